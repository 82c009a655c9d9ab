//! Readiness checks against a fake engine and local listeners.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::Method;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpListener;

use common::{FakeEngine, Reply, container_json, log_frame};
use dockhand::wait::{
    ExecCheck, ExitCodeCheck, HealthCheck, HttpCheck, LogPatternCheck, ReadinessPoller, TcpCheck,
    WaitError,
};

fn poller(timeout_ms: u64) -> ReadinessPoller {
    ReadinessPoller::new(Duration::from_millis(20), Duration::from_millis(timeout_ms))
}

fn health_json(status: &str) -> serde_json::Value {
    json!({
        "Id": "abc",
        "State": { "Running": true, "Health": { "Status": status } },
        "Config": { "Healthcheck": { "Test": ["CMD", "true"] } }
    })
}

#[tokio::test]
async fn test_http_check_waits_for_success() {
    let server = FakeEngine::start().await;
    server.route_raw(
        Method::HEAD,
        "/health",
        vec![Reply::Status(503), Reply::Status(503), Reply::Status(204)],
    );

    let check = HttpCheck::new(server.http_url("/health")).unwrap();
    let elapsed = poller(5_000).with_check(check).wait().await.unwrap();

    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(server.requests_to(Method::HEAD, "/health").len(), 3);
}

#[tokio::test]
async fn test_http_check_uses_configured_method_and_range() {
    let server = FakeEngine::start().await;
    server.route_raw(
        Method::GET,
        "/ping",
        vec![Reply::Status(302), Reply::Status(200)],
    );

    let check =
        HttpCheck::with_options(server.http_url("/ping"), Some("GET"), Some("200"), false).unwrap();
    poller(5_000).with_check(check).wait().await.unwrap();

    // The redirect is not followed and does not count.
    assert_eq!(server.requests_to(Method::GET, "/ping").len(), 2);
}

#[tokio::test]
async fn test_http_not_implemented_is_fatal() {
    let server = FakeEngine::start().await;
    server.route_raw(Method::HEAD, "/health", vec![Reply::Status(501)]);

    let check = HttpCheck::new(server.http_url("/health")).unwrap();
    let err = poller(5_000).with_check(check).wait().await.unwrap_err();
    assert!(matches!(err, WaitError::CheckFailed { .. }), "{err}");
}

#[tokio::test]
async fn test_http_timeout_reports_pending_check() {
    let server = FakeEngine::start().await;
    server.route_raw(Method::HEAD, "/health", vec![Reply::Status(500)]);

    let url = server.http_url("/health");
    let started = Instant::now();
    let err = poller(200)
        .with_check(HttpCheck::new(url.as_str()).unwrap())
        .wait()
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(200));
    match err {
        WaitError::Timeout { pending, .. } => assert_eq!(pending, format!("on url {}", url)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_tcp_and_http_must_both_pass() {
    let server = FakeEngine::start().await;
    server.route_raw(Method::HEAD, "/", vec![Reply::Status(200)]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    poller(5_000)
        .with_check(HttpCheck::new(server.http_url("/")).unwrap())
        .with_check(TcpCheck::new("127.0.0.1", vec![port]))
        .wait()
        .await
        .unwrap();

    // Drop the listener: the HTTP side alone is not enough any more.
    drop(listener);
    let err = poller(150)
        .with_check(HttpCheck::new(server.http_url("/")).unwrap())
        .with_check(TcpCheck::new("127.0.0.1", vec![port]))
        .wait()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_log_pattern_check_follows_output() {
    let engine = FakeEngine::start().await;
    engine.route(
        Method::GET,
        "/containers/abc/logs",
        vec![Reply::Chunks(
            200,
            vec![
                log_frame(1, "2024-05-01T08:00:00Z initializing\n"),
                log_frame(1, "2024-05-01T08:00:01Z database system is ready to accept connections\n"),
            ],
        )],
    );
    let client = Arc::new(engine.client());

    let check = LogPatternCheck::new(client, "abc", "ready to accept connections").unwrap();
    poller(5_000).with_check(check).wait().await.unwrap();

    // One follow subscription for the whole wait.
    let follows = engine.requests_to(Method::GET, "/containers/abc/logs");
    assert_eq!(follows.len(), 1);
    assert!(follows[0].query_has("follow=1"));
}

#[tokio::test]
async fn test_multiline_log_pattern() {
    let engine = FakeEngine::start().await;
    engine.route(
        Method::GET,
        "/containers/abc/logs",
        vec![Reply::Chunks(
            200,
            vec![
                log_frame(1, "2024-05-01T08:00:00Z migrations done\n"),
                log_frame(2, "2024-05-01T08:00:01Z some warning\n"),
                log_frame(1, "2024-05-01T08:00:02Z listening\n"),
            ],
        )],
    );
    let client = Arc::new(engine.client());

    let check = LogPatternCheck::new(client, "abc", "(?s)migrations done.*listening").unwrap();
    poller(5_000).with_check(check).wait().await.unwrap();
}

#[tokio::test]
async fn test_log_pattern_times_out_without_match() {
    let engine = FakeEngine::start().await;
    engine.route(
        Method::GET,
        "/containers/abc/logs",
        vec![Reply::Chunks(200, vec![log_frame(1, "2024-05-01T08:00:00Z still starting\n")])],
    );
    let client = Arc::new(engine.client());

    let check = LogPatternCheck::new(client, "abc", "ready").unwrap();
    let err = poller(200).with_check(check).wait().await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_invalid_log_pattern() {
    let engine = FakeEngine::start().await;
    let client = Arc::new(engine.client());
    assert!(matches!(
        LogPatternCheck::new(client, "abc", "(unclosed"),
        Err(WaitError::InvalidCheck { .. })
    ));
}

#[tokio::test]
async fn test_health_check_waits_for_healthy() {
    let engine = FakeEngine::start().await;
    engine.route(
        Method::GET,
        "/containers/abc/json",
        vec![
            Reply::ok(health_json("starting")),
            Reply::ok(health_json("starting")),
            Reply::ok(health_json("healthy")),
        ],
    );
    let client = Arc::new(engine.client());

    poller(5_000)
        .with_check(HealthCheck::new(client, "abc"))
        .wait()
        .await
        .unwrap();
    assert_eq!(engine.requests_to(Method::GET, "/containers/abc/json").len(), 3);
}

#[tokio::test]
async fn test_health_check_without_healthcheck_fails() {
    let engine = FakeEngine::start().await;
    engine.route(
        Method::GET,
        "/containers/abc/json",
        vec![Reply::ok(container_json("abc", "db-1", true, json!({})))],
    );
    let client = Arc::new(engine.client());

    let err = poller(5_000)
        .with_check(HealthCheck::new(client, "abc"))
        .wait()
        .await
        .unwrap_err();
    match err {
        WaitError::CheckFailed { reason, .. } => {
            assert!(reason.contains("No HEALTHCHECK configured"), "{reason}")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_exit_code_check_ignores_running_guard() {
    let engine = FakeEngine::start().await;
    let exited = json!({
        "Id": "job",
        "State": { "Running": false, "Status": "exited", "ExitCode": 0 }
    });
    engine.route(
        Method::GET,
        "/containers/job/json",
        vec![
            Reply::ok(container_json("job", "job-1", true, json!({}))),
            Reply::ok(exited),
        ],
    );
    let client = Arc::new(engine.client());

    poller(5_000)
        .with_running_guard(client.clone(), "job")
        .with_check(ExitCodeCheck::new(client, "job", 0))
        .wait()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_running_guard_fails_when_container_stops() {
    let engine = FakeEngine::start().await;
    let crashed = json!({
        "Id": "abc",
        "State": { "Running": false, "Status": "exited", "ExitCode": 137 }
    });
    engine.route(
        Method::GET,
        "/containers/abc/json",
        vec![
            Reply::ok(container_json("abc", "web-1", true, json!({}))),
            Reply::ok(crashed),
        ],
    );
    engine.route(
        Method::GET,
        "/containers/abc/logs",
        vec![Reply::Chunks(200, vec![log_frame(2, "2024-05-01T08:00:00Z killed\n")])],
    );
    engine.route_raw(Method::HEAD, "/health", vec![Reply::Status(503)]);
    let client = Arc::new(engine.client());

    let err = poller(5_000)
        .with_running_guard(client, "abc")
        .with_check(HttpCheck::new(engine.http_url("/health")).unwrap())
        .wait()
        .await
        .unwrap_err();
    match err {
        WaitError::NotRunning {
            container,
            exit_code,
        } => {
            assert_eq!(container, "abc");
            assert_eq!(exit_code, Some(137));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_exec_check_until_command_succeeds() {
    let engine = FakeEngine::start().await;
    engine.route(
        Method::POST,
        "/containers/abc/exec",
        vec![Reply::Json(201, json!({"Id": "e1"}))],
    );
    engine.route(
        Method::POST,
        "/exec/e1/start",
        vec![Reply::Chunks(200, vec![log_frame(1, "accepting connections\n")])],
    );
    engine.route(
        Method::GET,
        "/exec/e1/json",
        vec![
            Reply::ok(json!({"Running": false, "ExitCode": 2})),
            Reply::ok(json!({"Running": false, "ExitCode": 0})),
        ],
    );
    let client = Arc::new(engine.client());

    let command = vec!["pg_isready".to_string(), "-q".to_string()];
    poller(5_000)
        .with_check(ExecCheck::new(client, "abc", command))
        .wait()
        .await
        .unwrap();

    let created = engine.requests_to(Method::POST, "/containers/abc/exec");
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].json()["Cmd"], json!(["pg_isready", "-q"]));
}
