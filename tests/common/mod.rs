//! In-process fake Docker engine for integration tests.
//!
//! Routes are scripted per method and path. Each route holds a queue of
//! replies; the last reply repeats once the queue is drained. Every request
//! is recorded so tests can assert what the client sent.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use dockhand::engine::{ClientOptions, EngineClient, EngineEndpoint};

pub const API_VERSION: &str = "1.41";

/// A scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(u16, Value),
    Status(u16),
    /// Body sent as separate chunks with a short pause between them.
    Chunks(u16, Vec<Vec<u8>>),
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Json(200, body)
    }

    pub fn error(status: u16, message: &str) -> Self {
        Reply::Json(status, json!({ "message": message }))
    }

    /// A chunked stream of JSON lines.
    pub fn json_lines(lines: &[Value]) -> Self {
        Reply::Chunks(
            200,
            lines
                .iter()
                .map(|l| format!("{}\r\n", l).into_bytes())
                .collect(),
        )
    }
}

/// A request the fake engine received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    /// Path as sent, still percent-encoded.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn query_has(&self, pair: &str) -> bool {
        self.query
            .as_deref()
            .is_some_and(|q| q.split('&').any(|p| p == pair))
    }
}

struct Route {
    method: Method,
    path: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct Inner {
    routes: Vec<Route>,
    requests: Vec<Recorded>,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Inner>>);

pub struct FakeEngine {
    pub addr: std::net::SocketAddr,
    shared: Shared,
    task: JoinHandle<()>,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let shared = Shared::default();
        let app = Router::new().fallback(handle).with_state(shared.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, shared, task }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// `DOCKER_HOST` style address.
    pub fn docker_host(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn client(&self) -> EngineClient {
        let endpoint = EngineEndpoint::from_docker_host(&self.docker_host(), None).unwrap();
        EngineClient::new(endpoint, ClientOptions::default(), API_VERSION).unwrap()
    }

    /// Script `replies` for `method` on an API path like `/containers/json`.
    pub fn route(&self, method: Method, path: &str, replies: Vec<Reply>) {
        let path = if path == "/version" {
            path.to_string()
        } else {
            format!("/v{}{}", API_VERSION, path)
        };
        self.route_raw(method, &path, replies);
    }

    /// Script `replies` for an exact, unversioned path.
    pub fn route_raw(&self, method: Method, path: &str, replies: Vec<Reply>) {
        let path = path.to_string();
        let mut inner = self.shared.0.lock().unwrap();
        inner.routes.retain(|r| !(r.method == method && r.path == path));
        inner.routes.push(Route {
            method,
            path,
            replies: replies.into(),
        });
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.shared.0.lock().unwrap().requests.clone()
    }

    /// Recorded requests for `method` whose path ends with `suffix`.
    pub fn requests_to(&self, method: Method, suffix: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path.ends_with(suffix))
            .collect()
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(State(shared): State<Shared>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let path = parts.uri.path().to_string();

    let reply = {
        let mut inner = shared.0.lock().unwrap();
        inner.requests.push(Recorded {
            method: parts.method.clone(),
            path: path.clone(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            body,
        });
        inner
            .routes
            .iter_mut()
            .find(|r| r.method == parts.method && r.path == path)
            .and_then(|route| {
                if route.replies.len() > 1 {
                    route.replies.pop_front()
                } else {
                    route.replies.front().cloned()
                }
            })
    };

    match reply {
        Some(reply) => render(reply),
        None => render(Reply::error(404, &format!("no route for {}", path))),
    }
}

fn render(reply: Reply) -> Response {
    match reply {
        Reply::Json(status, body) => (
            status_code(status),
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response(),
        Reply::Status(status) => status_code(status).into_response(),
        Reply::Chunks(status, chunks) => {
            let stream = futures::stream::iter(chunks).then(|chunk| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, std::io::Error>(Bytes::from(chunk))
            });
            (
                status_code(status),
                [(header::CONTENT_TYPE, "application/json")],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Minimal `GET /containers/{id}/json` answer.
pub fn container_json(id: &str, name: &str, running: bool, ports: Value) -> Value {
    json!({
        "Id": id,
        "Name": format!("/{}", name),
        "State": { "Running": running, "Status": if running { "running" } else { "exited" }, "ExitCode": 0 },
        "Config": { "Image": "img" },
        "NetworkSettings": { "IPAddress": "172.17.0.2", "Ports": ports }
    })
}

/// One multiplexed log frame.
pub fn log_frame(stream: u8, text: &str) -> Vec<u8> {
    let mut frame = vec![stream, 0, 0, 0];
    frame.extend_from_slice(&(text.len() as u32).to_be_bytes());
    frame.extend_from_slice(text.as_bytes());
    frame
}
