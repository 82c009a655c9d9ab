//! HTTP(S) client for the Docker Engine REST API.
//!
//! Two call shapes exist:
//!
//! - [`EngineClient::request`] sends one request and reads the whole body.
//!   The call fails with [`EngineError::Status`] when the status is not in
//!   the caller's accepted list.
//! - [`EngineClient::stream_request`] returns an [`EventStream`] that decodes
//!   build, pull and push progress as it arrives.
//!
//! Both hold one permit of the client's connection ceiling for as long as the
//! connection is in use. Log follows are long-lived and run outside the
//! ceiling so that waiting on logs can never starve other calls.
//!
//! Nothing is retried here. Retry policy belongs to the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::engine::endpoint::EngineEndpoint;
use crate::engine::error::{EngineError, Result};
use crate::engine::image_name::ImageName;
use crate::engine::logs::{self, LogControl, LogHandle, LogLine};
use crate::engine::model::{
    ContainerCreateRequest, ContainerDetails, ContainerSummary, CreateResponse, ExecConfig,
    ExecInspect, ImageSummary, RegistryAuth, VersionInfo,
};
use crate::engine::stream::EventStream;
use crate::engine::url::{BuildOptions, UrlBuilder};

/// Default ceiling for concurrent engine connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Tuning knobs for [`EngineClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Maximum number of engine calls in flight at once.
    pub max_connections: usize,
    /// Timeout for non-streaming calls. Streams and log follows are unbounded.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            request_timeout: None,
        }
    }
}

/// Request body variants the engine accepts.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// Build context archive.
    Tar(Bytes),
}

impl RequestBody {
    fn apply(self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Tar(bytes) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
                .body(bytes),
        }
    }
}

/// A fully read, non-streaming response.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub url: String,
    pub status: u16,
    pub body: Bytes,
}

impl EngineResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| EngineError::decode(&self.url, e))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Client for one engine endpoint.
#[derive(Debug)]
pub struct EngineClient {
    http: reqwest::Client,
    endpoint: EngineEndpoint,
    urls: UrlBuilder,
    options: ClientOptions,
    permits: Arc<Semaphore>,
}

impl EngineClient {
    /// Connect to the engine, negotiating the API version through `/version`
    /// unless the endpoint pins one.
    pub async fn connect(endpoint: EngineEndpoint, options: ClientOptions) -> Result<Self> {
        let http = build_http(&endpoint, &options)?;
        let api_version = match endpoint.api_version() {
            Some(version) => version.to_string(),
            None => {
                let url = format!("{}/version", endpoint.base_url());
                tracing::debug!("GET {}", url);
                let mut request = http.get(&url);
                if let Some(timeout) = options.request_timeout {
                    request = request.timeout(timeout);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| EngineError::transport(&url, e))?;
                let status = response.status().as_u16();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| EngineError::transport(&url, e))?;
                if status != 200 {
                    return Err(EngineError::Status {
                        method: "GET".to_string(),
                        url,
                        status,
                        body: error_message(&body),
                    });
                }
                let info: VersionInfo =
                    serde_json::from_slice(&body).map_err(|e| EngineError::decode(&url, e))?;
                tracing::debug!(
                    "Engine {} speaks API {} ({}/{})",
                    info.version,
                    info.api_version,
                    info.os,
                    info.arch
                );
                info.api_version
            }
        };
        Ok(Self::assemble(http, endpoint, options, &api_version))
    }

    /// Build a client for a known API version without contacting the engine.
    pub fn new(endpoint: EngineEndpoint, options: ClientOptions, api_version: &str) -> Result<Self> {
        let http = build_http(&endpoint, &options)?;
        Ok(Self::assemble(http, endpoint, options, api_version))
    }

    fn assemble(
        http: reqwest::Client,
        endpoint: EngineEndpoint,
        options: ClientOptions,
        api_version: &str,
    ) -> Self {
        let urls = UrlBuilder::new(endpoint.base_url(), api_version);
        let permits = Arc::new(Semaphore::new(options.max_connections.max(1)));
        tracing::info!(
            "Using Docker engine at {} (API {})",
            endpoint.base_url(),
            urls.api_version()
        );
        Self {
            http,
            endpoint,
            urls,
            options,
            permits,
        }
    }

    pub fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    pub fn api_version(&self) -> &str {
        self.urls.api_version()
    }

    /// Connection permits currently free.
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse new calls. Calls already running finish normally and the
    /// connection pool closes when the client is dropped.
    pub fn shutdown(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            tracing::debug!("Engine client for {} shut down", self.endpoint.base_url());
        }
    }

    async fn acquire(&self, url: &str) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::transport(url, "engine client is shut down"))
    }

    /// Send a request and read the whole response.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
        accepted: &[u16],
    ) -> Result<EngineResponse> {
        let _permit = self.acquire(url).await?;
        tracing::debug!("{} {}", method, url);

        let mut builder = self.http.request(method.clone(), url);
        if let Some(timeout) = self.options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let response = body
            .apply(builder)
            .send()
            .await
            .map_err(|e| EngineError::transport(url, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::transport(url, e))?;

        if !accepted.contains(&status) {
            return Err(EngineError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status,
                body: error_message(&body),
            });
        }
        Ok(EngineResponse {
            url: url.to_string(),
            status,
            body,
        })
    }

    /// Open a streaming call. A non-success status fails right away; error
    /// events inside the body are reported when the stream is drained.
    pub async fn stream_request(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
        auth: Option<&RegistryAuth>,
    ) -> Result<EventStream> {
        let permit = self.acquire(url).await?;
        tracing::debug!("{} {} (streaming)", method, url);

        let mut builder = self.http.request(method.clone(), url);
        if let Some(auth) = auth {
            builder = builder.header(REGISTRY_AUTH_HEADER, auth.to_header());
        }
        let response = body
            .apply(builder)
            .send()
            .await
            .map_err(|e| EngineError::transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(EngineError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                body: error_message(&body),
            });
        }
        Ok(EventStream::new(url.to_string(), response, Some(permit)))
    }

    // ==================== System ====================

    pub async fn version(&self) -> Result<VersionInfo> {
        self.request(Method::GET, &self.urls.version(), RequestBody::Empty, &[200])
            .await?
            .json()
    }

    // ==================== Images ====================

    pub async fn list_images(&self, reference: Option<&str>) -> Result<Vec<ImageSummary>> {
        let url = self.urls.list_images(false, reference);
        self.request(Method::GET, &url, RequestBody::Empty, &[200])
            .await?
            .json()
    }

    pub async fn has_image(&self, name: &str) -> Result<bool> {
        let url = self.urls.inspect_image(name);
        let response = self
            .request(Method::GET, &url, RequestBody::Empty, &[200, 404])
            .await?;
        Ok(response.status == 200)
    }

    /// Open the pull stream for `image`, optionally from `registry`.
    pub async fn pull_stream(
        &self,
        image: &str,
        registry: Option<&str>,
        auth: Option<&RegistryAuth>,
    ) -> Result<EventStream> {
        let name = ImageName::parse(image)?;
        let url = self.urls.pull_image(&name, registry);
        self.stream_request(Method::POST, &url, RequestBody::Empty, auth)
            .await
    }

    /// Pull an image and log its progress.
    pub async fn pull_image(
        &self,
        image: &str,
        registry: Option<&str>,
        auth: Option<&RegistryAuth>,
    ) -> Result<()> {
        let operation = format!("pull of '{}'", image);
        self.pull_stream(image, registry, auth)
            .await?
            .finish(&operation)
            .await
    }

    /// Push an image. When the name has no registry but one is given, the
    /// image is tagged under the qualified name for the push and that
    /// temporary tag is removed afterwards, whether the push worked or not.
    pub async fn push_image(
        &self,
        image: &str,
        registry: Option<&str>,
        auth: Option<&RegistryAuth>,
    ) -> Result<()> {
        let name = ImageName::parse(image)?;
        let url = self.urls.push_image(&name, registry);
        let temporary = self.tag_temporary(&name, registry).await?;

        let operation = format!("push of '{}'", name.full_name(registry));
        let pushed = match self
            .stream_request(Method::POST, &url, RequestBody::Empty, auth)
            .await
        {
            Ok(stream) => stream.finish(&operation).await,
            Err(e) => Err(e),
        };

        let cleanup = match temporary {
            Some(target) => self.remove_temporary_tag(&target).await,
            None => Ok(()),
        };
        pushed?;
        cleanup
    }

    async fn tag_temporary(&self, name: &ImageName, registry: Option<&str>) -> Result<Option<String>> {
        let target = name.full_name(registry);
        if name.has_registry() || registry.is_none() {
            tracing::info!(
                "Temporary image tag skipped: '{}' already has a registry or none is configured",
                target
            );
            return Ok(None);
        }

        let existed = self.has_image(&target).await?;
        if existed {
            tracing::warn!(
                "Target image '{}' already exists, tagging '{}' will replace it",
                target,
                name.full_name(None)
            );
        }
        self.tag_image(&name.full_name(None), &target, false).await?;

        if existed {
            tracing::info!(
                "Tagged image '{}' won't be removed after the push as it already existed",
                target
            );
            Ok(None)
        } else {
            Ok(Some(target))
        }
    }

    async fn remove_temporary_tag(&self, target: &str) -> Result<()> {
        match self.remove_image(target, true).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!("Temporary tag '{}' was already removed", target);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to remove temporary tag '{}': {}", target, e);
                Err(EngineError::TemporaryTag {
                    image: target.to_string(),
                })
            }
        }
    }

    /// Tag `source` as `target`.
    pub async fn tag_image(&self, source: &str, target: &str, force: bool) -> Result<()> {
        let source = ImageName::parse(source)?;
        let target = ImageName::parse(target)?;
        let url = self.urls.tag_image(&source, &target, force);
        self.request(Method::POST, &url, RequestBody::Empty, &[201])
            .await?;
        Ok(())
    }

    /// Remove an image. Returns `false` when it did not exist.
    pub async fn remove_image(&self, name: &str, force: bool) -> Result<bool> {
        let url = self.urls.remove_image(name, force);
        let response = self
            .request(Method::DELETE, &url, RequestBody::Empty, &[200, 404])
            .await?;
        if response.status == 404 {
            return Ok(false);
        }
        if let Ok(serde_json::Value::Array(entries)) = response.json::<serde_json::Value>() {
            for entry in entries.iter().filter_map(|e| e.as_object()) {
                for (key, value) in entry {
                    tracing::debug!("{}: {}", key, value);
                }
            }
        }
        Ok(true)
    }

    /// Build `image` from a tar archive of the build context.
    pub async fn build_image(
        &self,
        image: &str,
        context: Bytes,
        options: &BuildOptions,
    ) -> Result<()> {
        let url = self.urls.build_image(image, options);
        let operation = format!("build of '{}'", image);
        self.stream_request(Method::POST, &url, RequestBody::Tar(context), None)
            .await?
            .finish(&operation)
            .await
    }

    // ==================== Containers ====================

    /// Create a container and return its full id.
    pub async fn create_container(
        &self,
        request: &ContainerCreateRequest,
        name: Option<&str>,
    ) -> Result<String> {
        let url = self.urls.create_container(name);
        let body = serde_json::to_value(request).map_err(|e| EngineError::decode(&url, e))?;
        let created: CreateResponse = self
            .request(Method::POST, &url, RequestBody::Json(body), &[201])
            .await?
            .json()?;
        for warning in created.warnings.iter().flatten() {
            tracing::warn!("{}", warning);
        }
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        let url = self.urls.start_container(id);
        self.request(Method::POST, &url, RequestBody::Empty, &[204, 304])
            .await?;
        Ok(())
    }

    /// Stop a container, giving it `kill_wait_secs` before it is killed.
    pub async fn stop_container(&self, id: &str, kill_wait_secs: u32) -> Result<()> {
        let url = self.urls.stop_container(id, kill_wait_secs);
        self.request(Method::POST, &url, RequestBody::Empty, &[204, 304])
            .await?;
        Ok(())
    }

    pub async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<()> {
        let url = self.urls.remove_container(id, remove_volumes);
        self.request(Method::DELETE, &url, RequestBody::Empty, &[204])
            .await?;
        Ok(())
    }

    /// Inspect a container. `None` when the engine does not know it.
    pub async fn inspect_container(&self, id: &str) -> Result<Option<ContainerDetails>> {
        let url = self.urls.inspect_container(id);
        let response = self
            .request(Method::GET, &url, RequestBody::Empty, &[200, 404])
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        response.json().map(Some)
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let url = self.urls.list_containers(all, None);
        self.request(Method::GET, &url, RequestBody::Empty, &[200])
            .await?
            .json()
    }

    /// Names of all containers, running or not.
    pub async fn container_names(&self) -> Result<HashSet<String>> {
        Ok(self
            .list_containers(true)
            .await?
            .iter()
            .flat_map(|c| c.names().map(str::to_string))
            .collect())
    }

    /// Containers created from exactly `image`.
    pub async fn containers_for_image(
        &self,
        image: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let url = self.urls.list_containers(all, Some(("ancestor", image)));
        let containers: Vec<ContainerSummary> = self
            .request(Method::GET, &url, RequestBody::Empty, &[200])
            .await?
            .json()?;
        Ok(containers
            .into_iter()
            .filter(|c| same_image(&c.image, image))
            .collect())
    }

    // ==================== Logs ====================

    /// All log lines written so far.
    pub async fn logs(&self, id: &str) -> Result<Vec<LogLine>> {
        let url = self.urls.container_logs(id, false);
        let response = self
            .request(Method::GET, &url, RequestBody::Empty, &[200])
            .await?;
        Ok(logs::decode_all(&response.body))
    }

    /// Follow a container's logs in the background, calling `callback` for
    /// every line until it returns [`LogControl::Stop`], the container exits
    /// or the handle is cancelled.
    pub async fn follow_logs<F>(&self, id: &str, callback: F) -> Result<LogHandle>
    where
        F: FnMut(&LogLine) -> LogControl + Send + 'static,
    {
        self.follow_logs_with_cancel(id, callback, CancellationToken::new())
            .await
    }

    /// Like [`Self::follow_logs`], ending when `cancel` fires.
    pub async fn follow_logs_with_cancel<F>(
        &self,
        id: &str,
        callback: F,
        cancel: CancellationToken,
    ) -> Result<LogHandle>
    where
        F: FnMut(&LogLine) -> LogControl + Send + 'static,
    {
        if self.permits.is_closed() {
            return Err(EngineError::transport(
                self.endpoint.base_url(),
                "engine client is shut down",
            ));
        }
        let url = self.urls.container_logs(id, true);
        tracing::debug!("GET {} (follow)", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(EngineError::Status {
                method: "GET".to_string(),
                url,
                status: status.as_u16(),
                body: error_message(&body),
            });
        }
        Ok(LogHandle::spawn(id, url, response, callback, cancel))
    }

    // ==================== Exec ====================

    /// Create an exec instance and return its id.
    pub async fn create_exec(&self, container_id: &str, cmd: Vec<String>) -> Result<String> {
        let url = self.urls.create_exec(container_id);
        let body = serde_json::to_value(ExecConfig::new(cmd))
            .map_err(|e| EngineError::decode(&url, e))?;
        let created: CreateResponse = self
            .request(Method::POST, &url, RequestBody::Json(body), &[201])
            .await?
            .json()?;
        Ok(created.id)
    }

    /// Run an exec instance to completion and return its output.
    pub async fn start_exec(&self, exec_id: &str) -> Result<String> {
        let url = self.urls.start_exec(exec_id);
        let body = serde_json::json!({ "Detach": false, "Tty": false });
        let response = self
            .request(Method::POST, &url, RequestBody::Json(body), &[200])
            .await?;
        let output: Vec<String> = logs::decode_all(&response.body)
            .into_iter()
            .map(|line| line.text)
            .collect();
        Ok(output.join("\n"))
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        let url = self.urls.inspect_exec(exec_id);
        self.request(Method::GET, &url, RequestBody::Empty, &[200])
            .await?
            .json()
    }
}

fn build_http(endpoint: &EngineEndpoint, options: &ClientOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(options.max_connections.max(1))
        .connect_timeout(Duration::from_secs(10));
    if let Some(tls) = endpoint.tls() {
        builder = tls.apply(builder)?;
    }
    builder.build().map_err(|e| EngineError::Endpoint {
        url: endpoint.base_url().to_string(),
        reason: e.to_string(),
    })
}

/// The engine wraps errors as `{"message": "..."}`; fall back to the raw text.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

fn same_image(actual: &str, wanted: &str) -> bool {
    if actual == wanted {
        return true;
    }
    match (ImageName::parse(actual), ImageName::parse(wanted)) {
        (Ok(a), Ok(b)) => a.full_name(None) == b.full_name(None),
        _ => false,
    }
}
