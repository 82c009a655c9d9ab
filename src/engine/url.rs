//! Engine URL construction.
//!
//! Every URL has the shape `{base}/v{api_version}/{path}`. Path segments that
//! carry identifiers (image names, container ids) and all query values are
//! percent-encoded, so `registry:5000/team/app` travels as a single segment.

use crate::engine::image_name::ImageName;

/// Builds versioned engine URLs.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base_url: String,
    api_version: String,
}

/// Extra build flags appended to the `/build` URL.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Path of the Dockerfile inside the context.
    pub dockerfile: Option<String>,
    /// Do not use the build cache.
    pub no_cache: bool,
    /// Always attempt to pull a newer base image.
    pub pull: bool,
    /// Always remove intermediate containers.
    pub force_rm: bool,
    /// Build-time variables.
    pub build_args: Vec<(String, String)>,
}

impl UrlBuilder {
    /// `api_version` is given without the leading `v` (e.g. `1.41`).
    pub fn new(base_url: &str, api_version: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.trim_start_matches('v').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Unversioned `/version` endpoint used for API negotiation.
    pub fn version(&self) -> String {
        format!("{}/version", self.base_url)
    }

    pub fn list_images(&self, all: bool, reference: Option<&str>) -> String {
        let mut query = Query::new().flag("all", all);
        if let Some(reference) = reference {
            query = query.param("filters", &filters(&[("reference", reference)]));
        }
        self.url("images/json", &[], query)
    }

    pub fn inspect_image(&self, name: &str) -> String {
        self.url("images/{}/json", &[name], Query::new())
    }

    pub fn create_container(&self, name: Option<&str>) -> String {
        let mut query = Query::new();
        if let Some(name) = name {
            query = query.param("name", name);
        }
        self.url("containers/create", &[], query)
    }

    pub fn start_container(&self, id: &str) -> String {
        self.url("containers/{}/start", &[id], Query::new())
    }

    pub fn stop_container(&self, id: &str, kill_wait_secs: u32) -> String {
        let mut query = Query::new();
        if kill_wait_secs > 0 {
            query = query.param("t", &kill_wait_secs.to_string());
        }
        self.url("containers/{}/stop", &[id], query)
    }

    pub fn remove_container(&self, id: &str, remove_volumes: bool) -> String {
        self.url(
            "containers/{}",
            &[id],
            Query::new().flag("v", remove_volumes).flag("force", true),
        )
    }

    pub fn inspect_container(&self, id: &str) -> String {
        self.url("containers/{}/json", &[id], Query::new())
    }

    pub fn list_containers(&self, all: bool, filter: Option<(&str, &str)>) -> String {
        let mut query = Query::new().flag("all", all);
        if let Some(filter) = filter {
            query = query.param("filters", &filters(&[filter]));
        }
        self.url("containers/json", &[], query)
    }

    pub fn container_logs(&self, id: &str, follow: bool) -> String {
        self.url(
            "containers/{}/logs",
            &[id],
            Query::new()
                .flag("stdout", true)
                .flag("stderr", true)
                .flag("timestamps", true)
                .flag("follow", follow),
        )
    }

    pub fn pull_image(&self, name: &ImageName, registry: Option<&str>) -> String {
        let tag = name.digest().or(name.tag()).unwrap_or("latest");
        self.url(
            "images/create",
            &[],
            Query::new()
                .param("fromImage", &name.name_without_tag(registry))
                .param("tag", tag),
        )
    }

    pub fn push_image(&self, name: &ImageName, registry: Option<&str>) -> String {
        self.url(
            "images/{}/push",
            &[&name.name_without_tag(registry)],
            Query::new()
                .param("tag", name.tag().unwrap_or("latest"))
                .flag("force", true),
        )
    }

    pub fn tag_image(&self, source: &ImageName, target: &ImageName, force: bool) -> String {
        self.url(
            "images/{}/tag",
            &[&source.full_name(None)],
            Query::new()
                .param("repo", &target.name_without_tag(None))
                .param("tag", target.tag().unwrap_or("latest"))
                .flag("force", force),
        )
    }

    pub fn remove_image(&self, name: &str, force: bool) -> String {
        self.url("images/{}", &[name], Query::new().flag("force", force))
    }

    pub fn build_image(&self, image: &str, options: &BuildOptions) -> String {
        let mut query = Query::new().param("t", image).flag("rm", true);
        if let Some(dockerfile) = &options.dockerfile {
            query = query.param("dockerfile", dockerfile);
        }
        if options.no_cache {
            query = query.flag("nocache", true);
        }
        if options.pull {
            query = query.flag("pull", true);
        }
        if options.force_rm {
            query = query.flag("forcerm", true);
        }
        if !options.build_args.is_empty() {
            let args: serde_json::Map<String, serde_json::Value> = options
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            query = query.param("buildargs", &serde_json::Value::Object(args).to_string());
        }
        self.url("build", &[], query)
    }

    pub fn create_exec(&self, container_id: &str) -> String {
        self.url("containers/{}/exec", &[container_id], Query::new())
    }

    pub fn start_exec(&self, exec_id: &str) -> String {
        self.url("exec/{}/start", &[exec_id], Query::new())
    }

    pub fn inspect_exec(&self, exec_id: &str) -> String {
        self.url("exec/{}/json", &[exec_id], Query::new())
    }

    /// Fill each `{}` in `template` with the next encoded argument.
    fn url(&self, template: &str, args: &[&str], query: Query) -> String {
        let mut path = String::with_capacity(template.len() + 32);
        let mut args = args.iter();
        let mut pieces = template.split("{}").peekable();
        while let Some(piece) = pieces.next() {
            path.push_str(piece);
            if pieces.peek().is_some()
                && let Some(arg) = args.next()
            {
                path.push_str(&urlencoding::encode(arg));
            }
        }
        format!(
            "{}/v{}/{}{}",
            self.base_url,
            self.api_version,
            path,
            query.render()
        )
    }
}

/// Ordered query string builder. Values are percent-encoded on render.
#[derive(Debug, Default)]
struct Query {
    pairs: Vec<(&'static str, String)>,
}

impl Query {
    fn new() -> Self {
        Self::default()
    }

    fn param(mut self, key: &'static str, value: &str) -> Self {
        self.pairs.push((key, value.to_string()));
        self
    }

    fn flag(self, key: &'static str, value: bool) -> Self {
        self.param(key, if value { "1" } else { "0" })
    }

    fn render(&self) -> String {
        if self.pairs.is_empty() {
            return String::new();
        }
        let joined: Vec<String> = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        format!("?{}", joined.join("&"))
    }
}

/// Engine filter JSON: `{"key":["value"]}`.
fn filters(pairs: &[(&str, &str)]) -> String {
    let map: serde_json::Map<String, serde_json::Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::json!([v])))
        .collect();
    serde_json::Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> UrlBuilder {
        UrlBuilder::new("http://localhost:2375/", "v1.41")
    }

    #[test]
    fn test_base_and_version_normalized() {
        let urls = builder();
        assert_eq!(urls.base_url(), "http://localhost:2375");
        assert_eq!(urls.api_version(), "1.41");
        assert_eq!(
            urls.start_container("abc"),
            "http://localhost:2375/v1.41/containers/abc/start"
        );
    }

    #[test]
    fn test_identifiers_with_slash_and_colon_are_encoded() {
        let urls = builder();
        assert_eq!(
            urls.inspect_image("registry.local:5000/team/app:1.0"),
            "http://localhost:2375/v1.41/images/registry.local%3A5000%2Fteam%2Fapp%3A1.0/json"
        );
        assert_eq!(
            urls.remove_image("team/app:1.0", true),
            "http://localhost:2375/v1.41/images/team%2Fapp%3A1.0?force=1"
        );
    }

    #[test]
    fn test_pull_and_push_urls() {
        let urls = builder();
        let name = ImageName::parse("team/app:1.0").unwrap();
        assert_eq!(
            urls.pull_image(&name, Some("registry.local")),
            "http://localhost:2375/v1.41/images/create?fromImage=registry.local%2Fteam%2Fapp&tag=1.0"
        );
        assert_eq!(
            urls.push_image(&name, Some("registry.local")),
            "http://localhost:2375/v1.41/images/registry.local%2Fteam%2Fapp/push?tag=1.0&force=1"
        );
    }

    #[test]
    fn test_tag_url() {
        let urls = builder();
        let source = ImageName::parse("app:1.0").unwrap();
        let target = ImageName::parse("registry.local/app:1.0").unwrap();
        assert_eq!(
            urls.tag_image(&source, &target, false),
            "http://localhost:2375/v1.41/images/app%3A1.0/tag?repo=registry.local%2Fapp&tag=1.0&force=0"
        );
    }

    #[test]
    fn test_logs_and_create_urls() {
        let urls = builder();
        assert_eq!(
            urls.container_logs("abc", true),
            "http://localhost:2375/v1.41/containers/abc/logs?stdout=1&stderr=1&timestamps=1&follow=1"
        );
        assert_eq!(
            urls.create_container(Some("my app")),
            "http://localhost:2375/v1.41/containers/create?name=my%20app"
        );
        assert_eq!(
            urls.create_container(None),
            "http://localhost:2375/v1.41/containers/create"
        );
    }

    #[test]
    fn test_build_url_with_options() {
        let urls = builder();
        let options = BuildOptions {
            no_cache: true,
            build_args: vec![("VERSION".to_string(), "1".to_string())],
            ..Default::default()
        };
        assert_eq!(
            urls.build_image("app:1.0", &options),
            "http://localhost:2375/v1.41/build?t=app%3A1.0&rm=1&nocache=1&buildargs=%7B%22VERSION%22%3A%221%22%7D"
        );
    }

    #[test]
    fn test_container_filter_is_json() {
        let urls = builder();
        assert_eq!(
            urls.list_containers(true, Some(("ancestor", "app"))),
            "http://localhost:2375/v1.41/containers/json?all=1&filters=%7B%22ancestor%22%3A%5B%22app%22%5D%7D"
        );
    }
}
