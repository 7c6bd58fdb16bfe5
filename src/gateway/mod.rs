//! Smart HTTP transfer gateway for Git repositories.
//!
//! [`GitGateway`] is a [`Module`]: it matches the request path against the ordered service
//! table, resolves the repository directory under the configured project root and runs the
//! selected operation. RPC requests are bridged to `git <rpc> --stateless-rpc` with both pipes
//! streamed concurrently; dumb-protocol paths are served from disk through [`crate::content`].
//!
//! Errors returned by an operation are rendered once, before any response bytes went out:
//! existence failures become `404 Not Found`, policy refusals `403 Forbidden`, everything else
//! a `500` carrying the error message. After the status line is sent they are only logged.

pub mod body;
pub mod git;
pub mod routing;
pub mod service;

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use axum::http::{StatusCode, Version, header};
use tokio::fs;

use self::{git::GitTool, routing::match_route, service::HandlerReq};
use crate::{
    config::GatewayConfig,
    content,
    errors::GatewayError,
    module::{Input, Module, Output, RouteUserAgent, Router},
    protocol::{EventSink, LogSink},
};

/// The git transfer gateway module.
pub struct GitGateway {
    config: GatewayConfig,
    git: GitTool,
    sink: Arc<dyn EventSink>,
    router: RouteUserAgent,
}

impl GitGateway {
    /// Builds a gateway whose events go to the log.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            git: GitTool::new(&config.git_bin_path),
            config,
            sink: Arc::new(LogSink),
            router: RouteUserAgent::prefix("git"),
        }
    }

    /// Replaces the sink receiving ref-update and fetch events.
    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Creates the project root when it does not exist yet.
    pub async fn init(&self) -> Result<(), GatewayError> {
        fs::create_dir_all(&self.config.project_root).await?;
        tracing::debug!(root = %self.config.project_root.display(), "project root ready");
        Ok(())
    }

    /// Resolves the repository directory for a matched path prefix.
    pub async fn git_dir(&self, prefix: &str) -> Result<PathBuf, GatewayError> {
        let relative = Path::new(prefix.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(GatewayError::not_found(prefix));
        }

        let root = if self.config.project_root.as_os_str().is_empty() {
            std::env::current_dir()?
        } else {
            self.config.project_root.clone()
        };
        let dir = root.join(relative);
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(GatewayError::not_found(dir.display().to_string())),
        }
    }

    async fn serve(
        &self,
        input: &mut dyn Input,
        output: &mut dyn Output,
    ) -> Result<(), GatewayError> {
        let Some(matched) = match_route(input.path()) else {
            return Err(GatewayError::not_found(input.path()));
        };
        if *input.method() != matched.service.method {
            tracing::debug!(
                "{} {} expects {}",
                input.method(),
                input.path(),
                matched.service.method
            );
            return Err(GatewayError::MethodNotAllowed);
        }

        let dir = self.git_dir(&matched.repo).await?;
        tracing::debug!(
            dir = %dir.display(),
            file = %matched.file,
            "routing {:?}",
            matched.service.operation
        );
        let hr = HandlerReq {
            input,
            output,
            dir,
            file: matched.file,
        };
        self.run(matched.service.operation, hr).await
    }
}

/// Renders an operation error as a short plain-text response.
async fn render_error(input: &dyn Input, output: &mut dyn Output, err: &GatewayError) {
    if output.status_sent() {
        tracing::warn!(
            "{} {} failed after response started: {}",
            input.method(),
            input.path(),
            err
        );
        return;
    }
    // cache headers set by the operation do not apply to the error
    for name in [header::CACHE_CONTROL, header::EXPIRES, header::PRAGMA] {
        output.remove_header(&name);
    }
    let (status, body) = match err {
        e if e.is_not_found() => (StatusCode::NOT_FOUND, "Not Found"),
        GatewayError::AccessDenied(_) => (StatusCode::FORBIDDEN, "Forbidden"),
        GatewayError::MethodNotAllowed if input.version() >= Version::HTTP_11 => {
            (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        GatewayError::MethodNotAllowed => (StatusCode::BAD_REQUEST, "Bad Request"),
        _ => {
            tracing::error!("{} {}: {}", input.method(), input.path(), err);
            content::error(output, &err.to_string(), StatusCode::INTERNAL_SERVER_ERROR).await;
            return;
        }
    };
    tracing::debug!("{} {} -> {}: {}", input.method(), input.path(), status, err);
    output.remove_header(&header::CONTENT_LENGTH);
    output.set_header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    let _ = output.write_status(status).await;
    let _ = output.write(body.as_bytes()).await;
}

#[async_trait]
impl Module for GitGateway {
    fn route(&self, input: &dyn Input) -> bool {
        self.router.route(input)
    }

    async fn handle(&self, input: &mut dyn Input, output: &mut dyn Output) {
        if let Err(err) = self.serve(input, output).await {
            render_error(&*input, output, &err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        protocol::Event,
        transport::memory::{MemoryInput, MemoryOutput},
    };

    fn gateway(root: &Path) -> GitGateway {
        GitGateway::new(GatewayConfig::new(root))
    }

    async fn run(gw: &GitGateway, mut input: MemoryInput) -> MemoryOutput {
        let mut output = MemoryOutput::new();
        gw.handle(&mut input, &mut output).await;
        output
    }

    #[test]
    fn routes_git_user_agents() {
        let gw = gateway(Path::new("/srv/git"));
        let refs = || MemoryInput::get("/r.git/info/refs");
        assert!(gw.route(&refs().with_header("User-Agent", "git/2.43.0")));
        assert!(!gw.route(&refs().with_header("User-Agent", "curl/8.5")));
        assert!(!gw.route(&MemoryInput::get("/r.git/info/refs")));
    }

    /// Prefixes are resolved under the root and must name an existing directory.
    #[tokio::test]
    async fn resolves_repository_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("team/a.git")).unwrap();
        std::fs::write(root.path().join("plain"), b"x").unwrap();
        let gw = gateway(root.path());

        assert_eq!(gw.git_dir("/team/a.git").await.unwrap(), root.path().join("team/a.git"));
        assert!(gw.git_dir("/team/b.git").await.unwrap_err().is_not_found());
        assert!(gw.git_dir("/plain").await.unwrap_err().is_not_found());
        assert!(gw.git_dir("/team/../team/a.git").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn init_creates_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("nested/repos");
        let gw = gateway(&root);
        gw.init().await.unwrap();
        assert!(root.is_dir());
        gw.init().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let out = run(&gateway(root.path()), MemoryInput::get("/r.git/description")).await;
        assert_eq!(out.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(out.body_str(), "Not Found");
    }

    /// A wrong method is 405 on HTTP/1.1 and 400 on HTTP/1.0.
    #[tokio::test]
    async fn method_mismatch_depends_on_version() {
        let root = tempfile::tempdir().unwrap();
        let gw = gateway(root.path());

        let out = run(&gw, MemoryInput::get("/r.git/git-upload-pack")).await;
        assert_eq!(out.status(), Some(StatusCode::METHOD_NOT_ALLOWED));
        assert_eq!(out.body_str(), "Method Not Allowed");

        let out = run(
            &gw,
            MemoryInput::post("/r.git/HEAD").with_version(Version::HTTP_10),
        )
        .await;
        assert_eq!(out.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(out.body_str(), "Bad Request");
    }

    /// Policy refusals happen before the tool is spawned, so no event is emitted.
    #[tokio::test]
    async fn disabled_receive_pack_is_forbidden() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("r.git")).unwrap();
        let events = Arc::new(Mutex::new(Vec::<Event>::new()));
        let seen = events.clone();
        let gw = GitGateway::new(GatewayConfig {
            receive_pack: false,
            ..GatewayConfig::new(root.path())
        })
        .with_event_sink(move |e: Event| seen.lock().unwrap().push(e));

        let input = MemoryInput::post("/r.git/git-receive-pack")
            .with_header("Content-Type", "application/x-git-receive-pack-request")
            .with_body("0000");
        let out = run(&gw, input).await;
        assert_eq!(out.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(out.body_str(), "Forbidden");
        assert!(events.lock().unwrap().is_empty());
    }

    /// An RPC without the matching request content type is refused even when enabled.
    #[tokio::test]
    async fn rpc_requires_request_content_type() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("r.git")).unwrap();
        let gw = gateway(root.path());
        let input = MemoryInput::post("/r.git/git-upload-pack")
            .with_header("Content-Type", "application/x-git-receive-pack-request");
        let out = run(&gw, input).await;
        assert_eq!(out.status(), Some(StatusCode::FORBIDDEN));
    }

    /// Tool failures before any output are rendered as 500 with the error text.
    #[tokio::test]
    async fn missing_tool_is_internal_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("r.git")).unwrap();
        let gw = GitGateway::new(GatewayConfig {
            git_bin_path: root.path().join("no-git"),
            ..GatewayConfig::new(root.path())
        });
        let out = run(&gw, MemoryInput::get("/r.git/info/refs?service=git-upload-pack")).await;
        assert_eq!(out.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(out.body_str().starts_with("Tool error: failed to run"));
        assert_eq!(out.header(&header::CONTENT_TYPE), Some("text/plain; charset=utf-8"));
    }
}
