//! A small host serving the git transfer gateway over HTTP with axum.
//!
//! Configuration comes from the environment:
//! - `GIT_PROJECT_ROOT`, `GIT_BIN_PATH`, `GIT_UPLOAD_PACK`, `GIT_RECEIVE_PACK`,
//!   `GIT_RESPECT_REPO_CONFIG`: see `GatewayConfig::from_env`.
//! - `GATEWAY_ADDR`: listen address, `0.0.0.0:8080` by default.
//! - `GATEWAY_LOG`: log level, `info` by default.
//!
//! Clone through it with `git clone http://localhost:8080/<repo>.git`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{StatusCode, header};
use git_gateway::{GatewayConfig, GitGateway, Input, Module, Mux, Output};

/// Answers every request no other module routed.
struct HostNotFound;

#[async_trait]
impl Module for HostNotFound {
    fn route(&self, _input: &dyn Input) -> bool {
        true
    }

    async fn handle(&self, input: &mut dyn Input, output: &mut dyn Output) {
        tracing::debug!("no module for {} {}{}", input.method(), input.host(), input.path());
        output.set_header(header::CONTENT_TYPE, "text/html; charset=utf-8");
        let _ = output.write_status(StatusCode::INTERNAL_SERVER_ERROR).await;
        let _ = output.write(b"<h1>host not found</h1>").await;
    }
}

#[tokio::main]
async fn main() {
    let level = std::env::var("GATEWAY_LOG")
        .ok()
        .and_then(|l| l.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .init();

    let config = GatewayConfig::from_env().expect("invalid gateway configuration");
    let gateway = GitGateway::new(config);
    gateway.init().await.expect("failed to create project root");
    tracing::info!(
        root = %gateway.config().project_root.display(),
        receive_pack = gateway.config().receive_pack,
        "git gateway ready"
    );

    let mut mux = Mux::new();
    mux.register(gateway).register(HostNotFound);

    let addr = std::env::var("GATEWAY_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");
    tracing::info!("listening on {}", addr);
    axum::serve(listener, git_gateway::transport::axum_host::router(Arc::new(mux)))
        .await
        .expect("server error");
}
