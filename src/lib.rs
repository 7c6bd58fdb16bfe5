//! git-gateway: a pluggable HTTP content gateway with a smart HTTP transfer gateway for Git
//! repositories.
//!
//! Goals
//! - Serve static content with full HTTP semantics: conditional requests, byte ranges
//!   (single and `multipart/byteranges`), content-type detection and directory listings.
//! - Bridge git's stateless RPC mode (`upload-pack`, `receive-pack`) over HTTP request and
//!   response bodies, streaming both pipes concurrently.
//! - Observe pkt-line framing on the way through and report ref updates and fetches as events.
//!
//! Modules
//! - `module`: the handler contract (`Input`, `Output`, `Module`), the ordered `Mux` and routing
//!   predicates.
//! - `content`: conditional and byte-range serving, signature sniffing, directory listings.
//! - `protocol`: service kinds, pkt-line framing, request/tool-output scanners, events.
//! - `gateway`: `GitGateway`, the ordered service table and the git binary invocations.
//! - `transport`: in-memory and axum adapters for `Input`/`Output`.
//! - `config`: gateway configuration, from serde or the environment.
//! - `errors`: unified error type and its HTTP status classification.
//!
//! Typical Usage
//! - Register `GitGateway::new(GatewayConfig::from_env()?)` on a `Mux`, followed by any fallback
//!   module, and serve the mux with `transport::axum_host::router`.

pub mod config;
pub mod content;
pub mod errors;
pub mod gateway;
pub mod module;
pub mod protocol;
pub mod transport;

pub use config::GatewayConfig;
pub use errors::GatewayError;
pub use gateway::GitGateway;
pub use module::{
    Input, Module, Mux, Output, RouteAll, RouteDomain, RouteMethod, RoutePath, RouteScheme,
    RouteUserAgent, Routed, Router,
};
pub use protocol::{Event, EventKind, EventSink, ServiceType};
