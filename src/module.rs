//! Handler-module contract shared by the dispatcher, the content server and the git gateway.
//!
//! A host adapts its transport into an [`Input`] (the request) and an [`Output`] (the response
//! writer), then asks each registered [`Module`] in order whether it routes the request. Modules
//! are plain values registered explicitly by the host; [`Mux`] is itself a module and dispatches
//! to the first member whose predicate matches.

use std::{io, sync::Arc};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::AsyncRead;

/// Readable request body handed out once per request.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read side of a request, provided by the host.
pub trait Input: Send + Sync {
    /// Returns true when the request arrived over an encrypted transport.
    fn secure(&self) -> bool;

    fn method(&self) -> &Method;

    /// Protocol version of the request line.
    fn version(&self) -> Version;

    fn host(&self) -> &str;

    /// URL path, without the query string.
    fn path(&self) -> &str;

    /// First value of the named header, if present and valid text.
    fn header(&self, name: &str) -> Option<&str>;

    fn raw_query(&self) -> &str;

    /// First value of the named query parameter, percent-decoded.
    fn query(&self, key: &str) -> Option<String>;

    /// First value of the named form field. Hosts without body form parsing fall back to the
    /// query string.
    fn form_value(&self, key: &str) -> Option<String>;

    fn cookie(&self, name: &str) -> Option<String>;

    /// Takes the request body. Returns `None` when it was already taken or the request has none.
    fn take_body(&mut self) -> Option<BodyReader>;
}

/// Write side of a response, provided by the host.
///
/// Headers may be changed until the status line is written; afterwards implementations ignore
/// header changes. Only the first status write takes effect, and writing body bytes before any
/// status implies `200 OK`.
#[async_trait]
pub trait Output: Send {
    fn headers(&self) -> &HeaderMap;

    fn append_header(&mut self, name: HeaderName, value: HeaderValue);

    fn remove_header(&mut self, name: &HeaderName);

    /// Returns true once the status line has been written.
    fn status_sent(&self) -> bool;

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()>;

    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Ends a started response body with an error, so the client sees a broken transfer
    /// rather than a short but complete one. The default does nothing.
    async fn abort(&mut self, error: io::Error) {
        tracing::debug!("response aborted: {}", error);
    }

    /// First value of a response header as text.
    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Appends a header from text, dropping values that are not valid header text.
    fn add_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => self.append_header(name, value),
            Err(_) => tracing::warn!("dropping invalid value for header {}: {:?}", name, value),
        }
    }

    /// Replaces every value of a header with a single one.
    fn set_header(&mut self, name: HeaderName, value: &str) {
        self.remove_header(&name);
        self.add_header(name, value);
    }
}

/// A pluggable request handler: a routing predicate plus the handling operation.
#[async_trait]
pub trait Module: Send + Sync {
    /// Returns whether this module handles the request.
    fn route(&self, input: &dyn Input) -> bool;

    /// Responds to the request.
    async fn handle(&self, input: &mut dyn Input, output: &mut dyn Output);
}

#[async_trait]
impl<M: Module + ?Sized> Module for Arc<M> {
    fn route(&self, input: &dyn Input) -> bool {
        (**self).route(input)
    }

    async fn handle(&self, input: &mut dyn Input, output: &mut dyn Output) {
        (**self).handle(input, output).await
    }
}

/// Ordered list of modules; the first one whose predicate matches handles the request.
#[derive(Default, Clone)]
pub struct Mux {
    modules: Vec<Arc<dyn Module>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a module; registration order is dispatch order.
    pub fn register(&mut self, module: impl Module + 'static) -> &mut Self {
        self.modules.push(Arc::new(module));
        self
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn find(&self, input: &dyn Input) -> Option<&Arc<dyn Module>> {
        self.modules.iter().find(|m| m.route(input))
    }
}

#[async_trait]
impl Module for Mux {
    fn route(&self, input: &dyn Input) -> bool {
        self.find(input).is_some()
    }

    async fn handle(&self, input: &mut dyn Input, output: &mut dyn Output) {
        match self.find(&*input).cloned() {
            Some(module) => module.handle(input, output).await,
            None => tracing::debug!("no module routes {} {}", input.method(), input.path()),
        }
    }
}

/// Routing predicate over a request.
pub trait Router: Send + Sync {
    fn route(&self, input: &dyn Input) -> bool;
}

impl<F> Router for F
where
    F: Fn(&dyn Input) -> bool + Send + Sync,
{
    fn route(&self, input: &dyn Input) -> bool {
        self(input)
    }
}

/// Matches the request host exactly.
pub struct RouteDomain(pub String);

impl Router for RouteDomain {
    fn route(&self, input: &dyn Input) -> bool {
        self.0 == input.host()
    }
}

/// Matches request paths starting with the given prefix.
pub struct RoutePath(pub String);

impl Router for RoutePath {
    fn route(&self, input: &dyn Input) -> bool {
        input.path().starts_with(self.0.as_str())
    }
}

/// Matches one request method.
pub struct RouteMethod(pub Method);

impl RouteMethod {
    pub const GET: RouteMethod = RouteMethod(Method::GET);
    pub const HEAD: RouteMethod = RouteMethod(Method::HEAD);
    pub const POST: RouteMethod = RouteMethod(Method::POST);
    pub const PUT: RouteMethod = RouteMethod(Method::PUT);
    pub const DELETE: RouteMethod = RouteMethod(Method::DELETE);
    pub const CONNECT: RouteMethod = RouteMethod(Method::CONNECT);
    pub const OPTIONS: RouteMethod = RouteMethod(Method::OPTIONS);
    pub const TRACE: RouteMethod = RouteMethod(Method::TRACE);
    pub const PATCH: RouteMethod = RouteMethod(Method::PATCH);
}

impl Router for RouteMethod {
    fn route(&self, input: &dyn Input) -> bool {
        *input.method() == self.0
    }
}

/// Matches on the transport security of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScheme {
    Plain,
    Secure,
}

impl Router for RouteScheme {
    fn route(&self, input: &dyn Input) -> bool {
        match self {
            RouteScheme::Plain => !input.secure(),
            RouteScheme::Secure => input.secure(),
        }
    }
}

/// Matches a `User-Agent` starting with the given prefix.
pub struct RouteUserAgent(pub String);

impl RouteUserAgent {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }
}

impl Router for RouteUserAgent {
    fn route(&self, input: &dyn Input) -> bool {
        input
            .header("User-Agent")
            .is_some_and(|ua| ua.starts_with(self.0.as_str()))
    }
}

/// Matches when every member matches; an empty set matches everything.
#[derive(Default)]
pub struct RouteAll(Vec<Box<dyn Router>>);

impl RouteAll {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, router: impl Router + 'static) -> Self {
        self.0.push(Box::new(router));
        self
    }
}

impl Router for RouteAll {
    fn route(&self, input: &dyn Input) -> bool {
        self.0.iter().all(|r| r.route(input))
    }
}

/// Replaces a module's own predicate with another router.
pub struct Routed<R, M> {
    router: R,
    module: M,
}

impl<R: Router, M: Module> Routed<R, M> {
    pub fn new(router: R, module: M) -> Self {
        Self { router, module }
    }
}

#[async_trait]
impl<R: Router, M: Module> Module for Routed<R, M> {
    fn route(&self, input: &dyn Input) -> bool {
        self.router.route(input)
    }

    async fn handle(&self, input: &mut dyn Input, output: &mut dyn Output) {
        self.module.handle(input, output).await
    }
}
