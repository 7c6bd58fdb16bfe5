//! In-memory request and response recorder.
//!
//! Useful for embedding a module behind a transport that already buffers requests, and for
//! exercising modules in tests without a socket.

use std::{io, sync::Mutex};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use super::{cookie_value, query_value};
use crate::module::{BodyReader, Input, Output};

/// A fully buffered request.
pub struct MemoryInput {
    secure: bool,
    method: Method,
    version: Version,
    host: String,
    path: String,
    raw_query: String,
    headers: HeaderMap,
    form: Vec<(String, String)>,
    body: Mutex<Option<BodyReader>>,
}

impl MemoryInput {
    pub fn new(method: Method, path: &str) -> Self {
        let (path, raw_query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path.to_string(), String::new()),
        };
        Self {
            secure: false,
            method,
            version: Version::HTTP_11,
            host: "localhost".to_string(),
            path,
            raw_query,
            headers: HeaderMap::new(),
            form: Vec::new(),
            body: Mutex::new(None),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: &str) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!("ignoring invalid header {}: {:?}", name, value),
        }
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_form(mut self, key: &str, value: &str) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(self, body: impl Into<Vec<u8>>) -> Self {
        let reader: BodyReader = Box::new(io::Cursor::new(body.into()));
        self.with_body_reader(reader)
    }

    pub fn with_body_reader(mut self, reader: BodyReader) -> Self {
        self.body = Mutex::new(Some(reader));
        self
    }
}

impl Input for MemoryInput {
    fn secure(&self) -> bool {
        self.secure
    }

    fn method(&self) -> &Method {
        &self.method
    }

    fn version(&self) -> Version {
        self.version
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn raw_query(&self) -> &str {
        &self.raw_query
    }

    fn query(&self, key: &str) -> Option<String> {
        query_value(&self.raw_query, key)
    }

    fn form_value(&self, key: &str) -> Option<String> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| self.query(key))
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all("cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|h| cookie_value(h, name))
    }

    fn take_body(&mut self) -> Option<BodyReader> {
        self.body.get_mut().ok()?.take()
    }
}

/// Records everything a module writes.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
    aborted: Option<String>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status as written, or `None` when the module never responded.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Error the body was aborted with, if any.
    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// All values of a header, in insertion order.
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Output for MemoryOutput {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.status.is_none() {
            self.headers.append(name, value);
        }
    }

    fn remove_header(&mut self, name: &HeaderName) {
        if self.status.is_none() {
            self.headers.remove(name);
        }
    }

    fn status_sent(&self) -> bool {
        self.status.is_some()
    }

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        if self.status.is_none() {
            self.status = Some(status);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    async fn abort(&mut self, error: io::Error) {
        if self.status.is_none() {
            self.status = Some(StatusCode::INTERNAL_SERVER_ERROR);
        }
        self.aborted.get_or_insert_with(|| error.to_string());
    }
}
