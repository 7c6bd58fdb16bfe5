//! Serves any [`Module`] as an axum handler.
//!
//! The module runs on its own task. The response head is released to axum as soon as the module
//! writes a status line (or its first body bytes); the body follows through a bounded channel,
//! so a slow client applies backpressure to the module and a disconnected client makes its
//! writes fail.

use std::{io, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use super::{cookie_value, query_value};
use crate::module::{BodyReader, Input, Module, Output};

/// Body chunks buffered between the module task and the client.
const BODY_CHANNEL_DEPTH: usize = 16;

/// Builds an axum router that hands every request to `module`.
pub fn router<M: Module + 'static>(module: Arc<M>) -> Router {
    Router::new().fallback(move |request: Request| {
        let module = module.clone();
        async move { serve(module, request).await }
    })
}

/// Runs `module` for one request and returns the streamed response.
pub async fn serve<M: Module + 'static>(module: Arc<M>, request: Request) -> Response {
    let mut input = AxumInput::from_request(request);
    if !module.route(&input) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let mut output = AxumOutput {
        headers: HeaderMap::new(),
        status: None,
        head_tx: Some(head_tx),
        body_tx,
    };

    tokio::spawn(async move {
        module.handle(&mut input, &mut output).await;
        if !output.status_sent() {
            let _ = output.write_status(StatusCode::OK).await;
        }
    });

    match head_rx.await {
        Ok((status, headers)) => {
            let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(_) => {
            tracing::error!("module task ended without a response head");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Request side backed by an axum request.
pub struct AxumInput {
    secure: bool,
    method: Method,
    version: Version,
    host: String,
    path: String,
    raw_query: String,
    headers: HeaderMap,
    body: Mutex<Option<BodyReader>>,
}

impl AxumInput {
    pub fn from_request(request: Request) -> Self {
        let (parts, body) = request.into_parts();
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default();
        let secure = parts.uri.scheme_str() == Some("https")
            || parts
                .headers
                .get("x-forwarded-proto")
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"https"));

        let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
        let reader: BodyReader = Box::new(Box::pin(StreamReader::new(stream)));

        Self {
            secure,
            method: parts.method,
            version: parts.version,
            host,
            path: parts.uri.path().to_string(),
            raw_query: parts.uri.query().unwrap_or_default().to_string(),
            headers: parts.headers,
            body: Mutex::new(Some(reader)),
        }
    }
}

impl Input for AxumInput {
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

    // Form bodies are not parsed; the body belongs to the module.
    fn form_value(&self, key: &str) -> Option<String> {
        self.query(key)
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|h| cookie_value(h, name))
    }

    fn take_body(&mut self) -> Option<BodyReader> {
        self.body.get_mut().ok()?.take()
    }
}

/// Response side feeding the channels read by [`serve`].
pub struct AxumOutput {
    headers: HeaderMap,
    status: Option<StatusCode>,
    head_tx: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body_tx: mpsc::Sender<io::Result<Bytes>>,
}

#[async_trait]
impl Output for AxumOutput {
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
        if self.status.is_some() {
            return Ok(());
        }
        self.status = Some(status);
        match self.head_tx.take() {
            Some(tx) => tx
                .send((status, self.headers.clone()))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away")),
            None => Ok(()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.status.is_none() {
            self.write_status(StatusCode::OK).await?;
        }
        if data.is_empty() {
            return Ok(());
        }
        self.body_tx
            .send(Ok(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    async fn abort(&mut self, error: io::Error) {
        if self.status.is_none() {
            let _ = self.write_status(StatusCode::INTERNAL_SERVER_ERROR).await;
        }
        // an error chunk makes the server reset the body instead of ending it cleanly
        let _ = self.body_tx.send(Err(error)).await;
    }
}
