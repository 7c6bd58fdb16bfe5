//! Error types for the gateway crate.
//!
//! This module defines the error enumeration returned by the transfer gateway's handler
//! operations. The gateway classifies each value into an HTTP status once, in
//! [`GatewayError::status`], so handlers only have to say *what* went wrong.
//!
//! Notes:
//! - Existence failures from the filesystem arrive as `Io` with `ErrorKind::NotFound` and are
//!   classified like `NotFound`.
//! - Once response headers have been sent, errors can no longer change the status; they are
//!   reported through the event's terminal error instead.

use std::{io, path::PathBuf};

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for gateway handler operations.
pub enum GatewayError {
    /// No route, repository or file exists for the request.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Access policy refused the operation for this repository.
    #[error("Access denied for repository {}", .0.display())]
    AccessDenied(PathBuf),

    /// The route exists but expects another HTTP method.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Malformed request or configuration value.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error from the filesystem, pipes or the request body.
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    /// The external tool could not be run or reported a failure.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Generic internal failure.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn not_found(what: impl Into<String>) -> Self {
        GatewayError::NotFound(what.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        GatewayError::Tool(msg.into())
    }

    /// Returns true for the "does not exist" family, including raw I/O not-found errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            GatewayError::NotFound(_) => true,
            GatewayError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// HTTP status this error is rendered with when no response has been started yet.
    pub fn status(&self) -> StatusCode {
        match self {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
