//! Git smart-HTTP wire format: service kinds, pkt-line framing, the stream scanners that observe
//! framing in request and tool-output bodies, and the events they produce.

pub mod event;
pub mod pkt;
pub mod scanner;

use std::{fmt, str::FromStr};

pub use event::{Event, EventKind, EventSink, LogSink, RequestInfo};
pub use pkt::{Pkt, PktDecoder, packet_flush, packet_write};
pub use scanner::{RpcReader, ToolError, ToolOutputReader};

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Invalid pkt-line: {0}")]
    InvalidPktLine(String),
}

/// The two stateless RPC services of the smart protocol.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl ServiceType {
    /// Subcommand name passed to the git binary, e.g. `upload-pack`.
    pub fn rpc_name(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "upload-pack",
            ServiceType::ReceivePack => "receive-pack",
        }
    }

    /// Parses a bare subcommand name as used in request paths.
    pub fn from_rpc_name(name: &str) -> Option<Self> {
        match name {
            "upload-pack" => Some(ServiceType::UploadPack),
            "receive-pack" => Some(ServiceType::ReceivePack),
            _ => None,
        }
    }

    /// Repository config key enabling the service over HTTP.
    pub fn config_key(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "http.uploadpack",
            ServiceType::ReceivePack => "http.receivepack",
        }
    }

    pub fn request_content_type(&self) -> String {
        format!("application/x-git-{}-request", self.rpc_name())
    }

    pub fn result_content_type(&self) -> String {
        format!("application/x-git-{}-result", self.rpc_name())
    }

    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-git-{}-advertisement", self.rpc_name())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "git-{}", self.rpc_name())
    }
}

impl FromStr for ServiceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("git-")
            .and_then(ServiceType::from_rpc_name)
            .ok_or_else(|| ProtocolError::InvalidService(s.to_string()))
    }
}
