//! Events recognised in RPC request bodies and the sinks they are delivered to.

use std::path::{Path, PathBuf};

use axum::http::Method;

use super::ServiceType;
use crate::module::Input;

/// Object id of the all-zero hash, in either hash width.
fn is_zero_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b == b'0')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A ref update outside `refs/tags/`.
    Push,
    /// A ref update under `refs/tags/`.
    Tag,
    /// A ref update whose new id is all zeros.
    Delete,
    /// An upload-pack `want`.
    Fetch,
}

/// Snapshot of the request an event originated from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    pub host: String,
    pub user_agent: Option<String>,
    pub secure: bool,
}

impl RequestInfo {
    pub fn from_input(input: &dyn Input) -> Self {
        Self {
            method: input.method().clone(),
            path: input.path().to_string(),
            host: input.host().to_string(),
            user_agent: input.header("User-Agent").map(str::to_string),
            secure: input.secure(),
        }
    }
}

/// A ref update or fetch observed in a request body.
///
/// `dir`, `request` and `error` are filled in by the gateway once the tool has exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub service: ServiceType,
    /// Repository directory.
    pub dir: PathBuf,
    pub request: RequestInfo,
    /// Terminal error of the RPC, if it failed.
    pub error: Option<String>,
    /// New id for ref updates, wanted id for fetches.
    pub commit: String,
    /// Previous id for ref updates; empty for fetches.
    pub last: String,
    pub ref_name: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    /// Protocol v2 command the record belonged to.
    pub command: Option<String>,
}

impl Event {
    fn new(kind: EventKind, service: ServiceType) -> Self {
        Self {
            kind,
            service,
            dir: PathBuf::new(),
            request: RequestInfo::default(),
            error: None,
            commit: String::new(),
            last: String::new(),
            ref_name: String::new(),
            branch: None,
            tag: None,
            command: None,
        }
    }

    /// Event for a receive-pack command `old new ref`.
    pub fn ref_update(old: &str, new: &str, ref_name: &str) -> Self {
        let tag = ref_name.strip_prefix("refs/tags/").map(str::to_string);
        let branch = ref_name.strip_prefix("refs/heads/").map(str::to_string);
        let kind = if is_zero_id(new) {
            EventKind::Delete
        } else if tag.is_some() {
            EventKind::Tag
        } else {
            EventKind::Push
        };
        Self {
            commit: new.to_string(),
            last: old.to_string(),
            ref_name: ref_name.to_string(),
            branch,
            tag,
            ..Self::new(kind, ServiceType::ReceivePack)
        }
    }

    /// Event for an upload-pack `want <id>`.
    pub fn fetch(want: &str, command: Option<String>) -> Self {
        Self {
            commit: want.to_string(),
            command,
            ..Self::new(EventKind::Fetch, ServiceType::UploadPack)
        }
    }

    /// Attaches the repository, originating request and outcome of the RPC.
    pub fn stamp(&mut self, dir: &Path, request: &RequestInfo, error: Option<&str>) {
        self.dir = dir.to_path_buf();
        self.request = request.clone();
        self.error = error.map(str::to_string);
    }
}

/// Receives events after an RPC finished.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}

/// Logs each event; used when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        tracing::info!(
            kind = ?event.kind,
            dir = %event.dir.display(),
            ref_name = %event.ref_name,
            commit = %event.commit,
            error = ?event.error,
            "git event"
        );
    }
}
