//! Pass-through readers that watch pkt-line framing without altering the bytes.
//!
//! [`RpcReader`] wraps a request body on its way to the tool and records ref updates and wants
//! from the command section (everything before the first flush). [`ToolOutputReader`] wraps the
//! tool's output on its way to the client and records the first error the tool signals in-band.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

use super::{
    ServiceType,
    event::Event,
    pkt::{self, Pkt, PktDecoder},
};

/// Longest error message kept from the tool's output.
const MAX_ERROR_LEN: usize = 1024;

/// Error the tool reported inside its output stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ToolError(pub String);

fn is_object_id(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Scans an RPC request body for protocol records.
pub struct RpcReader<R> {
    inner: R,
    service: ServiceType,
    decoder: PktDecoder,
    scanning: bool,
    command: Option<String>,
    events: Vec<Event>,
}

impl<R> RpcReader<R> {
    pub fn new(inner: R, service: ServiceType) -> Self {
        Self {
            inner,
            service,
            decoder: PktDecoder::new(),
            scanning: true,
            command: None,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    fn scan(&mut self, data: &[u8]) {
        if !self.scanning {
            return;
        }
        self.decoder.push(data);
        loop {
            match self.decoder.next_pkt() {
                Ok(Some(Pkt::Data(line))) => self.record(&line),
                Ok(Some(Pkt::Delim | Pkt::ResponseEnd)) => {}
                Ok(Some(Pkt::Flush)) => {
                    self.stop();
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("stopped scanning {} request: {}", self.service, e);
                    self.stop();
                    return;
                }
            }
        }
    }

    fn stop(&mut self) {
        self.scanning = false;
        self.decoder.clear();
    }

    fn record(&mut self, line: &[u8]) {
        let line = match memchr::memchr(0, line) {
            Some(nul) => &line[..nul],
            None => line,
        };
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\n');

        match self.service {
            ServiceType::ReceivePack => {
                let mut fields = line.split(' ');
                if let (Some(old), Some(new), Some(name), None) =
                    (fields.next(), fields.next(), fields.next(), fields.next())
                    && is_object_id(old)
                    && is_object_id(new)
                {
                    self.events.push(Event::ref_update(old, new, name));
                }
            }
            ServiceType::UploadPack => {
                if let Some(command) = line.strip_prefix("command=") {
                    self.command = Some(command.to_string());
                } else if let Some(rest) = line.strip_prefix("want ") {
                    let id = rest.split(' ').next().unwrap_or(rest);
                    if is_object_id(id) {
                        self.events.push(Event::fetch(id, self.command.clone()));
                    }
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RpcReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.scan(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Scans the tool's output for an in-band error.
///
/// Recognised signals are an `ERR ` packet, a side-band 3 packet, and a side-band 2 progress
/// packet containing `error:`. Once the stream stops looking like pkt-lines (raw pack data) the
/// reader only forwards bytes.
pub struct ToolOutputReader<R> {
    inner: R,
    header: [u8; 4],
    header_len: usize,
    remaining: usize,
    payload: Vec<u8>,
    passthrough: bool,
    error: Option<ToolError>,
}

impl<R> ToolOutputReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: [0; 4],
            header_len: 0,
            remaining: 0,
            payload: Vec::new(),
            passthrough: false,
            error: None,
        }
    }

    /// First error the tool signalled, if any.
    pub fn error(&self) -> Option<&ToolError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ToolError> {
        self.error.take()
    }

    fn scan(&mut self, mut data: &[u8]) {
        while !data.is_empty() && !self.passthrough {
            if self.remaining == 0 {
                let take = (4 - self.header_len).min(data.len());
                self.header[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
                self.header_len += take;
                data = &data[take..];
                if self.header_len < 4 {
                    return;
                }
                self.header_len = 0;
                match pkt::parse_header(&self.header) {
                    Some(0..=2) => {}
                    Some(len) if len > 4 => {
                        self.remaining = len - 4;
                        self.payload.clear();
                    }
                    Some(4) => {}
                    _ => self.passthrough = true,
                }
            } else {
                let take = self.remaining.min(data.len());
                let room = MAX_ERROR_LEN.saturating_sub(self.payload.len()).min(take);
                self.payload.extend_from_slice(&data[..room]);
                self.remaining -= take;
                data = &data[take..];
                if self.remaining == 0 {
                    self.inspect();
                }
            }
        }
    }

    fn inspect(&mut self) {
        if self.error.is_some() {
            return;
        }
        let message = match self.payload.split_first() {
            _ if self.payload.starts_with(b"ERR ") => Some(&self.payload[4..]),
            Some((3, rest)) => Some(rest),
            Some((2, rest)) if memchr::memmem::find(rest, b"error:").is_some() => Some(rest),
            _ => None,
        };
        if let Some(message) = message {
            let message = String::from_utf8_lossy(message).trim().to_string();
            self.error = Some(ToolError(message));
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ToolOutputReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.scan(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
