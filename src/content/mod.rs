//! Content server: serves a seekable byte resource, or a file or directory from disk, with
//! conditional-request, byte-range and content-type handling.
//!
//! - [`serve_content`] serves any `AsyncRead + AsyncSeek` resource, measuring its size by seeking.
//! - [`serve_content_sized`] is the same with a size already known to the caller.
//! - [`serve_file`] serves a filesystem path, listing directories and redirecting to canonical
//!   directory URLs.
//!
//! Multi-range responses are framed as `multipart/byteranges`; the parts are produced by a
//! separate future feeding a bounded channel while the response writer drains it.

pub mod condition;
pub mod range;
pub mod sniff;

use std::{
    fs::Metadata,
    io::{self, SeekFrom},
    path::Path,
};

use axum::http::{Method, StatusCode, header};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
    sync::mpsc,
};

use crate::module::{Input, Output};
use condition::{CondResult, Decision};
use range::{ByteRange, MultipartWriter, RangeError};

const INDEX_PAGE: &str = "/index.html";
const COPY_BUF_SIZE: usize = 32 * 1024;
/// Chunks buffered between the multipart producer and the response writer.
const PART_CHANNEL_DEPTH: usize = 4;

/// Characters escaped in directory listing links.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("seeker can't seek")]
pub struct SeekError;

/// Where the content server gets the resource size from.
enum Size {
    Known(u64),
    Measure,
}

/// Writes a plain-text error response: `msg` followed by a newline.
pub async fn error(output: &mut dyn Output, msg: &str, status: StatusCode) {
    output.remove_header(&header::CONTENT_LENGTH);
    output.set_header(header::CONTENT_TYPE, sniff::TEXT_PLAIN_UTF8);
    output.set_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
    if output.write_status(status).await.is_ok() {
        let _ = output.write(format!("{msg}\n").as_bytes()).await;
    }
}

/// Serves `content`, measuring its size by seeking to the end and back.
///
/// `name` is only used to guess the content type from its extension when the response has no
/// `Content-Type` yet. `modtime` of `None` (or the Unix epoch) means unknown.
pub async fn serve_content<C>(
    input: &dyn Input,
    output: &mut dyn Output,
    name: &str,
    modtime: Option<DateTime<Utc>>,
    content: &mut C,
) where
    C: AsyncRead + AsyncSeek + Send + Unpin + ?Sized,
{
    serve(input, output, name, modtime, Size::Measure, content).await
}

/// Serves `content` whose total length is already known.
pub async fn serve_content_sized<C>(
    input: &dyn Input,
    output: &mut dyn Output,
    name: &str,
    modtime: Option<DateTime<Utc>>,
    size: u64,
    content: &mut C,
) where
    C: AsyncRead + AsyncSeek + Send + Unpin + ?Sized,
{
    serve(input, output, name, modtime, Size::Known(size), content).await
}

/// Serves a file or directory from disk.
///
/// Requests whose URL path contains a `..` segment are refused. A directory is served through its
/// `index.html` when present, else as a sorted link listing.
pub async fn serve_file(input: &dyn Input, output: &mut dyn Output, path: &Path) {
    let url = input.path();
    if contains_dot_dot(url) {
        error(output, "invalid URL path", StatusCode::BAD_REQUEST).await;
        return;
    }
    if url.ends_with(INDEX_PAGE) {
        local_redirect(input, output, "./").await;
        return;
    }

    let mut path = path.to_path_buf();
    let mut meta = match fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => return http_error(output, &e).await,
    };

    if meta.is_dir() {
        if !url.ends_with('/') {
            let base = url.rsplit('/').next().unwrap_or(url);
            local_redirect(input, output, &format!("{base}/")).await;
            return;
        }
        let index = path.join("index.html");
        if let Ok(index_meta) = fs::metadata(&index).await {
            path = index;
            meta = index_meta;
        }
    }

    let modtime = modified(&meta);
    if meta.is_dir() {
        if condition::check_if_modified_since(input, modtime) == CondResult::False {
            write_not_modified(output).await;
            return;
        }
        set_last_modified(output, modtime);
        dir_list(input, output, &path).await;
        return;
    }

    let mut file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => return http_error(output, &e).await,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    serve(input, output, &name, modtime, Size::Known(meta.len()), &mut file).await
}

async fn serve<C>(
    input: &dyn Input,
    output: &mut dyn Output,
    name: &str,
    modtime: Option<DateTime<Utc>>,
    size: Size,
    content: &mut C,
) where
    C: AsyncRead + AsyncSeek + Send + Unpin + ?Sized,
{
    set_last_modified(output, modtime);
    let range_header = match condition::evaluate(input, output.header(&header::ETAG), modtime) {
        Decision::NotModified => return write_not_modified(output).await,
        Decision::PreconditionFailed => {
            let _ = output.write_status(StatusCode::PRECONDITION_FAILED).await;
            return;
        }
        Decision::Proceed { range } => range.unwrap_or_default(),
    };

    let ctype = match output.header(&header::CONTENT_TYPE) {
        Some(ctype) => ctype.to_string(),
        None => {
            let ctype = match sniff::type_by_extension(name) {
                Some(ctype) => ctype,
                None => {
                    let mut buf = [0u8; sniff::SNIFF_LEN];
                    let n = read_full(content, &mut buf).await;
                    let ctype = sniff::detect_content_type(&buf[..n]);
                    if content.seek(SeekFrom::Start(0)).await.is_err() {
                        let msg = SeekError.to_string();
                        error(output, &msg, StatusCode::INTERNAL_SERVER_ERROR).await;
                        return;
                    }
                    ctype
                }
            };
            output.add_header(header::CONTENT_TYPE, ctype);
            ctype.to_string()
        }
    };

    let size = match size {
        Size::Known(size) => size,
        Size::Measure => match measure(content).await {
            Ok(size) => size,
            Err(e) => {
                error(output, &e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).await;
                return;
            }
        },
    };

    let mut ranges = match range::parse_range(&range_header, size) {
        Ok(ranges) => ranges,
        Err(e) => {
            if e == RangeError::NoOverlap {
                output.add_header(header::CONTENT_RANGE, &format!("bytes */{size}"));
            }
            error(output, &e.to_string(), StatusCode::RANGE_NOT_SATISFIABLE).await;
            return;
        }
    };
    // overlapping ranges that add up to more than the resource are served whole
    if range::sum_ranges_size(&ranges) > size {
        ranges.clear();
    }

    let mut status = StatusCode::OK;
    let mut send_size = size;
    let mut multipart = None;
    match ranges.as_slice() {
        [] => {}
        [single] => {
            if let Err(e) = content.seek(SeekFrom::Start(single.start)).await {
                error(output, &e.to_string(), StatusCode::RANGE_NOT_SATISFIABLE).await;
                return;
            }
            send_size = single.length;
            status = StatusCode::PARTIAL_CONTENT;
            output.add_header(header::CONTENT_RANGE, &single.content_range(size));
        }
        _ => {
            let writer = MultipartWriter::new();
            send_size = range::multipart_size(&ranges, &ctype, size, writer.boundary());
            status = StatusCode::PARTIAL_CONTENT;
            output.set_header(header::CONTENT_TYPE, &writer.content_type());
            multipart = Some(writer);
        }
    }

    output.set_header(header::ACCEPT_RANGES, "bytes");
    if output.header(&header::CONTENT_ENCODING).is_none() {
        output.set_header(header::CONTENT_LENGTH, &send_size.to_string());
    }

    if let Err(e) = output.write_status(status).await {
        tracing::warn!("failed to write response head for {}: {}", name, e);
        return;
    }
    if *input.method() == Method::HEAD {
        return;
    }

    let sent = match multipart {
        Some(writer) => send_multipart(content, output, writer, &ranges, &ctype, size).await,
        None => copy_n(content, output, send_size).await.map(|_| ()),
    };
    if let Err(e) = sent {
        tracing::warn!("aborted response body for {}: {}", name, e);
        output.abort(e).await;
    }
}

/// Answers `304 Not Modified`, dropping the representation headers.
pub async fn write_not_modified(output: &mut dyn Output) {
    output.remove_header(&header::CONTENT_TYPE);
    output.remove_header(&header::CONTENT_LENGTH);
    if output.header(&header::ETAG).is_some() {
        output.remove_header(&header::LAST_MODIFIED);
    }
    let _ = output.write_status(StatusCode::NOT_MODIFIED).await;
}

fn set_last_modified(output: &mut dyn Output, modtime: Option<DateTime<Utc>>) {
    if let Some(t) = modtime.filter(|_| !condition::is_zero_time(modtime)) {
        output.set_header(header::LAST_MODIFIED, &condition::format_http_date(t));
    }
}

fn modified(meta: &Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

async fn measure<C>(content: &mut C) -> Result<u64, SeekError>
where
    C: AsyncSeek + Unpin + ?Sized,
{
    let size = content.seek(SeekFrom::End(0)).await.map_err(|_| SeekError)?;
    content.seek(SeekFrom::Start(0)).await.map_err(|_| SeekError)?;
    Ok(size)
}

/// Reads until `buf` is full or the reader stops yielding bytes.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> usize
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}

/// Copies at most `n` bytes from `reader` to the response body.
async fn copy_n<R>(reader: &mut R, output: &mut dyn Output, n: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = n;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = reader.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        output.write(&buf[..read]).await?;
        remaining -= read as u64;
    }
    Ok(n - remaining)
}

/// Streams a `multipart/byteranges` body.
///
/// The producer seeks and reads each range into a bounded channel; the consumer forwards chunks
/// to the response. A producer failure is delivered in-band and ends the body early. When the
/// consumer stops, its receiver is dropped and the producer's next send fails, ending it too.
async fn send_multipart<C>(
    content: &mut C,
    output: &mut dyn Output,
    mut writer: MultipartWriter,
    ranges: &[ByteRange],
    ctype: &str,
    size: u64,
) -> io::Result<()>
where
    C: AsyncRead + AsyncSeek + Send + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(PART_CHANNEL_DEPTH);

    let producer = async move {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        for range in ranges {
            let head = writer.part_header(range, ctype, size);
            if tx.send(Ok(Bytes::from(head))).await.is_err() {
                return;
            }
            if let Err(e) = content.seek(SeekFrom::Start(range.start)).await {
                let _ = tx.send(Err(e)).await;
                return;
            }
            let mut remaining = range.length;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let chunk = match content.read(&mut buf[..want]).await {
                    Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(n) => {
                        remaining -= n as u64;
                        Ok(Bytes::copy_from_slice(&buf[..n]))
                    }
                    Err(e) => Err(e),
                };
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    return;
                }
            }
        }
        let _ = tx.send(Ok(Bytes::from(writer.finish()))).await;
    };

    let consumer = async move {
        while let Some(chunk) = rx.recv().await {
            output.write(&chunk?).await?;
        }
        Ok(())
    };

    let ((), sent) = tokio::join!(producer, consumer);
    sent
}

async fn dir_list(input: &dyn Input, output: &mut dyn Output, dir: &Path) {
    let mut entries = match read_entries(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("failed to read directory {}: {}", dir.display(), e);
            error(output, "Error reading directory", StatusCode::INTERNAL_SERVER_ERROR).await;
            return;
        }
    };
    entries.sort();

    let mut listing = String::from("<pre>\n");
    for (mut name, is_dir) in entries {
        if is_dir {
            name.push('/');
        }
        let href = utf8_percent_encode(&name, PATH_SEGMENT);
        listing.push_str(&format!("<a href=\"{href}\">{}</a>\n", html_escape(&name)));
    }
    listing.push_str("</pre>\n");

    output.set_header(header::CONTENT_TYPE, "text/html; charset=utf-8");
    if output.write_status(StatusCode::OK).await.is_err() || *input.method() == Method::HEAD {
        return;
    }
    let _ = output.write(listing.as_bytes()).await;
}

async fn read_entries(dir: &Path) -> io::Result<Vec<(String, bool)>> {
    let mut read_dir = fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    Ok(entries)
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

async fn http_error(output: &mut dyn Output, e: &io::Error) {
    let (msg, status) = match e.kind() {
        io::ErrorKind::NotFound => ("404 page not found", StatusCode::NOT_FOUND),
        io::ErrorKind::PermissionDenied => ("403 Forbidden", StatusCode::FORBIDDEN),
        _ => ("500 Internal Server Error", StatusCode::INTERNAL_SERVER_ERROR),
    };
    error(output, msg, status).await
}

async fn local_redirect(input: &dyn Input, output: &mut dyn Output, target: &str) {
    let location = match input.raw_query() {
        "" => target.to_string(),
        query => format!("{target}?{query}"),
    };
    output.set_header(header::LOCATION, &location);
    let _ = output.write_status(StatusCode::MOVED_PERMANENTLY).await;
}

fn contains_dot_dot(path: &str) -> bool {
    path.contains("..") && path.split(['/', '\\']).any(|segment| segment == "..")
}
