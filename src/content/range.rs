//! `Range` header parsing and the `multipart/byteranges` envelope.

use std::fmt::Write as _;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range")]
    Invalid,

    /// The header parsed but no range overlaps the resource.
    #[error("invalid range: failed to overlap")]
    NoOverlap,
}

/// A byte span `[start, start + length)` of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// `Content-Range` value for this range of a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length - 1,
            size
        )
    }
}

/// Parses a `Range` header against a resource of `size` bytes.
///
/// An empty header yields no ranges. Entries starting at or past the end are dropped; when every
/// entry was dropped the result is [`RangeError::NoOverlap`].
pub fn parse_range(header: &str, size: u64) -> Result<Vec<ByteRange>, RangeError> {
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let set = header.strip_prefix("bytes=").ok_or(RangeError::Invalid)?;

    let mut ranges = Vec::new();
    let mut no_overlap = false;
    for entry in set.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (start, end) = entry.split_once('-').ok_or(RangeError::Invalid)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            // suffix: the last `end` bytes
            let suffix: u64 = end.parse().map_err(|_| RangeError::Invalid)?;
            if suffix == 0 || size == 0 {
                no_overlap = true;
                continue;
            }
            let start = size - suffix.min(size);
            ranges.push(ByteRange::new(start, size - start));
            continue;
        }

        let start: u64 = start.parse().map_err(|_| RangeError::Invalid)?;
        if start >= size {
            no_overlap = true;
            continue;
        }
        let length = if end.is_empty() {
            size - start
        } else {
            let end: u64 = end.parse().map_err(|_| RangeError::Invalid)?;
            if start > end {
                return Err(RangeError::Invalid);
            }
            end.min(size - 1) - start + 1
        };
        ranges.push(ByteRange::new(start, length));
    }

    if no_overlap && ranges.is_empty() {
        return Err(RangeError::NoOverlap);
    }
    Ok(ranges)
}

pub fn sum_ranges_size(ranges: &[ByteRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

/// Writes the framing of a `multipart/byteranges` body: part headers and the closing delimiter.
/// Part payloads are written by the caller between headers.
#[derive(Debug, Clone)]
pub struct MultipartWriter {
    boundary: String,
    parts: usize,
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartWriter {
    /// Creates a writer with a random boundary.
    pub fn new() -> Self {
        Self::with_boundary(Uuid::new_v4().simple().to_string())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the response `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/byteranges; boundary={}", self.boundary)
    }

    /// Delimiter and headers preceding the payload of the next part.
    pub fn part_header(&mut self, range: &ByteRange, content_type: &str, size: u64) -> String {
        let mut out = String::new();
        if self.parts > 0 {
            out.push_str("\r\n");
        }
        self.parts += 1;
        let _ = write!(out, "--{}\r\n", self.boundary);
        let _ = write!(out, "Content-Range: {}\r\n", range.content_range(size));
        let _ = write!(out, "Content-Type: {}\r\n", content_type);
        out.push_str("\r\n");
        out
    }

    /// Closing delimiter.
    pub fn finish(&self) -> String {
        if self.parts > 0 {
            format!("\r\n--{}--\r\n", self.boundary)
        } else {
            format!("--{}--\r\n", self.boundary)
        }
    }
}

/// Exact encoded length of a multipart body carrying `ranges`, framed with `boundary`.
pub fn multipart_size(ranges: &[ByteRange], content_type: &str, size: u64, boundary: &str) -> u64 {
    let mut writer = MultipartWriter::with_boundary(boundary);
    let mut encoded = 0u64;
    for range in ranges {
        encoded += writer.part_header(range, content_type, size).len() as u64;
        encoded += range.length;
    }
    encoded + writer.finish().len() as u64
}
