//! Request body decoding selected by `Content-Encoding`.
//!
//! Git clients gzip large RPC requests. The decoder is a sync [`flate2`] write-side decoder fed
//! with chunks read from the async body; decoded bytes are handed out from its buffer.

use std::{
    io::{self, Write},
    pin::Pin,
    task::{Context, Poll, ready},
};

use flate2::write::{DeflateDecoder, GzDecoder};
use tokio::io::{AsyncRead, ReadBuf};

const CHUNK_SIZE: usize = 16 * 1024;

enum Decoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    /// Raw deflate, without a zlib header.
    Deflate(DeflateDecoder<Vec<u8>>),
}

impl Decoder {
    fn for_encoding(encoding: Option<&str>) -> Self {
        match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip" | "x-gzip") => Decoder::Gzip(GzDecoder::new(Vec::new())),
            Some("deflate") => Decoder::Deflate(DeflateDecoder::new(Vec::new())),
            _ => Decoder::Identity,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Decoder::Identity => Ok(()),
            Decoder::Gzip(d) => d.write_all(data),
            Decoder::Deflate(d) => d.write_all(data),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            Decoder::Identity => Ok(()),
            Decoder::Gzip(d) => d.try_finish(),
            Decoder::Deflate(d) => d.try_finish(),
        }
    }

    fn take_output(&mut self) -> Vec<u8> {
        match self {
            Decoder::Identity => Vec::new(),
            Decoder::Gzip(d) => std::mem::take(d.get_mut()),
            Decoder::Deflate(d) => std::mem::take(d.get_mut()),
        }
    }
}

/// Async reader yielding the decoded request body.
pub struct DecodedBody<R> {
    inner: R,
    decoder: Decoder,
    pending: Vec<u8>,
    pos: usize,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R> DecodedBody<R> {
    /// Wraps `inner`, decoding according to the request's `Content-Encoding` value.
    pub fn new(inner: R, content_encoding: Option<&str>) -> Self {
        Self {
            inner,
            decoder: Decoder::for_encoding(content_encoding),
            pending: Vec::new(),
            pos: 0,
            chunk: vec![0; CHUNK_SIZE].into_boxed_slice(),
            eof: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecodedBody<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Decoder::Identity = this.decoder {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = ReadBuf::new(&mut this.chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
            let read = chunk.filled().len();
            if read == 0 {
                this.decoder.finish()?;
                this.eof = true;
            } else {
                this.decoder.write(&this.chunk[..read])?;
            }
            this.pending = this.decoder.take_output();
            this.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{
        Compression,
        write::{DeflateEncoder, GzEncoder},
    };
    use tokio::io::AsyncReadExt;

    const BODY: &[u8] = b"0032want 0123456789abcdef0123456789abcdef01234567\n00000009done\n";

    async fn decode(data: Vec<u8>, encoding: Option<&str>) -> io::Result<Vec<u8>> {
        let mut reader = DecodedBody::new(io::Cursor::new(data), encoding);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn decodes_by_content_encoding() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(BODY).unwrap();
        assert_eq!(decode(gz.finish().unwrap(), Some("gzip")).await.unwrap(), BODY);

        let mut deflate = DeflateEncoder::new(Vec::new(), Compression::best());
        deflate.write_all(BODY).unwrap();
        assert_eq!(decode(deflate.finish().unwrap(), Some("Deflate")).await.unwrap(), BODY);

        assert_eq!(decode(BODY.to_vec(), None).await.unwrap(), BODY);
        assert_eq!(decode(BODY.to_vec(), Some("br")).await.unwrap(), BODY);
    }

    /// A large body decodes across many chunks.
    #[tokio::test]
    async fn decodes_large_gzip_body() {
        let body: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&body).unwrap();
        assert_eq!(decode(gz.finish().unwrap(), Some("gzip")).await.unwrap(), body);
    }

    #[tokio::test]
    async fn truncated_gzip_is_an_error() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(BODY).unwrap();
        let mut data = gz.finish().unwrap();
        data.truncate(6);
        assert!(decode(data, Some("gzip")).await.is_err());
    }
}
