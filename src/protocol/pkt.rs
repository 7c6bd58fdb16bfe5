//! pkt-line framing: a 4-digit hex length (header included) followed by the payload.
//! `0000` is a flush packet; `0001` and `0002` are the protocol v2 delimiter and response-end.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

pub const PKT_LINE_END_MARKER: &[u8; 4] = b"0000";
/// Largest packet the protocol allows, header included.
pub const MAX_PKT_LEN: usize = 65520;

/// Encodes `line` as a single pkt-line.
pub fn packet_write(line: &str) -> Bytes {
    let mut pkt = BytesMut::with_capacity(line.len() + 4);
    pkt.put(format!("{:04x}", line.len() + 4).as_bytes());
    pkt.put(line.as_bytes());
    pkt.freeze()
}

pub fn packet_flush() -> Bytes {
    Bytes::from_static(PKT_LINE_END_MARKER)
}

/// Decodes a length header. Returns `None` unless all four bytes are hex digits.
pub fn parse_header(header: &[u8]) -> Option<usize> {
    if header.len() != 4 || !header.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(header).ok()?;
    usize::from_str_radix(text, 16).ok()
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pkt {
    Flush,
    Delim,
    ResponseEnd,
    Data(Bytes),
}

/// Incremental pkt-line decoder fed with arbitrary chunks.
#[derive(Debug, Default)]
pub struct PktDecoder {
    buf: BytesMut,
}

impl PktDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns the next complete packet, `Ok(None)` when more input is needed.
    pub fn next_pkt(&mut self) -> Result<Option<Pkt>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = parse_header(&self.buf[..4]).ok_or_else(|| {
            ProtocolError::InvalidPktLine(format!("bad length header {:?}", &self.buf[..4]))
        })?;
        let special = match len {
            0 => Some(Pkt::Flush),
            1 => Some(Pkt::Delim),
            2 => Some(Pkt::ResponseEnd),
            3 => return Err(ProtocolError::InvalidPktLine("length 3".to_string())),
            n if n > MAX_PKT_LEN => {
                return Err(ProtocolError::InvalidPktLine(format!("length {n} too large")));
            }
            _ => None,
        };
        if let Some(pkt) = special {
            self.buf.advance(4);
            return Ok(Some(pkt));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let mut line = self.buf.split_to(len);
        line.advance(4);
        Ok(Some(Pkt::Data(line.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_lines() {
        assert_eq!(
            &packet_write("# service=git-upload-pack\n")[..],
            b"001e# service=git-upload-pack\n"
        );
        assert_eq!(&packet_write("")[..], b"0004");
        assert_eq!(&packet_flush()[..], b"0000");
    }

    /// Packets split across chunks are only yielded once complete.
    #[test]
    fn decodes_incrementally() {
        let mut decoder = PktDecoder::new();
        decoder.push(b"000ahel");
        assert_eq!(decoder.next_pkt().unwrap(), None);
        decoder.push(b"lo\n00010002");
        assert_eq!(decoder.next_pkt().unwrap(), Some(Pkt::Data(Bytes::from_static(b"hello\n"))));
        assert_eq!(decoder.next_pkt().unwrap(), Some(Pkt::Delim));
        assert_eq!(decoder.next_pkt().unwrap(), Some(Pkt::ResponseEnd));
        decoder.push(b"00");
        assert_eq!(decoder.next_pkt().unwrap(), None);
        decoder.push(b"00");
        assert_eq!(decoder.next_pkt().unwrap(), Some(Pkt::Flush));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn rejects_bad_headers() {
        for bad in [&b"PACK"[..], b"+fff", b"0003", b"fff5"] {
            let mut decoder = PktDecoder::new();
            decoder.push(bad);
            assert!(decoder.next_pkt().is_err(), "{:?}", bad);
        }
    }
}
