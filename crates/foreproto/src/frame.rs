//! Frame header and cipher constants.
//!
//! ## Wire format
//!
//! ```text
//! bytes 0-3: cipher        u32 little-endian
//! bytes 4-7: frame length  u32 little-endian, header included (binary ciphers)
//! bytes 8..: body          interpretation per cipher
//! ```
//!
//! HTTP traffic shares the listener with the binary protocol. A header
//! whose eight bytes are printable ASCII is not a binary frame at all but
//! the start of an HTTP request line, and is routed to the HTTP parser.

use bytes::{BufMut, Bytes, BytesMut};

/// Length of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Cipher of a parameters frame: a `parameter-id -> typed value` mapping.
pub const CIPHER_PARAMETERS: u32 = 2_666_999_999;

/// Cipher of an action frame: one action code, optionally followed by a
/// parameters payload (`Modify`).
pub const CIPHER_ACTION: u32 = 2_666_999_998;

/// Cipher of a metadata frame: a raw UTF-8 JSON document.
pub const CIPHER_METADATA: u32 = 2_666_999_997;

/// The ASCII bytes `HTTP` as a little-endian u32. Not used as a literal
/// header cipher by browsers (a request line starts with the method), but
/// kept as the dispatch key for the HTTP handler.
pub const CIPHER_HTTP: u32 = u32::from_le_bytes(*b"HTTP");

/// A decoded binary frame: cipher plus body (header stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cipher: u32,
    pub body: Bytes,
}

impl Frame {
    pub fn new(cipher: u32, body: Bytes) -> Self {
        Self { cipher, body }
    }

    /// Serialize header + body into a single buffer ready for the wire.
    pub fn encode(&self) -> Bytes {
        let total = HEADER_LEN + self.body.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(self.cipher);
        buf.put_u32_le(total as u32);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Total on-wire length of this frame, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

/// True for the ciphers this crate decodes itself.
pub fn is_binary_cipher(cipher: u32) -> bool {
    matches!(cipher, CIPHER_PARAMETERS | CIPHER_ACTION | CIPHER_METADATA)
}

/// True when the peeked header bytes look like the start of ASCII text
/// rather than a binary header. HTTP request lines are printable ASCII.
pub fn looks_like_text(header: &[u8]) -> bool {
    header
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b) || b == b'\r' || b == b'\n' || b == b'\t')
}

/// Errors raised while decoding frames or their bodies.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame length {0} is below the header size")]
    LengthBelowHeader(usize),
    #[error("frame body ended early: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown scalar type tag {0}")]
    UnknownTag(u8),
    #[error("unknown action code {0}")]
    UnknownAction(u32),
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("string length {0} exceeds the enclosing frame")]
    StringOverrun(usize),
    #[error("table payload of {size} bytes does not fit its row schema")]
    TableMisaligned { size: usize },
    #[error("HTTP request exceeds the accumulation limit")]
    HttpTooLarge,
    #[error("HTTP parse error: {0}")]
    Http(#[from] httparse::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip_header() {
        let frame = Frame::new(CIPHER_PARAMETERS, Bytes::from_static(b"abc"));
        let wire = frame.encode();
        assert_eq!(wire.len(), HEADER_LEN + 3);
        assert_eq!(u32::from_le_bytes(wire[0..4].try_into().unwrap()), CIPHER_PARAMETERS);
        assert_eq!(u32::from_le_bytes(wire[4..8].try_into().unwrap()), 11);
        assert_eq!(&wire[8..], b"abc");
    }

    #[test]
    fn binary_ciphers() {
        assert!(is_binary_cipher(CIPHER_PARAMETERS));
        assert!(is_binary_cipher(CIPHER_ACTION));
        assert!(is_binary_cipher(CIPHER_METADATA));
        assert!(!is_binary_cipher(CIPHER_HTTP));
        assert!(!is_binary_cipher(0));
    }

    #[test]
    fn request_line_is_text() {
        assert!(looks_like_text(b"GET /api"));
        assert!(looks_like_text(b"HTTP/1.1"));
        assert!(!looks_like_text(&CIPHER_PARAMETERS.to_le_bytes().repeat(2)));
    }
}
