//! Record framing on the socket.
//!
//! # Record Format
//!
//! Each encrypted record is preceded by a small clear-text header:
//! - 4 bytes: magic bytes "WSPR"
//! - 4 bytes: body length (big-endian)
//! - N bytes: body (`IV || ciphertext`, see [`crate::cipher`])
//!
//! Protocol version 1 relied on a single fixed-size socket read per message,
//! which truncated anything larger than the buffer and broke whenever TCP
//! split a write. The explicit length makes reads exact.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a record.
pub const RECORD_MAGIC: [u8; 4] = *b"WSPR";

/// Header size: 4 (magic) + 4 (length) = 8 bytes.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Maximum body size (64 KB).
///
/// Handshake messages carry at most a few RSA keys and signatures.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// Builds the header announcing a body of `body_len` bytes.
pub fn encode_header(body_len: usize) -> Result<[u8; RECORD_HEADER_SIZE]> {
    if body_len > MAX_RECORD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: MAX_RECORD_SIZE,
        });
    }

    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[..4].copy_from_slice(&RECORD_MAGIC);
    header[4..].copy_from_slice(&(body_len as u32).to_be_bytes());
    Ok(header)
}

/// Validates a header and returns the body length it announces.
pub fn decode_header(header: &[u8; RECORD_HEADER_SIZE]) -> Result<usize> {
    let magic = &header[..4];
    if magic != RECORD_MAGIC {
        let expected = u32::from_be_bytes(RECORD_MAGIC);
        let got = u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]);
        return Err(ProtocolError::Malformed(format!(
            "invalid record magic: expected 0x{:08x} (WSPR), got 0x{:08x}",
            expected, got
        )));
    }

    let body_len =
        u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if body_len > MAX_RECORD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: MAX_RECORD_SIZE,
        });
    }

    Ok(body_len)
}

/// Prepends the header to `body`.
pub fn frame(body: &[u8]) -> Result<Vec<u8>> {
    let header = encode_header(body.len())?;
    let mut output = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
    output.extend_from_slice(&header);
    output.extend_from_slice(body);
    Ok(output)
}
