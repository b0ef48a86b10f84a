//! Length-delimited JSON framing.
//!
//! Every message on the wire is a UTF-8 JSON document followed by the
//! two-byte terminator `\r\n`. A single socket read may carry several whole
//! frames, a partial frame, or both, so each connection owns a [`FrameReader`]
//! that accumulates raw chunks and yields complete frames in arrival order.
//! Writers always emit `\r\n`; readers also accept a lone `\n` from legacy
//! peers.

pub mod json;

pub use json::Backend;

use bytes::{Bytes, BytesMut};

/// The terminator appended to every outbound frame.
pub const TERMINATOR: &[u8] = b"\r\n";

/// There is no frame-size cap at the protocol layer, but an unbounded read
/// buffer is an invitation to memory exhaustion, so a configurable limit is
/// enforced per connection.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    FrameTooLarge { size: usize, limit: usize },
    Utf8(std::str::Utf8Error),
    Json(serde_json::Error),
    Json5(serde_json5::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge { size, limit } => {
                write!(f, "frame too large: size={}, limit={}", size, limit)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<serde_json5::Error> for Error {
    fn from(value: serde_json5::Error) -> Self {
        Self::Json5(value)
    }
}

/// Splits a byte stream into terminator-delimited frames.
///
/// The reader keeps the position already scanned for a terminator so feeding
/// it many small chunks does not rescan the whole buffer each time.
///
/// ```
/// use broker_server_codec::FrameReader;
///
/// let mut reader = FrameReader::default();
/// reader.extend(b"{\"a\":1}\r\n{\"b\"");
///
/// assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"a\":1}"[..]));
/// assert_eq!(reader.next_frame().unwrap(), None);
///
/// reader.extend(b":2}\n");
/// assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"b\":2}"[..]));
/// ```
pub struct FrameReader {
    buffer: BytesMut,
    scanned: usize,
    limit: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameReader {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scanned: 0,
            limit,
        }
    }

    /// Append a raw chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, without its terminator.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet contain a whole
    /// frame. Fails when the buffered partial frame, or a completed frame,
    /// exceeds the configured limit; the connection must be closed in that
    /// case, the reader is no longer in a usable state.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, Error> {
        if let Some(pos) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let mut frame = self.buffer.split_to(self.scanned + pos + 1);
            self.scanned = 0;

            frame.truncate(frame.len() - 1);
            if frame.last() == Some(&b'\r') {
                frame.truncate(frame.len() - 1);
            }

            if frame.len() > self.limit {
                return Err(Error::FrameTooLarge {
                    size: frame.len(),
                    limit: self.limit,
                });
            }

            return Ok(Some(frame.freeze()));
        }

        self.scanned = self.buffer.len();
        if self.buffer.len() > self.limit {
            return Err(Error::FrameTooLarge {
                size: self.buffer.len(),
                limit: self.limit,
            });
        }

        Ok(None)
    }

    /// Number of buffered bytes not yet yielded as frames.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }
}

/// Serialize a JSON value and append the terminator.
///
/// JSON serialization of a tree of plain values never produces bare control
/// bytes, so the terminator cannot appear inside the payload.
pub fn encode_frame(backend: &Backend, value: &serde_json::Value) -> Result<Bytes, Error> {
    let mut bytes = backend.encode(value)?;
    bytes.extend_from_slice(TERMINATOR);
    Ok(Bytes::from(bytes))
}

/// Parse one frame payload (terminator already stripped) into a JSON value.
pub fn decode_frame(backend: &Backend, bytes: &[u8]) -> Result<serde_json::Value, Error> {
    backend.decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_coalesced_frames() {
        let mut reader = FrameReader::default();
        reader.extend(b"{\"a\":1}\r\n{\"b\":2}\r\n{\"c\"");

        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"b\":2}"[..]));
        assert_eq!(reader.next_frame().unwrap(), None);

        reader.extend(b":3}\r\n");
        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"c\":3}"[..]));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn accepts_bare_newline() {
        let mut reader = FrameReader::default();
        reader.extend(b"{\"a\":1}\n");
        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[test]
    fn single_byte_chunks() {
        let mut reader = FrameReader::default();
        for byte in b"{\"k\":\"v\"}\r\n" {
            reader.extend(&[*byte]);
        }

        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(&b"{\"k\":\"v\"}"[..]));
    }

    #[test]
    fn rejects_oversized_partial() {
        let mut reader = FrameReader::new(16);
        reader.extend(&[b'x'; 17]);

        assert!(matches!(
            reader.next_frame(),
            Err(Error::FrameTooLarge { size: 17, limit: 16 })
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut reader = FrameReader::new(4);
        reader.extend(b"12345\r\n");

        assert!(matches!(
            reader.next_frame(),
            Err(Error::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn frame_round_trip() {
        let backend = Backend::Standard;
        let value = serde_json::json!({
            "error": false,
            "service": "Echo",
            "attribute": "echo",
            "args": ["hello"],
            "kwargs": {},
            "uid": "u1",
        });

        let bytes = encode_frame(&backend, &value).unwrap();
        assert!(bytes.ends_with(b"\r\n"));

        let mut reader = FrameReader::default();
        reader.extend(&bytes);
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(decode_frame(&backend, &frame).unwrap(), value);
    }
}
