//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Blob strings
//! use `Bytes` so replies can be sliced out of the read buffer without
//! copying.

use bytes::Bytes;

/// A single RESP protocol frame.
///
/// Covers the reply shapes backend servers and sentinels produce:
/// status lines, errors, integers, bulk data, arrays, null, and maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string response, e.g. `+OK\r\n`.
    Simple(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Null value. Parsed from RESP3 `_\r\n` as well as the RESP2
    /// null bulk (`$-1\r\n`) and null array (`*-1\r\n`).
    Null,

    /// Ordered map of key-value frame pairs, e.g. `%1\r\n+key\r\n+val\r\n`.
    Map(Vec<(Frame, Frame)>),
}

impl Frame {
    /// Builds a command array of bulk strings, the client → server
    /// wire format.
    pub fn command<I, S>(parts: I) -> Frame
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Frame::Array(
            parts
                .into_iter()
                .map(|p| Frame::Bulk(Bytes::copy_from_slice(p.as_ref())))
                .collect(),
        )
    }

    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns the textual content of a simple string or bulk string.
    ///
    /// Bulk data that is not valid UTF-8 yields `None`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Interprets the frame as an integer.
    ///
    /// Backends frequently answer numeric values as bulk strings (e.g.
    /// `CONFIG GET maxmemory`), so textual integers are accepted too.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            Frame::Simple(_) | Frame::Bulk(_) => self.as_str()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Consumes the frame and returns its elements if it is an array.
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Frame::Array(items) => Some(items),
            _ => None,
        }
    }
}
