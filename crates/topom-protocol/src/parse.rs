//! Single-pass RESP parser.
//!
//! Operates on buffered byte slices; the caller owns the socket and
//! keeps appending to the buffer until a complete frame is available.
//! A `Cursor<&[u8]>` tracks the position so nothing is consumed until a
//! whole frame has been recognised, letting the caller retry after the
//! next read.
//!
//! Both RESP2 and RESP3 replies are accepted. RESP2 null bulk strings
//! (`$-1`) and null arrays (`*-1`) become [`Frame::Null`]; RESP3 push
//! frames (`>`) are treated as arrays and booleans (`#t`/`#f`) as
//! integers, which is how pub/sub messages and a few sentinel replies
//! look on newer servers.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Maximum nesting depth for arrays and maps.
const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in an array or map.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for the up-front `Vec` allocation when an array header arrives.
const PREALLOC_CAP: usize = 1024;

/// Parses one frame, slicing bulk data zero-copy out of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` for a complete frame, `Ok(None)`
/// if more data is needed, or an error if the input is malformed.
pub fn parse_frame_bytes(buf: &Bytes) -> Result<Option<(Frame, usize)>, ProtocolError> {
    parse_with(buf.as_ref(), Some(buf))
}

/// Parses one frame, copying bulk data out of `buf`.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    parse_with(buf, None)
}

fn parse_with(buf: &[u8], src: Option<&Bytes>) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, src, 0) {
        Ok(frame) => Ok(Some((frame, cursor.position() as usize))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn try_parse(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
    depth: usize,
) -> Result<Frame, ProtocolError> {
    match read_byte(cursor)? {
        b'+' => Ok(Frame::Simple(read_text(cursor, "simple string")?)),
        b'-' => Ok(Frame::Error(read_text(cursor, "error string")?)),
        b':' => Ok(Frame::Integer(read_integer_line(cursor)?)),
        b'#' => match read_line(cursor)? {
            b"t" => Ok(Frame::Integer(1)),
            b"f" => Ok(Frame::Integer(0)),
            _ => Err(ProtocolError::InvalidInteger),
        },
        b'_' => {
            read_line(cursor)?;
            Ok(Frame::Null)
        }
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            read_bulk(cursor, src, len)
        }
        b'*' | b'>' => {
            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::Null);
            }
            let count = check_count(count, depth)?;
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, src, depth + 1)?);
            }
            Ok(Frame::Array(frames))
        }
        b'%' => {
            let count = check_count(read_integer_line(cursor)?, depth)?;
            let mut pairs = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                let key = try_parse(cursor, src, depth + 1)?;
                let val = try_parse(cursor, src, depth + 1)?;
                pairs.push((key, val));
            }
            Ok(Frame::Map(pairs))
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

fn check_count(count: i64, depth: usize) -> Result<usize, ProtocolError> {
    if depth + 1 > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    if count < 0 {
        return Err(ProtocolError::InvalidFrameLength(count));
    }
    if count as usize > MAX_ARRAY_ELEMENTS {
        return Err(ProtocolError::TooManyElements(count as usize));
    }
    Ok(count as usize)
}

fn read_bulk(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
    len: i64,
) -> Result<Frame, ProtocolError> {
    if len < 0 {
        return Err(ProtocolError::InvalidFrameLength(len));
    }
    if len > MAX_BULK_LEN {
        return Err(ProtocolError::BulkStringTooLarge(len as usize));
    }
    let len = len as usize;
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    if buf.len().saturating_sub(pos) < len + 2 {
        return Err(ProtocolError::Incomplete);
    }
    if &buf[pos + len..pos + len + 2] != b"\r\n" {
        return Err(ProtocolError::InvalidFrameLength(len as i64));
    }
    cursor.set_position((pos + len + 2) as u64);
    let data = match src {
        Some(b) => b.slice(pos..pos + len),
        None => Bytes::copy_from_slice(&buf[pos..pos + len]),
    };
    Ok(Frame::Bulk(data))
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    let byte = *cursor.get_ref().get(pos).ok_or(ProtocolError::Incomplete)?;
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

/// Returns the bytes up to the next `\r\n` and advances past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let buf: &'a [u8] = *cursor.get_ref();
    let start = cursor.position() as usize;
    let mut pos = start;
    while pos < buf.len() {
        let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) else {
            break;
        };
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(&buf[start..cr]);
        }
        pos = cr + 1;
    }
    Err(ProtocolError::Incomplete)
}

fn read_text(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<String, ProtocolError> {
    let line = read_line(cursor)?;
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8(what))
}

fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    parse_i64_bytes(read_line(cursor)?)
}

/// Parses an i64 without allocating. Negative values accumulate in the
/// negative direction so `i64::MIN` does not overflow.
fn parse_i64_bytes(buf: &[u8]) -> Result<i64, ProtocolError> {
    let (negative, digits) = match buf.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, buf),
        None => return Err(ProtocolError::InvalidInteger),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let d = (b - b'0') as i64;
        n = n
            .checked_mul(10)
            .and_then(|n| if negative { n.checked_sub(d) } else { n.checked_add(d) })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}
