//! Direct-to-buffer RESP serialization.
//!
//! Frames are written straight into a `BytesMut` with no intermediate
//! allocations; lengths and integers are formatted on the stack with
//! `itoa`. Nulls are emitted in the RESP2 form (`$-1`) since that is
//! what every backend generation understands.

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

impl Frame {
    /// Serializes this frame into the provided buffer, including the type
    /// prefix and trailing `\r\n` delimiters.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(dst, b'+', s.as_bytes()),
            Frame::Error(msg) => line(dst, b'-', msg.as_bytes()),
            Frame::Integer(n) => header(dst, b':', *n),
            Frame::Bulk(data) => {
                header(dst, b'$', data.len() as i64);
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                header(dst, b'*', items.len() as i64);
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::Map(pairs) => {
                header(dst, b'%', pairs.len() as i64);
                for (key, val) in pairs {
                    key.serialize(dst);
                    val.serialize(dst);
                }
            }
        }
    }
}

fn line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.put_u8(prefix);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}

/// Writes `<prefix><n>\r\n`.
fn header(dst: &mut BytesMut, prefix: u8, n: i64) {
    let mut buf = itoa::Buffer::new();
    dst.put_u8(prefix);
    dst.put_slice(buf.format(n).as_bytes());
    dst.put_slice(b"\r\n");
}
