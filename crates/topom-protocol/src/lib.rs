//! topom-protocol: RESP wire codec for backend and sentinel traffic.
//!
//! The controller only ever acts as a client: it builds command arrays,
//! writes them to a socket, and parses the replies. Backends may answer
//! in RESP2 (`$-1` nulls) or RESP3 (`_` nulls, maps), so the parser
//! accepts both.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use topom_protocol::{parse_frame, Frame};
//!
//! let cmd = Frame::command(["SLAVEOF", "NO", "ONE"]);
//! let mut buf = BytesMut::new();
//! cmd.serialize(&mut buf);
//! assert_eq!(&buf[..], b"*3\r\n$7\r\nSLAVEOF\r\n$2\r\nNO\r\n$3\r\nONE\r\n");
//!
//! let (reply, _) = parse_frame(b"+OK\r\n").unwrap().unwrap();
//! assert_eq!(reply, Frame::Simple("OK".into()));
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::{parse_frame, parse_frame_bytes};
pub use types::Frame;
