//! The wire protocol.
//!
//! A redis-style, binary safe framing. Requests are arrays of bulk strings:
//!
//! ```text
//! *2\r\n$3\r\nGET\r\n$4\r\nname\r\n
//! ```
//!
//! Replies are one of:
//!
//! - status `+OK\r\n`
//! - error `-ERR message\r\n`
//! - integer `:1000\r\n`
//! - bulk string `$5\r\nhello\r\n`
//! - null bulk string `$-1\r\n`
//!
//! Each connection owns its own [`FrameReader`]; nothing here is shared between connections.

mod codec;
mod reply;

pub use self::codec::{write_request, FrameReader};
pub use self::reply::Reply;

/// the line terminator
pub const CRLF: &[u8] = b"\r\n";

/// longest accepted header line, excluding the CRLF
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// largest accepted bulk string (512 MiB)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
