use std::io::{self, Write};

use super::CRLF;

/// A reply frame, as written by the command handlers and read back by the [`Client`].
///
/// [`Client`]: crate::Client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<status>\r\n`
    Status(String),
    /// `-<message>\r\n`
    Error(String),
    /// `:<n>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`
    Bulk(Vec<u8>),
    /// `$-1\r\n`
    Null,
}

impl Reply {
    /// the `+OK` acknowledgement
    pub fn ok() -> Reply {
        Reply::Status("OK".to_owned())
    }

    /// an `-ERR <message>` reply
    pub fn err(message: impl AsRef<str>) -> Reply {
        Reply::Error(format!("ERR {}", message.as_ref()))
    }

    /// writes the encoded frame to `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Reply::Status(s) => write_line(w, b'+', s.as_bytes()),
            Reply::Error(s) => write_line(w, b'-', s.as_bytes()),
            Reply::Integer(n) => write_line(w, b':', n.to_string().as_bytes()),
            Reply::Bulk(data) => {
                write_line(w, b'$', data.len().to_string().as_bytes())?;
                w.write_all(data)?;
                w.write_all(CRLF)
            }
            Reply::Null => w.write_all(b"$-1\r\n"),
        }
    }

    /// the encoded frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }
}

fn write_line<W: Write>(w: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    // status and error lines must not break the framing
    let body: Vec<u8> = body.iter().map(|&b| if b == b'\r' || b == b'\n' { b' ' } else { b }).collect();
    w.write_all(&[tag])?;
    w.write_all(&body)?;
    w.write_all(CRLF)
}
