use std::io::{self, BufRead, Read, Write};

use super::reply::Reply;
use super::{CRLF, MAX_BULK_LEN, MAX_LINE_LEN};
use crate::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

/// most bytes reserved up front for a bulk payload
const BULK_PREALLOC: usize = 64 * 1024;

/// Reads frames off one connection.
///
/// Requests are an array header `*<count>\r\n` followed by `count` bulk strings
/// `$<len>\r\n<bytes>\r\n`. Any deviation is an error and the caller is expected to drop the
/// connection: the reader makes no attempt to resynchronise.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: BufRead> FrameReader<R> {
    /// wraps a buffered reader
    pub fn new(inner: R) -> Self {
        FrameReader { inner }
    }

    /// Reads one request and returns its arguments, command name first.
    ///
    /// Returns `Ok(None)` if the peer closed the connection between requests.
    pub fn read_request(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let line = match self.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let count = parse_count(&line, b'*')?;
        if count <= 0 {
            return Err(ProtocolError::InvalidCount(count));
        }

        let mut args = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let line = self.read_line()?.ok_or(ProtocolError::UnexpectedEof)?;
            let len = parse_count(&line, b'$')?;
            args.push(self.read_bulk(len)?);
        }
        Ok(Some(args))
    }

    /// Reads one reply frame.
    ///
    /// # Errors
    /// [`ProtocolError::UnexpectedEof`] if the peer closed the connection
    pub fn read_reply(&mut self) -> Result<Reply> {
        let line = self.read_line()?.ok_or(ProtocolError::UnexpectedEof)?;
        let text = || String::from_utf8_lossy(&line[1..]).into_owned();
        match line[0] {
            b'+' => Ok(Reply::Status(text())),
            b'-' => Ok(Reply::Error(text())),
            b':' => parse_number(&line[1..])
                .map(Reply::Integer)
                .ok_or(ProtocolError::InvalidNumber),
            b'$' => match parse_count(&line, b'$')? {
                -1 => Ok(Reply::Null),
                len => self.read_bulk(len).map(Reply::Bulk),
            },
            other => Err(ProtocolError::InvalidReply(format!("unknown reply tag {:#04x}", other))),
        }
    }

    /// reads a CRLF terminated header line, without the CRLF. `None` on a clean EOF.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let limit = MAX_LINE_LEN as u64 + 2;
        let read = (&mut self.inner).take(limit).read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(if line.len() as u64 >= limit {
                ProtocolError::LineTooLong
            } else {
                ProtocolError::UnexpectedEof
            });
        }
        if line.len() <= 2 || line[line.len() - 2] != b'\r' {
            return Err(ProtocolError::InvalidLine);
        }
        line.truncate(line.len() - 2);
        Ok(Some(line))
    }

    /// reads a `len` byte bulk payload and its trailing CRLF
    fn read_bulk(&mut self, len: i64) -> Result<Vec<u8>> {
        if len < 0 || len > MAX_BULK_LEN {
            return Err(ProtocolError::InvalidLength(len));
        }
        let len = len as usize;
        // grows with the bytes that actually arrive, not with the declared length
        let mut buf = Vec::with_capacity(len.min(BULK_PREALLOC) + 2);
        let read = (&mut self.inner).take(len as u64 + 2).read_to_end(&mut buf)?;
        if read < len + 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        if &buf[len..] != CRLF {
            return Err(ProtocolError::MissingCrlf);
        }
        buf.truncate(len);
        Ok(buf)
    }
}

/// parses a `<tag><number>` header line
fn parse_count(line: &[u8], tag: u8) -> Result<i64> {
    if line.len() < 2 {
        return Err(ProtocolError::InvalidLine);
    }
    if line[0] != tag {
        return Err(ProtocolError::UnexpectedTag {
            expected: tag as char,
            found: line[0],
        });
    }
    parse_number(&line[1..]).ok_or(ProtocolError::InvalidNumber)
}

/// parses an optionally negative decimal integer, rejecting anything else
fn parse_number(digits: &[u8]) -> Option<i64> {
    let (negative, digits) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if digits.is_empty() {
        return None;
    }
    // accumulate towards the sign so that i64::MIN parses
    let mut n: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        let d = i64::from(d - b'0');
        n = n.checked_mul(10)?;
        n = if negative { n.checked_sub(d)? } else { n.checked_add(d)? };
    }
    Some(n)
}

/// writes `args` as a request frame
pub fn write_request<W: Write, A: AsRef<[u8]>>(w: &mut W, args: &[A]) -> io::Result<()> {
    write!(w, "*{}\r\n", args.len())?;
    for arg in args {
        let arg = arg.as_ref();
        write!(w, "${}\r\n", arg.len())?;
        w.write_all(arg)?;
        w.write_all(CRLF)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(input: &[u8]) -> FrameReader<&[u8]> {
        FrameReader::new(input)
    }

    #[test]
    fn reads_a_request() {
        let mut r = reader(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
        assert_eq!(r.read_request().unwrap(), Some(vec![b"GET".to_vec(), b"name".to_vec()]));
        assert_eq!(r.read_request().unwrap(), None);
    }

    #[test]
    fn bulk_payload_may_contain_crlf_and_be_empty() {
        let mut r = reader(b"*3\r\n$3\r\nSET\r\n$0\r\n\r\n$4\r\na\r\nb\r\n");
        let args = r.read_request().unwrap().unwrap();
        assert_eq!(args, vec![b"SET".to_vec(), Vec::new(), b"a\r\nb".to_vec()]);
    }

    #[test]
    fn pipelined_requests_are_read_in_order() {
        let mut buf = Vec::new();
        write_request(&mut buf, &["PING"]).unwrap();
        write_request(&mut buf, &["GET", "k"]).unwrap();
        let mut r = reader(&buf);
        assert_eq!(r.read_request().unwrap().unwrap().len(), 1);
        assert_eq!(r.read_request().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn rejects_malformed_framing() {
        let cases: &[&[u8]] = &[
            b"GET k\r\n",
            b"*1\n$3\r\nGET\r\n",
            b"*x\r\n",
            b"*\r\n",
            b"*0\r\n",
            b"*-1\r\n",
            b"*1\r\n+GET\r\n",
            b"*1\r\n$-1\r\n",
            b"*1\r\n$3\r\nGETX\r\n",
            b"*1\r\n$3\r\nGE\r\n\r\n",
        ];
        for case in cases {
            assert!(reader(case).read_request().is_err(), "{:?}", String::from_utf8_lossy(case));
        }
    }

    #[test]
    fn truncated_request_is_unexpected_eof() {
        let err = reader(b"*2\r\n$3\r\nGET\r\n").read_request().unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
        let err = reader(b"*1\r\n$5\r\nab").read_request().unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[test]
    fn large_declared_bulk_does_not_reserve_its_length() {
        let mut r = reader(b"*1\r\n$536870912\r\nabc");
        assert!(matches!(r.read_request(), Err(ProtocolError::UnexpectedEof)));
    }

    #[test]
    fn oversized_bulk_length_is_rejected() {
        let input = format!("*1\r\n${}\r\n", MAX_BULK_LEN + 1);
        assert!(matches!(reader(input.as_bytes()).read_request(), Err(ProtocolError::InvalidLength(_))));
    }

    #[test]
    fn overlong_header_line_is_rejected() {
        let mut input = b"*".to_vec();
        input.extend(std::iter::repeat(b'1').take(MAX_LINE_LEN + 10));
        input.extend_from_slice(b"\r\n");
        assert!(matches!(reader(&input).read_request(), Err(ProtocolError::LineTooLong)));
    }

    #[test]
    fn reads_every_reply_kind() {
        let mut buf = Vec::new();
        for reply in [Reply::ok(), Reply::err("x"), Reply::Integer(7), Reply::Bulk(b"v\r\n".to_vec()), Reply::Null] {
            reply.write_to(&mut buf).unwrap();
        }
        let mut r = reader(&buf);
        assert_eq!(r.read_reply().unwrap(), Reply::ok());
        assert_eq!(r.read_reply().unwrap(), Reply::Error("ERR x".into()));
        assert_eq!(r.read_reply().unwrap(), Reply::Integer(7));
        assert_eq!(r.read_reply().unwrap(), Reply::Bulk(b"v\r\n".to_vec()));
        assert_eq!(r.read_reply().unwrap(), Reply::Null);
    }

    #[test]
    fn extreme_integer_replies_read_back() {
        for n in [i64::MIN, i64::MAX] {
            let wire = Reply::Integer(n).to_bytes();
            assert_eq!(reader(&wire).read_reply().unwrap(), Reply::Integer(n));
        }
    }

    #[test]
    fn numbers_are_strict() {
        assert_eq!(parse_number(b"123"), Some(123));
        assert_eq!(parse_number(b"-5"), Some(-5));
        assert_eq!(parse_number(b"-"), None);
        assert_eq!(parse_number(b"+5"), None);
        assert_eq!(parse_number(b"1 "), None);
        assert_eq!(parse_number(b"99999999999999999999"), None);
        assert_eq!(parse_number(b"-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_number(b"9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse_number(b"9223372036854775808"), None);
        assert_eq!(parse_number(b"-9223372036854775809"), None);
    }
}
