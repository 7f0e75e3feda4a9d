use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};

use crate::error::{ProtocolError, Result, TableKvError};
use crate::protocol::{write_request, FrameReader, Reply};

/// `Client` talks to a tablekv [`Server`](crate::Server) over one connection
pub struct Client {
    reader: FrameReader<BufReader<TcpStream>>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// creates a client and establishes a socket connection to the server at the given `addr`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let tcp_reader = TcpStream::connect(addr)?;
        let tcp_writer = tcp_reader.try_clone()?;

        Ok(Client {
            reader: FrameReader::new(BufReader::new(tcp_reader)),
            writer: BufWriter::new(tcp_writer),
        })
    }

    /// Sends one request, command name first, and returns the raw reply.
    ///
    /// Error replies are returned as [`Reply::Error`], not as `Err`.
    pub fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        write_request(&mut self.writer, args)?;
        self.writer.flush()?;
        Ok(self.reader.read_reply()?)
    }

    /// gets the value of `key`
    /// ## Returns
    /// `Ok(Some(value))` if the key has a value, `Ok(None)` if it has none
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.call(&[b"GET", key])? {
            Reply::Bulk(value) => Ok(Some(value)),
            Reply::Null => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// sets `key` to `value`
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.call(&[b"SET", key, value]).and_then(expect_ok)
    }

    /// sets `key` to `value` and lets it expire after `ttl` seconds
    pub fn setex(&mut self, key: &[u8], ttl: u32, value: &[u8]) -> Result<()> {
        let ttl = ttl.to_string();
        self.call(&[b"SETEX", key, ttl.as_bytes(), value]).and_then(expect_ok)
    }

    /// sets `key` to `value` unless it already has one. Returns whether it was written.
    pub fn setnx(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.call(&[b"SETNX", key, value]).and_then(expect_integer).map(|n| n == 1)
    }

    /// adds 1 to the integer under `key` and returns the new value
    pub fn incr(&mut self, key: &[u8]) -> Result<i64> {
        self.call(&[b"INCR", key]).and_then(expect_integer)
    }

    /// adds `delta` to the integer under `key` and returns the new value
    pub fn incrby(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        let delta = delta.to_string();
        self.call(&[b"INCRBY", key, delta.as_bytes()]).and_then(expect_integer)
    }

    /// removes `keys`, returning how many had a value
    pub fn del(&mut self, keys: &[&[u8]]) -> Result<i64> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"DEL");
        args.extend_from_slice(keys);
        self.call(&args).and_then(expect_integer)
    }

    /// round trips a PING, returning the server's answer
    pub fn ping(&mut self) -> Result<String> {
        match self.call(&[b"PING"])? {
            Reply::Status(s) => Ok(s),
            other => Err(unexpected(other)),
        }
    }

    /// like [`Client::send`], but error replies become [`TableKvError::Reply`]
    fn call(&mut self, args: &[&[u8]]) -> Result<Reply> {
        match self.send(args)? {
            Reply::Error(msg) => Err(TableKvError::Reply(msg)),
            reply => Ok(reply),
        }
    }
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Status(ref s) if s == "OK" => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn expect_integer(reply: Reply) -> Result<i64> {
    match reply {
        Reply::Integer(n) => Ok(n),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> TableKvError {
    ProtocolError::InvalidReply(format!("unexpected reply {:?}", reply)).into()
}
