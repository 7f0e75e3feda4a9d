//! The command table.
//!
//! Every supported command maps to an arity range and a handler. A handler validates its
//! arguments, turns them into one [`Request`], waits for the worker's answer and renders it as
//! a [`Reply`]. Application level problems (bad arity, bad numbers, storage failures) become
//! error replies and the connection stays open. Only a closed worker pool is an `Err`.

use std::collections::HashMap;

use tracing::{error, warn};

use crate::error::{JobError, Result, StoreError};
use crate::protocol::Reply;
use crate::worker::{JobQueue, JobResult, Request, Response};

type Handler = fn(&JobQueue, &[Vec<u8>]) -> Result<Reply>;

/// one entry of the command table
#[derive(Clone, Copy)]
pub struct CommandSpec {
    /// lower-case command name
    pub name: &'static str,
    /// fewest arguments accepted, not counting the command name
    pub min_args: usize,
    /// most arguments accepted, not counting the command name
    pub max_args: usize,
    handler: Handler,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "get", min_args: 1, max_args: 1, handler: get },
    CommandSpec { name: "set", min_args: 2, max_args: 2, handler: set },
    CommandSpec { name: "setex", min_args: 3, max_args: 3, handler: setex },
    CommandSpec { name: "setnx", min_args: 2, max_args: 2, handler: setnx },
    CommandSpec { name: "incr", min_args: 1, max_args: 1, handler: incr },
    CommandSpec { name: "incrby", min_args: 2, max_args: 2, handler: incrby },
    CommandSpec { name: "decr", min_args: 1, max_args: 1, handler: decr },
    CommandSpec { name: "decrby", min_args: 2, max_args: 2, handler: decrby },
    CommandSpec { name: "del", min_args: 1, max_args: usize::MAX, handler: del },
    CommandSpec { name: "ping", min_args: 0, max_args: 1, handler: ping },
];

const NOT_AN_INTEGER: &str = "value is not an integer or out of range";

/// The dispatch context: the job queue and the command table, built once per server and
/// shared by every connection.
pub struct Dispatcher {
    queue: JobQueue,
    commands: HashMap<&'static str, CommandSpec>,
}

impl Dispatcher {
    /// creates a dispatcher that submits jobs to `queue`
    pub fn new(queue: JobQueue) -> Self {
        let commands = COMMANDS.iter().map(|spec| (spec.name, *spec)).collect();
        Dispatcher { queue, commands }
    }

    /// looks up a command by its lower-case name
    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// Executes one request (`args[0]` is the command name) and returns the reply to send.
    ///
    /// # Errors
    /// [`TableKvError::PoolClosed`](crate::TableKvError::PoolClosed) if the job could not be
    /// executed at all
    pub fn dispatch(&self, args: &[Vec<u8>]) -> Result<Reply> {
        let (name, args) = match args.split_first() {
            Some((name, args)) => (String::from_utf8_lossy(name).to_lowercase(), args),
            None => return Ok(Reply::err("empty command")),
        };
        let spec = match self.command(&name) {
            Some(spec) => spec,
            None => return Ok(Reply::err(format!("unknown command '{}'", name))),
        };
        if args.len() < spec.min_args || args.len() > spec.max_args {
            return Ok(Reply::err(format!("wrong number of arguments for '{}' command", spec.name)));
        }
        (spec.handler)(&self.queue, args)
    }
}

fn get(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    let key = match key_arg(&args[0], "get") {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };
    Ok(match queue.submit(Request::Get { key })? {
        Ok(Response::Value(Some(value))) => Reply::Bulk(value),
        Ok(Response::Value(None)) => Reply::Null,
        other => render_other("get", other),
    })
}

fn set(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    let key = match key_arg(&args[0], "set") {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };
    let request = Request::Set { key, value: args[1].clone(), no_overwrite: false };
    Ok(match queue.submit(request)? {
        Ok(Response::Done) => Reply::ok(),
        other => render_other("set", other),
    })
}

fn setex(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    let key = match key_arg(&args[0], "setex") {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };
    let ttl = match int_arg(&args[1]) {
        Some(ttl) => ttl,
        None => return Ok(Reply::err(NOT_AN_INTEGER)),
    };
    let ttl = match u32::try_from(ttl) {
        Ok(ttl) if ttl > 0 => ttl,
        _ => return Ok(Reply::err("invalid expire time in 'setex' command")),
    };
    let request = Request::SetWithExpiry { key, value: args[2].clone(), ttl };
    Ok(match queue.submit(request)? {
        Ok(Response::Done) => Reply::ok(),
        other => render_other("setex", other),
    })
}

fn setnx(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    let key = match key_arg(&args[0], "setnx") {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };
    let request = Request::Set { key, value: args[1].clone(), no_overwrite: true };
    Ok(match queue.submit(request)? {
        Ok(Response::Done) => Reply::Integer(1),
        Err(JobError::Store(StoreError::KeyExists)) => Reply::Integer(0),
        other => render_other("setnx", other),
    })
}

fn incr(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    increment(queue, &args[0], 1, "incr")
}

fn decr(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    increment(queue, &args[0], -1, "decr")
}

fn incrby(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    match int_arg(&args[1]) {
        Some(delta) => increment(queue, &args[0], delta, "incrby"),
        None => Ok(Reply::err(NOT_AN_INTEGER)),
    }
}

fn decrby(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    match int_arg(&args[1]).and_then(i64::checked_neg) {
        Some(delta) => increment(queue, &args[0], delta, "decrby"),
        None => Ok(Reply::err(NOT_AN_INTEGER)),
    }
}

fn increment(queue: &JobQueue, key: &[u8], delta: i64, command: &str) -> Result<Reply> {
    let key = match key_arg(key, command) {
        Ok(key) => key,
        Err(reply) => return Ok(reply),
    };
    Ok(match queue.submit(Request::IncrementBy { key, delta })? {
        Ok(Response::Integer(n)) => Reply::Integer(n),
        other => render_other(command, other),
    })
}

fn del(queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    let mut removed = 0;
    for key in args {
        let key = match key_arg(key, "del") {
            Ok(key) => key,
            Err(reply) => return Ok(reply),
        };
        match queue.submit(Request::Delete { key })? {
            Ok(Response::Removed(true)) => removed += 1,
            Ok(Response::Removed(false)) => {}
            other => return Ok(render_other("del", other)),
        }
    }
    Ok(Reply::Integer(removed))
}

fn ping(_queue: &JobQueue, args: &[Vec<u8>]) -> Result<Reply> {
    Ok(match args.first() {
        Some(message) => Reply::Bulk(message.clone()),
        None => Reply::Status("PONG".to_owned()),
    })
}

/// the key argument, or the error reply for an empty key
fn key_arg(key: &[u8], command: &str) -> std::result::Result<Vec<u8>, Reply> {
    if key.is_empty() {
        return Err(Reply::err(format!("wrong length of key for '{}' command", command)));
    }
    Ok(key.to_vec())
}

fn int_arg(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/// renders failures and responses a handler did not expect
fn render_other(command: &str, result: JobResult) -> Reply {
    match result {
        Err(JobError::NotAnInteger) => Reply::err(NOT_AN_INTEGER),
        Err(JobError::Store(e)) => {
            warn!(command, "storage error: {}", e);
            Reply::err("dberr")
        }
        Ok(response) => {
            error!(command, ?response, "unexpected response from worker");
            Reply::err("internal error")
        }
    }
}
