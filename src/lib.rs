#![deny(missing_docs)]
//! A multithreaded key-value server that partitions keys into tables and speaks a redis-style
//! wire protocol.
//!
//! This crate provides the [`Server`] itself, a [`Client`] for talking to it, as well as a
//! [`tablekv-client`] and [`tablekv-server`] executable.
//!
//! ## Supported Commands
//!
//! - `GET key` the value of a key, or a null reply
//! - `SET key value` store a value
//! - `SETEX key ttl value` store a value that expires after `ttl` seconds
//! - `SETNX key value` store a value only if the key has none, replies `:1` or `:0`
//! - `INCR key`, `INCRBY key delta`, `DECR key`, `DECRBY key delta` integer arithmetic,
//! replying with the new value
//! - `DEL key [key ...]` remove keys, replying with how many existed
//! - `PING [message]`
//!
//! Command names are case insensitive. See [`protocol`] for the framing.
//!
//! ## Tables
//! A key of the form `table:name` lives in table `table`. Keys without a `:`, or with an empty
//! table part, live in the `__default` table. See [`router`].
//!
//! ## Workers
//! Connections never touch storage themselves. Every command becomes a job on the bounded queue
//! of a fixed size [`WorkerPool`]; each worker keeps its own cache of open table handles and
//! runs the job in a storage transaction. Expiry bookkeeping for `SETEX` is kept in two
//! ordered tables and swept periodically by the pool. See [`worker`].
//!
//! ## Storage Engines
//! Anything implementing [`StorageEngine`]. Two are provided: [`SledEngine`], which persists to
//! disk using [`sled`], and the volatile [`MemoryEngine`].
//!
//! [`sled`]: https://docs.rs/sled
//! [`tablekv-server`]: ../tablekv_server/index.html
//! [`tablekv-client`]: ../tablekv_client/index.html

pub use client::Client;
pub use command::{CommandSpec, Dispatcher};
pub use config::{Config, EngineKind, DEFAULT_LISTEN};
pub use engine::{Isolation, MemoryEngine, SledEngine, StorageEngine, TableKind};
pub use error::{JobError, ProtocolError, Result, StoreError, StoreResult, TableKvError};
pub use protocol::Reply;
pub use server::{Server, ShutdownHandle};
pub use worker::{JobQueue, Request, Response, WorkerPool};

mod client;
mod command;
mod config;
pub mod engine;
mod error;
pub mod protocol;
pub mod router;
mod server;
pub mod worker;
