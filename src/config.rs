use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::Level;

use crate::error::{Result, TableKvError};
use crate::worker::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};

/// address the server listens on unless configured otherwise
pub const DEFAULT_LISTEN: &str = "127.0.0.1:6380";

/// The storage engines a server can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// persistent, backed by sled
    Sled,
    /// in-process and volatile
    Memory,
}

impl FromStr for EngineKind {
    type Err = TableKvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(EngineKind::Sled),
            "memory" => Ok(EngineKind::Memory),
            other => Err(TableKvError::Config(format!("unknown engine '{}', expected 'sled' or 'memory'", other))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Sled => "sled",
            EngineKind::Memory => "memory",
        })
    }
}

/// Server settings.
///
/// Read from a JSON file where every field is optional, e.g.
///
/// ```json
/// { "listen": "0.0.0.0:6380", "engine": "sled", "workers": 8 }
/// ```
///
/// and then overridden by command line flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// the address to accept connections on
    pub listen: SocketAddr,
    /// which storage engine to open
    pub engine: EngineKind,
    /// where the sled engine keeps its files
    pub data_dir: PathBuf,
    /// number of worker threads, fixed for the life of the server
    pub workers: usize,
    /// jobs that may wait in the queue before connections block
    pub queue_capacity: usize,
    /// milliseconds between expiry sweeps, 0 disables sweeping
    pub sweep_interval_ms: u64,
    /// most expiry records examined by one sweep
    pub sweep_batch: usize,
    /// one of trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 6380)),
            engine: EngineKind::Sled,
            data_dir: PathBuf::from("./tablekv-data"),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sweep_interval_ms: 1000,
            sweep_batch: 256,
            log_level: "info".to_owned(),
        }
    }
}

impl Config {
    /// reads a config file, filling missing fields with their defaults
    ///
    /// # Errors
    /// io errors reading the file, [`TableKvError::Json`] if it is not a valid config
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        Config::from_json(&text)
    }

    /// parses a JSON config, filling missing fields with their defaults
    pub fn from_json(text: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// checks the values no serde type can express
    ///
    /// # Errors
    /// [`TableKvError::Config`] naming the first bad field
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(TableKvError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(TableKvError::Config("queue_capacity must be at least 1".into()));
        }
        if self.sweep_interval_ms > 0 && self.sweep_batch == 0 {
            return Err(TableKvError::Config("sweep_batch must be at least 1".into()));
        }
        self.log_level()?;
        Ok(())
    }

    /// the interval between expiry sweeps, `None` if sweeping is disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.sweep_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// the configured log level
    pub fn log_level(&self) -> Result<Level> {
        Level::from_str(&self.log_level)
            .map_err(|_| TableKvError::Config(format!("invalid log_level '{}'", self.log_level)))
    }
}
