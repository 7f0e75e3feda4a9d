//! this binary starts the tablekv server
//! to see the list of options, type: `tablekv-server --help`
//!
//! Settings come from an optional JSON config file (`--config`), and any flag given on the
//! command line overrides the file. SIGINT and SIGTERM shut the server down gracefully.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{anyhow, Context};
use clap::{crate_version, App, Arg, ArgMatches};
use tablekv::{Config, EngineKind, MemoryEngine, Server, SledEngine, StorageEngine};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() {
    // parse command line args
    let matches = App::new("tablekv-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a table-partitioned key-value server")
        .arg(Arg::with_name("config")
            .long("config")
            .value_name("FILE")
            .help("reads settings from a JSON config file"))
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT that the server listens on [default: 127.0.0.1:6380]"))
        .arg(Arg::with_name("engine")
            .long("engine")
            .value_name("ENGINE_NAME")
            .possible_values(&["sled", "memory"])
            .help("sets the storage engine to use [default: sled]"))
        .arg(Arg::with_name("data-dir")
            .long("data-dir")
            .value_name("DIR")
            .help("sets the directory the sled engine keeps its files in"))
        .arg(Arg::with_name("workers")
            .long("workers")
            .value_name("N")
            .help("sets the number of worker threads"))
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config = build_config(matches)?;
    subscriber_config(config.log_level()?);

    info!("tablekv-server {}", env!("CARGO_PKG_VERSION"));
    info!("Storage engine: {}", config.engine);

    match config.engine {
        EngineKind::Sled => {
            let engine = SledEngine::open(&config.data_dir)
                .with_context(|| format!("could not open sled database in {}", config.data_dir.display()))?;
            run_with_engine(engine, &config)
        }
        EngineKind::Memory => run_with_engine(MemoryEngine::new(), &config),
    }
}

fn run_with_engine<E: StorageEngine>(engine: E, config: &Config) -> anyhow::Result<()> {
    let server = Server::new(engine, config).context("could not start the server")?;
    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || shutdown.shutdown()).context("could not install the signal handler")?;
    server.run()?;
    Ok(())
}

/// reads the config file, if any, and applies the command line overrides to it
fn build_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("could not load config file {}", path))?,
        None => Config::default(),
    };
    if let Some(addr) = matches.value_of("addr") {
        config.listen = addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("could not parse {} into an IP address and port", addr))?;
    }
    if let Some(engine) = matches.value_of("engine") {
        config.engine = engine.parse()?;
    }
    if let Some(dir) = matches.value_of("data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(workers) = matches.value_of("workers") {
        config.workers = workers
            .parse()
            .map_err(|_| anyhow!("--workers expects a positive number, got {}", workers))?;
    }
    config.validate()?;
    Ok(config)
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
