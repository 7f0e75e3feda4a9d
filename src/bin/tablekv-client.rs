//! this binary sends one command to a tablekv server
//!
//! `tablekv-client get <KEY> [--addr IP:PORT]`
//!
//!     Print the value of KEY, or "(nil)" if it has none.
//!
//! `tablekv-client set <KEY> <VALUE>`, `setex <KEY> <TTL> <VALUE>`, `setnx <KEY> <VALUE>`
//!
//!     Store a value. setnx prints 1 if it wrote the value and 0 if the key already had one.
//!
//! `tablekv-client incr <KEY>`, `incrby <KEY> <DELTA>`
//!
//!     Print the new value.
//!
//! `tablekv-client del <KEY>...`
//!
//!     Print how many of the keys existed.
//!
//! `tablekv-client ping`
//!
//! Error replies are printed to stderr and the exit code is non-zero.

use std::io::Write;
use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use tablekv::Client;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:6380";

fn main() -> anyhow::Result<()> {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let key = || Arg::with_name("KEY").required(true).index(1);
    let matches = App::new("tablekv-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("sends a command to a tablekv server")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommands(vec![
            SubCommand::with_name("get")
                .about("Get the value of a key")
                .arg(key()),
            SubCommand::with_name("set")
                .about("Set the value of a key")
                .arg(key())
                .arg(Arg::with_name("VALUE").required(true).index(2)),
            SubCommand::with_name("setex")
                .about("Set the value of a key that expires after TTL seconds")
                .arg(key())
                .arg(Arg::with_name("TTL").required(true).index(2))
                .arg(Arg::with_name("VALUE").required(true).index(3)),
            SubCommand::with_name("setnx")
                .about("Set the value of a key unless it already has one")
                .arg(key())
                .arg(Arg::with_name("VALUE").required(true).index(2)),
            SubCommand::with_name("incr")
                .about("Increment the integer value of a key by one")
                .arg(key()),
            SubCommand::with_name("incrby")
                .about("Increment the integer value of a key by DELTA")
                .arg(key())
                .arg(Arg::with_name("DELTA").required(true).allow_hyphen_values(true).index(2)),
            SubCommand::with_name("del")
                .about("Remove one or more keys")
                .arg(Arg::with_name("KEY").required(true).multiple(true).index(1)),
            SubCommand::with_name("ping")
                .about("Check that the server answers"),
        ])
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT of the server to connect to")
            .default_value(DEFAULT_ADDRESS)
            .global(true))
        .get_matches();

    run(&matches)
}

/// connects to the server and runs the subcommand in `matches`
fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let (name, args) = match matches.subcommand() {
        (name, Some(args)) => (name, args),
        _ => return Err(anyhow!("no command given")),
    };
    let addr = args
        .value_of("addr")
        .or_else(|| matches.value_of("addr"))
        .unwrap_or(DEFAULT_ADDRESS);
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| anyhow!("could not parse {} into an IP address and port", addr))?;

    let mut client = Client::connect(addr).with_context(|| format!("could not connect to {}", addr))?;
    debug!(command = name, %addr, "connected");
    let arg = |name: &str| args.value_of(name).unwrap_or_default().as_bytes().to_vec();

    let out = match name {
        "get" => match client.get(&arg("KEY"))? {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => "(nil)".to_owned(),
        },
        "set" => {
            client.set(&arg("KEY"), &arg("VALUE"))?;
            "OK".to_owned()
        }
        "setex" => {
            let ttl = args.value_of("TTL").unwrap_or_default();
            let ttl: u32 = ttl.parse().map_err(|_| anyhow!("TTL must be a positive number of seconds, got {}", ttl))?;
            client.setex(&arg("KEY"), ttl, &arg("VALUE"))?;
            "OK".to_owned()
        }
        "setnx" => (client.setnx(&arg("KEY"), &arg("VALUE"))? as i64).to_string(),
        "incr" => client.incr(&arg("KEY"))?.to_string(),
        "incrby" => {
            let delta = args.value_of("DELTA").unwrap_or_default();
            let delta: i64 = delta.parse().map_err(|_| anyhow!("DELTA must be an integer, got {}", delta))?;
            client.incrby(&arg("KEY"), delta)?.to_string()
        }
        "del" => {
            let keys: Vec<&[u8]> = args.values_of("KEY").into_iter().flatten().map(str::as_bytes).collect();
            client.del(&keys)?.to_string()
        }
        "ping" => client.ping()?,
        other => return Err(anyhow!("unknown command {}", other)),
    };

    let stdout = std::io::stdout();
    writeln!(stdout.lock(), "{}", out)?;
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
