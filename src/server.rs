use std::io::{BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use tracing::{debug, error, info, info_span, warn};

use crate::command::Dispatcher;
use crate::config::Config;
use crate::engine::StorageEngine;
use crate::error::Result;
use crate::protocol::FrameReader;
use crate::worker::WorkerPool;

/// A TCP server in front of a [`WorkerPool`].
///
/// Every accepted connection is served on its own thread. A connection thread only decodes
/// requests, hands them to the shared [`Dispatcher`] and writes the replies back; the storage
/// work happens on the pool's workers.
///
/// # Example
/// ```rust,no_run
/// use tablekv::{Config, MemoryEngine, Server};
/// # fn main() -> tablekv::Result<()> {
/// let server = Server::new(MemoryEngine::new(), &Config::default())?;
/// let shutdown = server.shutdown_handle();
/// std::thread::spawn(move || shutdown.shutdown());
/// server.run()?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
    shared: Arc<Shared>,
}

/// Stops a running [`Server`] from another thread
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

/// state shared by the accept loop, the connection threads and the shutdown handles
struct Shared {
    local_addr: SocketAddr,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
    /// live sockets by connection id, so shutdown can unblock their reads
    connections: DashMap<u64, TcpStream>,
}

impl Server {
    /// Starts the worker pool over `engine` (and the expiry sweeper, if enabled) and binds the
    /// listening socket. Nothing is accepted until [`Server::run`].
    ///
    /// # Errors
    /// an invalid pool configuration or a socket that could not be bound
    pub fn new<E: StorageEngine>(engine: E, config: &Config) -> Result<Server> {
        config.validate()?;
        let mut pool = WorkerPool::new(engine, config.workers, config.queue_capacity)?;
        if let Some(interval) = config.sweep_interval() {
            pool.start_sweeper(interval, config.sweep_batch)?;
        }
        let dispatcher = Arc::new(Dispatcher::new(pool.queue()?));

        let listener = TcpListener::bind(config.listen)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        Ok(Server {
            listener,
            dispatcher,
            pool,
            shared: Arc::new(Shared {
                local_addr,
                shutting_down: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                connections: DashMap::new(),
            }),
        })
    }

    /// the address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// returns a handle that stops this server
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts connections until a [`ShutdownHandle`] fires, then closes every live connection,
    /// waits for the connection threads and shuts the worker pool down.
    pub fn run(self) -> Result<()> {
        let Server {
            listener,
            dispatcher,
            pool,
            shared,
        } = self;
        let mut threads: Vec<JoinHandle<()>> = Vec::new();

        for stream in listener.incoming() {
            if shared.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Connection failed: {}", e);
                    continue;
                }
            };
            threads.retain(|t| !t.is_finished());

            let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
            match stream.try_clone() {
                Ok(registered) => {
                    shared.connections.insert(id, registered);
                }
                Err(e) => {
                    warn!("could not register connection: {}", e);
                    continue;
                }
            }
            let dispatcher = Arc::clone(&dispatcher);
            let conn_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("conn-{}", id))
                .spawn(move || handle_connection(id, stream, &dispatcher, &conn_shared));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    error!("could not spawn connection thread: {}", e);
                    shared.connections.remove(&id);
                }
            }
        }

        drop(listener);
        shared.close_connections();
        for handle in threads {
            if handle.join().is_err() {
                error!("a connection thread panicked");
            }
        }
        drop(dispatcher);
        pool.shutdown();
        info!("server stopped");
        Ok(())
    }
}

impl ShutdownHandle {
    /// Stops accepting and shuts down every live connection. [`Server::run`] returns once the
    /// connection threads and the worker pool have finished.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        // wake the accept loop
        if let Err(e) = TcpStream::connect(wake_addr(self.shared.local_addr)) {
            warn!("could not wake the accept loop: {}", e);
        }
        self.shared.close_connections();
    }
}

impl Shared {
    fn close_connections(&self) {
        for conn in self.connections.iter() {
            let _ = conn.value().shutdown(Shutdown::Both);
        }
    }
}

/// the address to connect to in order to reach a listener bound to `addr`
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(a) if a.ip().is_unspecified() => SocketAddr::from((Ipv4Addr::LOCALHOST, a.port())),
        SocketAddr::V6(a) if a.ip().is_unspecified() => SocketAddr::from((Ipv6Addr::LOCALHOST, a.port())),
        other => other,
    }
}

/// Serves one connection. A panic while serving it is contained here and only ends this
/// connection.
fn handle_connection(id: u64, tcp: TcpStream, dispatcher: &Dispatcher, shared: &Shared) {
    let peer = tcp
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    let span = info_span!("connection", id, peer = %peer);
    let _entered = span.enter();
    debug!("accepted");

    match panic::catch_unwind(AssertUnwindSafe(|| serve(dispatcher, &tcp))) {
        Ok(Ok(())) => debug!("closed by peer"),
        Ok(Err(e)) => warn!("closing connection: {}", e),
        Err(_) => error!("connection handler panicked"),
    }
    let _ = tcp.shutdown(Shutdown::Both);
    shared.connections.remove(&id);
}

/// Reads requests off `tcp`, dispatches them and writes back the replies until the peer hangs
/// up or sends something that is not a valid request.
fn serve(dispatcher: &Dispatcher, tcp: &TcpStream) -> Result<()> {
    let mut requests = FrameReader::new(BufReader::new(tcp));
    let mut writer = BufWriter::new(tcp);

    while let Some(args) = requests.read_request()? {
        debug!(command = %String::from_utf8_lossy(&args[0]), args = args.len() - 1, "request");
        let reply = dispatcher.dispatch(&args)?;
        debug!(?reply, "reply");
        reply.write_to(&mut writer)?;
        writer.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_addr_targets_loopback() {
        let any: SocketAddr = "0.0.0.0:6380".parse().unwrap();
        assert_eq!(wake_addr(any), "127.0.0.1:6380".parse().unwrap());
        let any6: SocketAddr = "[::]:6380".parse().unwrap();
        assert_eq!(wake_addr(any6), "[::1]:6380".parse().unwrap());
        let fixed: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert_eq!(wake_addr(fixed), fixed);
    }
}
