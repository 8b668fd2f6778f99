//! TCP server: listening socket, accept loop and lifecycle.
//!
//! The accept loop runs as one task that owns the listener. Each accepted
//! socket becomes a [`Connection`], registered and then either submitted
//! to the worker pool or run inline on the accept task, depending on the
//! configured [`DispatchMode`].

use crate::config::{Config, DispatchMode};
use crate::connection::{Connection, Settings};
use crate::pool::WorkerPool;
use crate::registry::Registry;
use crate::shutdown::{ForceOnDrop, ShutdownCoordinator, ShutdownOutcome};
use bytes::Bytes;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Pending-connection queue length for the listening socket.
const LISTEN_BACKLOG: i32 = 50;

/// Server errors visible outside the server.
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be opened.
    Bind(SocketAddr, io::Error),
    /// Accept failed while the server was running.
    Accept(io::Error),
    /// The operation needs a running server.
    Stopped,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Could not open server socket on {addr}: {e}"),
            ServerError::Accept(e) => write!(f, "Error accepting client connection: {e}"),
            ServerError::Stopped => write!(f, "Server is stopped"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) | ServerError::Accept(e) => Some(e),
            ServerError::Stopped => None,
        }
    }
}

/// How the accept loop hands off a connection.
#[derive(Debug, Clone)]
enum Dispatcher {
    Pool(WorkerPool),
    Inline,
}

/// Server instance
pub struct Server {
    local_addr: SocketAddr,
    /// Present until the accept loop takes ownership of it.
    listener: Mutex<Option<TcpListener>>,
    stopped: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    settings: Settings,
    coordinator: ShutdownCoordinator,
    accept_done: watch::Receiver<bool>,
    accept_done_tx: Mutex<Option<watch::Sender<bool>>>,
    fatal: Arc<Mutex<Option<ServerError>>>,
}

impl Server {
    /// Bind and listen on the configured address.
    ///
    /// The listener is open once this returns; connections queue in the
    /// kernel backlog until [`Server::start`] runs the accept loop.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener =
            create_listener(config.listen).map_err(|e| ServerError::Bind(config.listen, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(config.listen, e))?;

        let dispatcher = match config.dispatch {
            DispatchMode::Pool => Dispatcher::Pool(WorkerPool::new(config.pool_size())),
            DispatchMode::Inline => Dispatcher::Inline,
        };
        let (accept_done_tx, accept_done) = watch::channel(false);

        info!(
            address = %local_addr,
            dispatch = ?config.dispatch,
            workers = config.pool_size(),
            "Server opened, looking for clients"
        );

        Ok(Server {
            local_addr,
            listener: Mutex::new(Some(listener)),
            stopped: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new(Notify::new()),
            registry: Arc::new(Registry::new()),
            dispatcher,
            settings: Settings {
                idle_timeout: config.idle_timeout,
                greeting: Bytes::from(config.greeting.clone().into_bytes()),
            },
            coordinator: ShutdownCoordinator::new(config.drain_timeout, config.force_timeout),
            accept_done,
            accept_done_tx: Mutex::new(Some(accept_done_tx)),
            fatal: Arc::new(Mutex::new(None)),
        })
    }

    fn listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the accept loop. Calls after the first, or after `stop()`,
    /// do nothing.
    pub fn start(&self) {
        let mut slot = self.listener();
        if self.is_stopped() {
            return;
        }
        let Some(listener) = slot.take() else {
            return;
        };
        let done = self
            .accept_done_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(slot);

        let accept = AcceptLoop {
            listener,
            stopped: Arc::clone(&self.stopped),
            wakeup: Arc::clone(&self.wakeup),
            registry: Arc::clone(&self.registry),
            dispatcher: self.dispatcher.clone(),
            settings: self.settings.clone(),
        };
        let fatal = Arc::clone(&self.fatal);

        tokio::spawn(async move {
            if let Err(e) = accept.run().await {
                error!(error = %e, "Accept loop failed");
                *fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            }
            if let Some(done) = done {
                let _ = done.send(true);
            }
        });
    }

    /// Stop the server and drain in-flight connections.
    ///
    /// Returns `None` if the server had already been stopped, so only the
    /// first caller observes the drain outcome.
    pub async fn stop(&self) -> Option<ShutdownOutcome> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return None;
        }
        info!("Server stopping");

        // Armed until the drain takes over, in case the caller is cancelled
        // while the accept loop is still winding down.
        let mut force = self.pool().map(ForceOnDrop::new);

        // Close the listening socket.
        let unstarted = self.listener().take();
        match unstarted {
            Some(listener) => {
                drop(listener);
                // No accept loop will run; release anyone in `wait()`.
                drop(
                    self.accept_done_tx
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take(),
                );
            }
            None => {
                self.wakeup.notify_one();
                self.accept_finished().await;
            }
        }
        debug!("Listening socket closed");

        if let Some(guard) = force.as_mut() {
            guard.disarm();
        }
        let outcome = match &self.dispatcher {
            Dispatcher::Pool(pool) => self.coordinator.drain(pool, &self.registry).await,
            Dispatcher::Inline => ShutdownOutcome::Drained,
        };
        info!(outcome = %outcome, live = self.registry.len(), "Server Stopped");
        Some(outcome)
    }

    /// Wait for the accept loop to exit.
    ///
    /// Returns the fatal accept error if that is why it exited, and returns
    /// at once if [`Server::start`] has not spawned the loop yet.
    pub async fn wait(&self) -> Result<(), ServerError> {
        if self
            .accept_done_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Ok(());
        }
        self.accept_finished().await;
        match self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn accept_finished(&self) {
        let mut done = self.accept_done.clone();
        // A closed channel means the accept task is gone as well.
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Address the server is listening on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        if self.is_stopped() {
            return Err(ServerError::Stopped);
        }
        Ok(self.local_addr)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The worker pool, if connections are dispatched to one.
    pub fn pool(&self) -> Option<&WorkerPool> {
        match &self.dispatcher {
            Dispatcher::Pool(pool) => Some(pool),
            Dispatcher::Inline => None,
        }
    }
}

/// State owned by the accept task.
struct AcceptLoop {
    listener: TcpListener,
    stopped: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    settings: Settings,
}

impl AcceptLoop {
    async fn run(self) -> Result<(), ServerError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let accepted = tokio::select! {
                biased;

                _ = self.wakeup.notified() => continue,
                result = self.listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    self.dispatch(stream, peer).await;
                }
                Err(e) if self.stopped.load(Ordering::Acquire) => {
                    debug!(error = %e, "Server is stopped and cannot listen for clients");
                    break;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }

        debug!("Accept loop exiting");
        Ok(())
    }

    async fn dispatch(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let connection = |id| {
            Connection::new(
                id,
                stream,
                self.settings.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.stopped),
            )
        };

        match &self.dispatcher {
            Dispatcher::Pool(pool) => {
                let submitted = self
                    .registry
                    .insert_with(peer, |id| pool.submit(connection(id).run()).map(Some));
                if let Err(rejected) = submitted {
                    warn!(peer = %peer, "Worker pool is shut down, dropping connection");
                    drop(rejected);
                }
            }
            Dispatcher::Inline => {
                let mut inline = None;
                let registered = self.registry.insert_with(peer, |id| {
                    inline = Some(connection(id));
                    Ok::<_, Infallible>(None)
                });
                if let (Ok(_), Some(conn)) = (registered, inline) {
                    conn.run().await;
                }
            }
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ACK;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const GREETING: &[u8] = b"hi\n";

    fn test_config(workers: usize, idle_ms: u64) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            workers,
            idle_timeout: Duration::from_millis(idle_ms),
            greeting: String::from_utf8(GREETING.to_vec()).unwrap(),
            drain_timeout: Duration::from_secs(5),
            force_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    async fn started(config: &Config) -> Server {
        let server = Server::bind(config).await.unwrap();
        server.start();
        server
    }

    /// Connect, read the greeting, send one byte and wait for its ack.
    async fn ping(addr: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut greeting = [0u8; GREETING.len()];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, GREETING);

        client.write_all(b"x").await.unwrap();
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], ACK);
        client
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_greeting_and_ack() {
        let server = started(&test_config(2, 2_000)).await;
        let addr = server.listen_addr().unwrap();

        let mut client = ping(addr).await;
        client.write_all(b"more").await.unwrap();
        let mut acks = [0u8; 4];
        client.read_exact(&mut acks).await.unwrap();
        assert_eq!(acks, [ACK; 4]);
        assert_eq!(server.registry().len(), 1);

        drop(client);
        assert!(eventually(|| server.registry().is_empty()).await);
        assert_eq!(server.stop().await, Some(ShutdownOutcome::Drained));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_head_of_line_blocking_within_capacity() {
        let server = started(&test_config(4, 2_000)).await;
        let addr = server.listen_addr().unwrap();

        // Every client gets its ack while all of them stay connected.
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(ping(addr).await);
        }
        assert_eq!(server.registry().len(), 4);
        assert_eq!(server.pool().unwrap().running(), 4);

        drop(clients);
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_excess_connections_queue() {
        let server = started(&test_config(2, 300)).await;
        let addr = server.listen_addr().unwrap();

        let _first = ping(addr).await;
        let _second = ping(addr).await;

        // Third client is accepted but waits for a free slot.
        let mut third = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(100), third.read(&mut buf)).await;
        assert!(early.is_err());
        assert!(eventually(|| server.registry().len() == 3).await);

        // The first two go idle and time out, freeing slots.
        let mut greeting = [0u8; GREETING.len()];
        third.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, GREETING);
        third.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], ACK);

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_connection_times_out() {
        let server = started(&test_config(2, 150)).await;
        let addr = server.listen_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut greeting = [0u8; GREETING.len()];
        client.read_exact(&mut greeting).await.unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(100));

        assert!(eventually(|| server.registry().is_empty()).await);
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_refuses_new_connections() {
        let server = started(&test_config(2, 200)).await;
        let addr = server.listen_addr().unwrap();
        let _client = ping(addr).await;

        let outcome = server.stop().await;
        assert_eq!(outcome, Some(ShutdownOutcome::Drained));
        assert!(server.is_stopped());
        assert!(matches!(server.listen_addr(), Err(ServerError::Stopped)));
        assert_eq!(server.registry().finished(), 0);
        assert!(server.registry().is_empty());
        assert!(TcpStream::connect(addr).await.is_err());

        // Idempotent.
        assert_eq!(server.stop().await, None);
        tokio_test::assert_ok!(server.wait().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_before_start_closes_listener() {
        let server = Server::bind(&test_config(1, 200)).await.unwrap();
        let addr = server.listen_addr().unwrap();

        assert_eq!(server.stop().await, Some(ShutdownOutcome::Drained));
        server.start();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inline_dispatch() {
        let config = Config {
            dispatch: DispatchMode::Inline,
            ..test_config(1, 200)
        };
        let server = started(&config).await;
        let addr = server.listen_addr().unwrap();
        assert!(server.pool().is_none());

        let client = ping(addr).await;
        drop(client);
        let _again = ping(addr).await;

        assert_eq!(server.stop().await, Some(ShutdownOutcome::Drained));
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_stop_forces_pool() {
        let server = started(&test_config(1, 2_000)).await;
        let pool = server.pool().unwrap().clone();
        let handle = pool
            .submit(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();

        // One poll sets the flag and parks on the accept loop, which has
        // not had a chance to run yet.
        let mut stop = tokio_test::task::spawn(server.stop());
        assert!(stop.poll().is_pending());
        drop(stop);

        assert!(server.is_stopped());
        assert!(pool.is_shutdown());
        assert!(handle.join().await.unwrap_err().is_cancelled());
        assert_eq!(server.stop().await, None);
    }

    #[tokio::test]
    async fn test_wait_without_start_returns() {
        let server = Server::bind(&test_config(1, 200)).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(1), server.wait()).await;
        assert!(matches!(waited, Ok(Ok(()))));
        assert!(!server.is_stopped());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let server = Server::bind(&test_config(1, 200)).await.unwrap();
        let taken = server.listen_addr().unwrap();

        let config = Config {
            listen: taken,
            ..test_config(1, 200)
        };
        let err = Server::bind(&config).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind(addr, _) if addr == taken));
    }
}
