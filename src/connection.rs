//! Connection state machine for accepted TCP sockets.
//!
//! A connection moves through `Opening → Configured → Active → Closing →
//! Closed`. Configuration failures skip `Active`. The handler task owns
//! the connection exclusively, so none of this state is locked.
//!
//! There is exactly one closing path. It runs either from the handler once
//! a close reason is known, or from `Drop` when the handler future is torn
//! down before reaching a close (forced shutdown).

use crate::registry::{ConnectionId, Registry};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// Byte written back for every byte received.
pub const ACK: u8 = 0x01;

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

static ACKS: [u8; BUFFER_SIZE] = [ACK; BUFFER_SIZE];

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket accepted, streams not yet verified.
    Opening,
    /// Peer address known, socket options and idle timeout set.
    Configured,
    /// Running the read/acknowledge loop.
    Active,
    /// A close reason has been determined; resources are being released.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The socket's I/O streams could not be obtained.
    IoUnavailable,
    /// Setting socket options failed.
    ConfigureFailed(io::ErrorKind),
    /// No data arrived within the idle timeout.
    TimedOut,
    /// The peer closed its side of the connection.
    PeerClosed,
    /// A read or write failed.
    Io(io::ErrorKind),
    /// The server was stopped while the connection was idle between reads.
    ServerStopped,
    /// The handler was torn down before it could close the connection.
    Aborted,
}

impl CloseReason {
    /// Whether the handler reached this close on its own.
    pub fn is_natural(&self) -> bool {
        !matches!(self, CloseReason::Aborted)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::IoUnavailable => write!(f, "could not establish I/O"),
            CloseReason::ConfigureFailed(kind) => {
                write!(f, "protocol error configuring socket: {kind}")
            }
            CloseReason::TimedOut => write!(f, "timed out"),
            CloseReason::PeerClosed => write!(f, "client closed connection"),
            CloseReason::Io(kind) => write!(f, "client I/O error: {kind}"),
            CloseReason::ServerStopped => write!(f, "server stopped"),
            CloseReason::Aborted => write!(f, "interrupted by forced shutdown"),
        }
    }
}

/// Per-connection settings shared by every handler.
#[derive(Debug, Clone)]
pub struct Settings {
    pub idle_timeout: Duration,
    /// Sent once before the first read; empty disables it.
    pub greeting: Bytes,
}

/// A single accepted client connection.
pub struct Connection {
    id: ConnectionId,
    state: ConnState,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    accepted_at: DateTime<Utc>,
    started: Instant,
    greeting_sent: bool,
    settings: Settings,
    registry: Arc<Registry>,
    stopped: Arc<AtomicBool>,
}

impl Connection {
    /// Wrap an accepted socket in the `Opening` state.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        settings: Settings,
        registry: Arc<Registry>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            state: ConnState::Opening,
            stream: Some(stream),
            peer: None,
            accepted_at: Utc::now(),
            started: Instant::now(),
            greeting_sent: false,
            settings,
            registry,
            stopped,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Run the connection to its close.
    pub async fn run(mut self) {
        self.registry.mark_started(self.id);

        if let Err(reason) = self.configure() {
            self.close(reason);
            return;
        }

        self.state = ConnState::Active;
        debug!(
            conn = self.id,
            peer = ?self.peer,
            accepted_at = %self.accepted_at,
            "Client connected"
        );

        let reason = self.serve().await;
        self.close(reason);
    }

    /// `Opening → Configured`.
    pub(crate) fn configure(&mut self) -> Result<(), CloseReason> {
        let stream = self.stream.as_ref().ok_or(CloseReason::IoUnavailable)?;
        let peer = stream
            .peer_addr()
            .map_err(|_| CloseReason::IoUnavailable)?;

        let sock = SockRef::from(stream);
        sock.set_nodelay(true)
            .and_then(|()| sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE)))
            .map_err(|e| CloseReason::ConfigureFailed(e.kind()))?;

        self.peer = Some(peer);
        self.state = ConnState::Configured;
        Ok(())
    }

    /// The read/acknowledge loop. Returns once a close reason is known.
    async fn serve(&mut self) -> CloseReason {
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return CloseReason::ServerStopped;
            }

            let Some(stream) = self.stream.as_mut() else {
                return CloseReason::IoUnavailable;
            };

            if !self.greeting_sent {
                if !self.settings.greeting.is_empty() {
                    if let Err(e) = stream.write_all(&self.settings.greeting).await {
                        return CloseReason::Io(e.kind());
                    }
                }
                self.greeting_sent = true;
            }

            let read = tokio::time::timeout(self.settings.idle_timeout, stream.read(&mut buffer));
            let n = match read.await {
                Err(_) => return CloseReason::TimedOut,
                Ok(Ok(0)) => return CloseReason::PeerClosed,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    return CloseReason::TimedOut
                }
                Ok(Err(e)) => return CloseReason::Io(e.kind()),
            };

            trace!(conn = self.id, bytes = n, "Received");
            if let Err(e) = stream.write_all(&ACKS[..n]).await {
                return CloseReason::Io(e.kind());
            }
        }
    }

    /// `Closing → Closed`.
    ///
    /// Releases the socket, deregisters, and logs the session. Returns
    /// `false` without doing anything if the connection is already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.state = ConnState::Closing;

        self.release();
        self.registry.remove(self.id, reason.is_natural());
        self.state = ConnState::Closed;

        let elapsed_ms = millis(self.started.elapsed());
        info!(
            conn = self.id,
            peer = ?self.peer,
            reason = %reason,
            elapsed_ms,
            "Connection closed"
        );
        true
    }

    /// Close input, output and the socket, each independently.
    fn release(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };

        let sock = SockRef::from(&stream);
        if let Err(e) = sock.shutdown(Shutdown::Read) {
            debug!(conn = self.id, error = %e, "Failed to close input");
        }
        if let Err(e) = sock.shutdown(Shutdown::Write) {
            debug!(conn = self.id, error = %e, "Failed to close output");
        }
        drop(stream);
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnState::Closed {
            self.close(CloseReason::Aborted);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}
