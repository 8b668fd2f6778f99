//! ackd: a concurrent TCP liveness server
//!
//! Accepts client connections and hands each to a bounded pool of worker
//! tasks. Every connection receives an optional greeting and then one
//! acknowledgement byte per byte it sends, until it goes idle, the peer
//! disconnects, or the server stops.
//!
//! Components:
//! - `connection`: per-socket state machine with a single close path
//! - `pool`: bounded worker pool with graceful and forced shutdown
//! - `registry`: live connections and their completion handles
//! - `server`: listening socket, accept loop and dispatch strategy
//! - `shutdown`: two-phase drain of the worker pool

pub mod config;
pub mod connection;
pub mod pool;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use config::{Config, DispatchMode};
pub use connection::{CloseReason, ConnState, Connection};
pub use pool::{TaskHandle, WorkerPool};
pub use registry::{ConnectionId, Registry};
pub use server::{Server, ServerError};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
