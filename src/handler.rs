//! External collaborator interfaces.
//!
//! The endpoint core is protocol-agnostic: it multiplexes readiness and
//! hands per-connection work to a [`Handler`]. Worker threads come from an
//! [`Executor`]; a default implementation lives in [`crate::executor`] and is
//! created at `start` when none is supplied.

use std::sync::Arc;

use crate::wrapper::Connection;

/// The condition that triggered a dispatch to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// Data is (or may be) available to read.
    OpenRead,
    /// The socket became writable again.
    OpenWrite,
    /// The endpoint is stopping.
    Stop,
    /// The peer disconnected.
    Disconnect,
    /// An error was recorded on the connection (e.g. a timeout); inspect it
    /// with [`Connection::take_error`].
    Error,
}

/// Handler verdict on a connection after processing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Keep the connection; the handler re-registers interest itself.
    Open,
    /// Close the connection now.
    Closed,
    /// The connection is parked in a long-running operation (upgraded
    /// protocols, long polls); the endpoint leaves it alone.
    Long,
}

/// Protocol handler invoked from worker threads.
pub trait Handler: Send + Sync + 'static {
    /// Process one event on one connection. Called after any TLS handshake
    /// has completed.
    fn process(&self, conn: &Arc<Connection>, event: SocketEvent) -> SocketState;

    /// The connection's key was cancelled; discard any in-flight processor
    /// state associated with it.
    fn release(&self, _conn: &Arc<Connection>) {}

    /// The endpoint is shutting down.
    fn recycle(&self) {}
}

/// Worker pool consumed by the endpoint. Backpressure is the caller's
/// responsibility.
pub trait Executor: Send + Sync + 'static {
    /// Run a task on a worker thread. Returns `false` once the pool has shut
    /// down (the task is dropped); the poller treats that as an instruction
    /// to close the connection.
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> bool;

    /// Stop accepting tasks and wind down worker threads.
    fn shutdown(&self);
}
