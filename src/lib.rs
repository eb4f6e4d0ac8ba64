//! Readiness-based TCP endpoint.
//!
//! The endpoint multiplexes inbound connections across poller threads and
//! dispatches per-connection work (read, write, sendfile, TLS handshake
//! progression, timeout, error) to a worker pool that invokes a pluggable
//! [`Handler`]. TLS is a channel variant: a handshake state interposed in
//! front of the handler, transparent once established.
//!
//! Three thread populations cooperate: one acceptor that blocks in `accept`
//! and gates on a connection limiter, N pollers that each own a selector and
//! run the readiness loop, and a worker pool running handler code. Interest
//! sets are owned by their poller; other threads request changes through a
//! per-poller event queue with a wake counter.

pub mod acceptor;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod executor;
pub mod handler;
mod latch;
pub mod metrics;
mod pool;
mod poller;
mod processor;
pub mod sendfile;
mod selector_pool;
pub mod wrapper;

pub use acceptor::AcceptorState;
pub use channel::HandshakeStatus;
pub use config::{EndpointConfig, SocketConfig};
pub use endpoint::Endpoint;
pub use error::Error;
pub use event::Ops;
pub use executor::ThreadPool;
pub use handler::{Executor, Handler, SocketEvent, SocketState};
pub use sendfile::{SendfileData, SendfileKeepAlive, SendfileState};
pub use wrapper::Connection;
