//! Sendfile state carried on a connection.

use std::fs::File;
use std::path::PathBuf;

/// What to do with the connection once the transfer completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendfileKeepAlive {
    /// Close the connection.
    None,
    /// Pipelined data is already buffered; dispatch a read immediately.
    Pipelined,
    /// Keep the connection and re-register read interest.
    Open,
}

/// Result of driving a sendfile transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendfileState {
    Done,
    Pending,
    Error,
}

/// A pending zero-copy file transfer, attached to a connection wrapper.
/// While attached, the owning poller drives the transfer inline instead of
/// dispatching readiness to the worker pool.
pub struct SendfileData {
    pub(crate) path: PathBuf,
    pub(crate) pos: u64,
    pub(crate) remaining: u64,
    pub(crate) keep_alive: SendfileKeepAlive,
    /// Opened lazily on first transfer.
    pub(crate) file: Option<File>,
}

impl SendfileData {
    pub fn new(path: impl Into<PathBuf>, pos: u64, length: u64, keep_alive: SendfileKeepAlive) -> Self {
        Self {
            path: path.into(),
            pos,
            remaining: length,
            keep_alive,
            file: None,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}
