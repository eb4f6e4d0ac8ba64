use std::io;

/// Errors surfaced by endpoint lifecycle operations.
///
/// Per-connection failures never reach this type; they are contained to the
/// connection teardown path and logged there.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("endpoint is not bound")]
    NotBound,

    #[error("endpoint is already running")]
    AlreadyRunning,
}
