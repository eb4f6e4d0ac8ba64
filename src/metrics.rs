//! Endpoint metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently established connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "accept_errors",
    description = "Total accept failures (transient errors included)"
)]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(
    name = "connections_timed_out",
    description = "Connections closed by the poller timeout scan"
)]
pub static CONNECTIONS_TIMED_OUT: Counter = Counter::new();

#[metric(
    name = "handshakes_failed",
    description = "TLS handshakes that failed and closed the connection"
)]
pub static HANDSHAKES_FAILED: Counter = Counter::new();

#[metric(
    name = "sendfile_completed",
    description = "Sendfile transfers completed"
)]
pub static SENDFILE_COMPLETED: Counter = Counter::new();
