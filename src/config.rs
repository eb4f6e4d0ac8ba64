//! Endpoint configuration.
//!
//! Plain structs with defaults matching the tuning surface of the endpoint;
//! all of them derive `Deserialize` so an embedding server can load them from
//! a TOML section.

use serde::Deserialize;
use std::net::IpAddr;

/// Top-level endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EndpointConfig {
    /// Address to bind.
    pub address: IpAddr,

    /// Port to bind. 0 asks the OS for an ephemeral port.
    pub port: u16,

    /// Listen backlog handed to the OS.
    pub accept_count: u32,

    /// Adopt the server socket from fd 0 instead of binding one.
    pub use_inherited_channel: bool,

    /// Number of acceptor threads. One is the default; more are permitted
    /// but have not measured well.
    pub acceptor_threads: usize,

    /// Number of poller threads.
    pub poller_threads: usize,

    /// Nice value applied to poller threads. 0 leaves the OS default.
    pub poller_thread_priority: i32,

    /// Maximum time a poller blocks in select when no events are pending.
    pub selector_timeout_ms: u64,

    /// Maximum number of concurrently established connections. -1 means
    /// unbounded.
    pub max_connections: i64,

    /// Keep-alive budget per connection: how many requests a connection may
    /// serve before it is closed. -1 means unbounded.
    pub max_keep_alive_requests: i64,

    /// Size of the default worker pool, used only when no executor is
    /// supplied before `start`.
    pub worker_threads: usize,

    /// Per-socket options and cache sizes.
    pub socket: SocketConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            accept_count: 100,
            use_inherited_channel: false,
            acceptor_threads: 1,
            poller_threads: default_poller_threads(),
            poller_thread_priority: 0,
            selector_timeout_ms: 1000,
            max_connections: 10_000,
            max_keep_alive_requests: 100,
            worker_threads: 8,
            socket: SocketConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::Error> {
        if self.poller_threads == 0 {
            return Err(crate::Error::InvalidConfig(
                "poller_threads must be at least 1".into(),
            ));
        }
        if self.acceptor_threads == 0 {
            return Err(crate::Error::InvalidConfig(
                "acceptor_threads must be at least 1".into(),
            ));
        }
        if self.socket.app_read_buf_size == 0 || self.socket.app_write_buf_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "application buffer sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Socket options and object-cache capacities.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SocketConfig {
    /// Per-connection read/write timeout in milliseconds. 0 disables
    /// timeout enforcement.
    pub so_timeout_ms: u64,

    /// Minimum gap between timeout scans on a poller.
    pub timeout_interval_ms: u64,

    /// Application-level read buffer size per channel.
    pub app_read_buf_size: usize,

    /// Application-level write buffer size per channel.
    pub app_write_buf_size: usize,

    /// Set TCP_NODELAY on accepted sockets.
    pub tcp_no_delay: bool,

    /// Set SO_KEEPALIVE on accepted sockets.
    pub so_keep_alive: bool,

    /// SO_RCVBUF for accepted sockets, when set.
    pub rcv_buf: Option<usize>,

    /// SO_SNDBUF for accepted sockets, when set.
    pub snd_buf: Option<usize>,

    /// Capacity of the poller-event cache.
    pub event_cache: usize,

    /// Capacity of the socket-processor cache.
    pub processor_cache: usize,

    /// Capacity of the channel cache.
    pub buffer_pool: usize,

    /// Hard cap on helper selectors used for blocking I/O from worker
    /// threads.
    pub max_helper_selectors: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            so_timeout_ms: 20_000,
            timeout_interval_ms: 1000,
            app_read_buf_size: 8192,
            app_write_buf_size: 8192,
            tcp_no_delay: true,
            so_keep_alive: false,
            rcv_buf: None,
            snd_buf: None,
            event_cache: 128,
            processor_cache: 128,
            buffer_pool: 128,
            max_helper_selectors: 200,
        }
    }
}

fn default_poller_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.min(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EndpointConfig::default();
        assert_eq!(config.selector_timeout_ms, 1000);
        assert_eq!(config.max_keep_alive_requests, 100);
        assert_eq!(config.acceptor_threads, 1);
        assert!(config.poller_threads >= 1 && config.poller_threads <= 2);
        assert_eq!(config.socket.so_timeout_ms, 20_000);
        assert_eq!(config.socket.app_read_buf_size, 8192);
        assert_eq!(config.socket.event_cache, 128);
        config.validate().unwrap();
    }

    #[test]
    fn from_toml() {
        let config: EndpointConfig = toml::from_str(
            r#"
            address = "127.0.0.1"
            port = 8080
            poller_threads = 4

            [socket]
            so_timeout_ms = 5000
            app_read_buf_size = 16384
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.poller_threads, 4);
        assert_eq!(config.socket.so_timeout_ms, 5000);
        assert_eq!(config.socket.app_read_buf_size, 16384);
        // untouched fields keep their defaults
        assert_eq!(config.socket.app_write_buf_size, 8192);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<EndpointConfig, _> = toml::from_str("bogus = true");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_pollers() {
        let config = EndpointConfig {
            poller_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
