//! Shared scaffolding for endpoint integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use trireme::{Endpoint, EndpointConfig, Handler};

pub fn test_config() -> EndpointConfig {
    let mut config = EndpointConfig::default();
    config.address = "127.0.0.1".parse().unwrap();
    config.port = 0;
    config.poller_threads = 1;
    config.worker_threads = 2;
    config.socket.so_timeout_ms = 5000;
    config
}

pub fn start_endpoint(config: EndpointConfig, handler: Arc<dyn Handler>) -> (Endpoint, SocketAddr) {
    let mut endpoint = Endpoint::new(config, handler);
    endpoint.bind().expect("bind failed");
    endpoint.start().expect("start failed");
    let addr = endpoint.local_addr().expect("no local addr");
    (endpoint, addr)
}

/// Poll a condition with a deadline instead of fixed sleeps.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
