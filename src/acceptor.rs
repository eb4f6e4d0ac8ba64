//! The accept loop.
//!
//! One blocking thread (more are permitted, but multi-accept has not
//! measured well) that gates on the connection limiter, accepts, configures
//! the socket, pairs it with a pooled channel, and hands the new connection
//! to a poller picked round-robin. Transient accept failures back off
//! exponentially instead of spinning the loop.

use socket2::SockRef;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::channel::Channel;
use crate::endpoint::Shared;
use crate::metrics::{ACCEPT_ERRORS, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE};
use crate::poller::PollerHandle;
use crate::wrapper::Connection;

const INITIAL_ERROR_DELAY_MS: u64 = 50;
const MAX_ERROR_DELAY_MS: u64 = 1600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptorState {
    New = 0,
    Running = 1,
    Paused = 2,
    Ended = 3,
}

pub(crate) struct Acceptor {
    shared: Arc<Shared>,
    listener: Arc<TcpListener>,
    pollers: Vec<Arc<PollerHandle>>,
    state: Arc<AtomicU8>,
}

impl Acceptor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        listener: Arc<TcpListener>,
        pollers: Vec<Arc<PollerHandle>>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            shared,
            listener,
            pollers,
            state,
        }
    }

    pub(crate) fn run(self) {
        let mut error_delay = 0u64;

        while self.shared.is_running() {
            while self.shared.is_paused() && self.shared.is_running() {
                self.state
                    .store(AcceptorState::Paused as u8, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(50));
            }
            if !self.shared.is_running() {
                break;
            }
            self.state
                .store(AcceptorState::Running as u8, Ordering::Relaxed);

            // at max connections this blocks until a close frees a slot
            self.shared.limiter.acquire();

            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    self.shared.limiter.release();
                    if self.shared.is_running() {
                        ACCEPT_ERRORS.increment();
                        tracing::error!("accept failed: {e}");
                        if error_delay > 0 {
                            std::thread::sleep(Duration::from_millis(error_delay));
                        }
                        error_delay = next_error_delay(error_delay);
                        continue;
                    }
                    break;
                }
            };
            // successful accept resets the backoff
            error_delay = 0;

            if self.shared.is_running() && !self.shared.is_paused() {
                if let Err(e) = self.setup_socket(stream, peer) {
                    tracing::error!(%peer, "failed to set up accepted socket: {e}");
                    self.shared.limiter.release();
                }
            } else {
                self.shared.limiter.release();
            }
        }

        self.state
            .store(AcceptorState::Ended as u8, Ordering::Relaxed);
    }

    /// Configure the socket, wrap it in a (recycled) channel, and register
    /// it with the next poller. The socket is closed by drop on any error.
    fn setup_socket(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let socket_config = &self.shared.config.socket;

        // non-blocking from here on; the pollers own readiness
        stream.set_nonblocking(true)?;
        let sock = SockRef::from(&stream);
        sock.set_nodelay(socket_config.tcp_no_delay)?;
        if socket_config.so_keep_alive {
            sock.set_keepalive(true)?;
        }
        if let Some(size) = socket_config.rcv_buf {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = socket_config.snd_buf {
            sock.set_send_buffer_size(size)?;
        }

        let stream = mio::net::TcpStream::from_std(stream);

        let mut channel = self.shared.channel_cache.pop().unwrap_or_else(|| {
            Channel::new(
                socket_config.app_read_buf_size,
                socket_config.app_write_buf_size,
            )
        });
        channel
            .reset(stream, self.shared.tls.as_ref())
            .map_err(io::Error::other)?;

        let poller = self.next_poller();
        let conn = Connection::create(
            channel,
            self.shared.clone(),
            poller.clone(),
            peer,
            self.shared.tls.is_some(),
        );

        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();
        poller.register(&self.shared, &conn);
        Ok(())
    }

    /// True round-robin across pollers.
    fn next_poller(&self) -> &Arc<PollerHandle> {
        let index = self.shared.rotation.fetch_add(1, Ordering::Relaxed) % self.pollers.len();
        &self.pollers[index]
    }
}

fn next_error_delay(delay: u64) -> u64 {
    if delay == 0 {
        INITIAL_ERROR_DELAY_MS
    } else {
        (delay * 2).min(MAX_ERROR_DELAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_delay_backs_off_and_caps() {
        let mut delay = 0;
        let mut seen = Vec::new();
        for _ in 0..8 {
            delay = next_error_delay(delay);
            seen.push(delay);
        }
        assert_eq!(seen, vec![50, 100, 200, 400, 800, 1600, 1600, 1600]);
    }
}
