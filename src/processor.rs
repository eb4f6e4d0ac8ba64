//! Worker-pool unit of per-connection work.
//!
//! A processor advances the TLS handshake if one is in flight, then invokes
//! the protocol handler. Incomplete handshake progress turns into an
//! interest re-registration on the owning poller. Processors are pooled and
//! reset between uses.

use std::sync::Arc;

use crate::channel::HandshakeStatus;
use crate::endpoint::Shared;
use crate::handler::{SocketEvent, SocketState};
use crate::metrics::HANDSHAKES_FAILED;
use crate::poller::close_connection;
use crate::wrapper::Connection;

enum Handshake {
    Complete,
    Failed,
    NeedRead,
    NeedWrite,
}

pub(crate) struct SocketProcessor {
    conn: Option<Arc<Connection>>,
    event: Option<SocketEvent>,
}

impl SocketProcessor {
    pub(crate) fn new() -> Self {
        Self {
            conn: None,
            event: None,
        }
    }

    pub(crate) fn set(&mut self, conn: Arc<Connection>, event: SocketEvent) {
        self.conn = Some(conn);
        self.event = Some(event);
    }

    fn reset(&mut self) {
        self.conn = None;
        self.event = None;
    }

    pub(crate) fn run(mut self, shared: &Arc<Shared>) {
        let (Some(conn), Some(mut event)) = (self.conn.take(), self.event.take()) else {
            return;
        };

        let handshake = {
            let mut channel = conn.channel.lock();
            if channel.handshake_complete() {
                Handshake::Complete
            } else if matches!(
                event,
                SocketEvent::Stop | SocketEvent::Disconnect | SocketEvent::Error
            ) {
                // no point finishing a handshake we are about to tear down
                Handshake::Failed
            } else {
                match channel.handshake(true, true) {
                    Ok(HandshakeStatus::Complete) => {
                        // handshake I/O may have consumed a write readiness;
                        // the socket was just opened, so the first real event
                        // is always a read
                        event = SocketEvent::OpenRead;
                        Handshake::Complete
                    }
                    Ok(HandshakeStatus::NeedRead) => Handshake::NeedRead,
                    Ok(HandshakeStatus::NeedWrite) => Handshake::NeedWrite,
                    Err(e) => {
                        tracing::debug!(peer = %conn.peer_addr(), "handshake failed: {e}");
                        HANDSHAKES_FAILED.increment();
                        Handshake::Failed
                    }
                }
            }
        };

        match handshake {
            Handshake::Complete => {
                let budget = if event == SocketEvent::OpenRead {
                    conn.consume_keep_alive()
                } else {
                    i64::MAX
                };
                let state = shared.handler.process(&conn, event);
                let keep_alive_spent = state == SocketState::Open && budget <= 0;
                if state == SocketState::Closed || keep_alive_spent || event == SocketEvent::Error {
                    close_connection(shared, &conn);
                }
            }
            Handshake::Failed => close_connection(shared, &conn),
            Handshake::NeedRead => conn.register_read_interest(),
            Handshake::NeedWrite => conn.register_write_interest(),
        }

        self.reset();
        if shared.is_running() && !shared.is_paused() {
            shared.processor_cache.push(self);
        }
    }
}

/// Dispatch one event for one connection, through the worker pool when
/// `dispatch` is set, inline otherwise. Returns `false` when the submission
/// was rejected (pool shut down) — callers treat that as "close now".
pub(crate) fn process_socket(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    event: SocketEvent,
    dispatch: bool,
) -> bool {
    let mut processor = shared
        .processor_cache
        .pop()
        .unwrap_or_else(SocketProcessor::new);
    processor.set(conn.clone(), event);

    if dispatch {
        if let Some(executor) = shared.executor.get() {
            let shared = shared.clone();
            return executor.execute(Box::new(move || processor.run(&shared)));
        }
    }
    processor.run(shared);
    true
}
