//! The readiness loop.
//!
//! Each poller owns one selector and a dedicated thread. Per iteration it
//! drains its event queue (applying interest mutations requested by other
//! threads), selects, dispatches ready keys to the worker pool (or drives
//! sendfile inline), and enforces timeouts. Selector keys are mutated only
//! on this thread; everything else goes through the event queue.

use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::endpoint::Shared;
use crate::event::{EventOp, EventQueue, Ops, PollerEvent};
use crate::handler::SocketEvent;
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_TIMED_OUT, SENDFILE_COMPLETED};
use crate::processor::process_socket;
use crate::sendfile::SendfileKeepAlive;
use crate::wrapper::{Connection, NO_TOKEN, now_millis};

/// Token reserved for the queue waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// The face a poller shows to other threads: its event queue plus a cloned
/// registry for cross-thread deregistration on close.
pub(crate) struct PollerHandle {
    pub(crate) id: usize,
    pub(crate) queue: EventQueue,
    pub(crate) registry: mio::Registry,
    pub(crate) close: AtomicBool,
    pub(crate) key_count: AtomicUsize,
}

impl PollerHandle {
    /// Register a newly accepted connection: initial interest is READ, the
    /// wrapper becomes the key attachment when the event is applied.
    pub(crate) fn register(&self, shared: &Arc<Shared>, conn: &Arc<Connection>) {
        conn.set_interest(Ops::READ);
        let mut event = shared.event_cache.pop().unwrap_or_else(PollerEvent::new);
        event.set(conn.clone(), EventOp::Register);
        self.queue.push(event);
    }

    /// Request an interest-set addition for a connection owned by this
    /// poller.
    pub(crate) fn add(&self, shared: &Arc<Shared>, conn: &Arc<Connection>, ops: Ops) {
        let mut event = shared.event_cache.pop().unwrap_or_else(PollerEvent::new);
        event.set(conn.clone(), EventOp::AddInterest(ops));
        self.queue.push(event);
        if self.close.load(Ordering::Acquire) {
            process_socket(shared, conn, SocketEvent::Stop, false);
        }
    }

    /// Flag the poller for shutdown and wake its selector.
    pub(crate) fn destroy(&self) {
        self.close.store(true, Ordering::Release);
        self.queue.wake();
    }

    pub(crate) fn key_count(&self) -> usize {
        self.key_count.load(Ordering::Relaxed)
    }
}

struct KeyEntry {
    conn: Arc<Connection>,
    /// Whether the stream is currently registered with the selector. An
    /// empty interest set is realized by deregistering while the key entry
    /// stays alive.
    registered: bool,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    keys: Slab<KeyEntry>,
    handle: Arc<PollerHandle>,
    shared: Arc<Shared>,
    next_expiration: u64,
}

impl Poller {
    pub(crate) fn new(poll: Poll, handle: Arc<PollerHandle>, shared: Arc<Shared>) -> Self {
        Self {
            poll,
            events: Events::with_capacity(1024),
            keys: Slab::new(),
            handle,
            shared,
            next_expiration: 0,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let mut has_events = false;

            if !self.handle.close.load(Ordering::Acquire) {
                has_events = self.drain_events();

                // events arrived since the last drain: select must not block
                let timeout = if self.handle.queue.park() > 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(self.shared.config.selector_timeout_ms)
                };
                match self.poll.poll(&mut self.events, Some(timeout)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::error!(poller = self.handle.id, "select failed: {e}");
                    }
                }
                self.handle.queue.unpark();
            }

            if self.handle.close.load(Ordering::Acquire) {
                self.drain_events();
                // force every remaining key through the cleanup path
                self.scan_timeouts(0, false);
                self.shared.stop_latch.count_down();
                return;
            }

            let ready: Vec<(usize, Ops)> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| {
                    let mut ops = Ops::NONE;
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        ops = ops.union(Ops::READ);
                    }
                    if event.is_writable() || event.is_write_closed() {
                        ops = ops.union(Ops::WRITE);
                    }
                    (event.token().0, ops)
                })
                .collect();

            // woke up with nothing selected: new events may be pending
            if ready.is_empty() {
                has_events |= self.drain_events();
            }

            for &(token, ops) in &ready {
                self.process_key(token, ops);
            }

            self.scan_timeouts(ready.len(), has_events);
        }
    }

    /// Apply queued interest mutations. The drain is bounded by the queue
    /// length observed on entry.
    fn drain_events(&mut self) -> bool {
        let mut result = false;
        for _ in 0..self.handle.queue.len() {
            let Some(mut event) = self.handle.queue.try_pop() else {
                break;
            };
            result = true;
            if let Some((conn, op)) = event.take() {
                match op {
                    EventOp::Register => self.apply_register(conn),
                    EventOp::AddInterest(ops) => self.apply_add_interest(conn, ops),
                }
            }
            event.reset();
            if self.shared.is_running() && !self.shared.is_paused() {
                self.shared.event_cache.push(event);
            }
        }
        result
    }

    fn apply_register(&mut self, conn: Arc<Connection>) {
        let token = self.keys.insert(KeyEntry {
            conn: conn.clone(),
            registered: false,
        });
        conn.set_token(token);
        self.publish_key_count();
        if let Err(e) = self.apply_interest(token, &conn, Ops::READ) {
            tracing::error!(poller = self.handle.id, "socket registration failed: {e}");
            self.cancel_and_remove(token, &conn);
        }
    }

    fn apply_add_interest(&mut self, conn: Arc<Connection>, mask: Ops) {
        let token = conn.token();
        let entry_matches = token != NO_TOKEN
            && self
                .keys
                .get(token)
                .map(|entry| Arc::ptr_eq(&entry.conn, &conn))
                .unwrap_or(false);
        if !entry_matches {
            // the key was cancelled (socket closed) between enqueue and
            // apply; account for the connection here since the close path
            // could not
            if conn.detach() {
                self.shared.limiter.release();
                CONNECTIONS_ACTIVE.decrement();
            }
            conn.set_closed();
            return;
        }
        if conn.is_detached() {
            self.remove_key(token, &conn);
            return;
        }
        let ops = conn.interest_ops().union(mask);
        if self.apply_interest(token, &conn, ops).is_err() {
            self.cancel_and_remove(token, &conn);
        }
    }

    /// Set the selector interest for a key and mirror it on the wrapper.
    fn apply_interest(&mut self, token: usize, conn: &Arc<Connection>, ops: Ops) -> io::Result<()> {
        let Some(entry) = self.keys.get_mut(token) else {
            return Ok(());
        };
        let mut channel = conn.channel.lock();
        let Some(stream) = channel.stream_mut() else {
            conn.set_interest(Ops::NONE);
            return Ok(());
        };
        if ops.is_empty() {
            if entry.registered {
                self.poll.registry().deregister(stream)?;
                entry.registered = false;
            }
        } else {
            let interest = to_interest(ops);
            if entry.registered {
                self.poll.registry().reregister(stream, Token(token), interest)?;
            } else {
                self.poll.registry().register(stream, Token(token), interest)?;
                entry.registered = true;
            }
        }
        conn.set_interest(ops);
        Ok(())
    }

    fn process_key(&mut self, token: usize, ready: Ops) {
        let Some(entry) = self.keys.get(token) else {
            return;
        };
        let conn = entry.conn.clone();
        if conn.is_detached() {
            self.remove_key(token, &conn);
            return;
        }
        if self.handle.close.load(Ordering::Acquire) {
            self.cancel_and_remove(token, &conn);
            return;
        }
        if ready.is_empty() {
            return;
        }

        // clear the ready bits so no second thread is dispatched for the
        // same readiness while a worker holds the socket
        let remaining = conn.interest_ops().difference(ready);
        if self.apply_interest(token, &conn, remaining).is_err() {
            self.cancel_and_remove(token, &conn);
            return;
        }

        if conn.has_sendfile() {
            self.process_sendfile(token, &conn);
            return;
        }

        let mut close_socket = false;
        if ready.contains(Ops::READ)
            && !process_socket(&self.shared, &conn, SocketEvent::OpenRead, true)
        {
            close_socket = true;
        }
        if !close_socket
            && ready.contains(Ops::WRITE)
            && !process_socket(&self.shared, &conn, SocketEvent::OpenWrite, true)
        {
            close_socket = true;
        }
        if close_socket {
            self.cancel_and_remove(token, &conn);
        }
    }

    /// Drive a sendfile transfer inline on the poller thread.
    fn process_sendfile(&mut self, token: usize, conn: &Arc<Connection>) {
        match sendfile_transfer(conn) {
            Ok(SendfileProgress::Done(keep_alive)) => match keep_alive {
                SendfileKeepAlive::None => {
                    close_connection(&self.shared, conn);
                    self.remove_key(token, conn);
                }
                SendfileKeepAlive::Pipelined => {
                    if !process_socket(&self.shared, conn, SocketEvent::OpenRead, true) {
                        self.cancel_and_remove(token, conn);
                    }
                }
                SendfileKeepAlive::Open => {
                    if self.apply_interest(token, conn, Ops::READ).is_err() {
                        self.cancel_and_remove(token, conn);
                    }
                }
            },
            Ok(SendfileProgress::Pending) => {
                if self.apply_interest(token, conn, Ops::WRITE).is_err() {
                    self.cancel_and_remove(token, conn);
                }
            }
            Err(e) => {
                tracing::debug!(peer = %conn.peer_addr(), "sendfile failed: {e}");
                self.cancel_and_remove(token, conn);
            }
        }
    }

    /// Timeout pass. Skipped while the expiration horizon has not passed and
    /// the selector is seeing traffic; always runs on shutdown.
    fn scan_timeouts(&mut self, ready_count: usize, has_events: bool) {
        let now = now_millis();
        let close = self.handle.close.load(Ordering::Acquire);
        if self.next_expiration > 0
            && (ready_count > 0 || has_events)
            && now < self.next_expiration
            && !close
        {
            return;
        }

        let tokens: Vec<usize> = self.keys.iter().map(|(token, _)| token).collect();
        for token in tokens {
            let Some(entry) = self.keys.get(token) else {
                continue;
            };
            let conn = entry.conn.clone();
            if conn.is_detached() {
                self.remove_key(token, &conn);
                continue;
            }
            if close {
                let _ = self.apply_interest(token, &conn, Ops::NONE);
                self.cancel_and_remove(token, &conn);
                continue;
            }

            let interest = conn.interest_ops();
            let mut timed_out = false;
            if interest.contains(Ops::READ) {
                let timeout = conn.read_timeout_ms();
                timed_out = timeout > 0 && now.saturating_sub(conn.last_read()) > timeout;
            }
            if !timed_out && interest.contains(Ops::WRITE) {
                let timeout = conn.write_timeout_ms();
                timed_out = timeout > 0 && now.saturating_sub(conn.last_write()) > timeout;
            }
            if timed_out {
                // zero the interest first so the timeout fires once
                if self.apply_interest(token, &conn, Ops::NONE).is_err() {
                    self.cancel_and_remove(token, &conn);
                    continue;
                }
                conn.set_error(io::Error::new(io::ErrorKind::TimedOut, "socket timeout"));
                CONNECTIONS_TIMED_OUT.increment();
                if !process_socket(&self.shared, &conn, SocketEvent::Error, true) {
                    self.cancel_and_remove(token, &conn);
                }
            }
        }

        self.next_expiration = now_millis() + self.shared.config.socket.timeout_interval_ms;
    }

    fn remove_key(&mut self, token: usize, conn: &Arc<Connection>) {
        let matches = self
            .keys
            .get(token)
            .map(|entry| Arc::ptr_eq(&entry.conn, conn))
            .unwrap_or(false);
        if matches {
            self.keys.remove(token);
            self.publish_key_count();
        }
    }

    fn cancel_and_remove(&mut self, token: usize, conn: &Arc<Connection>) {
        cancelled_key(&self.shared, conn);
        self.remove_key(token, conn);
    }

    fn publish_key_count(&self) {
        self.handle.key_count.store(self.keys.len(), Ordering::Relaxed);
    }
}

fn to_interest(ops: Ops) -> Interest {
    match (ops.contains(Ops::READ), ops.contains(Ops::WRITE)) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // callers never pass an empty set here
        _ => Interest::READABLE,
    }
}

/// Tear down a connection's key. Safe to call from any thread and any number
/// of times; the attachment swap makes exactly one caller responsible for
/// cleanup and the single latch decrement. Returns whether this call did the
/// teardown.
pub(crate) fn cancelled_key(shared: &Arc<Shared>, conn: &Arc<Connection>) -> bool {
    if !conn.detach() {
        return false;
    }
    // let the protocol handler drop any in-flight processor state
    shared.handler.release(conn);

    // the file descriptor closes before the socket so a half-finished
    // transfer cannot outlive the connection
    *conn.sendfile_lock() = None;

    {
        let mut channel = conn.channel.lock();
        if let Some(stream) = channel.stream_mut() {
            if let Err(e) = conn.poller().registry.deregister(stream) {
                tracing::debug!("deregister on close failed: {e}");
            }
        }
        // TLS first: clean shutdown, then the raw socket
        channel.close();
    }

    shared.limiter.release();
    CONNECTIONS_ACTIVE.decrement();
    conn.set_closed();
    true
}

/// Close a connection and recycle its channel into the cache. This is the
/// handler-driven close path; error paths go straight to [`cancelled_key`].
pub(crate) fn close_connection(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    if cancelled_key(shared, conn) {
        tracing::debug!(peer = %conn.peer_addr(), "connection closed");
        if shared.is_running() && !shared.is_paused() {
            shared.channel_cache.push(conn.take_channel());
        }
    }
}

pub(crate) enum SendfileProgress {
    Done(SendfileKeepAlive),
    Pending,
}

/// Advance an attached sendfile transfer one step: flush buffered outbound
/// bytes first, then move file bytes. Plain channels use zero-copy
/// `sendfile(2)`; secure channels go through the TLS session.
pub(crate) fn sendfile_transfer(conn: &Connection) -> io::Result<SendfileProgress> {
    let mut slot = conn.sendfile_lock();
    let Some(data) = slot.as_mut() else {
        // cleared by a concurrent close; nothing left to drive
        return Ok(SendfileProgress::Done(SendfileKeepAlive::None));
    };

    let mut channel = conn.channel.lock();
    if data.file.is_none() {
        data.file = Some(File::open(&data.path)?);
    }
    let file = data.file.as_ref().unwrap();

    if channel.outbound_remaining() > 0 {
        if channel.flush_outbound()? {
            conn.update_last_write();
        }
    } else if data.remaining > 0 {
        if channel.is_secure() {
            let mut chunk = [0u8; 8192];
            let want = data.remaining.min(chunk.len() as u64) as usize;
            let n = file.read_at(&mut chunk[..want], data.pos)?;
            if n == 0 {
                return Err(io::Error::other("file ended before sendfile completed"));
            }
            match channel.write(&chunk[..n]) {
                Ok(written) => {
                    data.pos += written as u64;
                    data.remaining -= written as u64;
                    conn.update_last_write();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        } else {
            let sock = channel
                .raw_fd()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            let mut offset = data.pos as libc::off_t;
            let count = data.remaining.min(0x7fff_f000) as usize;
            let sent = unsafe { libc::sendfile(sock, file.as_raw_fd(), &mut offset, count) };
            if sent < 0 {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    return Err(e);
                }
            } else if sent == 0 {
                if file.metadata()?.len() <= data.pos {
                    return Err(io::Error::other("sendfile configured past end of file"));
                }
            } else {
                data.pos += sent as u64;
                data.remaining -= sent as u64;
                conn.update_last_write();
            }
        }
    }

    let done = data.remaining == 0 && channel.outbound_remaining() == 0;
    if done {
        let keep_alive = data.keep_alive;
        drop(channel);
        *slot = None;
        SENDFILE_COMPLETED.increment();
        return Ok(SendfileProgress::Done(keep_alive));
    }
    Ok(SendfileProgress::Pending)
}
