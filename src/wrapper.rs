//! Per-connection state shared between the owning poller and worker threads.

use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use crate::channel::Channel;
use crate::endpoint::Shared;
use crate::event::Ops;
use crate::poller::PollerHandle;
use crate::sendfile::{SendfileData, SendfileState};

/// Sentinel for "not registered on a selector yet".
pub(crate) const NO_TOKEN: usize = usize::MAX;

/// Milliseconds on a process-local monotonic clock.
pub(crate) fn now_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Wrapper around one accepted connection.
///
/// Bound to exactly one poller from registration until close. The interest
/// set mirrors the selector's interest for the connection's key and is only
/// mutated by the owning poller; other threads request changes through the
/// poller's event queue. The attachment flag is the idempotency guard for
/// teardown: whichever thread detaches it runs cleanup and performs the
/// single connection-latch decrement.
pub struct Connection {
    pub(crate) channel: Mutex<Channel>,
    shared: Arc<Shared>,
    poller: Arc<PollerHandle>,
    /// Self-reference for enqueuing this wrapper on the poller's queue.
    me: Weak<Connection>,
    peer: SocketAddr,
    secure: bool,
    token: AtomicUsize,
    interest: AtomicU8,
    attached: AtomicBool,
    closed: AtomicBool,
    last_read: AtomicU64,
    last_write: AtomicU64,
    read_timeout: AtomicU64,
    write_timeout: AtomicU64,
    keep_alive_left: AtomicI64,
    error: Mutex<Option<io::Error>>,
    sendfile: Mutex<Option<SendfileData>>,
}

impl Connection {
    pub(crate) fn create(
        channel: Channel,
        shared: Arc<Shared>,
        poller: Arc<PollerHandle>,
        peer: SocketAddr,
        secure: bool,
    ) -> Arc<Self> {
        let now = now_millis();
        let so_timeout = shared.config.socket.so_timeout_ms;
        let keep_alive = shared.config.max_keep_alive_requests;
        Arc::new_cyclic(|me| Self {
            channel: Mutex::new(channel),
            shared,
            poller,
            me: me.clone(),
            peer,
            secure,
            token: AtomicUsize::new(NO_TOKEN),
            interest: AtomicU8::new(Ops::NONE.bits()),
            attached: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            read_timeout: AtomicU64::new(so_timeout),
            write_timeout: AtomicU64::new(so_timeout),
            keep_alive_left: AtomicI64::new(keep_alive),
            error: Mutex::new(None),
            sendfile: Mutex::new(None),
        })
    }

    // --- handler-facing I/O ---

    /// Non-blocking read. `Ok(0)` is end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.channel.lock().read(buf)?;
        self.update_last_read();
        Ok(n)
    }

    /// Non-blocking write; returns bytes accepted into the channel.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let n = self.channel.lock().write(data)?;
        self.update_last_write();
        Ok(n)
    }

    /// Drain buffered outbound bytes; `true` once everything is on the wire.
    pub fn flush_outbound(&self) -> io::Result<bool> {
        self.channel.lock().flush_outbound()
    }

    /// Blocking read for handler code that needs to wait for a body without
    /// involving the poller: waits for readiness on a borrowed helper
    /// selector, bounded by the connection's read timeout.
    pub fn read_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.read_timeout.load(Ordering::Relaxed);
        loop {
            match self.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(Ops::READ, timeout)?;
                }
                other => return other,
            }
        }
    }

    /// Blocking write of the whole buffer, bounded by the write timeout.
    pub fn write_blocking(&self, data: &[u8]) -> io::Result<()> {
        let timeout = self.write_timeout.load(Ordering::Relaxed);
        let mut written = 0;
        while written < data.len() {
            let result = self.channel.lock().write(&data[written..]);
            match result {
                Ok(n) => {
                    written += n;
                    self.update_last_write();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(Ops::WRITE, timeout)?;
                }
                Err(e) => return Err(e),
            }
        }
        loop {
            if self.channel.lock().flush_outbound()? {
                return Ok(());
            }
            self.wait_ready(Ops::WRITE, timeout)?;
        }
    }

    fn wait_ready(&self, ops: Ops, timeout_ms: u64) -> io::Result<()> {
        let fd = self
            .channel
            .lock()
            .raw_fd()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if self.shared.selectors.block_on_ready(fd, ops, timeout_ms)? {
            Ok(())
        } else {
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    // --- interest registration ---

    /// Ask the owning poller to add read interest for this connection.
    pub fn register_read_interest(&self) {
        if let Some(me) = self.me.upgrade() {
            self.poller.add(&self.shared, &me, Ops::READ);
        }
    }

    /// Ask the owning poller to add write interest for this connection.
    pub fn register_write_interest(&self) {
        if let Some(me) = self.me.upgrade() {
            self.poller.add(&self.shared, &me, Ops::WRITE);
        }
    }

    // --- sendfile ---

    /// Attach a sendfile transfer and drive the first step on the calling
    /// worker thread. On `Done` the caller re-registers interest itself; on
    /// `Pending` the poller takes over via write readiness.
    pub fn start_sendfile(&self, data: SendfileData) -> SendfileState {
        *self.sendfile.lock() = Some(data);
        match crate::poller::sendfile_transfer(self) {
            Ok(crate::poller::SendfileProgress::Done(_)) => SendfileState::Done,
            Ok(crate::poller::SendfileProgress::Pending) => {
                self.register_write_interest();
                SendfileState::Pending
            }
            Err(e) => {
                tracing::debug!(peer = %self.peer, "sendfile failed: {e}");
                SendfileState::Error
            }
        }
    }

    pub(crate) fn has_sendfile(&self) -> bool {
        self.sendfile.lock().is_some()
    }

    pub(crate) fn sendfile_lock(&self) -> MutexGuard<'_, Option<SendfileData>> {
        self.sendfile.lock()
    }

    // --- observability ---

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the deferred error recorded on this connection (set before an
    /// `Error` event is dispatched).
    pub fn take_error(&self) -> Option<io::Error> {
        self.error.lock().take()
    }

    pub fn keep_alive_remaining(&self) -> i64 {
        self.keep_alive_left.load(Ordering::Relaxed)
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout.load(Ordering::Relaxed)
    }

    pub fn set_read_timeout_ms(&self, timeout: u64) {
        self.read_timeout.store(timeout, Ordering::Relaxed);
    }

    pub fn write_timeout_ms(&self) -> u64 {
        self.write_timeout.load(Ordering::Relaxed)
    }

    pub fn set_write_timeout_ms(&self, timeout: u64) {
        self.write_timeout.store(timeout, Ordering::Relaxed);
    }

    // --- crate internals ---

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn poller(&self) -> &Arc<PollerHandle> {
        &self.poller
    }

    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.token.store(token, Ordering::Release);
    }

    pub(crate) fn interest_ops(&self) -> Ops {
        Ops::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn set_interest(&self, ops: Ops) {
        self.interest.store(ops.bits(), Ordering::Release);
    }

    /// Detach the wrapper from its key. Returns `true` for exactly one
    /// caller; that caller owns teardown and the latch decrement.
    pub(crate) fn detach(&self) -> bool {
        self.attached.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_detached(&self) -> bool {
        !self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn update_last_read(&self) {
        self.last_read.fetch_max(now_millis(), Ordering::AcqRel);
    }

    pub(crate) fn update_last_write(&self) {
        self.last_write.fetch_max(now_millis(), Ordering::AcqRel);
    }

    pub(crate) fn last_read(&self) -> u64 {
        self.last_read.load(Ordering::Relaxed)
    }

    pub(crate) fn last_write(&self) -> u64 {
        self.last_write.load(Ordering::Relaxed)
    }

    pub(crate) fn set_error(&self, error: io::Error) {
        *self.error.lock() = Some(error);
    }

    /// Consume one unit of the keep-alive budget; returns what is left.
    /// Unlimited budgets (configured as -1) never run out.
    pub(crate) fn consume_keep_alive(&self) -> i64 {
        if self.shared.config.max_keep_alive_requests < 0 {
            return i64::MAX;
        }
        (self.keep_alive_left.fetch_sub(1, Ordering::AcqRel) - 1).max(0)
    }

    /// Swap the channel out for recycling after close.
    pub(crate) fn take_channel(&self) -> Channel {
        std::mem::replace(&mut *self.channel.lock(), Channel::shell())
    }
}
