//! Cross-thread interest mutations.
//!
//! Selector keys are owned by their poller thread; every other thread asks
//! for interest changes by enqueuing an event here. The wake counter decides
//! whether the poller needs an explicit wakeup: the producer increments it,
//! and the transition out of the parked value (-1, set by the poller right
//! before a blocking select) fires the waker.

use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::wrapper::Connection;

/// Interest bitmask over read/write readiness.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(1);
    pub const WRITE: Ops = Ops(2);

    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn union(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> Ops {
        Ops(bits & 0b11)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Ops::READ), self.contains(Ops::WRITE)) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventOp {
    /// Attach the wrapper to the selector with initial interest READ.
    Register,
    /// OR the mask into the key's existing interest set.
    AddInterest(Ops),
}

/// Pooled record of a pending interest mutation. Reset between uses so the
/// cache holds no connection references.
pub(crate) struct PollerEvent {
    conn: Option<Arc<Connection>>,
    op: EventOp,
}

impl PollerEvent {
    pub(crate) fn new() -> Self {
        Self {
            conn: None,
            op: EventOp::Register,
        }
    }

    pub(crate) fn set(&mut self, conn: Arc<Connection>, op: EventOp) {
        self.conn = Some(conn);
        self.op = op;
    }

    pub(crate) fn take(&mut self) -> Option<(Arc<Connection>, EventOp)> {
        self.conn.take().map(|conn| (conn, self.op))
    }

    pub(crate) fn reset(&mut self) {
        self.conn = None;
        self.op = EventOp::Register;
    }
}

/// Unbounded MPSC queue between event producers and one poller.
pub(crate) struct EventQueue {
    tx: Sender<PollerEvent>,
    rx: Receiver<PollerEvent>,
    wake_counter: AtomicI64,
    waker: mio::Waker,
}

impl EventQueue {
    pub(crate) fn new(waker: mio::Waker) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            wake_counter: AtomicI64::new(0),
            waker,
        }
    }

    /// Enqueue an event, waking the poller if it is parked in a blocking
    /// select.
    pub(crate) fn push(&self, event: PollerEvent) {
        let _ = self.tx.send(event);
        if self.wake_counter.fetch_add(1, Ordering::AcqRel) == -1 {
            let _ = self.waker.wake();
        }
    }

    pub(crate) fn try_pop(&self) -> Option<PollerEvent> {
        self.rx.try_recv().ok()
    }

    /// Snapshot of how many events are queued. Drains are bounded by this so
    /// a flood of producers cannot starve selection.
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    /// Wake the owning poller regardless of counter state.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// Park the counter at -1. The previous value tells the poller whether
    /// events arrived since the last drain (> 0 means select must not block).
    pub(crate) fn park(&self) -> i64 {
        self.wake_counter.swap(-1, Ordering::AcqRel)
    }

    /// Leave the parked state after selection.
    pub(crate) fn unpark(&self) {
        self.wake_counter.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    const WAKE: Token = Token(usize::MAX);

    fn queue_with_poll() -> (EventQueue, Poll, Events) {
        let poll = Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), WAKE).unwrap();
        (EventQueue::new(waker), poll, Events::with_capacity(8))
    }

    #[test]
    fn fifo_order() {
        let (queue, _poll, _events) = queue_with_poll();

        let mut e1 = PollerEvent::new();
        e1.op = EventOp::AddInterest(Ops::READ);
        let mut e2 = PollerEvent::new();
        e2.op = EventOp::AddInterest(Ops::WRITE);

        queue.push(e1);
        queue.push(e2);

        assert_eq!(queue.try_pop().unwrap().op, EventOp::AddInterest(Ops::READ));
        assert_eq!(
            queue.try_pop().unwrap().op,
            EventOp::AddInterest(Ops::WRITE)
        );
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn push_wakes_parked_poller() {
        let (queue, mut poll, mut events) = queue_with_poll();

        assert_eq!(queue.park(), 0);
        queue.push(PollerEvent::new());

        // the waker fired, so a blocking select returns promptly
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        let woke = events.iter().any(|e| e.token() == WAKE);
        assert!(woke);
        queue.unpark();
    }

    #[test]
    fn park_reports_pending_pushes() {
        let (queue, _poll, _events) = queue_with_poll();

        queue.push(PollerEvent::new());
        queue.push(PollerEvent::new());
        // two pushes since the last drain: select must not block
        assert_eq!(queue.park(), 2);
        queue.unpark();
    }

    #[test]
    fn ops_mask() {
        let rw = Ops::READ.union(Ops::WRITE);
        assert!(rw.contains(Ops::READ));
        assert!(rw.contains(Ops::WRITE));
        assert!(!Ops::READ.contains(Ops::WRITE));
        assert!(rw.difference(Ops::READ).contains(Ops::WRITE));
        assert!(Ops::NONE.is_empty());
        assert!(!Ops::NONE.contains(Ops::NONE));
    }
}
