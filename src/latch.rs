//! Connection counting and shutdown latches.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Counting gate bounding concurrent established connections.
///
/// The acceptor calls `acquire` before `accept`, blocking while the endpoint
/// is at capacity; every close path calls `release` exactly once. A maximum
/// of -1 turns `acquire` into a no-op counter bump.
pub(crate) struct ConnectionLimiter {
    max: AtomicI64,
    count: Mutex<i64>,
    available: Condvar,
    /// Set when the endpoint stops: waiters proceed unconditionally so the
    /// acceptor can observe the running flag and exit.
    released: AtomicBool,
}

impl ConnectionLimiter {
    pub(crate) fn new(max: i64) -> Self {
        Self {
            max: AtomicI64::new(max),
            count: Mutex::new(0),
            available: Condvar::new(),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock();
        loop {
            let max = self.max.load(Ordering::Relaxed);
            if max < 0 || *count < max || self.released.load(Ordering::Acquire) {
                *count += 1;
                return;
            }
            self.available.wait(&mut count);
        }
    }

    pub(crate) fn release(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        self.available.notify_one();
    }

    pub(crate) fn count(&self) -> i64 {
        *self.count.lock()
    }

    pub(crate) fn set_max(&self, max: i64) {
        self.max.store(max, Ordering::Relaxed);
        self.available.notify_all();
    }

    /// Open the gate permanently. Used by `stop` before unblocking the
    /// acceptor so no thread stays parked on a dead endpoint.
    pub(crate) fn release_all(&self) {
        self.released.store(true, Ordering::Release);
        let _count = self.count.lock();
        self.available.notify_all();
    }
}

/// Countdown latch sized to the poller count; `stop` waits on it so poller
/// threads get a bounded window to drain and close their selectors.
pub(crate) struct StopLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl StopLatch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.zero.notify_all();
            }
        }
    }

    /// Wait until the latch reaches zero. Returns `false` on timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return true;
        }
        self.zero.wait_for(&mut remaining, timeout);
        *remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn limiter_counts_acquire_release() {
        let limiter = ConnectionLimiter::new(4);
        limiter.acquire();
        limiter.acquire();
        assert_eq!(limiter.count(), 2);
        limiter.release();
        assert_eq!(limiter.count(), 1);
        limiter.release();
        assert_eq!(limiter.count(), 0);
    }

    #[test]
    fn limiter_blocks_at_capacity() {
        let limiter = Arc::new(ConnectionLimiter::new(1));
        limiter.acquire();

        let other = limiter.clone();
        let waiter = thread::spawn(move || {
            other.acquire();
            other.count()
        });

        // give the waiter time to park
        thread::sleep(Duration::from_millis(50));
        limiter.release();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn limiter_unbounded() {
        let limiter = ConnectionLimiter::new(-1);
        for _ in 0..100 {
            limiter.acquire();
        }
        assert_eq!(limiter.count(), 100);
    }

    #[test]
    fn limiter_release_all_unblocks_waiters() {
        let limiter = Arc::new(ConnectionLimiter::new(1));
        limiter.acquire();

        let other = limiter.clone();
        let waiter = thread::spawn(move || other.acquire());

        thread::sleep(Duration::from_millis(50));
        limiter.release_all();
        waiter.join().unwrap();
    }

    #[test]
    fn stop_latch_reaches_zero() {
        let latch = Arc::new(StopLatch::new(2));
        let l1 = latch.clone();
        let l2 = latch.clone();
        thread::spawn(move || l1.count_down());
        thread::spawn(move || l2.count_down());
        assert!(latch.wait(Duration::from_secs(1)));
    }

    #[test]
    fn stop_latch_times_out() {
        let latch = StopLatch::new(1);
        assert!(!latch.wait(Duration::from_millis(20)));
    }
}
