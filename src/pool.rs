//! Bounded object caches.
//!
//! The endpoint recycles three kinds of objects that are expensive or noisy
//! to allocate per connection: channels (with their buffers), poller events,
//! and socket processors. Each cache is a bounded LIFO: `push` refuses
//! overflow so callers drop the object instead, `pop` returns `None` when
//! empty so callers construct a fresh one.

use parking_lot::Mutex;

/// Thread-safe bounded LIFO stack. No ordering guarantee across producers.
pub(crate) struct SyncStack<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> SyncStack<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity.min(128))),
            capacity,
        }
    }

    /// Push an item, returning `false` (and the caller keeps ownership
    /// implicitly dropped) when the stack is full.
    pub(crate) fn push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push(item);
        true
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let stack = SyncStack::new(4);
        assert!(stack.push(1));
        assert!(stack.push(2));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn bounded() {
        let stack = SyncStack::new(2);
        assert!(stack.push(1));
        assert!(stack.push(2));
        // overflow is refused, never queued
        assert!(!stack.push(3));
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn clear_empties() {
        let stack = SyncStack::new(4);
        stack.push("a");
        stack.push("b");
        stack.clear();
        assert_eq!(stack.len(), 0);
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn concurrent_push_pop_stays_bounded() {
        use std::sync::Arc;

        let stack = Arc::new(SyncStack::new(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    stack.push(i);
                    stack.pop();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(stack.len() <= 8);
    }
}
