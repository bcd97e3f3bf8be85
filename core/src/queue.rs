//! Bounded single-producer/single-consumer ring queues
//!
//! A queue is created as a split pair. Neither half is `Clone`, so the task
//! holding the `Producer` is the only writer and the task holding the
//! `Consumer` is the only reader. Capacity is fixed at construction.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct Ring<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

/// Create a queue holding at most `capacity` items
pub fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let ring = Arc::new(Ring {
        items: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// Writing half of a ring queue
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Append an item; hands it back if the queue is full
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.ring.items.lock();
        if items.len() >= self.ring.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.ring.items.lock().len() >= self.ring.capacity
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }
}

/// Reading half of a ring queue
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Remove the oldest item
    pub fn pop(&self) -> Option<T> {
        self.ring.items.lock().pop_front()
    }

    /// Inspect the oldest item without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.ring.items.lock().front().map(f)
    }

    pub fn len(&self) -> usize {
        self.ring.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.items.lock().is_empty()
    }

    /// Discard everything queued
    pub fn clear(&self) {
        self.ring.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = ring(3);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.push(3).unwrap();

        assert_eq!(rx.peek_with(|v| *v), Some(1));
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_full_rejects_and_returns_item() {
        let (tx, rx) = ring(2);
        tx.push("a").unwrap();
        tx.push("b").unwrap();
        assert!(tx.is_full());
        assert_eq!(tx.push("c"), Err("c"));

        rx.pop();
        assert!(!tx.is_full());
        assert!(tx.push("c").is_ok());
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_clear() {
        let (tx, rx) = ring(4);
        tx.push(7u8).unwrap();
        tx.push(8u8).unwrap();
        rx.clear();
        assert!(rx.is_empty());
        assert_eq!(tx.capacity(), 4);
    }
}
