//! Ring Buffer Implementation

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default buffer capacity
pub const DEFAULT_CAPACITY: usize = 200;

/// Bounded buffer; pushing past capacity evicts the oldest entry
pub struct RingBuffer<T> {
    storage: RwLock<VecDeque<T>>,
    capacity: usize,
    /// Total entries ever pushed (for statistics)
    total_written: AtomicUsize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a new ring buffer holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            storage: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            total_written: AtomicUsize::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Append an entry, returning the evicted one if the buffer was full
    pub fn push(&self, item: T) -> Option<T> {
        let mut storage = self.storage.write();
        let evicted = if storage.len() == self.capacity {
            storage.pop_front()
        } else {
            None
        };
        storage.push_back(item);
        self.total_written.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn len(&self) -> usize {
        self.storage.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// The last `count` entries, oldest first
    pub fn read_last(&self, count: usize) -> Vec<T> {
        let storage = self.storage.read();
        let skip = storage.len().saturating_sub(count);
        storage.iter().skip(skip).cloned().collect()
    }

    /// Copy of every entry, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.storage.read().iter().cloned().collect()
    }

    /// Copy of the entries matching `predicate`, oldest first
    pub fn filter<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.storage
            .read()
            .iter()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<T> {
        self.storage.read().back().cloned()
    }

    pub fn total_written(&self) -> usize {
        self.total_written.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.storage.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_and_read() {
        let buffer = RingBuffer::new(10);
        for i in 0..5 {
            buffer.push(i * 100);
        }

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.read_last(3), vec![200, 300, 400]);
        assert_eq!(buffer.last(), Some(400));
    }

    #[test]
    fn test_overwrite_oldest() {
        let buffer = RingBuffer::new(5);
        let evicted: Vec<_> = (0..8).filter_map(|i| buffer.push(i)).collect();

        assert_eq!(evicted, vec![0, 1, 2]);
        assert!(buffer.is_full());
        assert_eq!(buffer.snapshot(), vec![3, 4, 5, 6, 7]);
        assert_eq!(buffer.total_written(), 8);
    }

    #[test]
    fn test_fill_ratio_and_clear() {
        let buffer = RingBuffer::new(100);
        assert_eq!(buffer.fill_ratio(), 0.0);
        for i in 0..50 {
            buffer.push(i);
        }
        assert!((buffer.fill_ratio() - 0.5).abs() < 0.01);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_written(), 50);
    }

    proptest! {
        #[test]
        fn prop_keeps_newest_entries(capacity in 1usize..50, count in 0usize..200) {
            let buffer = RingBuffer::new(capacity);
            for i in 0..count {
                buffer.push(i);
            }
            let expected: Vec<usize> = (count.saturating_sub(capacity)..count).collect();
            prop_assert_eq!(buffer.snapshot(), expected);
        }
    }
}
