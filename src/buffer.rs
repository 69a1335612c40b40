//! Thread-safe append-mostly sequence with snapshot iteration.
//!
//! [`ConcurrentBuffer`] accumulates per-iteration results while workers are
//! still appending. Mutations hold the write lock for a single operation;
//! reads hold the read lock. Iteration never holds a lock: `snapshot` and
//! `tail` clone the live contents under the read lock and hand back an owned
//! `Vec`, so a walk cannot be invalidated by concurrent removal. Appends that
//! race a snapshot may or may not be visible to it.

use std::sync::RwLock;

/// An indexable sequence safe under arbitrary concurrent callers.
#[derive(Debug, Default)]
pub struct ConcurrentBuffer<T> {
    items: RwLock<Vec<T>>,
}

impl<T: Clone> ConcurrentBuffer<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Appends an item at the end.
    pub fn push(&self, item: T) {
        self.items.write().unwrap().push(item);
    }

    /// Returns a clone of the item at `index`, if present.
    pub fn get(&self, index: usize) -> Option<T> {
        self.items.read().unwrap().get(index).cloned()
    }

    /// Replaces the item at `index`. Returns false when out of bounds.
    pub fn set(&self, index: usize, item: T) -> bool {
        let mut items = self.items.write().unwrap();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    /// Removes and returns the item at `index`, if present.
    pub fn remove(&self, index: usize) -> Option<T> {
        let mut items = self.items.write().unwrap();
        if index < items.len() {
            Some(items.remove(index))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.items.write().unwrap().clear();
    }

    /// An owned copy of the whole sequence.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().unwrap().clone()
    }

    /// An owned copy of the last `n` items (or all, when fewer are held).
    pub fn tail(&self, n: usize) -> Vec<T> {
        let items = self.items.read().unwrap();
        let start = items.len().saturating_sub(n);
        items[start..].to_vec()
    }

    /// Consumes the buffer, returning its contents.
    pub fn into_vec(self) -> Vec<T> {
        self.items.into_inner().unwrap()
    }
}

impl<T: Clone + PartialEq> ConcurrentBuffer<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.read().unwrap().contains(item)
    }
}

impl<T: Clone> FromIterator<T> for ConcurrentBuffer<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: RwLock::new(iter.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_get_len() {
        let buffer = ConcurrentBuffer::new();
        assert!(buffer.is_empty());

        buffer.push(1);
        buffer.push(2);
        buffer.push(3);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.get(0), Some(1));
        assert_eq!(buffer.get(2), Some(3));
        assert_eq!(buffer.get(3), None);
    }

    #[test]
    fn set_and_remove() {
        let buffer: ConcurrentBuffer<i32> = [10, 20, 30].into_iter().collect();

        assert!(buffer.set(1, 25));
        assert!(!buffer.set(9, 99));
        assert_eq!(buffer.get(1), Some(25));

        assert_eq!(buffer.remove(0), Some(10));
        assert_eq!(buffer.remove(5), None);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(0), Some(25));
    }

    #[test]
    fn contains_and_clear() {
        let buffer: ConcurrentBuffer<&str> = ["a", "b"].into_iter().collect();
        assert!(buffer.contains(&"a"));
        assert!(!buffer.contains(&"z"));

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.contains(&"a"));
    }

    #[test]
    fn tail_returns_most_recent() {
        let buffer: ConcurrentBuffer<i32> = (0..10).collect();
        assert_eq!(buffer.tail(3), vec![7, 8, 9]);
        assert_eq!(buffer.tail(100).len(), 10);
        assert_eq!(buffer.tail(0), Vec::<i32>::new());
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        const WORKERS: usize = 8;
        const PER_WORKER: usize = 500;

        let buffer = Arc::new(ConcurrentBuffer::new());
        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..PER_WORKER {
                        buffer.push(w * PER_WORKER + i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.len(), WORKERS * PER_WORKER);

        // Every pushed value is present exactly once.
        let mut items = buffer.snapshot();
        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), WORKERS * PER_WORKER);
    }

    #[test]
    fn snapshot_survives_concurrent_mutation() {
        let buffer: Arc<ConcurrentBuffer<i32>> = Arc::new((0..100).collect());

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 100..200 {
                    buffer.push(i);
                    buffer.remove(0);
                }
            })
        };

        // Walk snapshots while the writer churns; every observed snapshot is
        // internally consistent regardless of interleaving.
        for _ in 0..50 {
            let snapshot = buffer.snapshot();
            for window in snapshot.windows(2) {
                assert!(window[0] < window[1]);
            }
        }

        writer.join().unwrap();
        assert_eq!(buffer.len(), 100);
    }

    #[test]
    fn into_vec_returns_contents() {
        let buffer: ConcurrentBuffer<i32> = (0..5).collect();
        assert_eq!(buffer.into_vec(), vec![0, 1, 2, 3, 4]);
    }
}
