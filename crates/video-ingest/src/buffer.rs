//! Bounded drop-oldest buffer holding a camera's most recent frames.

use std::{
    collections::VecDeque,
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Default number of frames retained per camera.
pub const DEFAULT_FRAME_BUFFER_CAPACITY: usize = 5;

pub struct FrameBuffer<T> {
    slots: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
    evicted: AtomicU64,
}

impl<T> FrameBuffer<T> {
    /// Create a buffer holding at most `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total number of entries evicted to make room for newer ones.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Insert without blocking. When full, the single oldest entry is evicted
    /// first and returned.
    pub fn put(&self, item: T) -> Option<T> {
        let mut slots = self.lock();
        let evicted = if slots.len() >= self.capacity {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            slots.pop_front()
        } else {
            None
        };
        slots.push_back(item);
        drop(slots);
        self.ready.notify_one();
        evicted
    }

    /// Pop the oldest entry, waiting up to `timeout` for one to arrive.
    /// Returns `None` on expiry.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();
        loop {
            if let Some(item) = slots.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slots = guard;
        }
    }

    /// Atomically drop every buffered entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut slots = self.lock();
        let removed = slots.len();
        slots.clear();
        removed
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> FrameBuffer<T> {
    /// Clone of the newest entry without removing it.
    pub fn peek_latest(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

impl<T> Default for FrameBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn full_buffer_evicts_oldest_entry() {
        let buffer = FrameBuffer::new(3);
        assert_eq!(buffer.put(1), None);
        assert_eq!(buffer.put(2), None);
        assert_eq!(buffer.put(3), None);
        assert_eq!(buffer.put(4), Some(1));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.evicted(), 1);
        assert_eq!(buffer.get(Duration::ZERO), Some(2));
        assert_eq!(buffer.peek_latest(), Some(4));
    }

    #[test]
    fn get_returns_none_after_timeout() {
        let buffer: FrameBuffer<u8> = FrameBuffer::default();
        let start = Instant::now();
        assert_eq!(buffer.get(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocked_get_wakes_on_put() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let producer = buffer.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put(7u32);
        });
        assert_eq!(buffer.get(Duration::from_secs(2)), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn clear_empties_buffer() {
        let buffer = FrameBuffer::new(5);
        for i in 0..4 {
            buffer.put(i);
        }
        assert_eq!(buffer.clear(), 4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.get(Duration::ZERO), None);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let buffer = FrameBuffer::new(0);
        buffer.put('a');
        assert_eq!(buffer.put('b'), Some('a'));
        assert_eq!(buffer.capacity(), 1);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..16, inserts in 0usize..64) {
            let buffer = FrameBuffer::new(capacity);
            for i in 0..inserts {
                let before = buffer.len();
                let evicted = buffer.put(i);
                prop_assert!(buffer.len() <= capacity);
                if before == capacity {
                    prop_assert_eq!(evicted, Some(i - capacity));
                } else {
                    prop_assert_eq!(evicted, None);
                }
            }
            prop_assert_eq!(buffer.len(), inserts.min(capacity));
        }
    }
}
