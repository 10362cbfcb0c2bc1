//! Fixed-capacity blocking FIFO shared by producers and workers.
//!
//! One mutex guards the queue; `not_full` and `not_empty` condition
//! variables wake exactly one waiter per push or pop. An empty payload is
//! the stop sentinel for workers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use bytes::Bytes;

#[derive(Debug)]
pub struct BoundedBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<Bytes>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl BoundedBuffer {
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "bounded buffer capacity must be at least 1");
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `payload`, blocking while the buffer is full.
    pub fn push(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let mut queue = self.lock();
        while queue.len() == self.capacity {
            queue = self
                .not_full
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        queue.push_back(payload);
        drop(queue);
        self.not_empty.notify_one();
    }

    /// Enqueue the empty stop sentinel.
    pub fn push_sentinel(&self) {
        self.push(Bytes::new());
    }

    /// Dequeue the oldest payload, blocking while the buffer is empty.
    pub fn pop(&self) -> Bytes {
        let mut queue = self.lock();
        let payload = loop {
            match queue.pop_front() {
                Some(payload) => break payload,
                None => {
                    queue = self
                        .not_empty
                        .wait(queue)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        };
        drop(queue);
        self.not_full.notify_one();
        payload
    }

    /// Current number of queued payloads. Advisory under concurrency.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    // The queue holds plain data, so a panic elsewhere cannot leave it
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn is_sentinel(payload: &[u8]) -> bool {
    payload.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pops_in_push_order() {
        let buffer = BoundedBuffer::new(8);
        let msgs: Vec<Bytes> = (0u8..8).map(|i| Bytes::from(vec![i; i as usize + 1])).collect();
        for m in &msgs {
            buffer.push(m.clone());
        }
        for m in &msgs {
            assert_eq!(&buffer.pop(), m);
        }
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn fifo_through_capacity_one() {
        let buffer = Arc::new(BoundedBuffer::new(1));
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0u32..200 {
                    buffer.push(Bytes::copy_from_slice(&i.to_le_bytes()));
                }
            })
        };
        for i in 0u32..200 {
            let msg = buffer.pop();
            assert_eq!(u32::from_le_bytes(msg[..].try_into().unwrap()), i);
        }
        producer.join().unwrap();
    }

    #[test]
    fn push_blocks_until_pop_when_full() {
        let buffer = Arc::new(BoundedBuffer::new(2));
        buffer.push(&b"a"[..]);
        buffer.push(&b"b"[..]);
        assert_eq!(buffer.size(), 2);

        let pushed = Arc::new(AtomicBool::new(false));
        let handle = {
            let buffer = Arc::clone(&buffer);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                buffer.push(&b"c"[..]);
                pushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!pushed.load(Ordering::SeqCst), "push returned while full");
        assert!(buffer.size() <= buffer.capacity());

        assert_eq!(&buffer.pop()[..], b"a");
        handle.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(&buffer.pop()[..], b"b");
        assert_eq!(&buffer.pop()[..], b"c");
    }

    #[test]
    fn no_loss_no_duplication_across_threads() {
        const PRODUCERS: u32 = 4;
        const CONSUMERS: usize = 5;
        const PER_PRODUCER: u32 = 500;

        let buffer = Arc::new(BoundedBuffer::new(3));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let id = p * PER_PRODUCER + i;
                        buffer.push(Bytes::copy_from_slice(&id.to_le_bytes()));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        max_seen.fetch_max(buffer.size(), Ordering::SeqCst);
                        let msg = buffer.pop();
                        if is_sentinel(&msg) {
                            return seen;
                        }
                        seen.push(u32::from_le_bytes(msg[..].try_into().unwrap()));
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for _ in 0..CONSUMERS {
            buffer.push_sentinel();
        }

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.join().unwrap());
        }
        let total = (PRODUCERS * PER_PRODUCER) as usize;
        assert_eq!(all.len(), total);
        let unique: HashSet<u32> = all.into_iter().collect();
        assert_eq!(unique.len(), total);
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn sentinels_release_every_waiting_consumer() {
        let buffer = Arc::new(BoundedBuffer::new(1));
        let workers: Vec<_> = (0..6)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || while !is_sentinel(&buffer.pop()) {})
            })
            .collect();
        for i in 0u8..20 {
            buffer.push(vec![i + 1]);
        }
        for _ in 0..workers.len() {
            buffer.push_sentinel();
        }
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn zero_capacity_is_rejected() {
        let _ = BoundedBuffer::new(0);
    }
}
