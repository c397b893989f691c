//! Bucket collector
//!
//! Tracks one [`LeakyBucket`] per client key in a map plus an indexed binary
//! min-heap ordered on each bucket's drain time `p`, so the earliest-empty
//! bucket is always at the root. Each bucket stores its own heap slot,
//! keeping re-prioritization O(log n) without a lookup. A background task
//! pops drained buckets once per second.
//!
//! Locking: the collector mutex spans the map and the heap. `add` releases
//! it before charging the bucket and re-acquires it only to restore heap
//! order, so a slow charge never blocks unrelated keys.

use super::bucket::LeakyBucket;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

type BucketRef = Arc<Mutex<LeakyBucket>>;

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, BucketRef>,
    heap: Vec<BucketRef>,
}

/// Keeps track of multiple leaky buckets and drops the empty ones.
pub struct Collector {
    inner: Mutex<Inner>,
    rate: f64,
    capacity: i64,
    quit: Arc<Notify>,
}

impl Collector {
    /// Create a collector and start the periodic empty-bucket sweep.
    pub fn new(rate: f64, capacity: i64) -> Arc<Self> {
        let collector = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            rate,
            capacity,
            quit: Arc::new(Notify::new()),
        });

        let sweep = Arc::downgrade(&collector);
        let quit = collector.quit.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = quit.notified() => return,
                    _ = tick.tick() => {
                        let Some(collector) = sweep.upgrade() else { return };
                        collector.remove_empty_buckets();
                    }
                }
            }
        });

        collector
    }

    /// Stop the background sweep.
    pub fn stop(&self) {
        self.quit.notify_waiters();
    }

    /// Charge `amount` tokens to the bucket for `key`, creating it on first
    /// use. Returns the admitted amount, zero meaning fully rejected.
    pub fn add(&self, key: &str, amount: i64) -> i64 {
        let bucket = {
            let mut inner = self.inner.lock().expect("collector lock poisoned");
            match inner.buckets.get(key) {
                Some(b) => b.clone(),
                None => {
                    let b = Arc::new(Mutex::new(LeakyBucket::keyed(
                        key.to_string(),
                        self.rate,
                        self.capacity,
                    )));
                    Self::heap_push(&mut inner, b.clone());
                    inner.buckets.insert(key.to_string(), b.clone());
                    b
                }
            }
        };

        let (admitted, index) = {
            let mut b = bucket.lock().expect("bucket lock poisoned");
            (b.add(amount), b.index)
        };

        if admitted > 0 {
            let mut inner = self.inner.lock().expect("collector lock poisoned");
            // the sweep may have dropped the bucket while we charged it
            if inner.heap.get(index).is_some_and(|slot| Arc::ptr_eq(slot, &bucket)) {
                Self::heap_fix(&mut inner, index);
            }
        }
        admitted
    }

    /// Remove the bucket for `key`, if any.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("collector lock poisoned");
        if let Some(bucket) = inner.buckets.remove(key) {
            let index = bucket.lock().expect("bucket lock poisoned").index;
            Self::heap_remove(&mut inner, index);
        }
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("collector lock poisoned").buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop every bucket whose drain time has passed.
    fn remove_empty_buckets(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("collector lock poisoned");
        loop {
            let Some(head) = inner.heap.first() else { break };
            let (key, p) = {
                let b = head.lock().expect("bucket lock poisoned");
                (b.key.clone(), b.p)
            };
            if now < p {
                break;
            }
            inner.buckets.remove(&key);
            Self::heap_remove(&mut inner, 0);
        }
    }

    // Indexed binary min-heap on `p`. Each bucket records its slot so a
    // re-prioritization starts from a known position.

    fn priority(slot: &BucketRef) -> Instant {
        slot.lock().expect("bucket lock poisoned").p
    }

    fn set_index(slot: &BucketRef, index: usize) {
        slot.lock().expect("bucket lock poisoned").index = index;
    }

    fn heap_push(inner: &mut Inner, bucket: BucketRef) {
        let index = inner.heap.len();
        Self::set_index(&bucket, index);
        inner.heap.push(bucket);
        Self::sift_up(&mut inner.heap, index);
    }

    fn heap_remove(inner: &mut Inner, index: usize) {
        if inner.heap.is_empty() {
            return;
        }
        let last = inner.heap.len() - 1;
        inner.heap.swap(index, last);
        if index < last {
            Self::set_index(&inner.heap[index], index);
        }
        inner.heap.pop();
        if index < inner.heap.len() {
            Self::heap_fix(inner, index);
        }
    }

    fn heap_fix(inner: &mut Inner, index: usize) {
        let moved = Self::sift_down(&mut inner.heap, index);
        if !moved {
            Self::sift_up(&mut inner.heap, index);
        }
    }

    fn sift_up(heap: &mut [BucketRef], mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if Self::priority(&heap[index]) >= Self::priority(&heap[parent]) {
                break;
            }
            heap.swap(index, parent);
            Self::set_index(&heap[index], index);
            Self::set_index(&heap[parent], parent);
            index = parent;
        }
    }

    fn sift_down(heap: &mut [BucketRef], mut index: usize) -> bool {
        let len = heap.len();
        let mut moved = false;
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && Self::priority(&heap[right]) < Self::priority(&heap[left]) {
                child = right;
            }
            if Self::priority(&heap[child]) >= Self::priority(&heap[index]) {
                break;
            }
            heap.swap(index, child);
            Self::set_index(&heap[index], index);
            Self::set_index(&heap[child], child);
            index = child;
            moved = true;
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_key_admission() {
        let collector = Collector::new(1.0, 2);

        assert_eq!(collector.add("a", 1), 1);
        assert_eq!(collector.add("a", 1), 1);
        assert_eq!(collector.add("a", 1), 0);
        // an unrelated key has its own bucket
        assert_eq!(collector.add("b", 1), 1);

        collector.stop();
    }

    #[tokio::test]
    async fn remove_resets_a_key() {
        let collector = Collector::new(1.0, 1);
        assert_eq!(collector.add("a", 1), 1);
        assert_eq!(collector.add("a", 1), 0);

        collector.remove("a");
        assert_eq!(collector.add("a", 1), 1);
        collector.stop();
    }

    #[tokio::test]
    async fn sweep_drops_drained_buckets() {
        let collector = Collector::new(1000.0, 10);
        for i in 0..16 {
            collector.add(&format!("key-{}", i), 1);
        }
        assert_eq!(collector.len(), 16);

        // all buckets drain within ~1ms at rate 1000/s
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.remove_empty_buckets();
        assert_eq!(collector.len(), 0);
        collector.stop();
    }

    #[tokio::test]
    async fn heap_keeps_earliest_drain_at_root() {
        let collector = Collector::new(1.0, 100);
        collector.add("slow", 50);
        collector.add("fast", 1);

        // fast drains long before slow; a sweep in between must only drop fast
        tokio::time::sleep(Duration::from_millis(1100)).await;
        collector.remove_empty_buckets();
        assert_eq!(collector.len(), 1);
        collector.stop();
    }
}
