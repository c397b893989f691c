//! Leaky-bucket rate limiter
//!
//! A bucket drains at `rate` tokens per second up to `capacity`. The only
//! state is `p`, the instant the bucket becomes empty again; the remaining
//! fill level is derived from how far `p` sits in the future.

use std::time::{Duration, Instant};

/// A single leaky bucket keyed per client.
#[derive(Debug)]
pub struct LeakyBucket {
    /// Identifying key
    pub(crate) key: String,
    /// Bucket capacity
    capacity: i64,
    /// Amount of bucket leaks per second
    rate: f64,
    /// Scheduled drain time
    pub(crate) p: Instant,
    /// Slot in the collector heap
    pub(crate) index: usize,
}

impl LeakyBucket {
    pub fn new(rate: f64, capacity: i64) -> Self {
        Self::keyed(String::new(), rate, capacity)
    }

    pub(crate) fn keyed(key: String, rate: f64, capacity: i64) -> Self {
        Self { key, capacity, rate, p: Instant::now(), index: 0 }
    }

    /// Try to add `amount` tokens. Returns how many were admitted: `amount`
    /// when the bucket has room, less when it is near capacity, zero when
    /// full.
    pub fn add(&mut self, amount: i64) -> i64 {
        let count = self.count();
        if count >= self.capacity {
            return 0;
        }

        let now = Instant::now();
        if now >= self.p {
            self.p = now;
        }
        let allowed = amount.min(self.capacity - count);
        let advance = Duration::from_secs_f64(allowed as f64 / self.rate);
        self.p += advance;
        allowed
    }

    /// Tokens currently held, derived from the drain deadline.
    fn count(&self) -> i64 {
        let now = Instant::now();
        if now >= self.p {
            return 0;
        }
        let remaining = (self.p - now).as_secs_f64();
        let per_drip = 1.0 / self.rate;
        (remaining / per_drip).ceil() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let mut bucket = LeakyBucket::new(1.0, 2);
        assert_eq!(bucket.add(1), 1);
        assert_eq!(bucket.add(1), 1);
        assert_eq!(bucket.add(1), 0);
    }

    #[test]
    fn partial_admission_when_near_full() {
        let mut bucket = LeakyBucket::new(1.0, 3);
        assert_eq!(bucket.add(2), 2);
        // only one slot left
        assert_eq!(bucket.add(5), 1);
        assert_eq!(bucket.add(1), 0);
    }

    #[test]
    fn drains_over_time() {
        let mut bucket = LeakyBucket::new(100.0, 2);
        assert_eq!(bucket.add(2), 2);
        assert_eq!(bucket.add(1), 0);

        // at 100 tokens/s one slot frees after 10ms
        std::thread::sleep(Duration::from_millis(25));
        assert!(bucket.add(1) >= 1);
    }
}
