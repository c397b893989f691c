//! Server runtime counters
//!
//! The monitoring middleware feeds these: an in-flight request gauge, error
//! count, and per-status response counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct ServerStats {
    in_flight: AtomicI64,
    errors: AtomicU64,
    statuses: Mutex<HashMap<u16, u64>>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self, status: u16, errored: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if errored {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        *self.statuses.lock().expect("status counters lock poisoned").entry(status).or_insert(0) +=
            1;
    }

    /// Requests currently being processed.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn status_count(&self, status: u16) -> u64 {
        self.statuses
            .lock()
            .expect("status counters lock poisoned")
            .get(&status)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_lifecycle() {
        let stats = ServerStats::new();
        stats.request_started();
        assert_eq!(stats.in_flight(), 1);

        stats.request_finished(200, false);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(stats.status_count(200), 1);
        assert_eq!(stats.errors(), 0);

        stats.request_started();
        stats.request_finished(500, true);
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.status_count(500), 1);
    }
}
