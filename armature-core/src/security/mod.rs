//! Security utilities
//!
//! IP list matching for white/blacklists, the crawler/exploit scanner with
//! its banned-IP set, and the leaky-bucket rate limiter used by the
//! brute-force middleware. All state here is owned; the server instantiates
//! what it needs at construction and releases it on stop.

pub mod bucket;
pub mod collector;
pub mod ipcheck;
pub mod urlscan;

pub use bucket::LeakyBucket;
pub use collector::Collector;
pub use ipcheck::{ip_in_range, matches};
pub use urlscan::UrlScanner;
