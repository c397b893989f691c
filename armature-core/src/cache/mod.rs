//! Uniform cache interface
//!
//! Every driver exposes the same small surface: typed K/V with TTL, key
//! listing by glob, and a full clear. Values are JSON-serialized on write and
//! JSON-parsed on read, so anything `serde` can handle goes in. Hash
//! operations and pub/sub are Redis-specific and live on the concrete
//! [`redis::RedisCache`] driver.
//!
//! A [`CacheManager`] keeps the registered drivers by name with one of them
//! marked as default, so subsystems that only need "a cache" (sessions,
//! rate limiting state) stay driver-agnostic.

pub mod memory;
pub mod redis;

pub use memory::MemoryCache;
pub use redis::RedisCache;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Driver name for the in-memory cache.
pub const MEMORY: &str = "memory";
/// Driver name for the Redis cache.
pub const REDIS: &str = "redis";

/// Uniform cache driver contract.
///
/// `ttl` of zero means the entry never expires.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Driver name ("memory", "redis", ...)
    fn kind(&self) -> &str;
    /// Raw bytes stored under `key`, if any.
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Whether `key` currently exists.
    async fn has(&self, key: &str) -> Result<bool>;
    /// Store raw bytes under `key` with the given lifetime.
    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    /// Remove `key`.
    async fn del(&self, key: &str) -> Result<()>;
    /// All keys matching a glob pattern (`session:*`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    /// Remove every key.
    async fn clear(&self) -> Result<()>;
}

/// Typed accessors over any [`Cache`], JSON on the wire.
#[async_trait]
pub trait CacheExt: Cache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.set_raw(key, raw, ttl).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Registry of cache drivers with a default.
#[derive(Default)]
pub struct CacheManager {
    drivers: RwLock<HashMap<String, Arc<dyn Cache>>>,
    default: RwLock<Option<String>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver. The first registered driver becomes the default.
    pub fn register(&self, driver: Arc<dyn Cache>) {
        let name = driver.kind().to_string();
        let mut defaults = self.default.write().expect("default driver lock poisoned");
        if defaults.is_none() {
            *defaults = Some(name.clone());
        }
        self.drivers.write().expect("driver table lock poisoned").insert(name, driver);
    }

    /// Mark an already-registered driver as the default.
    pub fn set_default(&self, name: &str) {
        *self.default.write().expect("default driver lock poisoned") = Some(name.to_string());
    }

    /// Look up a driver by name.
    pub fn driver(&self, name: &str) -> Option<Arc<dyn Cache>> {
        self.drivers.read().expect("driver table lock poisoned").get(name).cloned()
    }

    /// The default driver, if one has been registered.
    pub fn default_driver(&self) -> Option<Arc<dyn Cache>> {
        let name = self.default.read().expect("default driver lock poisoned").clone()?;
        self.driver(&name)
    }
}

/// Glob match supporting `*` wildcards (used by drivers without native
/// pattern support).
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut rest = value;
    let mut parts = pattern.split('*').peekable();
    let mut first = true;
    while let Some(part) = parts.next() {
        if part.is_empty() {
            first = false;
            continue;
        }
        if first {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if parts.peek().is_none() {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
        first = false;
    }
    // pattern ended with '*'
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("session:*", "session:abc"));
        assert!(!glob_match("session:*", "cluster:abc"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
        assert!(glob_match("exact", "exact"));
    }

    #[tokio::test]
    async fn manager_default_driver() {
        let manager = CacheManager::new();
        assert!(manager.default_driver().is_none());

        manager.register(Arc::new(MemoryCache::new()));
        let driver = manager.default_driver().expect("default registered");
        assert_eq!(driver.kind(), MEMORY);
        assert!(manager.driver(REDIS).is_none());
    }
}
