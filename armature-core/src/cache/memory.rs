//! In-memory cache driver
//!
//! Process-local driver used by tests and the `mem` session store. Expiry is
//! lazy: entries past their deadline are dropped on access and swept by
//! `keys`/`has`.

use super::{glob_match, Cache};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

struct Slot {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= Utc::now())
    }
}

/// In-process cache with per-entry TTL.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().expect("cache table lock poisoned");
        entries.values().filter(|slot| !slot.expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn kind(&self) -> &str {
        super::MEMORY
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        {
            let entries = self.entries.read().expect("cache table lock poisoned");
            match entries.get(key) {
                Some(slot) if !slot.expired() => return Ok(Some(slot.value.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // expired: drop it under the write lock
        self.entries.write().expect("cache table lock poisoned").remove(key);
        Ok(None)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get_raw(key).await?.is_some())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl)?)
        };
        let slot = Slot { value, expires_at };
        self.entries.write().expect("cache table lock poisoned").insert(key.to_string(), slot);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.write().expect("cache table lock poisoned").remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.write().expect("cache table lock poisoned");
        entries.retain(|_, slot| !slot.expired());
        Ok(entries.keys().filter(|k| glob_match(pattern, k)).cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().expect("cache table lock poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let cache = MemoryCache::new();
        cache.set("k", &42u32, Duration::ZERO).await.unwrap();

        assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(42));
        assert!(cache.has("k").await.unwrap());

        cache.del("k").await.unwrap();
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("gone", &"v", Duration::from_millis(10)).await.unwrap();
        cache.set("kept", &"v", Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get::<String>("gone").await.unwrap(), None);
        assert_eq!(cache.get::<String>("kept").await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn keys_filters_by_glob() {
        let cache = MemoryCache::new();
        cache.set("session:a", &1, Duration::ZERO).await.unwrap();
        cache.set("session:b", &2, Duration::ZERO).await.unwrap();
        cache.set("other", &3, Duration::ZERO).await.unwrap();

        let mut keys = cache.keys("session:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session:a", "session:b"]);
    }
}
