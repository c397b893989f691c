//! Session storage
//!
//! The [`Store`] trait is the contract the server programs against; the
//! built-in implementation wraps any [`Cache`] driver, which gives the
//! `redis` and `mem` backends for free. Sessions are stored under a
//! `session:` key prefix with the configured TTL, or without expiry when the
//! session is persistent.

use super::{Session, SessionConfig, Token};
use crate::cache::{Cache, CacheExt};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const SESSION_PREFIX: &str = "session:";

/// Contract of a session store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store name ("redis", "mem", ...)
    fn kind(&self) -> &str;
    /// Persist a session.
    async fn set(&self, session: &Session) -> Result<()>;
    /// Retrieve a session by token.
    async fn get(&self, token: &Token) -> Result<Option<Session>>;
    /// Remove a session.
    async fn del(&self, token: &Token) -> Result<()>;
    /// List sessions, optionally only those linked to the given account.
    async fn list(&self, account_id: Option<&str>) -> Result<Vec<Session>>;
    /// Remove expired sessions. The cache backends expire entries through
    /// their TTL, so this is a no-op for them.
    async fn gc(&self) -> Result<()>;
    /// Release the backend.
    fn close(&self);
}

/// Session store over any cache driver.
pub struct CacheStore {
    kind: &'static str,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl CacheStore {
    /// Redis-backed store.
    pub fn redis(cache: Arc<dyn Cache>, config: &SessionConfig) -> Self {
        Self { kind: "redis", cache, ttl: config.ttl }
    }

    /// In-memory store.
    pub fn memory(cache: Arc<dyn Cache>, config: &SessionConfig) -> Self {
        Self { kind: "mem", cache, ttl: config.ttl }
    }

    fn key(token: &Token) -> String {
        format!("{}{}", SESSION_PREFIX, token)
    }
}

#[async_trait]
impl Store for CacheStore {
    fn kind(&self) -> &str {
        self.kind
    }

    async fn set(&self, session: &Session) -> Result<()> {
        // persistent sessions never expire
        let ttl = if session.persistent { Duration::ZERO } else { self.ttl };
        self.cache.set(&Self::key(&session.id), session, ttl).await
    }

    async fn get(&self, token: &Token) -> Result<Option<Session>> {
        self.cache.get(&Self::key(token)).await
    }

    async fn del(&self, token: &Token) -> Result<()> {
        self.cache.del(&Self::key(token)).await
    }

    async fn list(&self, account_id: Option<&str>) -> Result<Vec<Session>> {
        let mut res = Vec::new();
        for key in self.cache.keys(&format!("{}*", SESSION_PREFIX)).await? {
            let token = Token::from_string(key.trim_start_matches(SESSION_PREFIX));
            let Some(session) = self.get(&token).await? else {
                continue;
            };
            match account_id {
                Some(account) if !account.trim().is_empty() => {
                    if session.account_id.as_deref() == Some(account) {
                        res.push(session);
                    }
                }
                _ => res.push(session),
            }
        }
        Ok(res)
    }

    async fn gc(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}
