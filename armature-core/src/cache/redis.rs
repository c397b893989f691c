//! Redis cache driver
//!
//! K/V with TTL plus the Redis-only extras the rest of the framework leans
//! on: hash operations (cluster membership tables) and pub/sub (cluster
//! broadcast). Each subscription is tracked under a caller-supplied key with
//! its own close signal; a consumer task forwards received frames to the
//! handler until the subscription is closed.

use super::{Cache, REDIS};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Redis endpoint configuration (`platform.cache.redis.*`).
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { addr: "localhost:6379".to_string(), password: String::new() }
    }
}

impl RedisConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        Self {
            addr: settings.str_or("platform.cache.redis.addr", "localhost:6379"),
            password: settings.str_or("platform.cache.redis.password", ""),
        }
    }

    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/", self.addr)
        } else {
            format!("redis://:{}@{}/", self.password, self.addr)
        }
    }
}

/// A message delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Handler invoked for every frame received on a subscription.
pub type MessageHandler = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

struct Subscription {
    channels: Vec<String>,
    close: Arc<Notify>,
}

/// Redis-backed [`Cache`] driver.
pub struct RedisCache {
    client: redis::Client,
    conn: MultiplexedConnection,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl RedisCache {
    /// Connect to Redis and verify the link with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .with_context(|| format!("invalid redis address {}", config.addr))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .with_context(|| format!("redis connection error: {}", config.addr))?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(Self { client, conn, subscriptions: Mutex::new(HashMap::new()) })
    }

    // Hash operations, used by the cluster coordinator for membership tables.

    /// Atomically increment `prop` inside the hash at `key`, returning the
    /// new value.
    pub async fn hinc(&self, key: &str, prop: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, prop, 1).await?)
    }

    pub async fn hset(&self, key: &str, prop: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, prop, value).await?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, prop: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, prop).await?)
    }

    pub async fn hdel(&self, key: &str, prop: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, prop).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    // Pub/sub.

    /// Publish a message on a channel.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    /// Subscribe under a caller-supplied key. The key itself is always one of
    /// the subscribed channels; `extra_channels` adds more. The handler runs
    /// on a dedicated consumer task until [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        key: &str,
        handler: MessageHandler,
        extra_channels: &[&str],
    ) -> Result<()> {
        let mut channels: Vec<String> = extra_channels.iter().map(|c| c.to_string()).collect();
        channels.push(key.to_string());

        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }

        let close = Arc::new(Notify::new());
        let sub = Subscription { channels: channels.clone(), close: close.clone() };
        self.subscriptions
            .lock()
            .expect("subscription table lock poisoned")
            .insert(key.to_string(), sub);

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = close.notified() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        let channel = msg.get_channel_name().to_string();
                        match msg.get_payload::<String>() {
                            Ok(payload) => handler(PubSubMessage { channel, payload }),
                            Err(err) => log::warn!("dropping undecodable frame on {}: {}", channel, err),
                        }
                    }
                }
            }
            // dropping the stream tears down the pubsub connection
        });
        Ok(())
    }

    /// Close the subscription registered under `key`.
    pub fn unsubscribe(&self, key: &str) {
        let sub = self.subscriptions.lock().expect("subscription table lock poisoned").remove(key);
        if let Some(sub) = sub {
            log::debug!("closing subscription {} ({} channels)", key, sub.channels.len());
            sub.close.notify_waiters();
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn kind(&self) -> &str {
        REDIS
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value).await?;
        } else {
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHALL").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
