//! Cluster coordinator
//!
//! Attaches the process to a named cluster backed by Redis: every node gets
//! a monotonic id from an atomic hash counter, publishes its liveness record
//! periodically, and exchanges broadcast frames over a shared channel. Named
//! locks stored with a short TTL give cluster-wide mutual exclusion; a
//! crashed holder loses its locks when the TTL lapses.
//!
//! Redis errors during background maintenance are swallowed on purpose: node
//! records and lock entries self-heal through their TTLs.

pub mod protocol;

pub use protocol::{Message, MessageKind, NodeInfo, SharedLock, LOCK_TTL, PING_TIME};

use crate::cache::{Cache, CacheExt, RedisCache};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use protocol::{channel_key, cluster_key, locks_key, NODE_ID_PROP};
use serde::Serialize;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

/// Callback invoked for every inbound broadcast.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// A node's membership in a named cluster.
pub struct Cluster {
    name: String,
    node_id: i64,
    key: String,
    channel: String,
    ip: String,
    cache: Arc<RedisCache>,
    handler: Mutex<Option<MessageHandler>>,
    active_locks: AsyncMutex<Vec<SharedLock>>,
    stop: Arc<Notify>,
}

impl Cluster {
    /// Join the cluster identified by `name`.
    pub async fn join(name: &str, cache: Arc<RedisCache>) -> Result<Arc<Self>> {
        let key = cluster_key(name);
        let channel = channel_key(name);

        let node_id = cache.hinc(&key, NODE_ID_PROP).await?;

        let cluster = Arc::new(Self {
            name: name.to_string(),
            node_id,
            key,
            channel: channel.clone(),
            ip: local_addr(),
            cache,
            handler: Mutex::new(None),
            active_locks: AsyncMutex::new(Vec::new()),
            stop: Arc::new(Notify::new()),
        });

        cluster.write_node_info().await?;

        let listener = Arc::downgrade(&cluster);
        cluster
            .cache
            .subscribe(
                &channel,
                Arc::new(move |frame| {
                    let Some(cluster) = listener.upgrade() else { return };
                    cluster.on_frame(&frame.payload);
                }),
                &[],
            )
            .await?;

        cluster.announce(MessageKind::NodeJoined).await?;

        let maintenance = Arc::downgrade(&cluster);
        let stop = cluster.stop.clone();
        tokio::spawn(async move {
            maintenance_loop(maintenance, stop).await;
        });

        log::info!("joined cluster {} as node {}", name, node_id);
        Ok(cluster)
    }

    /// This node's id inside the cluster.
    pub fn id(&self) -> i64 {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a payload to every node in the cluster.
    pub async fn broadcast(&self, payload: &impl Serialize) -> Result<()> {
        let msg = Message::new(MessageKind::NodeBroadcast, self.node_id, payload)?;
        self.cache.publish(&self.channel, &serde_json::to_string(&msg)?).await
    }

    /// Register the callback invoked per inbound broadcast.
    pub fn on_message(&self, callback: MessageHandler) {
        *self.handler.lock().expect("message handler lock poisoned") = Some(callback);
    }

    /// Acquire the cluster-wide lock `name`. Fails when this node already
    /// holds it or another node does.
    pub async fn lock(&self, name: &str) -> Result<()> {
        let mut held = self.active_locks.lock().await;

        if held.iter().any(|l| l.name == name) {
            bail!("a lock with this name already exists");
        }

        if let Some(existing) = self.cache.get::<SharedLock>(&locks_key(&self.name, name)).await? {
            bail!("lock already acquired by {}", existing.node_id);
        }

        let lock = SharedLock { name: name.to_string(), time: Utc::now(), node_id: self.node_id };
        self.cache.set(&locks_key(&self.name, name), &lock, LOCK_TTL).await?;
        held.push(lock);
        Ok(())
    }

    /// Release a lock held by this node.
    pub async fn unlock(&self, name: &str) -> Result<()> {
        let mut held = self.active_locks.lock().await;
        let before = held.len();
        held.retain(|l| l.name != name);
        if held.len() == before {
            return Err(anyhow!("no such lock"));
        }
        self.cache.del(&locks_key(&self.name, name)).await
    }

    /// Leave the cluster: announce, drop the membership record, close the
    /// subscription and stop maintenance.
    pub async fn leave(&self) -> Result<()> {
        self.announce(MessageKind::NodeLeave).await?;
        self.cache.hdel(&self.key, &self.node_id.to_string()).await?;
        self.cache.unsubscribe(&self.channel);
        self.stop.notify_waiters();
        log::info!("left cluster {} (node {})", self.name, self.node_id);
        Ok(())
    }

    async fn announce(&self, kind: MessageKind) -> Result<()> {
        let msg = Message::new(kind, self.node_id, &self.node_id)?;
        self.cache.publish(&self.channel, &serde_json::to_string(&msg)?).await
    }

    fn on_frame(&self, payload: &str) {
        let Ok(msg) = serde_json::from_str::<Message>(payload) else {
            return;
        };
        match msg.kind {
            MessageKind::NodeBroadcast => {
                let handler = self.handler.lock().expect("message handler lock poisoned").clone();
                if let Some(handler) = handler {
                    handler(msg);
                }
            }
            MessageKind::Ping | MessageKind::NodeJoined | MessageKind::NodeLeave => {}
        }
    }

    async fn write_node_info(&self) -> Result<()> {
        let info = NodeInfo { ip: self.ip.clone(), last_seen: Utc::now() };
        self.cache.hset(&self.key, &self.node_id.to_string(), &serde_json::to_string(&info)?).await
    }

    /// Refresh every lock this node holds. Failures are ignored; an
    /// unrenewed lock simply expires.
    async fn renew_locks(&self) {
        let held = self.active_locks.lock().await.clone();
        for lock in held {
            let _ = self.cache.set(&locks_key(&self.name, &lock.name), &lock, LOCK_TTL).await;
        }
    }

    /// Drop membership records of nodes that stopped pinging. Runs under the
    /// cluster-wide `cluster-gc` lock so only one node sweeps at a time.
    async fn collect_stale_nodes(&self) {
        if self.lock("cluster-gc").await.is_err() {
            return;
        }
        if let Ok(records) = self.cache.hgetall(&self.key).await {
            let now = Utc::now();
            let ping = chrono::Duration::from_std(PING_TIME)
                .unwrap_or_else(|_| chrono::Duration::zero());
            for (prop, raw) in records {
                if prop == NODE_ID_PROP {
                    continue;
                }
                let Ok(node) = serde_json::from_str::<NodeInfo>(&raw) else {
                    continue;
                };
                if node.last_seen + ping < now {
                    let _ = self.cache.hdel(&self.key, &prop).await;
                }
            }
        }
        let _ = self.unlock("cluster-gc").await;
    }
}

async fn maintenance_loop(cluster: std::sync::Weak<Cluster>, stop: Arc<Notify>) {
    let start = tokio::time::Instant::now();
    let mut ping = tokio::time::interval_at(start + PING_TIME, PING_TIME);
    let mut locks = tokio::time::interval_at(start + LOCK_TTL, LOCK_TTL);
    let mut gc = tokio::time::interval_at(start + PING_TIME * 2, PING_TIME * 2);

    loop {
        tokio::select! {
            _ = stop.notified() => return,
            _ = locks.tick() => {
                let Some(cluster) = cluster.upgrade() else { return };
                cluster.renew_locks().await;
            }
            _ = ping.tick() => {
                let Some(cluster) = cluster.upgrade() else { return };
                let _ = cluster.write_node_info().await;
            }
            _ = gc.tick() => {
                let Some(cluster) = cluster.upgrade() else { return };
                cluster.collect_stale_nodes().await;
            }
        }
    }
}

/// Best-effort local address used in the membership record. The socket is
/// never actually used to send anything.
fn local_addr() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}
