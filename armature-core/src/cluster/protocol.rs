//! Cluster wire protocol
//!
//! Messages travel as JSON over the cluster's Redis channel. Kinds are
//! numeric on the wire so frames stay compact and order-stable.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often a node refreshes its membership record.
pub const PING_TIME: Duration = Duration::from_secs(30);
/// Lifetime of a shared lock record; holders renew before it elapses.
pub const LOCK_TTL: Duration = Duration::from_secs(3);

/// Hash property holding the node id counter.
pub(crate) const NODE_ID_PROP: &str = "nodeId";

pub(crate) fn cluster_key(name: &str) -> String {
    format!("cluster:{}", name)
}

pub(crate) fn channel_key(name: &str) -> String {
    format!("channel:{}", name)
}

pub(crate) fn locks_key(cluster: &str, lock: &str) -> String {
    format!("cluster:{}:locks:{}", cluster, lock)
}

/// Kind of a cluster message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Ping,
    NodeJoined,
    NodeLeave,
    NodeBroadcast,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Ping => 0,
            MessageKind::NodeJoined => 1,
            MessageKind::NodeLeave => 2,
            MessageKind::NodeBroadcast => 3,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Ping),
            1 => Ok(MessageKind::NodeJoined),
            2 => Ok(MessageKind::NodeLeave),
            3 => Ok(MessageKind::NodeBroadcast),
            other => Err(format!("unknown message kind {}", other)),
        }
    }
}

/// A frame exchanged between cluster nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "nodeID")]
    pub node_id: i64,
    /// Opaque JSON payload
    pub data: serde_json::Value,
}

impl Message {
    pub fn new(kind: MessageKind, node_id: i64, payload: &impl Serialize) -> Result<Self> {
        Ok(Self { kind, node_id, data: serde_json::to_value(payload)? })
    }

    /// Decode the payload into a concrete type.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.data.as_i64()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.data.as_str()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.data.as_bool()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.data.as_f64()
    }
}

/// Membership record a node publishes about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ip: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// A named cluster-wide mutex record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedLock {
    pub name: String,
    pub time: chrono::DateTime<chrono::Utc>,
    pub node_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kinds_are_numeric_on_the_wire() {
        let msg = Message::new(MessageKind::NodeBroadcast, 7, &"payload").unwrap();
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":3"));
        assert!(encoded.contains("\"nodeID\":7"));

        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageKind::NodeBroadcast);
        assert_eq!(decoded.as_str(), Some("payload"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"type":9,"nodeID":1,"data":null}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn typed_payload_unpack() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            job: String,
        }
        let msg =
            Message::new(MessageKind::NodeBroadcast, 1, &Payload { job: "rebuild".into() }).unwrap();
        assert_eq!(msg.unpack::<Payload>().unwrap(), Payload { job: "rebuild".into() });
    }

    #[test]
    fn key_formats() {
        assert_eq!(cluster_key("main"), "cluster:main");
        assert_eq!(channel_key("main"), "channel:main");
        assert_eq!(locks_key("main", "gc"), "cluster:main:locks:gc");
    }
}
