//! Session management
//!
//! Sessions are identified by a self-checked [`Token`], carry an arbitrary
//! JSON data map plus client metadata, and live in a pluggable [`Store`]
//! backed by any cache driver.

pub mod store;
pub mod token;

pub use store::{CacheStore, Store};
pub use token::Token;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A named capability a session may hold ("users.edit", "reports.read", ...).
pub type Permission = String;

/// Set of permissions granted to a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(Vec<Permission>);

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, permission: impl Into<Permission>) {
        let permission = permission.into();
        if !self.0.contains(&permission) {
            self.0.push(permission);
        }
    }

    pub fn revoke(&mut self, permission: &str) {
        self.0.retain(|p| p != permission);
    }

    pub fn revoke_all(&mut self) {
        self.0.clear();
    }

    pub fn can(&self, permission: &str) -> bool {
        self.0.iter().any(|p| p == permission)
    }

    pub fn can_any(&self, permissions: &[&str]) -> bool {
        permissions.iter().any(|p| self.can(p))
    }

    pub fn can_all(&self, permissions: &[&str]) -> bool {
        permissions.iter().all(|p| self.can(p))
    }
}

/// User session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id
    pub id: Token,
    /// Map of values stored on the session
    pub data: HashMap<String, serde_json::Value>,
    /// Last time the session was used
    pub last_activity: DateTime<Utc>,
    /// Client IP the session was created from
    pub ip: String,
    /// CSRF token echoed by the client on write verbs
    pub csrf_token: Token,
    /// User agent of the session holder
    pub ua: String,
    /// When the session was created
    pub created: DateTime<Utc>,
    /// Persistent sessions are stored without a TTL
    pub persistent: bool,
    /// Account id if linked with an account
    pub account_id: Option<String>,
    /// Unique device id
    pub device_id: Option<String>,
    /// Sessions can be locked for various reasons
    pub locked: bool,
    /// Permissions granted to this session
    pub permissions: Permissions,
}

impl Session {
    /// Create a new anonymous session for the given client.
    pub fn new(ip: impl Into<String>, ua: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Token::generate(),
            data: HashMap::new(),
            last_activity: now,
            ip: ip.into(),
            csrf_token: Token::generate(),
            ua: ua.into(),
            created: now,
            persistent: false,
            account_id: None,
            device_id: None,
            locked: false,
            permissions: Permissions::new(),
        }
    }

    /// Update the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Get a typed value from the data map.
    pub fn get_data<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set a value in the data map.
    pub fn set_data<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
    }
}

/// Session policy (`platform.server.session.*`).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which store holds the sessions ("redis" or "mem")
    pub store: String,
    /// Enable the use of sessions
    pub enabled: bool,
    /// Enable client sessions through cookies
    pub use_cookie: bool,
    /// Name of the session cookie
    pub cookie_name: String,
    /// Name of the header that carries the session id when cookies are off
    pub header_name: String,
    /// Maximum inactivity before a session is dropped
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: "redis".to_string(),
            enabled: true,
            use_cookie: true,
            cookie_name: "_session".to_string(),
            header_name: "X-Session-Id".to_string(),
            ttl: Duration::from_secs(3600),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        let defaults = Self::default();
        Self {
            store: settings.str_or("platform.server.session.store", &defaults.store),
            enabled: settings.bool_or("platform.server.session.enabled", defaults.enabled),
            use_cookie: settings.bool_or("platform.server.session.useCookie", defaults.use_cookie),
            cookie_name: settings
                .str_or("platform.server.session.cookieName", &defaults.cookie_name),
            header_name: settings
                .str_or("platform.server.session.headerName", &defaults.header_name),
            ttl: settings.duration_or("platform.server.session.ttl", defaults.ttl),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_valid_tokens() {
        let session = Session::new("203.0.113.9", "test-agent");
        assert!(session.id.is_valid());
        assert!(session.csrf_token.is_valid());
        assert_ne!(session.id, session.csrf_token);
        assert!(!session.persistent);
    }

    #[test]
    fn data_map_roundtrip() {
        let mut session = Session::new("203.0.113.9", "test-agent");
        session.set_data("cart", vec![1, 2, 3]);

        assert_eq!(session.get_data::<Vec<i32>>("cart"), Some(vec![1, 2, 3]));
        assert_eq!(session.get_data::<String>("missing"), None);
    }

    #[test]
    fn permission_checks() {
        let mut perms = Permissions::new();
        perms.grant("users.read");
        perms.grant("users.edit");

        assert!(perms.can("users.read"));
        assert!(perms.can_any(&["nope", "users.edit"]));
        assert!(perms.can_all(&["users.read", "users.edit"]));
        assert!(!perms.can_all(&["users.read", "admin"]));

        perms.revoke("users.edit");
        assert!(!perms.can("users.edit"));
    }
}
