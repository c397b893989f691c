//! Request context
//!
//! One [`Context`] per request, created on arrival and dropped when the
//! response goes out. It bundles the parsed request, the buffered response,
//! the server configuration, the restored session and a side-band data map.
//! The owning request task is the only mutator; interior locks exist so the
//! context can travel through the boxed middleware chain as an `Arc`.

use super::config::ServerConfig;
use super::response::Response;
use crate::session::Session;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Parsed request data, immutable for the lifetime of the context.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: Option<SocketAddr>,
}

impl RequestInfo {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Per-request state handed to middleware and handlers.
pub struct Context {
    pub request: RequestInfo,
    pub response: Mutex<Response>,
    pub config: Arc<ServerConfig>,
    session: Mutex<Option<Session>>,
    data: Mutex<HashMap<String, serde_json::Value>>,
    trace_id: Mutex<Option<String>>,
    dnt: AtomicBool,
    consent: AtomicBool,
}

impl Context {
    pub fn new(request: RequestInfo, config: Arc<ServerConfig>) -> Self {
        Self {
            request,
            response: Mutex::new(Response::new()),
            config,
            session: Mutex::new(None),
            data: Mutex::new(HashMap::new()),
            trace_id: Mutex::new(None),
            dnt: AtomicBool::new(false),
            consent: AtomicBool::new(false),
        }
    }

    /// The client address: X-Forwarded-For, then X-Real-Ip, then the socket
    /// peer.
    pub fn remote_addr(&self) -> String {
        for header in ["X-Forwarded-For", "X-Real-Ip"] {
            if let Some(value) = self.request.header(header) {
                if let Some(first) = value.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }
        self.request.peer.map(|p| p.ip().to_string()).unwrap_or_default()
    }

    /// The client's User-Agent, if sent.
    pub fn user_agent(&self) -> String {
        self.request.header("User-Agent").unwrap_or_default().to_string()
    }

    pub fn response(&self) -> MutexGuard<'_, Response> {
        self.response.lock().expect("response lock poisoned")
    }

    // Session access

    pub fn session(&self) -> Option<Session> {
        self.session.lock().expect("session lock poisoned").clone()
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.lock().expect("session lock poisoned") = session;
    }

    /// True when a session was restored for this request.
    pub fn authenticated(&self) -> bool {
        self.session.lock().expect("session lock poisoned").is_some()
    }

    /// The logged-in account id, empty when anonymous.
    pub fn account_id(&self) -> String {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .and_then(|s| s.account_id.clone())
            .unwrap_or_default()
    }

    /// Whether the session holds the given permission.
    pub fn can(&self, permission: &str) -> bool {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .is_some_and(|s| s.permissions.can(permission))
    }

    pub fn can_any(&self, permissions: &[&str]) -> bool {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .is_some_and(|s| s.permissions.can_any(permissions))
    }

    pub fn can_all(&self, permissions: &[&str]) -> bool {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .is_some_and(|s| s.permissions.can_all(permissions))
    }

    // Side-band data map

    /// Stash a value for the duration of the request.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: T) {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.lock().expect("data map lock poisoned").insert(key.into(), value);
        }
    }

    /// Fetch a stashed value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.lock().expect("data map lock poisoned");
        data.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    // Tracing / consent flags

    pub fn trace_id(&self) -> Option<String> {
        self.trace_id.lock().expect("trace id lock poisoned").clone()
    }

    pub(crate) fn set_trace_id(&self, id: String) {
        *self.trace_id.lock().expect("trace id lock poisoned") = Some(id);
    }

    pub fn dnt(&self) -> bool {
        self.dnt.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dnt(&self, on: bool) {
        self.dnt.store(on, Ordering::Relaxed);
    }

    /// Consent given to track and use cookies.
    pub fn consent(&self) -> bool {
        self.consent.load(Ordering::Relaxed)
    }

    pub fn set_consent(&self, on: bool) {
        self.consent.store(on, Ordering::Relaxed);
    }

    // Short-circuit replies

    /// Missing parameters, bad encoding and other malformed input.
    pub fn bad_request(&self, message: &str) {
        self.reply(400, message);
    }

    /// The caller is not authenticated.
    pub fn unauthorized(&self, message: &str) {
        self.reply(401, message);
    }

    /// Authenticated but not allowed to do this.
    pub fn forbidden(&self, message: &str) {
        self.reply(403, message);
    }

    /// Something broke on our side.
    pub fn server_error(&self, message: &str) {
        self.reply(500, message);
    }

    fn reply(&self, status: u16, message: &str) {
        let mut res = self.response();
        res.write_header(status);
        let _ = res.write(message.as_bytes());
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;

    #[test]
    fn remote_addr_prefers_forwarded_header() {
        let ctx = context(Method::GET, "/", &[("X-Forwarded-For", "203.0.113.1, 10.0.0.1")], b"");
        assert_eq!(ctx.remote_addr(), "203.0.113.1");

        let ctx = context(Method::GET, "/", &[("X-Real-Ip", "203.0.113.2")], b"");
        assert_eq!(ctx.remote_addr(), "203.0.113.2");

        let ctx = context(Method::GET, "/", &[], b"");
        assert_eq!(ctx.remote_addr(), "198.51.100.20");
    }

    #[test]
    fn data_map_roundtrip() {
        let ctx = context(Method::GET, "/", &[], b"");
        ctx.set("flag", true);
        assert_eq!(ctx.get::<bool>("flag"), Some(true));
        assert_eq!(ctx.get::<bool>("other"), None);
    }

    #[test]
    fn permissions_require_a_session() {
        let ctx = context(Method::GET, "/", &[], b"");
        assert!(!ctx.authenticated());
        assert!(!ctx.can("users.read"));

        let mut session = Session::new("203.0.113.1", "agent");
        session.permissions.grant("users.read");
        session.account_id = Some("acct-1".to_string());
        ctx.set_session(Some(session));

        assert!(ctx.authenticated());
        assert!(ctx.can("users.read"));
        assert!(!ctx.can("users.write"));
        assert_eq!(ctx.account_id(), "acct-1");
    }

    #[test]
    fn reply_helpers_commit_status() {
        let ctx = context(Method::GET, "/", &[], b"");
        ctx.bad_request("bad input");
        let res = ctx.response();
        assert_eq!(res.status, 400);
        assert!(res.committed);
    }
}
