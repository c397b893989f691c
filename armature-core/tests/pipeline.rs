//! End-to-end pipeline tests
//!
//! Each test boots a real server on an ephemeral port and talks plain
//! HTTP/1.1 over a socket, so the full path is exercised: listener,
//! middleware chain, route dispatch, codecs and the buffered response.

use armature_core::prelude::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Issue one request with `Connection: close` and read the reply to EOF.
async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Reply {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut msg = format!("{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n", method, path);
    for (name, value) in headers {
        msg.push_str(&format!("{}: {}\r\n", name, value));
    }
    msg.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    stream.write_all(msg.as_bytes()).await.expect("write head");
    stream.write_all(body).await.expect("write body");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read reply");
    parse_reply(&raw)
}

fn parse_reply(raw: &[u8]) -> Reply {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("reply must have a header block");
    let head = String::from_utf8_lossy(&raw[..split]);
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 =
        status_line.split_whitespace().nth(1).expect("status code").parse().expect("numeric");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Reply { status, headers, body }
}

struct Svc;

impl Module for Svc {
    fn id(&self) -> &str {
        "svc"
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
}

impl Service for Svc {
    fn endpoints(&self) -> Vec<Endpoint> {
        vec![
            Endpoint::new("GetPing", &[], |_ctx, _args| Box::pin(async { (200, Ok(vec![])) })),
            Endpoint::new("DoEcho", &[ParamKind::Str], |_ctx, args| {
                Box::pin(async move { (200, Ok(args)) })
            }),
            Endpoint::new("AddUser", &[ParamKind::Object], |_ctx, args| {
                Box::pin(async move { (200, Ok(args)) })
            }),
        ]
    }
}

fn base_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.port = 0;
    config.address = "127.0.0.1".to_string();
    // point the static set somewhere harmless and empty
    config.static_path = std::env::temp_dir().join("armature-no-static").display().to_string();
    config
}

async fn boot(config: ServerConfig) -> (Server, SocketAddr) {
    let server = Server::new(Some(config)).expect("server builds");
    server.register_module(Svc).expect("module registers");
    server.start().await.expect("server starts");
    let addr = server.local_addr().expect("bound address");
    (server, addr)
}

#[tokio::test]
async fn healthcheck_carries_trace_id() {
    let (server, addr) = boot(base_config()).await;

    let reply = request(addr, "GET", "/healthcheck", &[], b"").await;
    assert_eq!(reply.status, 200);
    assert!(reply.body.is_empty());
    let trace = reply.header("X-Trace-Id").expect("trace header present");
    assert_eq!(trace.len(), 24);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn versions_lists_registered_modules() {
    let (server, addr) = boot(base_config()).await;

    let reply = request(addr, "GET", "/versions", &[], b"").await;
    assert_eq!(reply.status, 200);
    let versions: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(versions["svc"], "1.0.0");

    let reply = request(addr, "GET", "/svc/1.0.0/ping", &[], b"").await;
    assert_eq!(reply.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn echo_decodes_typed_url_segment() {
    let (server, addr) = boot(base_config()).await;

    let reply = request(
        addr,
        "GET",
        "/svc/1.0.0/echo/hello",
        &[("Accept", "application/json")],
        b"",
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "\"hello\"");
    assert_eq!(reply.header("Content-Type"), Some("application/json"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let (server, addr) = boot(base_config()).await;

    assert_eq!(request(addr, "GET", "/nope", &[], b"").await.status, 404);
    assert_eq!(request(addr, "GET", "/svc/9.9.9/ping", &[], b"").await.status, 404);
    assert_eq!(request(addr, "POST", "/svc/1.0.0/ping", &[], b"").await.status, 404);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn csrf_required_rejects_missing_token() {
    let mut config = base_config();
    config.security.csrf_required = true;
    let (server, addr) = boot(config).await;

    // persist a session and present it without the CSRF header
    let store = server.session_store().expect("session store built");
    let session = Session::new("127.0.0.1", "pipeline-test");
    store.set(&session).await.unwrap();

    let reply = request(
        addr,
        "POST",
        "/svc/1.0.0/user",
        &[("X-Session-Id", session.id.as_str()), ("Content-Type", "application/json")],
        br#"{"name":"alice"}"#,
    )
    .await;
    assert_eq!(reply.status, 406);
    assert!(reply.text().contains("missing CSRF token"));

    // with the session's CSRF token the same request goes through
    let reply = request(
        addr,
        "POST",
        "/svc/1.0.0/user",
        &[
            ("X-Session-Id", session.id.as_str()),
            ("X-Csrf-Token", session.csrf_token.as_str()),
            ("Content-Type", "application/json"),
        ],
        br#"{"name":"alice"}"#,
    )
    .await;
    assert_eq!(reply.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn brute_force_limits_a_client() {
    let mut config = base_config();
    config.security.brute_force.enabled = true;
    config.security.brute_force.rate = 1.0;
    config.security.brute_force.capacity = 2;
    let (server, addr) = boot(config).await;

    assert_eq!(request(addr, "GET", "/svc/1.0.0/ping", &[], b"").await.status, 200);
    assert_eq!(request(addr, "GET", "/svc/1.0.0/ping", &[], b"").await.status, 200);

    let reply = request(addr, "GET", "/svc/1.0.0/ping", &[], b"").await;
    assert_eq!(reply.status, 429);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn honeypot_bans_the_caller() {
    let mut config = base_config();
    config.security.url_scanner = true;
    let (server, addr) = boot(config).await;

    let reply = request(addr, "GET", "/honeypot", &[], b"").await;
    assert_eq!(reply.status, 204);

    // every subsequent request from the same address is refused
    let reply = request(addr, "GET", "/svc/1.0.0/ping", &[], b"").await;
    assert_eq!(reply.status, 403);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn gzip_negotiated_when_accepted() {
    let (server, addr) = boot(base_config()).await;

    let reply = request(
        addr,
        "GET",
        "/svc/1.0.0/echo/compressed",
        &[("Accept-Encoding", "gzip")],
        b"",
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Encoding"), Some("gzip"));

    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(reply.body.as_slice());
    let mut text = String::new();
    decoder.read_to_string(&mut text).unwrap();
    assert_eq!(text, "\"compressed\"");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn json_array_body_distributes_parameters() {
    let (server, addr) = boot(base_config()).await;

    // single non-scalar parameter: the whole body decodes into it
    let reply = request(
        addr,
        "POST",
        "/svc/1.0.0/user",
        &[("Content-Type", "application/json")],
        br#"{"name":"bob"}"#,
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), r#"{"name":"bob"}"#);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_header_is_set() {
    let (server, addr) = boot(base_config()).await;

    let reply = request(addr, "GET", "/healthcheck", &[], b"").await;
    assert_eq!(reply.header("Server"), Some("Armature"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_completes_within_bound() {
    let (server, _addr) = boot(base_config()).await;

    let begin = std::time::Instant::now();
    server.stop().await.unwrap();
    assert!(begin.elapsed() < std::time::Duration::from_secs(11));
}
