//! HTTP(S) application server
//!
//! The composition root: owns the route table, codec registry, middleware
//! chain, security state, session store and TLS provider, accepts
//! connections on a background task, and drains active requests on stop.
//!
//! Built-in endpoints: `/healthcheck` (200), `/versions` (module→version
//! JSON), `/honeypot` (bans the caller, 204), plus `/robots.txt` synthesized
//! with a honeypot disallow stanza when URL scanning is on.

pub mod codec;
pub mod config;
pub mod context;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod stats;
pub mod tls;

pub use codec::{Body, CodecRegistry};
pub use config::{HttpsConfig, SecurityConfig, ServerConfig};
pub use context::{Context, RequestInfo};
pub use middleware::{Handler, Middleware};
pub use response::{Encoding, Response};
pub use routes::{dispatch, Endpoint, Module, ParamKind, RouteTable, Service};
pub use stats::ServerStats;
pub use tls::CertProvider;

use crate::cache::{Cache, MemoryCache};
use crate::security::{Collector, UrlScanner};
use crate::session::{CacheStore, Store};
use crate::{Error, Result};
use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

const HEALTH_CHECK_PATH: &str = "/healthcheck";
const HONEY_POT_PATH: &str = "/honeypot";
const VERSION_LIST_PATH: &str = "/versions";
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// How long `stop` waits for in-flight requests before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// In-flight request counter `stop` drains against.
#[derive(Default)]
struct ActiveRequests {
    count: AtomicUsize,
    drained: Notify,
}

impl ActiveRequests {
    fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.clone())
    }

    async fn wait_drained(&self) {
        while self.count.load(Ordering::SeqCst) != 0 {
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ActiveGuard(Arc<ActiveRequests>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// The server and everything it owns.
pub struct Server {
    inner: Arc<ServerInner>,
    listener_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

struct ServerInner {
    config: Arc<ServerConfig>,
    routes: RwLock<RouteTable>,
    codecs: Arc<CodecRegistry>,
    scanner: Arc<UrlScanner>,
    collector: Mutex<Option<Arc<Collector>>>,
    cache: Mutex<Option<Arc<dyn Cache>>>,
    session_store: Mutex<Option<Arc<dyn Store>>>,
    stats: Arc<ServerStats>,
    static_files: RwLock<HashSet<String>>,
    chain: RwLock<Vec<Middleware>>,
    user_middleware: Mutex<Vec<Middleware>>,
    cert_provider: Mutex<Option<Arc<CertProvider>>>,
    active: Arc<ActiveRequests>,
    shutdown: Arc<Notify>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a server; `None` uses the default configuration.
    pub fn new(config: Option<ServerConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();
        config.validate()?;

        let scanner = Arc::new(UrlScanner::new(config.security.ban_duration));
        Ok(Self {
            inner: Arc::new(ServerInner {
                config: Arc::new(config),
                routes: RwLock::new(RouteTable::new()),
                codecs: Arc::new(CodecRegistry::new()),
                scanner,
                collector: Mutex::new(None),
                cache: Mutex::new(None),
                session_store: Mutex::new(None),
                stats: Arc::new(ServerStats::new()),
                static_files: RwLock::new(HashSet::new()),
                chain: RwLock::new(Vec::new()),
                user_middleware: Mutex::new(Vec::new()),
                cert_provider: Mutex::new(None),
                active: Arc::new(ActiveRequests::default()),
                shutdown: Arc::new(Notify::new()),
                local_addr: Mutex::new(None),
            }),
            listener_task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Create a server configured from the settings registry.
    pub fn from_settings(settings: &crate::Settings) -> Result<Self> {
        Self::new(Some(ServerConfig::from_settings(settings)))
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.inner.config.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.inner.stats.clone()
    }

    /// Cache driver backing sessions (and anything else that wants it).
    pub fn set_cache(&self, cache: Arc<dyn Cache>) {
        *self.inner.cache.lock().expect("cache slot lock poisoned") = Some(cache);
    }

    /// Register a service module's endpoints.
    pub fn register_module<S: Service>(&self, service: S) -> Result<()> {
        self.inner.routes.write().expect("route table lock poisoned").register(&service)
    }

    /// Remove a service by its `id-version` key.
    pub fn unregister_module(&self, service_key: &str) {
        self.inner.routes.write().expect("route table lock poisoned").unregister(service_key);
    }

    /// Append user middleware, run innermost (after the built-in chain).
    pub fn use_middleware(&self, middleware: Middleware) {
        self.inner
            .user_middleware
            .lock()
            .expect("user middleware lock poisoned")
            .push(middleware);
    }

    /// Compose the pipeline, snapshot the static file set, resolve the TLS
    /// provider and launch the listener.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let config = inner.config.clone();

        inner.build_session_store();
        inner.build_chain();
        inner.read_static_files();

        let addr: SocketAddr = if config.https.enabled {
            let provider = Arc::new(inner.resolve_cert_provider()?);
            *inner.cert_provider.lock().expect("cert provider lock poisoned") =
                Some(provider.clone());
            format!("{}:{}", config.address, config.https.port)
        } else {
            format!("{}:{}", config.address, config.port)
        }
        .parse()
        .map_err(|e| Error::Http(format!("invalid bind address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Http(format!("cannot bind {}: {}", addr, e)))?;
        let bound = listener.local_addr().map_err(|e| Error::Http(e.to_string()))?;
        *inner.local_addr.lock().expect("local addr lock poisoned") = Some(bound);
        log::info!("{} listening on {}", config.name, bound);

        let tls_config = inner
            .cert_provider
            .lock()
            .expect("cert provider lock poisoned")
            .as_ref()
            .map(|provider| provider.server_config());
        let acceptor = tls_config.map(tokio_rustls::TlsAcceptor::from);

        let accept_inner = inner.clone();
        let shutdown = inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                log::warn!("accept failed: {}", err);
                                continue;
                            }
                        };
                        let inner = accept_inner.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            inner.serve_connection(stream, peer, acceptor).await;
                        });
                    }
                }
            }
        });
        *self.listener_task.lock().expect("listener task lock poisoned") = Some(task);
        Ok(())
    }

    /// Stop accepting, drain active requests, give up after ten seconds.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.notify_waiters();
        if let Some(task) = self.listener_task.lock().expect("listener task lock poisoned").take() {
            task.abort();
        }

        match tokio::time::timeout(DRAIN_TIMEOUT, self.inner.active.wait_drained()).await {
            Ok(()) => log::info!("server stopped gracefully"),
            Err(_) => log::warn!("server killed (timed out)"),
        }

        if let Some(collector) = self.inner.collector.lock().expect("collector lock poisoned").take()
        {
            collector.stop();
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            self.stop().await?;
        }
        self.start().await
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// The bound socket address once started; useful with an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("local addr lock poisoned")
    }

    /// The session store, available once started when sessions are enabled.
    pub fn session_store(&self) -> Option<Arc<dyn Store>> {
        self.inner.session_store.lock().expect("session store lock poisoned").clone()
    }
}

impl ServerInner {
    fn build_session_store(&self) {
        if !self.config.session.enabled {
            return;
        }
        let mut slot = self.session_store.lock().expect("session store lock poisoned");
        if slot.is_some() {
            return;
        }
        let cache = self.cache.lock().expect("cache slot lock poisoned").clone();
        let store: Arc<dyn Store> = match (self.config.session.store.as_str(), cache) {
            ("mem", _) | (_, None) => {
                if self.config.session.store != "mem" {
                    log::warn!(
                        "no cache driver supplied for session store {:?}, using memory",
                        self.config.session.store
                    );
                }
                Arc::new(CacheStore::memory(Arc::new(MemoryCache::new()), &self.config.session))
            }
            (_, Some(cache)) => Arc::new(CacheStore::redis(cache, &self.config.session)),
        };
        *slot = Some(store);
    }

    /// Fixed order, outer first; user middleware goes innermost.
    fn build_chain(&self) {
        let mut chain: Vec<Middleware> = vec![
            middleware::access_log(),
            middleware::recover(),
            middleware::monitoring(self.stats.clone()),
            middleware::trace(),
        ];
        if let Some(store) = self.session_store.lock().expect("session store lock poisoned").clone()
        {
            chain.push(middleware::session(store));
        }
        chain.push(middleware::pre_security(Some(self.scanner.clone())));
        chain.push(middleware::cache_headers());
        chain.push(middleware::post_security());
        chain.push(middleware::compress());

        if self.config.security.brute_force.enabled {
            let collector = Collector::new(
                self.config.security.brute_force.rate,
                self.config.security.brute_force.capacity,
            );
            *self.collector.lock().expect("collector lock poisoned") = Some(collector.clone());
            chain.push(middleware::brute_force(collector));
        }

        chain.extend(self.user_middleware.lock().expect("user middleware lock poisoned").clone());
        *self.chain.write().expect("middleware chain lock poisoned") = chain;
    }

    /// Snapshot of the files under the static path; `/robots.txt` is always
    /// a member.
    fn read_static_files(&self) {
        let mut assets = HashSet::new();
        collect_files(Path::new(&self.config.static_path), Path::new(&self.config.static_path), &mut assets);
        assets.insert("/robots.txt".to_string());
        *self.static_files.write().expect("static set lock poisoned") = assets;
    }

    /// Pick the certificate provider per the HTTPS configuration, testing
    /// external files first.
    fn resolve_cert_provider(&self) -> Result<CertProvider> {
        let https = &self.config.https;

        if (https.cert.is_empty() || https.key.is_empty()) && !https.auto {
            return Err(Error::Tls(
                "you must provide a TLS certificate, enable auto certificates, or start in HTTP"
                    .to_string(),
            ));
        }

        let external_ok = if !https.cert.is_empty() && !https.key.is_empty() {
            tls::test_key_pair(&https.cert, &https.key, https.auto)
                .map_err(|e| Error::Tls(e.to_string()))?
        } else {
            false
        };

        if external_ok {
            return Ok(CertProvider::external(&https.cert, &https.key));
        }
        match https.cert_type.as_str() {
            "self-signed" => Ok(CertProvider::self_signed()),
            "lets-encrypt" | "auto" => {
                CertProvider::acme(vec![self.config.host.clone()])
                    .map_err(|e| Error::Tls(e.to_string()))
            }
            other => Err(Error::Tls(format!("invalid certificate provider: {}", other))),
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
    ) {
        let mut builder = http1::Builder::new();
        builder.timer(TokioTimer::new());
        if !self.config.read_timeout.is_zero() {
            builder.header_read_timeout(self.config.read_timeout);
        }

        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let inner = self.clone();
            async move { Ok::<_, std::convert::Infallible>(inner.handle(req, peer).await) }
        });

        let served = match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    builder.serve_connection(TokioIo::new(tls_stream), service).await
                }
                Err(err) => {
                    log::debug!("tls handshake with {} failed: {}", peer, err);
                    return;
                }
            },
            None => builder.serve_connection(TokioIo::new(stream), service).await,
        };
        if let Err(err) = served {
            log::debug!("connection from {} ended with error: {}", peer, err);
        }
    }

    /// Route one request through the pipeline and produce the wire response.
    async fn handle(
        self: Arc<Self>,
        req: hyper::Request<Incoming>,
        peer: SocketAddr,
    ) -> hyper::Response<Full<Bytes>> {
        let _guard = self.active.enter();

        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.config.post_max_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return plain_response(400, "request body too large or unreadable"),
        };

        let request = RequestInfo {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers,
            body,
            peer: Some(peer),
        };
        let ctx = Arc::new(Context::new(request, self.config.clone()));
        let path = ctx.request.path().to_string();

        // ACME challenges answer before anything else so orders can verify
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            let provider = self.cert_provider.lock().expect("cert provider lock poisoned").clone();
            if let Some(key_auth) = provider.and_then(|p| p.http_challenge(token)) {
                return plain_response(200, &key_auth);
            }
        }

        let Some((base, chained)) = self.base_handler(&ctx, &path) else {
            return not_found();
        };

        let handler = if chained {
            let chain = self.chain.read().expect("middleware chain lock poisoned").clone();
            middleware::compose(&chain, base)
        } else {
            base
        };
        let outcome = handler(ctx.clone()).await;

        if let Err(err) = outcome {
            let committed = ctx.response().committed;
            let mut res = ctx.response();
            if !committed {
                res.write_header(500);
            }
            let _ = res.write(err.to_string().as_bytes());
        }
        self.into_wire(ctx)
    }

    /// Resolve the innermost handler for a path, or `None` for a plain 404.
    /// The flag says whether the handler runs through the middleware chain
    /// (CORS preflights answer through post-security alone).
    fn base_handler(self: &Arc<Self>, ctx: &Arc<Context>, path: &str) -> Option<(Handler, bool)> {
        match path {
            HONEY_POT_PATH => {
                let scanner = self.scanner.clone();
                let handler: Handler = Arc::new(move |ctx: Arc<Context>| {
                    let scanner = scanner.clone();
                    Box::pin(async move {
                        scanner.ban(&ctx.remote_addr());
                        ctx.response().write_header(204);
                        Ok(())
                    })
                });
                Some((handler, false))
            }
            HEALTH_CHECK_PATH => {
                let handler: Handler = Arc::new(|ctx: Arc<Context>| {
                    Box::pin(async move {
                        ctx.response().write_header(200);
                        Ok(())
                    })
                });
                Some((handler, true))
            }
            VERSION_LIST_PATH => {
                let versions =
                    self.routes.read().expect("route table lock poisoned").versions();
                let handler: Handler = Arc::new(move |ctx: Arc<Context>| {
                    let versions = versions.clone();
                    Box::pin(async move {
                        let data = serde_json::to_vec_pretty(&versions)?;
                        let mut res = ctx.response();
                        res.set_header("Content-Type", "application/json");
                        res.write_header(200);
                        res.write(&data)?;
                        Ok(())
                    })
                });
                Some((handler, true))
            }
            _ => {
                if self.static_files.read().expect("static set lock poisoned").contains(path) {
                    return Some((self.static_file_handler(), true));
                }
                self.route_handler(ctx, path)
            }
        }
    }

    fn route_handler(self: &Arc<Self>, ctx: &Arc<Context>, path: &str) -> Option<(Handler, bool)> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() < 4 {
            return None;
        }
        let service_key = format!("{}-{}", parts[1], parts[2]).to_lowercase();
        let name = parts[3].to_string();

        let routes = self.routes.read().expect("route table lock poisoned");

        if ctx.request.method == Method::OPTIONS {
            let requested =
                ctx.request.header("Access-Control-Request-Method").unwrap_or("").to_string();
            if !routes.has_handler(&service_key, &requested, &name) {
                return None;
            }
            // preflight answers through post-security alone
            let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
            let chain = [middleware::post_security()];
            return Some((middleware::compose(&chain, noop), false));
        }

        let entry = routes.lookup(&service_key, &ctx.request.method, &name)?;
        let codecs = self.codecs.clone();
        let handler: Handler = Arc::new(move |ctx: Arc<Context>| {
            let entry = entry.clone();
            let codecs = codecs.clone();
            Box::pin(async move { dispatch(entry, ctx, codecs).await })
        });
        Some((handler, true))
    }

    fn static_file_handler(self: &Arc<Self>) -> Handler {
        let static_path = self.config.static_path.clone();
        let scanner_enabled = self.config.security.url_scanner;
        Arc::new(move |ctx: Arc<Context>| {
            let static_path = static_path.clone();
            Box::pin(async move {
                let rel = ctx.request.path().trim_start_matches('/');
                let full = Path::new(&static_path).join(rel);

                if let Ok(data) = tokio::fs::read(&full).await {
                    let mime = mime_by_extension(&full);
                    let mut res = ctx.response();
                    res.set_header("Content-Type", mime);
                    res.write(&data)?;
                }

                if scanner_enabled && ctx.request.path().ends_with("robots.txt") {
                    ctx.response().write(
                        format!("\n\nUser-agent: *\nDisallow: {}\n", HONEY_POT_PATH).as_bytes(),
                    )?;
                }

                if ctx.response().size == 0 {
                    ctx.response().write_header(404);
                }
                Ok(())
            })
        })
    }

    /// Turn the buffered response into the hyper reply.
    fn into_wire(&self, ctx: Arc<Context>) -> hyper::Response<Full<Bytes>> {
        let response = std::mem::take(&mut *ctx.response());
        let (status, headers, body) = response.finish();

        let mut wire = hyper::Response::builder().status(status);
        if let Some(header_map) = wire.headers_mut() {
            *header_map = headers;
            header_map.insert(
                "Server",
                self.config.name.parse().unwrap_or_else(|_| {
                    http::HeaderValue::from_static("Armature")
                }),
            );
        }
        wire.body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| plain_response(500, "response build error"))
    }
}

fn plain_response(status: u16, body: &str) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.as_bytes().to_vec())))
        .expect("static response must build")
}

fn not_found() -> hyper::Response<Full<Bytes>> {
    plain_response(404, "404 page not found")
}

/// Walk a directory, collecting web paths relative to `base`. Dotfiles and
/// dot-directories are skipped.
fn collect_files(base: &Path, dir: &Path, out: &mut HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out);
        } else if let Ok(rel) = path.strip_prefix(base) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            out.insert(format!("/{}", rel));
        }
    }
}

/// MIME type by file extension; the short list the asset pipeline serves.
fn mime_by_extension(path: &PathBuf) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        "xml" => "application/xml",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
