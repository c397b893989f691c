//! Middleware chain
//!
//! A middleware is a function transformer: it takes the next handler and
//! returns a new one. The server composes a fixed, outer-first order (access
//! logging, panic recovery, monitoring, tracing, session recovery,
//! pre-security, cache headers, post-security, compression, brute force) and
//! appends user middleware; composition starts from the innermost and
//! proceeds outward, so for any request the pre-handler phases run in list
//! order and the post-handler phases unwind in reverse.

use super::context::Context;
use super::response::Encoding;
use super::stats::ServerStats;
use crate::security::{self, Collector, UrlScanner};
use crate::session::{Store, Token};
use anyhow::{anyhow, Result};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::Method;
use rand::RngCore;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Handler function used by middleware to chain-call all of them.
pub type Handler = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Middleware function signature.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Wrap `base` with `chain`, first element outermost.
pub fn compose(chain: &[Middleware], base: Handler) -> Handler {
    let mut handler = base;
    for middleware in chain.iter().rev() {
        handler = middleware(handler);
    }
    handler
}

/// Emit one Apache-style access line after the inner handler returns.
pub fn access_log() -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            Box::pin(async move {
                let host = ctx.remote_addr();
                let user = match ctx.account_id() {
                    id if id.is_empty() => "-".to_string(),
                    id => id,
                };
                let when = Utc::now().to_rfc3339();
                let line = format!("{} {}", ctx.request.method, ctx.request.path());

                let res = next(ctx.clone()).await;

                let (status, size) = {
                    let response = ctx.response();
                    (response.status, response.size)
                };
                let trace = ctx.trace_id().unwrap_or_default();
                log::info!("{} {} {} \"{}\" {} {} {}", host, user, when, line, status, size, trace);
                res
            })
        })
    })
}

/// Catch panics from anything further in, log them and surface a recovered
/// error instead of unwinding into the HTTP engine.
pub fn recover() -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            Box::pin(async move {
                match AssertUnwindSafe(next(ctx.clone())).catch_unwind().await {
                    Ok(res) => res,
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        log::debug!("[RECOVERED] {}", msg);
                        if !ctx.response().committed {
                            ctx.response().write_header(500);
                        }
                        Err(anyhow!("internal server error"))
                    }
                }
            })
        })
    })
}

/// Maintain the in-flight gauge and per-status counters.
pub fn monitoring(stats: Arc<ServerStats>) -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        let stats = stats.clone();
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            let stats = stats.clone();
            Box::pin(async move {
                stats.request_started();
                let res = next(ctx.clone()).await;
                stats.request_finished(ctx.response().status, res.is_err());
                res
            })
        })
    })
}

/// Propagate or synthesize the trace id so callers can follow a request
/// across services.
pub fn trace() -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            Box::pin(async move {
                let config = ctx.config.clone();
                if config.enable_tracing {
                    let header = match config.trace_header.as_str() {
                        "" => "X-Trace-Id",
                        name => name,
                    };
                    let incoming = ctx.request.header(header).unwrap_or("").to_string();

                    if config.trace_required && incoming.is_empty() {
                        ctx.response().write_header(400);
                        return Err(anyhow!("trace token required"));
                    }

                    let trace_id = if incoming.is_empty() {
                        let mut buf = [0u8; 12];
                        rand::thread_rng().fill_bytes(&mut buf);
                        hex::encode(buf)
                    } else {
                        incoming
                    };
                    ctx.response().set_header(header, &trace_id);
                    ctx.set_trace_id(trace_id);
                }
                next(ctx).await
            })
        })
    })
}

/// Restore the session named by the configured cookie, or the session header
/// when no cookie is present.
pub fn session(store: Arc<dyn Store>) -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        let store = store.clone();
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            let store = store.clone();
            Box::pin(async move {
                if ctx.session().is_none() {
                    let config = &ctx.config.session;
                    let raw = cookie_value(&ctx, &config.cookie_name)
                        .filter(|_| config.use_cookie)
                        .or_else(|| {
                            ctx.request.header(&config.header_name).map(str::to_string)
                        });
                    if let Some(raw) = raw {
                        let token = Token::from_string(raw);
                        if token.is_valid() {
                            match store.get(&token).await {
                                Ok(found) => ctx.set_session(found),
                                Err(err) => log::warn!("session restore failed: {}", err),
                            }
                        }
                    }
                }
                next(ctx).await
            })
        })
    })
}

fn cookie_value(ctx: &Context, name: &str) -> Option<String> {
    let header = ctx.request.header("Cookie")?;
    for pair in header.split(';') {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

/// All pre-handler security checks: IP lists, URL scanning, CSRF, DNT, and
/// the advertised security headers.
pub fn pre_security(scanner: Option<Arc<UrlScanner>>) -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        let scanner = scanner.clone();
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            let scanner = scanner.clone();
            Box::pin(async move {
                let cfg = ctx.config.security.clone();
                let addr = ctx.remote_addr();
                let method = ctx.request.method.clone();

                if !cfg.whitelist.is_empty() {
                    let list: Vec<&str> = cfg.whitelist.split(',').map(str::trim).collect();
                    if !security::ip_in_range(&addr, &list, cfg.allow_private) {
                        ctx.response().write_header(403);
                        return Err(anyhow!("{:?} is not whitelisted", addr));
                    }
                }
                if !cfg.blacklist.is_empty() {
                    let list: Vec<&str> = cfg.blacklist.split(',').map(str::trim).collect();
                    if security::matches(&addr, &list) {
                        ctx.response().write_header(403);
                        return Err(anyhow!("{:?} is blacklisted", addr));
                    }
                }

                if cfg.url_scanner {
                    if let Some(scanner) = &scanner {
                        if scanner.is_crawler(ctx.request.path(), &addr, &ctx.user_agent()) {
                            ctx.response().write_header(403);
                            return Err(anyhow!("your IP address was banned"));
                        }
                    }
                }

                if cfg.csrf_required
                    && ctx.authenticated()
                    && (method == Method::POST || method == Method::PUT || method == Method::PATCH)
                {
                    let sent = ctx.request.header("X-Csrf-Token").unwrap_or("");
                    let expected =
                        ctx.session().map(|s| s.csrf_token.as_str().to_string()).unwrap_or_default();
                    if sent.is_empty() {
                        ctx.response().write_header(406);
                        return Err(anyhow!("missing CSRF token"));
                    }
                    if sent != expected {
                        ctx.response().write_header(406);
                        return Err(anyhow!("invalid CSRF token"));
                    }
                }

                if cfg.dnt && ctx.request.header("DNT") == Some("1") {
                    ctx.set_dnt(true);
                    let tk = if ctx.consent() { "C" } else { "N" };
                    ctx.response().set_header("Tk", tk);
                }

                {
                    let mut res = ctx.response();
                    if cfg.prevent_iframing {
                        res.set_header("X-Frame-Options", "SAMEORIGIN");
                    }
                    if cfg.xss_protection {
                        res.set_header("X-Xss-Protection", "1; mode=block");
                    }
                    if cfg.hsts && !cfg.hsts_directives.is_empty() {
                        res.set_header("Strict-Transport-Security", &cfg.hsts_directives);
                    }
                    if !cfg.csp.is_empty() {
                        res.set_header("Content-Security-Policy", &cfg.csp);
                    }
                    if cfg.content_type_options {
                        res.set_header("X-Content-Type-Options", "nosniff");
                    }
                }

                next(ctx).await
            })
        })
    })
}

/// Cache headers for static resources.
pub fn cache_headers() -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            Box::pin(async move { next(ctx).await })
        })
    })
}

/// CORS response headers, echoing the request origin when the configured
/// comma-separated allow-list contains it.
pub fn post_security() -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            Box::pin(async move {
                let cfg = ctx.config.security.clone();
                let origin = ctx.request.header("Origin").unwrap_or("").to_string();
                let is_options = ctx.request.method == Method::OPTIONS;
                let requested_method =
                    ctx.request.header("Access-Control-Request-Method").unwrap_or("").to_string();

                {
                    let mut res = ctx.response();
                    if !cfg.cors_origin.is_empty() {
                        res.set_header("Access-Control-Allow-Credentials", "true");
                        if cfg.cors_origin == "*" {
                            res.set_header("Access-Control-Allow-Origin", &cfg.cors_origin);
                        } else if cfg.cors_origin.contains(',') && cfg.cors_origin.contains(&origin)
                        {
                            res.set_header("Access-Control-Allow-Origin", &origin);
                            res.set_header("Vary", "Origin");
                        } else {
                            res.set_header("Access-Control-Allow-Origin", &origin);
                        }
                    }
                    if is_options && !cfg.cors_expose.is_empty() {
                        res.set_header("Access-Control-Expose-Headers", &cfg.cors_expose);
                    }
                    if is_options && !cfg.cors_methods.is_empty() {
                        if cfg.cors_methods == "*" {
                            res.set_header("Access-Control-Allow-Methods", &cfg.cors_methods);
                        } else if cfg
                            .cors_methods
                            .to_lowercase()
                            .contains(&requested_method.to_lowercase())
                        {
                            res.set_header("Access-Control-Allow-Methods", &requested_method);
                        }
                    }
                    if is_options && !cfg.cors_headers.is_empty() {
                        res.set_header("Access-Control-Allow-Headers", &cfg.cors_headers);
                    }
                }

                next(ctx).await
            })
        })
    })
}

/// Compress the response when the client accepts br, gzip or deflate. The
/// wrapper is finished when the response is finalized, after the inner
/// handler returns.
pub fn compress() -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            Box::pin(async move {
                let disabled = ctx.request.header("X-No-Compression").is_some();
                if ctx.config.use_compression && !disabled {
                    let accepted = ctx.request.header("Accept-Encoding").unwrap_or("");
                    let encoding = if accepted.contains("br") {
                        Some(Encoding::Brotli)
                    } else if accepted.contains("gzip") {
                        Some(Encoding::Gzip)
                    } else if accepted.contains("deflate") {
                        Some(Encoding::Deflate)
                    } else {
                        None
                    };
                    if let Some(encoding) = encoding {
                        ctx.response().set_compressor(encoding);
                    }
                }
                next(ctx).await
            })
        })
    })
}

/// Charge one token per request to the caller's bucket; an empty allowance
/// is a 429.
pub fn brute_force(collector: Arc<Collector>) -> Middleware {
    Arc::new(move |next: Handler| -> Handler {
        let collector = collector.clone();
        Arc::new(move |ctx: Arc<Context>| {
            let next = next.clone();
            let collector = collector.clone();
            Box::pin(async move {
                let key = match ctx.session() {
                    Some(session) => session.id.as_str().to_string(),
                    None => ctx.remote_addr(),
                };
                if collector.add(&key, 1) == 0 {
                    ctx.response().write_header(429);
                    return Err(anyhow!("too many requests"));
                }
                next(ctx).await
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::context::test_support::context;

    fn base_counting(order: Arc<std::sync::Mutex<Vec<&'static str>>>) -> Handler {
        Arc::new(move |_ctx| {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push("base");
                Ok(())
            })
        })
    }

    fn tagging(tag: &'static str, order: Arc<std::sync::Mutex<Vec<&'static str>>>) -> Middleware {
        Arc::new(move |next: Handler| -> Handler {
            let order = order.clone();
            Arc::new(move |ctx| {
                let next = next.clone();
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(tag);
                    next(ctx).await
                })
            })
        })
    }

    #[tokio::test]
    async fn compose_is_outer_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain =
            vec![tagging("outer", order.clone()), tagging("inner", order.clone())];
        let handler = compose(&chain, base_counting(order.clone()));

        let ctx = Arc::new(context(Method::GET, "/", &[], b""));
        handler(ctx).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "base"]);
    }

    #[tokio::test]
    async fn recover_turns_panics_into_errors() {
        let panicking: Handler = Arc::new(|_ctx| Box::pin(async { panic!("kaboom") }));
        let handler = compose(&[recover()], panicking);

        let ctx = Arc::new(context(Method::GET, "/", &[], b""));
        let res = handler(ctx.clone()).await;
        assert!(res.is_err());
        assert_eq!(ctx.response().status, 500);
    }

    #[tokio::test]
    async fn trace_synthesizes_an_id() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[trace()], noop);

        let ctx = Arc::new(context(Method::GET, "/", &[], b""));
        handler(ctx.clone()).await.unwrap();

        let id = ctx.trace_id().expect("trace id set");
        assert_eq!(id.len(), 24);
        assert_eq!(ctx.response().header("X-Trace-Id"), Some(id.as_str()));
    }

    #[tokio::test]
    async fn trace_propagates_incoming_id() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[trace()], noop);

        let ctx = Arc::new(context(
            Method::GET,
            "/",
            &[("X-Trace-Id", "abcdefabcdefabcdefabcdef")],
            b"",
        ));
        handler(ctx.clone()).await.unwrap();
        assert_eq!(ctx.trace_id().as_deref(), Some("abcdefabcdefabcdefabcdef"));
    }

    #[tokio::test]
    async fn trace_required_rejects_missing_header() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[trace()], noop);

        let ctx = context(Method::GET, "/", &[], b"");
        let mut config = (*ctx.config).clone();
        config.trace_required = true;
        let ctx = Arc::new(crate::server::Context::new(ctx.request.clone(), Arc::new(config)));

        assert!(handler(ctx.clone()).await.is_err());
        assert_eq!(ctx.response().status, 400);
    }

    #[tokio::test]
    async fn pre_security_sets_advertised_headers() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[pre_security(None)], noop);

        let ctx = Arc::new(context(Method::GET, "/", &[("DNT", "1")], b""));
        handler(ctx.clone()).await.unwrap();

        let res = ctx.response();
        assert_eq!(res.header("X-Frame-Options"), Some("SAMEORIGIN"));
        assert_eq!(res.header("X-Xss-Protection"), Some("1; mode=block"));
        assert_eq!(res.header("X-Content-Type-Options"), Some("nosniff"));
        assert_eq!(res.header("Content-Security-Policy"), Some("default-src 'self'"));
        assert_eq!(res.header("Tk"), Some("N"));
        drop(res);
        assert!(ctx.dnt());
    }

    #[tokio::test]
    async fn csrf_missing_token_is_406() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[pre_security(None)], noop);

        let ctx = context(Method::POST, "/svc/1.0.0/user", &[], b"{}");
        let mut config = (*ctx.config).clone();
        config.security.csrf_required = true;
        let ctx = Arc::new(crate::server::Context::new(ctx.request.clone(), Arc::new(config)));
        ctx.set_session(Some(crate::session::Session::new("198.51.100.20", "agent")));

        let err = handler(ctx.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "missing CSRF token");
        assert_eq!(ctx.response().status, 406);
    }

    #[tokio::test]
    async fn csrf_valid_token_passes() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[pre_security(None)], noop);

        let session = crate::session::Session::new("198.51.100.20", "agent");
        let csrf = session.csrf_token.as_str().to_string();

        let ctx = context(Method::POST, "/svc/1.0.0/user", &[], b"{}");
        let mut config = (*ctx.config).clone();
        config.security.csrf_required = true;
        let mut request = ctx.request.clone();
        request.headers.insert("X-Csrf-Token", csrf.parse().unwrap());
        let ctx = Arc::new(crate::server::Context::new(request, Arc::new(config)));
        ctx.set_session(Some(session));

        assert!(handler(ctx).await.is_ok());
    }

    #[tokio::test]
    async fn blacklisted_ip_is_rejected() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[pre_security(None)], noop);

        let ctx = context(Method::GET, "/", &[], b"");
        let mut config = (*ctx.config).clone();
        config.security.blacklist = "198.51.100.0/24".to_string();
        let ctx = Arc::new(crate::server::Context::new(ctx.request.clone(), Arc::new(config)));

        assert!(handler(ctx.clone()).await.is_err());
        assert_eq!(ctx.response().status, 403);
    }

    #[tokio::test]
    async fn brute_force_rejects_after_capacity() {
        let collector = Collector::new(1.0, 2);
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[brute_force(collector.clone())], noop);

        let ctx = Arc::new(context(Method::POST, "/login", &[], b""));
        assert!(handler(ctx.clone()).await.is_ok());
        assert!(handler(ctx.clone()).await.is_ok());

        let res = handler(ctx.clone()).await;
        assert!(res.is_err());
        assert_eq!(ctx.response().status, 429);
        collector.stop();
    }

    #[tokio::test]
    async fn compress_negotiates_gzip() {
        let writing: Handler = Arc::new(|ctx: Arc<Context>| {
            Box::pin(async move {
                ctx.response().write(b"hello hello hello")?;
                Ok(())
            })
        });
        let handler = compose(&[compress()], writing);

        let ctx = Arc::new(context(Method::GET, "/", &[("Accept-Encoding", "gzip, br")], b""));
        handler(ctx.clone()).await.unwrap();

        let res = std::mem::take(&mut *ctx.response());
        assert_eq!(res.encoding(), Encoding::Brotli);
    }

    #[tokio::test]
    async fn no_compression_header_disables_it() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[compress()], noop);

        let ctx = Arc::new(context(
            Method::GET,
            "/",
            &[("Accept-Encoding", "gzip"), ("X-No-Compression", "1")],
            b"",
        ));
        handler(ctx.clone()).await.unwrap();
        assert_eq!(ctx.response().encoding(), Encoding::Identity);
    }

    #[tokio::test]
    async fn session_restored_from_header() {
        use crate::cache::MemoryCache;
        use crate::session::{CacheStore, Session, SessionConfig};

        let store = Arc::new(CacheStore::memory(
            Arc::new(MemoryCache::new()),
            &SessionConfig::default(),
        ));
        let session_obj = Session::new("198.51.100.20", "agent");
        store.set(&session_obj).await.unwrap();

        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[session(store)], noop);

        let ctx = Arc::new(context(
            Method::GET,
            "/",
            &[("X-Session-Id", session_obj.id.as_str())],
            b"",
        ));
        handler(ctx.clone()).await.unwrap();
        assert_eq!(ctx.session().map(|s| s.id), Some(session_obj.id));
    }

    #[tokio::test]
    async fn invalid_session_token_is_ignored() {
        use crate::cache::MemoryCache;
        use crate::session::{CacheStore, SessionConfig};

        let store = Arc::new(CacheStore::memory(
            Arc::new(MemoryCache::new()),
            &SessionConfig::default(),
        ));
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[session(store)], noop);

        let ctx = Arc::new(context(
            Method::GET,
            "/",
            &[("X-Session-Id", "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")],
            b"",
        ));
        handler(ctx.clone()).await.unwrap();
        assert!(ctx.session().is_none());
    }

    #[tokio::test]
    async fn cors_echoes_allowed_origin() {
        let noop: Handler = Arc::new(|_ctx| Box::pin(async { Ok(()) }));
        let handler = compose(&[post_security()], noop);

        let ctx = context(
            Method::OPTIONS,
            "/svc/1.0.0/user",
            &[
                ("Origin", "https://app.example.com"),
                ("Access-Control-Request-Method", "POST"),
            ],
            b"",
        );
        let mut config = (*ctx.config).clone();
        config.security.cors_origin =
            "https://app.example.com,https://admin.example.com".to_string();
        config.security.cors_methods = "GET,POST".to_string();
        let ctx = Arc::new(crate::server::Context::new(ctx.request.clone(), Arc::new(config)));

        handler(ctx.clone()).await.unwrap();
        let res = ctx.response();
        assert_eq!(res.header("Access-Control-Allow-Origin"), Some("https://app.example.com"));
        assert_eq!(res.header("Vary"), Some("Origin"));
        assert_eq!(res.header("Access-Control-Allow-Methods"), Some("POST"));
        assert_eq!(res.header("Access-Control-Allow-Credentials"), Some("true"));
    }
}
