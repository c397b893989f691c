//! Route registry
//!
//! Service modules register endpoints by name; the registry derives the HTTP
//! method from the name prefix, builds the REST path, and rejects
//! conflicting handlers at registration time. Endpoints are explicit
//! descriptors: the declared parameter kinds drive URL-segment parsing and
//! body decoding, and the handler itself is an async closure over the
//! request context and the decoded arguments.
//!
//! Naming contract (mirrored in the endpoint path):
//!
//! | Prefix | Method |
//! |---|---|
//! | `Get` | GET |
//! | `Add`, `Create` | POST |
//! | `Edit`, `Update` | PUT |
//! | `Delete`, `Remove` | DELETE |
//! | `Do`, other | GET, or POST when a parameter is not a scalar |

use super::codec::{Body, CodecRegistry};
use super::context::Context;
use anyhow::Result;
use futures_util::future::BoxFuture;
use http::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A registration-time unit identified by `(id, version)`.
pub trait Module: Send + Sync {
    fn id(&self) -> &str;
    fn version(&self) -> &str;
}

/// A module that exposes HTTP endpoints.
pub trait Service: Module {
    fn endpoints(&self) -> Vec<Endpoint>;
}

/// Declared kind of an endpoint parameter after the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Bool,
    /// Any structured value; decoded from the request body.
    Object,
}

impl ParamKind {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, ParamKind::Object)
    }

    /// Segment name used in the endpoint path (`/:string`, `/:int`, ...).
    fn segment(&self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Int => "int",
            ParamKind::Bool => "bool",
            ParamKind::Object => "object",
        }
    }
}

/// What an endpoint handler returns: the HTTP status plus either the values
/// to encode into the body or an error to report.
pub type HandlerResult = (u16, Result<Vec<Body>>);

/// Boxed endpoint handler.
pub type HandlerFn =
    Arc<dyn Fn(Arc<Context>, Vec<Body>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Endpoint descriptor a service hands to the registry.
#[derive(Clone)]
pub struct Endpoint {
    /// Source method name, prefix included ("GetStatus", "AddUser").
    pub name: String,
    /// Parameter kinds after the context parameter.
    pub params: Vec<ParamKind>,
    /// Explicit HTTP method override; normally derived from the name.
    pub method_override: Option<Method>,
    pub handler: HandlerFn,
}

impl Endpoint {
    pub fn new<F>(name: impl Into<String>, params: &[ParamKind], handler: F) -> Self
    where
        F: Fn(Arc<Context>, Vec<Body>) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            params: params.to_vec(),
            method_override: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method_override = Some(method);
        self
    }
}

/// A resolved route.
pub struct RouteEntry {
    /// Trimmed, lowercased endpoint name.
    pub name: String,
    pub http_method: Method,
    /// `/{id}/{version}/{name}[/:type...]`
    pub rest_endpoint: String,
    pub params: Vec<ParamKind>,
    pub handler: HandlerFn,
}

/// All registered services, keyed `id-version` then `{METHOD}{name}`.
#[derive(Default)]
pub struct RouteTable {
    services: HashMap<String, HashMap<String, Arc<RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every endpoint of a service. Fails on a duplicate
    /// method+name pair without touching the table.
    pub fn register(&mut self, service: &dyn Service) -> crate::Result<()> {
        let service_key =
            format!("{}-{}", service.id().to_lowercase(), service.version().to_lowercase());

        let mut handlers: HashMap<String, Arc<RouteEntry>> = HashMap::new();
        for endpoint in service.endpoints() {
            let entry = resolve(service, endpoint);
            let key = format!("{}{}", entry.http_method, entry.name);
            if let Some(previous) = handlers.get(&key) {
                return Err(crate::Error::Registration(format!(
                    "duplicate handlers for '{}' with method {} (existing endpoint {})",
                    entry.name, entry.http_method, previous.rest_endpoint
                )));
            }
            handlers.insert(key, Arc::new(entry));
        }

        if !handlers.is_empty() {
            self.services.insert(service_key, handlers);
        }
        Ok(())
    }

    /// Remove a service by `id-version` key.
    pub fn unregister(&mut self, service_key: &str) {
        self.services.remove(&service_key.to_lowercase());
    }

    pub fn unregister_all(&mut self) {
        self.services.clear();
    }

    /// Resolve a route; falls back to the lowercased name like the URL form.
    pub fn lookup(&self, service_key: &str, method: &Method, name: &str) -> Option<Arc<RouteEntry>> {
        let service = self.services.get(service_key)?;
        service
            .get(&format!("{}{}", method, name))
            .or_else(|| service.get(&format!("{}{}", method, name.to_lowercase())))
            .cloned()
    }

    /// Whether a service has a handler for the given method+name, used for
    /// CORS preflight.
    pub fn has_handler(&self, service_key: &str, method: &str, name: &str) -> bool {
        self.services
            .get(service_key)
            .is_some_and(|s| s.contains_key(&format!("{}{}", method, name.to_lowercase())))
    }

    /// Registered module → version map for the versions endpoint.
    pub fn versions(&self) -> HashMap<String, String> {
        self.services
            .keys()
            .filter_map(|key| {
                let (id, version) = key.split_once('-')?;
                Some((id.to_string(), version.to_string()))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Derive method, trimmed name and REST path for an endpoint.
fn resolve(service: &dyn Service, endpoint: Endpoint) -> RouteEntry {
    let name = endpoint.name.as_str();
    let (mut method, prefixes): (Method, &[&str]) = match name {
        n if n.starts_with("Get") => (Method::GET, &["Get"]),
        n if n.starts_with("Add") || n.starts_with("Create") => (Method::POST, &["Add", "Create"]),
        n if n.starts_with("Edit") || n.starts_with("Update") => (Method::PUT, &["Edit", "Update"]),
        n if n.starts_with("Delete") || n.starts_with("Remove") => {
            (Method::DELETE, &["Delete", "Remove"])
        }
        _ => (Method::GET, &["Do"]),
    };

    // GET/DELETE endpoints take scalar parameters as typed URL segments; a
    // non-scalar parameter forces the request into a POST body instead
    let mut segments = Vec::new();
    if !endpoint.params.is_empty() && (method == Method::GET || method == Method::DELETE) {
        for param in &endpoint.params {
            if !param.is_scalar() {
                method = Method::POST;
                segments.clear();
                break;
            }
            segments.push(format!(":{}", param.segment()));
        }
    }

    if let Some(explicit) = endpoint.method_override.clone() {
        method = explicit;
    }

    let mut trimmed = endpoint.name.to_lowercase();
    for prefix in prefixes {
        if let Some(rest) = trimmed.strip_prefix(&prefix.to_lowercase()) {
            trimmed = rest.to_string();
        }
    }

    let mut rest_endpoint = format!("/{}/{}/{}", service.id(), service.version(), trimmed);
    if !segments.is_empty() && (method == Method::GET || method == Method::DELETE) {
        rest_endpoint.push('/');
        rest_endpoint.push_str(&segments.join("/"));
    }

    RouteEntry {
        name: trimmed,
        http_method: method,
        rest_endpoint,
        params: endpoint.params,
        handler: endpoint.handler,
    }
}

/// Run a resolved route: parse typed URL segments, decode the body, invoke
/// the handler and encode its results under the negotiated content type.
pub async fn dispatch(
    entry: Arc<RouteEntry>,
    ctx: Arc<Context>,
    codecs: Arc<CodecRegistry>,
) -> Result<()> {
    let mut args: Vec<Body> = Vec::new();

    // typed URL segments, strictly validated
    if entry.rest_endpoint.contains(':') {
        let url_parts: Vec<&str> = ctx.request.path().split('/').collect();
        let pattern_parts: Vec<&str> = entry.rest_endpoint.split('/').collect();
        if url_parts.len() == pattern_parts.len() {
            for (idx, part) in pattern_parts.iter().enumerate() {
                let Some(kind) = part.strip_prefix(':') else {
                    continue;
                };
                let raw = url_parts[idx];
                match kind {
                    "string" => args.push(Body::Json(Value::String(raw.to_string()))),
                    "int" => match raw.parse::<i64>() {
                        Ok(n) => args.push(Body::Json(json!(n))),
                        Err(err) => {
                            ctx.bad_request(&format!("failed to parse argument: {}", err));
                            return Ok(());
                        }
                    },
                    "bool" => match parse_truthy(raw) {
                        Some(b) => args.push(Body::Json(json!(b))),
                        None => {
                            ctx.bad_request("failed to parse argument: not a boolean");
                            return Ok(());
                        }
                    },
                    _ => {}
                }
            }
        }
    }

    // decode the body into the remaining parameters
    if !ctx.request.body.is_empty() {
        let content_type = ctx.request.header("Content-Type").unwrap_or(super::codec::DEFAULT_MIME);
        let Some(decode) = codecs.decoder(content_type) else {
            ctx.bad_request("invalid input format");
            return Ok(());
        };
        let remaining = &entry.params[args.len().min(entry.params.len())..];
        match decode(&ctx.request.body, remaining) {
            Ok(decoded) => args.extend(decoded),
            Err(err) => {
                ctx.bad_request(&format!("failed to parse input: {}", err));
                return Ok(());
            }
        }
    }

    let (status, outcome) = (entry.handler)(ctx.clone(), args).await;

    let explicit = ctx.response().header("Content-Type").map(str::to_string);
    let (mime, encode) =
        codecs.negotiate(ctx.request.header("Accept"), explicit.as_deref());

    {
        let mut res = ctx.response();
        if res.header("Content-Type").is_none() {
            res.set_header("Content-Type", &mime);
        }
        if !res.committed {
            res.write_header(status);
        }
    }

    match outcome {
        Err(err) => {
            let payload = encode(&[Body::Json(json!({ "error": err.to_string() }))])
                .unwrap_or_default();
            ctx.response().write(&payload)?;
        }
        Ok(values) if !values.is_empty() => match encode(&values) {
            Ok(payload) => {
                ctx.response().write(&payload)?;
            }
            Err(_) => ctx.bad_request("invalid output format"),
        },
        Ok(_) => {}
    }
    Ok(())
}

fn parse_truthy(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Svc(Vec<Endpoint>);

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
            self.0.clone()
        }
    }

    fn noop(name: &str, params: &[ParamKind]) -> Endpoint {
        Endpoint::new(name, params, |_ctx, _args| Box::pin(async { (200, Ok(vec![])) }))
    }

    fn entry(table: &RouteTable, method: Method, name: &str) -> Arc<RouteEntry> {
        table.lookup("svc-1.0.0", &method, name).expect("route registered")
    }

    #[test]
    fn prefixes_map_to_http_methods() {
        let mut table = RouteTable::new();
        table
            .register(&Svc(vec![
                noop("GetUsers", &[]),
                noop("AddUser", &[ParamKind::Object]),
                noop("CreateGroup", &[ParamKind::Object]),
                noop("UpdateUser", &[ParamKind::Object]),
                noop("EditGroup", &[ParamKind::Object]),
                noop("DeleteUser", &[ParamKind::Str]),
                noop("RemoveGroup", &[ParamKind::Str]),
                noop("DoPing", &[]),
            ]))
            .unwrap();

        assert_eq!(entry(&table, Method::GET, "users").rest_endpoint, "/svc/1.0.0/users");
        assert_eq!(entry(&table, Method::POST, "user").rest_endpoint, "/svc/1.0.0/user");
        assert_eq!(entry(&table, Method::POST, "group").rest_endpoint, "/svc/1.0.0/group");
        assert_eq!(entry(&table, Method::PUT, "user").name, "user");
        assert_eq!(entry(&table, Method::PUT, "group").name, "group");
        assert_eq!(
            entry(&table, Method::DELETE, "user").rest_endpoint,
            "/svc/1.0.0/user/:string"
        );
        assert_eq!(entry(&table, Method::GET, "ping").name, "ping");
    }

    #[test]
    fn scalar_params_become_typed_segments() {
        let mut table = RouteTable::new();
        table
            .register(&Svc(vec![noop(
                "GetItem",
                &[ParamKind::Str, ParamKind::Int, ParamKind::Bool],
            )]))
            .unwrap();

        let entry = entry(&table, Method::GET, "item");
        assert_eq!(entry.rest_endpoint, "/svc/1.0.0/item/:string/:int/:bool");
    }

    #[test]
    fn non_scalar_param_flips_get_to_post() {
        let mut table = RouteTable::new();
        table
            .register(&Svc(vec![noop("DoSearch", &[ParamKind::Str, ParamKind::Object])]))
            .unwrap();

        let entry = entry(&table, Method::POST, "search");
        assert_eq!(entry.rest_endpoint, "/svc/1.0.0/search");
    }

    #[test]
    fn duplicate_method_name_pair_is_rejected() {
        let mut table = RouteTable::new();
        let res = table.register(&Svc(vec![
            noop("GetStatus", &[]),
            // Do-prefixed, also GET, trims to the same name
            noop("DoStatus", &[]),
        ]));
        assert!(res.is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn versions_lists_registered_modules() {
        let mut table = RouteTable::new();
        table.register(&Svc(vec![noop("GetPing", &[])])).unwrap();

        let versions = table.versions();
        assert_eq!(versions.get("svc").map(String::as_str), Some("1.0.0"));
    }

    #[test]
    fn lookup_falls_back_to_lowercase() {
        let mut table = RouteTable::new();
        table.register(&Svc(vec![noop("GetPing", &[])])).unwrap();

        assert!(table.lookup("svc-1.0.0", &Method::GET, "Ping").is_some());
        assert!(table.lookup("svc-1.0.0", &Method::POST, "ping").is_none());
        assert!(table.lookup("other-1.0.0", &Method::GET, "ping").is_none());
    }

    #[tokio::test]
    async fn dispatch_parses_typed_segments() {
        use crate::server::context::test_support::context;

        let mut table = RouteTable::new();
        let echo = Endpoint::new("DoEcho", &[ParamKind::Str], |_ctx, args| {
            Box::pin(async move { (200, Ok(args)) })
        });
        table.register(&Svc(vec![echo])).unwrap();

        let entry = entry(&table, Method::GET, "echo");
        let ctx = Arc::new(context(
            Method::GET,
            "/svc/1.0.0/echo/hello",
            &[("Accept", "application/json")],
            b"",
        ));
        dispatch(entry, ctx.clone(), Arc::new(CodecRegistry::new())).await.unwrap();

        let res = std::mem::take(&mut *ctx.response());
        let (status, headers, body) = res.finish();
        assert_eq!(status, 200);
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
        assert_eq!(body, br#""hello""#);
    }

    #[tokio::test]
    async fn dispatch_rejects_bad_int_segment() {
        use crate::server::context::test_support::context;

        let mut table = RouteTable::new();
        table
            .register(&Svc(vec![Endpoint::new("GetItem", &[ParamKind::Int], |_ctx, args| {
                Box::pin(async move { (200, Ok(args)) })
            })]))
            .unwrap();

        let entry = entry(&table, Method::GET, "item");
        let ctx = Arc::new(context(Method::GET, "/svc/1.0.0/item/not-a-number", &[], b""));
        dispatch(entry, ctx.clone(), Arc::new(CodecRegistry::new())).await.unwrap();

        assert_eq!(ctx.response().status, 400);
    }

    #[tokio::test]
    async fn dispatch_reports_handler_errors() {
        use crate::server::context::test_support::context;

        let mut table = RouteTable::new();
        table
            .register(&Svc(vec![Endpoint::new("GetBoom", &[], |_ctx, _args| {
                Box::pin(async { (503, Err(anyhow::anyhow!("backend down"))) })
            })]))
            .unwrap();

        let entry = entry(&table, Method::GET, "boom");
        let ctx = Arc::new(context(Method::GET, "/svc/1.0.0/boom", &[], b""));
        dispatch(entry, ctx.clone(), Arc::new(CodecRegistry::new())).await.unwrap();

        let res = std::mem::take(&mut *ctx.response());
        let (status, _, body) = res.finish();
        assert_eq!(status, 503);
        assert_eq!(body, br#"{"error":"backend down"}"#);
    }
}
