//! Armature - Core
//!
//! An embeddable HTTP(S) application server framework. You register service
//! modules (an id, a version and a set of typed endpoint handlers) and
//! Armature runs the rest: the middleware pipeline (security, rate limiting,
//! compression, tracing, session recovery, access logging), content
//! negotiation, TLS, cross-node coordination and cron scheduling.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use armature_core::prelude::*;
//!
//! struct Status;
//!
//! impl Module for Status {
//!     fn id(&self) -> &str { "status" }
//!     fn version(&self) -> &str { "1.0.0" }
//! }
//!
//! impl Service for Status {
//!     fn endpoints(&self) -> Vec<Endpoint> {
//!         vec![Endpoint::new("GetPing", &[], |_ctx, _args| {
//!             Box::pin(async { (200, Ok(vec![])) })
//!         })]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Server::new(None)?;
//!     server.register_module(Status)?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await
//! }
//! ```
//!
//! # Architecture
//!
//! - [`server`] - HTTP(S) listener, dispatch, middleware chain, codecs, TLS
//! - [`session`] - self-checked tokens and pluggable session stores
//! - [`cache`] - uniform K/V + pub/sub interface with memory and Redis drivers
//! - [`cluster`] - node membership, broadcast and distributed locks over Redis
//! - [`security`] - IP list matching, crawler detection, leaky-bucket limiting
//! - [`scheduler`] - cron jobs with cluster-wide mutual exclusion
//! - [`logging`] - structured async logger behind the standard `log` facade

pub mod cache;
pub mod cluster;
pub mod logging;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod session;
pub mod settings;

// Prelude module for convenient imports
pub mod prelude;

// Re-exports of main types and traits
pub use server::{Context, Endpoint, Module, ParamKind, Server, ServerConfig, Service};
pub use session::{Session, Token};
pub use settings::Settings;

/// Main result type for the framework
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Armature
#[derive(Debug)]
pub enum Error {
    /// Listener and HTTP engine errors
    Http(String),
    /// TLS provider errors (missing material, handshake setup)
    Tls(String),
    /// Cache driver and Redis errors
    Cache(String),
    /// Cluster membership and lock errors
    Cluster(String),
    /// Invalid or conflicting configuration
    Config(String),
    /// Service registration errors (duplicate handlers, bad descriptors)
    Registration(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(msg) => write!(f, "http error: {}", msg),
            Error::Tls(msg) => write!(f, "tls error: {}", msg),
            Error::Cache(msg) => write!(f, "cache error: {}", msg),
            Error::Cluster(msg) => write!(f, "cluster error: {}", msg),
            Error::Config(msg) => write!(f, "config error: {}", msg),
            Error::Registration(msg) => write!(f, "registration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
