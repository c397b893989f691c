//! Convenient imports for embedding hosts
//!
//! ```rust,ignore
//! use armature_core::prelude::*;
//! ```

pub use crate::cache::{Cache, CacheExt, CacheManager, MemoryCache, RedisCache};
pub use crate::cluster::Cluster;
pub use crate::logging::{LogConfig, Logger};
pub use crate::scheduler::{Scheduler, Task};
pub use crate::server::{
    Body, CertProvider, Context, Endpoint, Module, ParamKind, Server, ServerConfig, Service,
};
pub use crate::session::{Session, Store, Token};
pub use crate::settings::Settings;
