//! Server configuration
//!
//! Every knob is read from the flat settings registry with defaults that
//! start a reasonably secure server with no intervention. The key names and
//! defaults are part of the public contract; see the table in the crate
//! documentation.

use crate::session::SessionConfig;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of the server used in response headers
    pub name: String,
    /// Domain name the web server replies to; feeds the ACME host allow-list
    pub host: String,
    /// Bind address; 0.0.0.0 binds every interface
    pub address: String,
    /// Where static assets are loaded from
    pub static_path: String,
    /// HTTP port
    pub port: u16,
    /// Client read timeout; zero means unbounded
    pub read_timeout: Duration,
    /// Client write timeout; zero means unbounded
    pub write_timeout: Duration,
    /// Keep-alive idle timeout; zero means unbounded
    pub idle_timeout: Duration,
    /// Maximum request payload size
    pub post_max_size: usize,
    /// Compress responses when the client supports br/gzip/deflate
    pub use_compression: bool,
    /// Emit/propagate the trace header on all requests
    pub enable_tracing: bool,
    /// Reject requests arriving without a trace header
    pub trace_required: bool,
    /// Name of the trace header
    pub trace_header: String,
    /// HTTPS settings
    pub https: HttpsConfig,
    /// Session settings
    pub session: SessionConfig,
    /// Security settings
    pub security: SecurityConfig,
}

/// HTTPS listener configuration.
#[derive(Debug, Clone)]
pub struct HttpsConfig {
    /// Enable the TLS listener
    pub enabled: bool,
    /// Fall back to an auto provider when external material is absent or bad
    pub auto: bool,
    /// Auto provider: "lets-encrypt", "self-signed" or "auto"
    pub cert_type: String,
    /// HTTPS port
    pub port: u16,
    /// Path to the server certificate (PEM)
    pub cert: String,
    /// Path to the server private key (PEM)
    pub key: String,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto: true,
            cert_type: "lets-encrypt".to_string(),
            // historical default carried over verbatim
            port: 433,
            cert: String::new(),
            key: String::new(),
        }
    }
}

/// Security middleware configuration.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Brute-force limiter settings
    pub brute_force: BruteForceConfig,
    /// Require a CSRF token header on POST/PUT/PATCH
    pub csrf_required: bool,
    /// Respect Do-Not-Track requests
    pub dnt: bool,
    /// Send X-Frame-Options: SAMEORIGIN
    pub prevent_iframing: bool,
    /// Send X-Xss-Protection
    pub xss_protection: bool,
    /// Send Strict-Transport-Security
    pub hsts: bool,
    /// Send X-Content-Type-Options: nosniff
    pub content_type_options: bool,
    /// Strict-Transport-Security value
    pub hsts_directives: String,
    /// Content-Security-Policy value; empty disables the header
    pub csp: String,
    /// Comma-separated IP patterns allowed in; empty allows all
    pub whitelist: String,
    /// Comma-separated IP patterns always rejected
    pub blacklist: String,
    /// Private/loopback clients bypass the whitelist
    pub allow_private: bool,
    /// Enable crawler/exploit URL scanning
    pub url_scanner: bool,
    /// Ban duration after a positive scan detection
    pub ban_duration: Duration,
    /// Access-Control-Allow-Origin value ("*", one origin, or a CSV allow-list)
    pub cors_origin: String,
    /// Access-Control-Allow-Headers value
    pub cors_headers: String,
    /// Access-Control-Expose-Headers value
    pub cors_expose: String,
    /// Access-Control-Allow-Methods value
    pub cors_methods: String,
}

/// Leaky-bucket brute-force protection.
#[derive(Debug, Clone)]
pub struct BruteForceConfig {
    pub enabled: bool,
    /// Bucket drain rate in tokens per second
    pub rate: f64,
    /// Bucket capacity
    pub capacity: i64,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self { enabled: false, rate: 1.0, capacity: 10 }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            brute_force: BruteForceConfig::default(),
            csrf_required: false,
            dnt: true,
            prevent_iframing: true,
            xss_protection: true,
            hsts: false,
            content_type_options: true,
            hsts_directives: "max-age=63072000; includeSubDomains".to_string(),
            csp: "default-src 'self'".to_string(),
            whitelist: String::new(),
            blacklist: String::new(),
            allow_private: true,
            url_scanner: false,
            ban_duration: Duration::from_secs(5 * 3600),
            cors_origin: String::new(),
            cors_headers: String::new(),
            cors_expose: String::new(),
            cors_methods: String::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Armature".to_string(),
            host: "localhost".to_string(),
            address: "0.0.0.0".to_string(),
            static_path: "/var/www".to_string(),
            port: 80,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            post_max_size: 100 * 1024 * 1024,
            use_compression: true,
            enable_tracing: true,
            trace_required: false,
            trace_header: "X-Trace-Id".to_string(),
            https: HttpsConfig::default(),
            session: SessionConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Unmarshal a full configuration from the settings registry.
    pub fn from_settings(settings: &crate::Settings) -> Self {
        let d = Self::default();
        let ds = SecurityConfig::default();
        let dh = HttpsConfig::default();
        let db = BruteForceConfig::default();

        Self {
            name: settings.str_or("platform.server.name", &d.name),
            host: settings.str_or("platform.server.host", &d.host),
            address: settings.str_or("platform.server.address", &d.address),
            static_path: settings.str_or("platform.server.staticPath", &d.static_path),
            port: settings.int_or("platform.server.port", d.port as i64) as u16,
            // the original misspells this key; kept for compatibility
            read_timeout: settings.duration_or("platform.sever.readTimeout", d.read_timeout),
            write_timeout: settings.duration_or("platform.server.writeTimeout", d.write_timeout),
            idle_timeout: settings.duration_or("platform.server.idleTimeout", d.idle_timeout),
            post_max_size: settings.size_or("platform.server.maxPostSize", d.post_max_size),
            use_compression: settings.bool_or("platform.server.gzip", d.use_compression),
            enable_tracing: settings
                .bool_or("platform.server.security.tracing.enabled", d.enable_tracing),
            trace_required: settings
                .bool_or("platform.server.security.tracing.required", d.trace_required),
            trace_header: settings
                .str_or("platform.server.security.tracing.header", &d.trace_header),
            https: HttpsConfig {
                enabled: settings.bool_or("platform.server.https.enabled", dh.enabled),
                auto: settings.bool_or("platform.server.https.auto", dh.auto),
                cert_type: settings.str_or("platform.server.https.autoType", &dh.cert_type),
                port: settings.int_or("platform.server.https.port", dh.port as i64) as u16,
                cert: settings.str_or("platform.server.https.cert", &dh.cert),
                key: settings.str_or("platform.server.https.key", &dh.key),
            },
            session: SessionConfig::from_settings(settings),
            security: SecurityConfig {
                brute_force: BruteForceConfig {
                    enabled: settings
                        .bool_or("platform.server.security.bruteForce.enabled", db.enabled),
                    rate: settings.float_or("platform.server.security.bruteForce.rate", db.rate),
                    capacity: settings
                        .int_or("platform.server.security.bruteForce.capacity", db.capacity),
                },
                csrf_required: settings
                    .bool_or("platform.server.security.csrfRequired", ds.csrf_required),
                dnt: settings.bool_or("platform.server.security.dnt", ds.dnt),
                prevent_iframing: settings
                    .bool_or("platform.server.security.preventIFraming", ds.prevent_iframing),
                xss_protection: settings
                    .bool_or("platform.server.security.XSSProtection", ds.xss_protection),
                hsts: settings.bool_or("platform.server.security.hsts", ds.hsts),
                content_type_options: settings
                    .bool_or("platform.server.security.contentTypeOptions", ds.content_type_options),
                hsts_directives: settings
                    .str_or("platform.server.security.HSTSDirectives", &ds.hsts_directives),
                csp: settings.str_or("platform.server.security.csp", &ds.csp),
                whitelist: settings.str_or("platform.server.security.whitelist", &ds.whitelist),
                blacklist: settings.str_or("platform.server.security.blacklist", &ds.blacklist),
                allow_private: settings
                    .bool_or("platform.server.security.allowPrivate", ds.allow_private),
                url_scanner: settings
                    .bool_or("platform.server.security.urlScanner", ds.url_scanner),
                ban_duration: settings
                    .duration_or("platform.server.security.banDuration", ds.ban_duration),
                cors_origin: settings
                    .str_or("platform.server.security.cors.origin", &ds.cors_origin),
                cors_headers: settings
                    .str_or("platform.server.security.cors.headers", &ds.cors_headers),
                cors_expose: settings
                    .str_or("platform.server.security.cors.expose", &ds.cors_expose),
                cors_methods: settings
                    .str_or("platform.server.security.cors.methods", &ds.cors_methods),
            },
        }
    }

    /// Sanity-check the configuration before start.
    pub fn validate(&self) -> crate::Result<()> {
        if self.https.enabled {
            match self.https.cert_type.as_str() {
                "lets-encrypt" | "self-signed" | "auto" => {}
                other => {
                    return Err(crate::Error::Config(format!(
                        "invalid certificate provider: {}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Settings;

    #[test]
    fn defaults_match_the_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 80);
        assert_eq!(config.https.port, 433);
        assert_eq!(config.post_max_size, 100 * 1024 * 1024);
        assert!(config.enable_tracing);
        assert!(!config.trace_required);
        assert_eq!(config.trace_header, "X-Trace-Id");
        assert_eq!(config.session.cookie_name, "_session");
        assert_eq!(config.security.ban_duration, Duration::from_secs(5 * 3600));
        assert!(config.security.allow_private);
    }

    #[test]
    fn settings_override_defaults() {
        let mut settings = Settings::new();
        settings.set("platform.server.port", "8080");
        settings.set("platform.server.https.enabled", "yes");
        settings.set("platform.server.https.autoType", "self-signed");
        settings.set("platform.server.security.csrfRequired", "yes");
        settings.set("platform.server.security.banDuration", "10m");
        settings.set("platform.server.maxPostSize", "1MB");

        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 8080);
        assert!(config.https.enabled);
        assert_eq!(config.https.cert_type, "self-signed");
        assert!(config.security.csrf_required);
        assert_eq!(config.security.ban_duration, Duration::from_secs(600));
        assert_eq!(config.post_max_size, 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn bad_provider_fails_validation() {
        let mut settings = Settings::new();
        settings.set("platform.server.https.enabled", "yes");
        settings.set("platform.server.https.autoType", "carrier-pigeon");

        let config = ServerConfig::from_settings(&settings);
        assert!(config.validate().is_err());
    }
}
