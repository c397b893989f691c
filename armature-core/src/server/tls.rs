//! TLS certificate providers
//!
//! Three ways to terminate TLS behind one capability: certificates loaded
//! from disk, certificates signed on demand through ACME for an allow-listed
//! set of hosts, and ephemeral self-signed material for development. The
//! server validates external files at start and silently falls through to
//! the configured auto provider when they are expired or not yet valid.

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod acme;

pub use acme::AcmeManager;

/// A certificate source the TLS listener resolves material from.
pub enum CertProvider {
    /// PEM pair on disk, loaded once and cached.
    External(ExternalCert),
    /// Ephemeral EC P-256 certificate minted on the first handshake.
    SelfSigned(SelfSignedCert),
    /// ACME-signed certificates for an allow-listed host set.
    Acme(AcmeManager),
}

impl CertProvider {
    pub fn external(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        CertProvider::External(ExternalCert {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            cached: Mutex::new(None),
        })
    }

    pub fn self_signed() -> Self {
        CertProvider::SelfSigned(SelfSignedCert { cached: Mutex::new(None) })
    }

    pub fn acme(hosts: Vec<String>) -> Result<Self> {
        Ok(CertProvider::Acme(AcmeManager::new(hosts)?))
    }

    /// Certificate for the handshake, by SNI name.
    pub fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        match self {
            CertProvider::External(external) => external.resolve(),
            CertProvider::SelfSigned(self_signed) => self_signed.resolve(server_name),
            CertProvider::Acme(acme) => acme.resolve(server_name),
        }
    }

    /// The PEM paths for providers that have them on disk.
    pub fn certificate_files(&self) -> Option<(PathBuf, PathBuf)> {
        match self {
            CertProvider::External(external) => {
                Some((external.cert_file.clone(), external.key_file.clone()))
            }
            CertProvider::SelfSigned(_) | CertProvider::Acme(_) => None,
        }
    }

    /// Pending HTTP-01 challenge content, served by the HTTP listener under
    /// `/.well-known/acme-challenge/`.
    pub fn http_challenge(&self, token: &str) -> Option<String> {
        match self {
            CertProvider::Acme(acme) => acme.http_challenge(token),
            _ => None,
        }
    }

    /// A rustls server configuration resolving certificates through this
    /// provider.
    pub fn server_config(self: &Arc<Self>) -> Arc<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ProviderResolver(self.clone())));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

#[derive(Debug)]
struct ProviderResolver(Arc<CertProvider>);

impl std::fmt::Debug for CertProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertProvider::External(e) => write!(f, "External({})", e.cert_file.display()),
            CertProvider::SelfSigned(_) => write!(f, "SelfSigned"),
            CertProvider::Acme(_) => write!(f, "Acme"),
        }
    }
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.resolve(client_hello.server_name())
    }
}

/// Certificate pair defined by system files.
pub struct ExternalCert {
    cert_file: PathBuf,
    key_file: PathBuf,
    cached: Mutex<Option<Arc<CertifiedKey>>>,
}

impl ExternalCert {
    fn resolve(&self) -> Option<Arc<CertifiedKey>> {
        let mut cached = self.cached.lock().expect("certificate cache lock poisoned");
        if cached.is_none() {
            match load_key_pair(&self.cert_file, &self.key_file) {
                Ok(key) => *cached = Some(Arc::new(key)),
                Err(err) => {
                    log::error!("cannot load certificate pair: {}", err);
                    return None;
                }
            }
        }
        cached.clone()
    }
}

/// Development certificate minted in memory.
pub struct SelfSignedCert {
    cached: Mutex<Option<Arc<CertifiedKey>>>,
}

/// Validity of generated self-signed material.
const SELF_SIGNED_DAYS: i64 = 180;

impl SelfSignedCert {
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let mut cached = self.cached.lock().expect("certificate cache lock poisoned");
        if cached.is_none() {
            match generate_self_signed(server_name) {
                Ok(key) => *cached = Some(Arc::new(key)),
                Err(err) => {
                    log::error!("self-signed certificate generation failed: {}", err);
                    return None;
                }
            }
        }
        cached.clone()
    }
}

/// Mint an EC P-256 certificate covering localhost plus the SNI name, encode
/// it to PEM in memory, and parse it back into a usable pair.
fn generate_self_signed(server_name: Option<&str>) -> Result<CertifiedKey> {
    let mut names = vec!["localhost".to_string()];
    if let Some(name) = server_name {
        if !name.is_empty() && name != "localhost" {
            names.push(name.to_string());
        }
    }

    let key_pair = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::new(names)?;
    params.distinguished_name.push(rcgen::DnType::OrganizationName, "Armature");
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(SELF_SIGNED_DAYS);
    let cert = params.self_signed(&key_pair)?;

    key_pair_from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
}

/// Build a [`CertifiedKey`] from PEM buffers.
pub(crate) fn key_pair_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<std::io::Result<_>>()?;
    if certs.is_empty() {
        bail!("no certificates in PEM data");
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| anyhow!("no private key in PEM data"))?;
    let signing_key = any_supported_type(&key).map_err(|e| anyhow!("unusable key: {}", e))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

fn load_key_pair(cert_file: &Path, key_file: &Path) -> Result<CertifiedKey> {
    let cert_pem = std::fs::read(cert_file)
        .with_context(|| format!("cannot read {}", cert_file.display()))?;
    let key_pem =
        std::fs::read(key_file).with_context(|| format!("cannot read {}", key_file.display()))?;
    key_pair_from_pem(&cert_pem, &key_pem)
}

/// Test-load an external pair before start. Returns `Ok(true)` when usable;
/// with `auto` set, a bad or expired pair logs a warning and returns
/// `Ok(false)` so the server falls through to the auto provider.
pub fn test_key_pair(cert_file: &str, key_file: &str, auto: bool) -> Result<bool> {
    let pair = load_key_pair(Path::new(cert_file), Path::new(key_file));
    let pair = match pair {
        Ok(pair) => pair,
        Err(err) => {
            if auto {
                log::warn!("provided certificate is invalid ({}), using auto fetch", err);
                return Ok(false);
            }
            bail!("invalid certificate: {}", err);
        }
    };

    let now = Utc::now();
    for cert in &pair.cert {
        let (not_before, not_after) = match certificate_validity(cert.as_ref()) {
            Ok(window) => window,
            Err(err) => {
                if auto {
                    log::warn!("cannot inspect certificate ({}), using auto fetch", err);
                    return Ok(false);
                }
                bail!("invalid certificate: {}", err);
            }
        };
        if not_after < now {
            if auto {
                log::warn!("certificate is expired, using auto fetch");
                return Ok(false);
            }
            bail!("certificate is expired");
        }
        if not_before > now {
            if auto {
                log::warn!("certificate is not yet valid, using auto fetch");
                return Ok(false);
            }
            bail!("certificate is not yet valid");
        }
    }
    Ok(true)
}

/// Pull NotBefore/NotAfter out of a DER certificate.
///
/// The ASN.1 shape is fixed: the TBSCertificate's validity is the SEQUENCE
/// after version, serial, signature algorithm and issuer, so a small TLV
/// walk is enough; no general X.509 parsing needed.
pub(crate) fn certificate_validity(der: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let mut outer = DerReader::new(der);
    let certificate = outer.read_expect(0x30)?;

    let mut cert = DerReader::new(certificate);
    let tbs = cert.read_expect(0x30)?;

    let mut tbs = DerReader::new(tbs);
    let (first_tag, _) = tbs.peek()?;
    if first_tag == 0xA0 {
        tbs.read()?; // explicit version
    }
    tbs.read_expect(0x02)?; // serialNumber
    tbs.read_expect(0x30)?; // signature algorithm
    tbs.read_expect(0x30)?; // issuer
    let validity = tbs.read_expect(0x30)?;

    let mut validity = DerReader::new(validity);
    let not_before = read_time(&mut validity)?;
    let not_after = read_time(&mut validity)?;
    Ok((not_before, not_after))
}

fn read_time(reader: &mut DerReader<'_>) -> Result<DateTime<Utc>> {
    let (tag, content) = reader.read()?;
    let text = std::str::from_utf8(content).map_err(|_| anyhow!("bad time encoding"))?;
    let naive: NaiveDateTime = match tag {
        // UTCTime YYMMDDHHMMSSZ (two-digit year)
        0x17 => NaiveDateTime::parse_from_str(text, "%y%m%d%H%M%SZ")?,
        // GeneralizedTime YYYYMMDDHHMMSSZ
        0x18 => NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%SZ")?,
        other => bail!("unexpected time tag {:#x}", other),
    };
    Ok(naive.and_utc())
}

struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<(u8, usize)> {
        if self.pos >= self.data.len() {
            bail!("truncated DER");
        }
        Ok((self.data[self.pos], self.pos))
    }

    /// Read the next TLV, returning `(tag, content)`.
    fn read(&mut self) -> Result<(u8, &'a [u8])> {
        let (tag, _) = self.peek()?;
        self.pos += 1;

        let first = *self.data.get(self.pos).ok_or_else(|| anyhow!("truncated DER"))?;
        self.pos += 1;
        let length = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 4 {
                bail!("unsupported DER length");
            }
            let mut length = 0usize;
            for _ in 0..count {
                let byte = *self.data.get(self.pos).ok_or_else(|| anyhow!("truncated DER"))?;
                self.pos += 1;
                length = (length << 8) | byte as usize;
            }
            length
        };

        let end = self.pos.checked_add(length).ok_or_else(|| anyhow!("bad DER length"))?;
        if end > self.data.len() {
            bail!("truncated DER");
        }
        let content = &self.data[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn read_expect(&mut self, expected: u8) -> Result<&'a [u8]> {
        let (tag, content) = self.read()?;
        if tag != expected {
            bail!("unexpected DER tag {:#x}, wanted {:#x}", tag, expected);
        }
        Ok(content)
    }
}
