//! ACME certificate manager
//!
//! A directory-based ACME v2 client scoped to what the server needs: accept
//! the terms of service, restrict orders to the configured host list, answer
//! HTTP-01 challenges through the running listener, and cache acquired
//! material in a per-process temp directory. Certificates are requested on
//! demand: the first handshake for a host kicks off an order in the
//! background and handshakes succeed once it completes.
//!
//! Request bodies are JWS-signed with an ES256 account key per RFC 8555.

use super::key_pair_from_pem;
use anyhow::{anyhow, bail, Context as _, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::digest::{digest, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use rustls::sign::CertifiedKey;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Production directory; override with [`AcmeManager::with_directory`].
const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Attempts when polling an authorization or order.
const POLL_ATTEMPTS: u32 = 10;
const POLL_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct Directory {
    #[serde(rename = "newNonce")]
    new_nonce: String,
    #[serde(rename = "newAccount")]
    new_account: String,
    #[serde(rename = "newOrder")]
    new_order: String,
}

/// ACME-backed certificate source.
pub struct AcmeManager {
    inner: Arc<AcmeInner>,
}

struct AcmeInner {
    hosts: Vec<String>,
    directory_url: RwLock<String>,
    cache_dir: tempfile::TempDir,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    challenges: RwLock<HashMap<String, String>>,
    pending: Mutex<HashSet<String>>,
    account: tokio::sync::Mutex<Option<Account>>,
    http: reqwest::Client,
}

struct Account {
    key: Arc<EcdsaKeyPair>,
    kid: String,
    directory: Directory,
}

impl AcmeManager {
    /// Create a manager answering for the given hosts only.
    pub fn new(hosts: Vec<String>) -> Result<Self> {
        let cache_dir = tempfile::TempDir::new().context("could not create temp folder")?;
        Ok(Self {
            inner: Arc::new(AcmeInner {
                hosts,
                directory_url: RwLock::new(LETS_ENCRYPT_DIRECTORY.to_string()),
                cache_dir,
                certs: RwLock::new(HashMap::new()),
                challenges: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                account: tokio::sync::Mutex::new(None),
                http: reqwest::Client::new(),
            }),
        })
    }

    /// Point at a different directory (staging, pebble).
    pub fn with_directory(self, url: &str) -> Self {
        *self.inner.directory_url.write().expect("directory url lock poisoned") = url.to_string();
        self
    }

    /// Serve a cached certificate for the handshake; a miss for an allowed
    /// host starts acquisition in the background.
    pub(super) fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let host = match server_name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.inner.hosts.first()?.clone(),
        };
        if !self.inner.hosts.iter().any(|h| h == &host) {
            log::debug!("refusing certificate for non-allow-listed host {}", host);
            return None;
        }

        if let Some(found) =
            self.inner.certs.read().expect("certificate table lock poisoned").get(&host)
        {
            return Some(found.clone());
        }

        if let Some(loaded) = self.inner.load_cached(&host) {
            return Some(loaded);
        }

        let fresh = self.inner.pending.lock().expect("pending set lock poisoned").insert(host.clone());
        if fresh {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(err) = inner.acquire(&host).await {
                    log::error!("acme order for {} failed: {}", host, err);
                }
                inner.pending.lock().expect("pending set lock poisoned").remove(&host);
            });
        }
        None
    }

    /// Key authorization for a pending HTTP-01 token.
    pub fn http_challenge(&self, token: &str) -> Option<String> {
        self.inner.challenges.read().expect("challenge table lock poisoned").get(token).cloned()
    }
}

impl AcmeInner {
    fn cert_paths(&self, host: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        (
            self.cache_dir.path().join(format!("{}.crt", host)),
            self.cache_dir.path().join(format!("{}.key", host)),
        )
    }

    /// Try the on-disk cache from an earlier order in this process.
    fn load_cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let (cert_path, key_path) = self.cert_paths(host);
        let cert_pem = std::fs::read(cert_path).ok()?;
        let key_pem = std::fs::read(key_path).ok()?;
        let key = key_pair_from_pem(&cert_pem, &key_pem).ok()?;
        let key = Arc::new(key);
        self.certs
            .write()
            .expect("certificate table lock poisoned")
            .insert(host.to_string(), key.clone());
        Some(key)
    }

    /// Run one complete order for `host`.
    async fn acquire(self: &Arc<Self>, host: &str) -> Result<()> {
        let mut account = self.account.lock().await;
        if account.is_none() {
            *account = Some(self.register_account().await?);
        }
        let account = account.as_ref().expect("account registered above");

        // new order
        let payload = json!({ "identifiers": [{ "type": "dns", "value": host }] });
        let response =
            self.post(account, &account.directory.new_order, Some(payload)).await?;
        let order_url = header(&response, "Location")?;
        let order: Value = response.json().await?;

        let authorizations = order["authorizations"]
            .as_array()
            .ok_or_else(|| anyhow!("order without authorizations"))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect::<Vec<_>>();
        let finalize_url = order["finalize"]
            .as_str()
            .ok_or_else(|| anyhow!("order without finalize url"))?
            .to_string();

        for authz_url in authorizations {
            self.satisfy_authorization(account, &authz_url).await?;
        }

        // CSR and finalize
        let cert_key = rcgen::KeyPair::generate()?;
        let params = rcgen::CertificateParams::new(vec![host.to_string()])?;
        let csr = params.serialize_request(&cert_key)?;
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr.der()) });
        self.post(account, &finalize_url, Some(payload)).await?;

        // poll the order for the certificate URL
        let mut certificate_url = None;
        for _ in 0..POLL_ATTEMPTS {
            let response = self.post(account, &order_url, None).await?;
            let order: Value = response.json().await?;
            match order["status"].as_str() {
                Some("valid") => {
                    certificate_url = order["certificate"].as_str().map(str::to_string);
                    break;
                }
                Some("invalid") => bail!("order became invalid"),
                _ => tokio::time::sleep(POLL_DELAY).await,
            }
        }
        let certificate_url =
            certificate_url.ok_or_else(|| anyhow!("order did not become valid"))?;

        let response = self.post(account, &certificate_url, None).await?;
        let chain_pem = response.text().await?;

        let (cert_path, key_path) = self.cert_paths(host);
        std::fs::write(&cert_path, &chain_pem)?;
        std::fs::write(&key_path, cert_key.serialize_pem())?;

        let key = key_pair_from_pem(chain_pem.as_bytes(), cert_key.serialize_pem().as_bytes())?;
        self.certs
            .write()
            .expect("certificate table lock poisoned")
            .insert(host.to_string(), Arc::new(key));
        log::info!("acme certificate acquired for {}", host);
        Ok(())
    }

    /// Publish the HTTP-01 key authorization and wait for the CA to verify.
    async fn satisfy_authorization(&self, account: &Account, authz_url: &str) -> Result<()> {
        let response = self.post(account, authz_url, None).await?;
        let authz: Value = response.json().await?;
        if authz["status"].as_str() == Some("valid") {
            return Ok(());
        }

        let challenge = authz["challenges"]
            .as_array()
            .and_then(|list| list.iter().find(|c| c["type"] == "http-01"))
            .ok_or_else(|| anyhow!("no http-01 challenge offered"))?;
        let token = challenge["token"]
            .as_str()
            .ok_or_else(|| anyhow!("challenge without token"))?
            .to_string();
        let challenge_url = challenge["url"]
            .as_str()
            .ok_or_else(|| anyhow!("challenge without url"))?
            .to_string();

        let key_auth = format!("{}.{}", token, thumbprint(&account.key));
        self.challenges
            .write()
            .expect("challenge table lock poisoned")
            .insert(token.clone(), key_auth);

        // empty object tells the CA the challenge is ready
        self.post(account, &challenge_url, Some(json!({}))).await?;

        let mut satisfied = false;
        for _ in 0..POLL_ATTEMPTS {
            let response = self.post(account, authz_url, None).await?;
            let authz: Value = response.json().await?;
            match authz["status"].as_str() {
                Some("valid") => {
                    satisfied = true;
                    break;
                }
                Some("invalid") => break,
                _ => tokio::time::sleep(POLL_DELAY).await,
            }
        }

        self.challenges.write().expect("challenge table lock poisoned").remove(&token);
        if !satisfied {
            bail!("authorization was not validated");
        }
        Ok(())
    }

    /// Create the account key and register it, accepting the terms of
    /// service.
    async fn register_account(&self) -> Result<Account> {
        let directory_url =
            self.directory_url.read().expect("directory url lock poisoned").clone();
        let directory: Directory =
            self.http.get(&directory_url).send().await?.error_for_status()?.json().await?;

        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| anyhow!("account key generation failed"))?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|_| anyhow!("account key rejected"))?;
        let key = Arc::new(key);

        let nonce = self.fresh_nonce(&directory.new_nonce).await?;
        let payload = json!({ "termsOfServiceAgreed": true });
        let protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": directory.new_account,
            "jwk": jwk(&key),
        });
        let response =
            self.signed_request(&key, &directory.new_account, &protected, Some(payload)).await?;
        let kid = header(&response, "Location")?;

        Ok(Account { key, kid, directory })
    }

    /// POST with the account kid; `payload` of `None` is a POST-as-GET.
    async fn post(
        &self,
        account: &Account,
        url: &str,
        payload: Option<Value>,
    ) -> Result<reqwest::Response> {
        let nonce = self.fresh_nonce(&account.directory.new_nonce).await?;
        let protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
            "kid": account.kid,
        });
        self.signed_request(&account.key, url, &protected, payload).await
    }

    async fn signed_request(
        &self,
        key: &EcdsaKeyPair,
        url: &str,
        protected: &Value,
        payload: Option<Value>,
    ) -> Result<reqwest::Response> {
        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(protected)?);
        let payload_b64 = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(&value)?),
            None => String::new(),
        };
        let signing_input = format!("{}.{}", protected_b64, payload_b64);

        let rng = SystemRandom::new();
        let signature = key
            .sign(&rng, signing_input.as_bytes())
            .map_err(|_| anyhow!("jws signing failed"))?;

        let body = json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        });

        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(serde_json::to_vec(&body)?)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("acme endpoint {} answered {}: {}", url, status, detail);
        }
        Ok(response)
    }

    async fn fresh_nonce(&self, new_nonce_url: &str) -> Result<String> {
        let response = self.http.head(new_nonce_url).send().await?;
        header(&response, "Replay-Nonce")
    }
}

fn header(response: &reqwest::Response, name: &str) -> Result<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("response without {} header", name))
}

/// Public JWK of the account key (uncompressed P-256 point).
fn jwk(key: &EcdsaKeyPair) -> Value {
    use ring::signature::KeyPair as _;
    let point = key.public_key().as_ref();
    json!({
        "crv": "P-256",
        "kty": "EC",
        "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
        "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
    })
}

/// RFC 7638 thumbprint over the canonical JWK members.
fn thumbprint(key: &EcdsaKeyPair) -> String {
    let jwk = jwk(key);
    let canonical = format!(
        r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
        jwk["x"].as_str().unwrap_or_default(),
        jwk["y"].as_str().unwrap_or_default(),
    );
    URL_SAFE_NO_PAD.encode(digest(&SHA256, canonical.as_bytes()))
}
