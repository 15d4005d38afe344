//! Signing key resolution
//!
//! Fetches the provider's JSON Web Key Set once per `KeyResolver` and keeps it
//! for the lifetime of the handle. Initialisation is single-flight: concurrent
//! cold-start verifications share one fetch instead of stampeding the keys
//! endpoint. A failed fetch leaves the cache empty so the next call retries.
//!
//! There is no TTL and no refetch on unknown `kid`. A key rotation at the
//! provider needs a new resolver (process restart).

use std::fmt;

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result, VerifyError};

/// One RSA public key from the provider's key set.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    key: DecodingKey,
}

impl SigningKey {
    /// Build from a JWK. Only RSA keys with a `kid` are usable for RS256.
    pub fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let kid = jwk.common.key_id.clone()?;
        match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                .ok()
                .map(|key| Self { kid, key }),
            _ => {
                debug!(kid, "skipping non-RSA key");
                None
            }
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("kid", &self.kid).finish()
    }
}

/// Raw key set document. Keys are parsed one by one so a single entry with an
/// unknown key type does not poison the whole set.
#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

/// Lazily populated, handle-scoped cache of the provider's signing keys.
pub struct KeyResolver {
    http: reqwest::Client,
    jwks_uri: String,
    keys: OnceCell<Vec<SigningKey>>,
}

impl KeyResolver {
    /// Resolver that fetches from `jwks_uri` on first use.
    pub fn new(http: reqwest::Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
            keys: OnceCell::new(),
        }
    }

    /// Resolver pre-populated with a known key set; never touches the network.
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        let keys: Vec<SigningKey> = jwks.keys.iter().filter_map(SigningKey::from_jwk).collect();
        Self {
            http: reqwest::Client::new(),
            jwks_uri: String::new(),
            keys: OnceCell::from(keys),
        }
    }

    /// All cached signing keys, fetching them on the first call.
    pub async fn get_keys(&self) -> Result<&[SigningKey]> {
        let keys = self
            .keys
            .get_or_try_init(|| fetch_keys(&self.http, &self.jwks_uri))
            .await?;
        Ok(keys.as_slice())
    }

    /// Find the key with identifier `kid`.
    pub async fn resolve(&self, kid: &str) -> std::result::Result<SigningKey, VerifyError> {
        let keys = self
            .get_keys()
            .await
            .map_err(|e| VerifyError::KeyFetch(e.to_string()))?;
        keys.iter()
            .find(|k| k.kid == kid)
            .cloned()
            .ok_or_else(|| VerifyError::KeyNotFound(kid.to_string()))
    }
}

async fn fetch_keys(http: &reqwest::Client, jwks_uri: &str) -> Result<Vec<SigningKey>> {
    debug!(jwks_uri, "fetching signing keys");
    let response = http
        .get(jwks_uri)
        .send()
        .await
        .map_err(|e| Error::KeyFetch(format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::KeyFetch(format!("keys endpoint returned {status}")));
    }

    let raw: RawKeySet = response
        .json()
        .await
        .map_err(|e| Error::KeyFetch(format!("invalid key set: {e}")))?;

    let keys: Vec<SigningKey> = raw
        .keys
        .into_iter()
        .filter_map(|value| serde_json::from_value::<Jwk>(value).ok())
        .filter_map(|jwk| SigningKey::from_jwk(&jwk))
        .collect();

    info!(jwks_uri, keys = keys.len(), "loaded signing keys");
    Ok(keys)
}
