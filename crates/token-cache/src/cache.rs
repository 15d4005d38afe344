//! In-memory token cache
//!
//! One document per user, laid out like an MSAL serialized cache: four
//! sections (`Account`, `AccessToken`, `IdToken`, `RefreshToken`), each an
//! insertion-ordered map from cache key to record. Sections this crate does
//! not model (e.g. `AppMetadata`) survive a load/save round trip untouched.
//!
//! Every mutation sets the dirty flag. `CredentialStoreAdapter::save` only
//! writes dirty caches and clears the flag afterwards.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Epoch-second timestamps. MSAL writes them as strings; numbers are
/// accepted too.
mod epoch_secs {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// `"{oid}.{tid}"`
    pub home_account_id: String,
    pub environment: String,
    /// Tenant id
    pub realm: String,
    /// Object id
    pub local_account_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_authority_type")]
    pub authority_type: String,
}

fn default_authority_type() -> String {
    "MSSTS".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub home_account_id: String,
    pub environment: String,
    pub client_id: String,
    pub realm: String,
    /// Space-separated granted scopes
    pub target: String,
    pub secret: String,
    #[serde(with = "epoch_secs")]
    pub expires_on: u64,
    #[serde(default, with = "epoch_secs")]
    pub cached_at: u64,
    #[serde(default, with = "epoch_secs")]
    pub extended_expires_on: u64,
}

impl AccessToken {
    /// Granted scopes, lowercased.
    pub fn scopes(&self) -> Vec<String> {
        split_scopes(&self.target)
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        self.expires_on > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdToken {
    pub home_account_id: String,
    pub environment: String,
    pub client_id: String,
    pub realm: String,
    /// Signed ID token; must be re-verified before use.
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub home_account_id: String,
    pub environment: String,
    pub client_id: String,
    #[serde(default)]
    pub realm: String,
    pub secret: String,
}

/// A record kind stored in one section of the cache.
pub trait CacheRecord: Clone + Serialize + DeserializeOwned {
    /// Key under which the record is stored in its section.
    fn cache_key(&self) -> String;
    fn section(cache: &TokenCache) -> &IndexMap<String, Self>;
    fn section_mut(cache: &mut TokenCache) -> &mut IndexMap<String, Self>;
}

impl CacheRecord for Account {
    fn cache_key(&self) -> String {
        format!("{}-{}-{}", self.home_account_id, self.environment, self.realm).to_lowercase()
    }
    fn section(cache: &TokenCache) -> &IndexMap<String, Self> {
        &cache.accounts
    }
    fn section_mut(cache: &mut TokenCache) -> &mut IndexMap<String, Self> {
        &mut cache.accounts
    }
}

impl CacheRecord for AccessToken {
    fn cache_key(&self) -> String {
        format!(
            "{}-{}-accesstoken-{}-{}-{}",
            self.home_account_id, self.environment, self.client_id, self.realm, self.target
        )
        .to_lowercase()
    }
    fn section(cache: &TokenCache) -> &IndexMap<String, Self> {
        &cache.access_tokens
    }
    fn section_mut(cache: &mut TokenCache) -> &mut IndexMap<String, Self> {
        &mut cache.access_tokens
    }
}

impl CacheRecord for IdToken {
    fn cache_key(&self) -> String {
        format!(
            "{}-{}-idtoken-{}-{}-",
            self.home_account_id, self.environment, self.client_id, self.realm
        )
        .to_lowercase()
    }
    fn section(cache: &TokenCache) -> &IndexMap<String, Self> {
        &cache.id_tokens
    }
    fn section_mut(cache: &mut TokenCache) -> &mut IndexMap<String, Self> {
        &mut cache.id_tokens
    }
}

impl CacheRecord for RefreshToken {
    fn cache_key(&self) -> String {
        format!(
            "{}-{}-refreshtoken-{}-{}-",
            self.home_account_id, self.environment, self.client_id, self.realm
        )
        .to_lowercase()
    }
    fn section(cache: &TokenCache) -> &IndexMap<String, Self> {
        &cache.refresh_tokens
    }
    fn section_mut(cache: &mut TokenCache) -> &mut IndexMap<String, Self> {
        &mut cache.refresh_tokens
    }
}

/// Tokens from one successful token endpoint response, ready to be cached.
#[derive(Debug, Clone)]
pub struct NewTokens {
    /// Object id from the verified ID token
    pub oid: String,
    /// Tenant id from the verified ID token
    pub tid: String,
    pub environment: String,
    pub client_id: String,
    pub username: String,
    pub access_token: String,
    pub scopes: Vec<String>,
    /// Absolute expiry, epoch seconds
    pub expires_on: u64,
    pub extended_expires_on: Option<u64>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub cached_at: u64,
}

impl NewTokens {
    pub fn home_account_id(&self) -> String {
        format!("{}.{}", self.oid, self.tid)
    }
}

/// Everything cached for one account, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct UserTokens<'a> {
    pub account: Option<&'a Account>,
    pub access_tokens: Vec<&'a AccessToken>,
    pub id_tokens: Vec<&'a IdToken>,
    pub refresh_tokens: Vec<&'a RefreshToken>,
}

/// A single user's token cache document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(rename = "Account", default)]
    accounts: IndexMap<String, Account>,
    #[serde(rename = "AccessToken", default)]
    access_tokens: IndexMap<String, AccessToken>,
    #[serde(rename = "IdToken", default)]
    id_tokens: IndexMap<String, IdToken>,
    #[serde(rename = "RefreshToken", default)]
    refresh_tokens: IndexMap<String, RefreshToken>,
    #[serde(flatten)]
    other: Map<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialize a persisted blob. The result starts clean.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Records of kind `R` matching `predicate`, in insertion order.
    pub fn find<R: CacheRecord>(&self, predicate: impl Fn(&R) -> bool) -> Vec<&R> {
        R::section(self).values().filter(|r| predicate(r)).collect()
    }

    /// Insert or replace a record under its cache key.
    pub fn upsert<R: CacheRecord>(&mut self, record: R) {
        let key = record.cache_key();
        R::section_mut(self).insert(key, record);
        self.mark_dirty();
    }

    /// Remove every record of kind `R` matching `predicate`; returns how many.
    pub fn remove_where<R: CacheRecord>(&mut self, predicate: impl Fn(&R) -> bool) -> usize {
        let section = R::section_mut(self);
        let before = section.len();
        section.retain(|_, r| !predicate(r));
        let removed = before - section.len();
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.access_tokens.is_empty()
            && self.id_tokens.is_empty()
            && self.refresh_tokens.is_empty()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Called after a successful write.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Whether anything changed since load (or the last `mark_clean`).
    pub fn has_state_changed(&self) -> bool {
        self.dirty
    }

    /// Account and tokens stored under `home_account_id`.
    pub fn user_tokens(&self, home_account_id: &str) -> UserTokens<'_> {
        UserTokens {
            account: self
                .accounts
                .values()
                .find(|a| a.home_account_id == home_account_id),
            access_tokens: self.find(|t: &AccessToken| t.home_account_id == home_account_id),
            id_tokens: self.find(|t: &IdToken| t.home_account_id == home_account_id),
            refresh_tokens: self.find(|t: &RefreshToken| t.home_account_id == home_account_id),
        }
    }

    /// Record a token endpoint response.
    ///
    /// Access tokens for the same account, client and realm whose scopes
    /// overlap the new grant are replaced, so one scope set never has two
    /// competing entries.
    pub fn add_tokens(&mut self, tokens: NewTokens) {
        let home_account_id = tokens.home_account_id();
        let new_scopes: Vec<String> = tokens.scopes.iter().map(|s| s.to_lowercase()).collect();

        self.upsert(Account {
            home_account_id: home_account_id.clone(),
            environment: tokens.environment.clone(),
            realm: tokens.tid.clone(),
            local_account_id: tokens.oid.clone(),
            username: tokens.username.clone(),
            authority_type: default_authority_type(),
        });

        let replaced = self.remove_where(|t: &AccessToken| {
            t.home_account_id == home_account_id
                && t.client_id == tokens.client_id
                && t.realm == tokens.tid
                && t.scopes().iter().any(|s| new_scopes.contains(s))
        });

        self.upsert(AccessToken {
            home_account_id: home_account_id.clone(),
            environment: tokens.environment.clone(),
            client_id: tokens.client_id.clone(),
            realm: tokens.tid.clone(),
            target: tokens.scopes.join(" "),
            secret: tokens.access_token,
            expires_on: tokens.expires_on,
            cached_at: tokens.cached_at,
            extended_expires_on: tokens.extended_expires_on.unwrap_or(tokens.expires_on),
        });

        if let Some(secret) = tokens.id_token {
            self.upsert(IdToken {
                home_account_id: home_account_id.clone(),
                environment: tokens.environment.clone(),
                client_id: tokens.client_id.clone(),
                realm: tokens.tid.clone(),
                secret,
            });
        }

        if let Some(secret) = tokens.refresh_token {
            self.upsert(RefreshToken {
                home_account_id: home_account_id.clone(),
                environment: tokens.environment,
                client_id: tokens.client_id,
                realm: tokens.tid,
                secret,
            });
        }

        debug!(home_account_id, replaced, "cached token response");
    }
}

/// Split a space-separated scope string into lowercase scopes.
pub(crate) fn split_scopes(target: &str) -> Vec<String> {
    target.split_whitespace().map(str::to_lowercase).collect()
}
