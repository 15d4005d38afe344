//! Cached token matching
//!
//! Decides whether a user's cache can serve a request for a set of scopes
//! without contacting the provider, needs a silent refresh, or cannot help
//! at all. The decision is pure apart from ID token re-verification, which
//! goes through `IdTokenValidator` so this crate stays free of any signing
//! key handling.
//!
//! Matching rules:
//! - OpenID scopes (`openid`, `profile`, `email`, `offline_access`) are
//!   satisfied by the ID token and ignored when comparing scope sets
//! - Access tokens are examined in insertion order; the first whose granted
//!   scopes cover the request decides the outcome, there is no ranking
//! - A cached ID token may have expired since it was stored, so it is
//!   re-verified on every hit

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::cache::{AccessToken, IdToken, RefreshToken, TokenCache, UserTokens};

/// Scopes answered by the ID token rather than an access token grant.
pub const IDENTITY_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

/// Re-verifies a cached ID token at read time.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility.
pub trait IdTokenValidator: Send + Sync {
    /// Whether `id_token` still verifies (signature, expiry, audience, issuer).
    fn is_valid<'a>(&'a self, id_token: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// A cached access token with an ID token that verified just now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPair {
    pub access_token: AccessToken,
    pub id_token: IdToken,
}

/// Result of searching one user's cached access tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Valid access token and verified ID token; no network call needed
    Hit(CachedPair),
    /// Matching access token found but unusable; this refresh token can renew it
    Refresh(RefreshToken),
    /// Matching access token found but unusable and nothing to refresh with
    NoUsableToken,
    /// No cached access token covers the requested scopes
    NoMatch,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPlan {
    CacheHit(CachedPair),
    /// Redeem these refresh tokens in order until one succeeds.
    Refresh { candidates: Vec<RefreshToken> },
    /// Nothing in the cache can produce a token; interactive login needed.
    LoginRequired,
}

/// Requested scopes minus the identity scopes, lowercased.
pub fn resource_scopes(required: &[String]) -> Vec<String> {
    required
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| !IDENTITY_SCOPES.contains(&s.as_str()))
        .collect()
}

fn same_triple(home_account_id: &str, client_id: &str, realm: &str, at: &AccessToken) -> bool {
    at.home_account_id == home_account_id && at.client_id == client_id && at.realm == realm
}

/// Search `view` for a token pair for `client_id` covering `required_scopes`.
pub async fn find_cached_tokens(
    view: &UserTokens<'_>,
    client_id: &str,
    required_scopes: &[String],
    validator: &dyn IdTokenValidator,
    now: u64,
) -> CacheLookup {
    let wanted = resource_scopes(required_scopes);

    let matched = view.access_tokens.iter().copied().find(|at| {
        let granted = at.scopes();
        at.client_id == client_id && wanted.iter().all(|s| granted.contains(s))
    });
    let Some(at) = matched else {
        debug!(client_id, scopes = ?wanted, "no cached access token covers scopes");
        return CacheLookup::NoMatch;
    };

    if at.is_valid_at(now) {
        for idt in view.id_tokens.iter().copied() {
            if !same_triple(&idt.home_account_id, &idt.client_id, &idt.realm, at) {
                continue;
            }
            if validator.is_valid(&idt.secret).await {
                return CacheLookup::Hit(CachedPair {
                    access_token: at.clone(),
                    id_token: idt.clone(),
                });
            }
        }
        debug!(home_account_id = %at.home_account_id, "cached ID token no longer verifies");
    } else {
        debug!(home_account_id = %at.home_account_id, expires_on = at.expires_on, "cached access token expired");
    }

    view.refresh_tokens
        .iter()
        .copied()
        .find(|rt| same_triple(&rt.home_account_id, &rt.client_id, &rt.realm, at))
        .map_or(CacheLookup::NoUsableToken, |rt| CacheLookup::Refresh(rt.clone()))
}

/// Decide between a cache hit, a silent refresh and interactive login.
///
/// When the scope search yields nothing usable, the account's own refresh
/// tokens for this client are tried as a fallback, which covers scopes that
/// were never requested before.
pub async fn plan(
    cache: &TokenCache,
    home_account_id: &str,
    client_id: &str,
    required_scopes: &[String],
    validator: &dyn IdTokenValidator,
    now: u64,
) -> RefreshPlan {
    let view = cache.user_tokens(home_account_id);
    let mut candidates = Vec::new();

    match find_cached_tokens(&view, client_id, required_scopes, validator, now).await {
        CacheLookup::Hit(pair) => return RefreshPlan::CacheHit(pair),
        CacheLookup::Refresh(rt) => candidates.push(rt),
        CacheLookup::NoUsableToken | CacheLookup::NoMatch => {}
    }

    if let Some(account) = view.account {
        for rt in view.refresh_tokens.iter().copied() {
            if rt.home_account_id == account.home_account_id
                && rt.client_id == client_id
                && !candidates.contains(rt)
            {
                candidates.push(rt.clone());
            }
        }
    }

    if candidates.is_empty() {
        debug!(home_account_id, "no cached account or refresh token");
        return RefreshPlan::LoginRequired;
    }
    RefreshPlan::Refresh { candidates }
}
