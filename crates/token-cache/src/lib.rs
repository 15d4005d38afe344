//! Per-user token cache and its durable persistence
//!
//! Holds every token the provider issued to one user (accounts, access
//! tokens, ID tokens, refresh tokens) in an MSAL-shaped document, decides
//! whether a cached pair can serve a request, and moves the document to and
//! from a keyed blob store.
//!
//! Request lifecycle:
//! 1. `CredentialStoreAdapter::load()` reads the user's blob (tolerating
//!    read-after-write lag on not-found)
//! 2. `matcher::plan()` picks a cached pair, refresh candidates or login
//! 3. The caller records new tokens with `TokenCache::add_tokens()`
//! 4. `CredentialStoreAdapter::save()` writes back only if something changed

pub mod cache;
pub mod error;
pub mod file_store;
pub mod matcher;
pub mod store;

pub use cache::{
    AccessToken, Account, CacheRecord, IdToken, NewTokens, RefreshToken, TokenCache, UserTokens,
};
pub use error::{Error, Result, StoreError};
pub use file_store::FileStore;
pub use matcher::{
    CacheLookup, CachedPair, IDENTITY_SCOPES, IdTokenValidator, RefreshPlan, find_cached_tokens,
    plan, resource_scopes,
};
pub use store::{BlobStore, CredentialStoreAdapter, LoadedCache, MemoryStore, RetryPolicy, StoredBlob};
