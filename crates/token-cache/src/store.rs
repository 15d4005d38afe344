//! Credential store adapter
//!
//! Moves a user's `TokenCache` to and from a keyed blob store. Blobs are
//! versioned: `save` hands back the version it loaded and the backend refuses
//! the write if another request persisted in between, so a freshly redeemed
//! refresh token is never silently overwritten by a stale copy.
//!
//! Backends are eventually consistent. A read right after a user's first
//! write may report not-found, so `load` retries not-found a few times before
//! concluding the user has no cache. Every other backend error propagates on
//! the first attempt.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::TokenCache;
use crate::error::{Result, StoreError};

/// A stored blob and the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub version: u64,
}

/// Keyed blob storage with optimistic concurrency.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn BlobStore>`).
pub trait BlobStore: Send + Sync {
    /// Read the blob at `key`. Missing keys are `StoreError::NotFound`.
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<StoredBlob, StoreError>> + Send + 'a>>;

    /// Write `data` at `key` if the stored version still equals
    /// `expected_version` (`None`: the key must not exist yet). Returns the
    /// new version; a mismatch is `StoreError::Conflict`.
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<u64, StoreError>> + Send + 'a>>;
}

/// How `load` treats not-found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total reads before giving up, including the first
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// A cache together with the store version it was read at.
#[derive(Debug, Clone, Default)]
pub struct LoadedCache {
    pub cache: TokenCache,
    version: Option<u64>,
}

impl LoadedCache {
    /// A cache that has never been persisted.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }
}

/// Loads and saves per-user token caches.
#[derive(Clone)]
pub struct CredentialStoreAdapter {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl CredentialStoreAdapter {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Read the cache stored under `user_key`.
    ///
    /// Returns `None` when the blob is still missing after every attempt.
    pub async fn load(&self, user_key: &str) -> Result<Option<LoadedCache>> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.get(user_key).await {
                Ok(blob) => {
                    let cache = TokenCache::from_slice(&blob.data)?;
                    debug!(user_key, version = blob.version, attempt, "loaded token cache");
                    return Ok(Some(LoadedCache {
                        cache,
                        version: Some(blob.version),
                    }));
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(user_key, attempt, attempts, "token cache not found");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                Err(e) => {
                    warn!(user_key, error = %e, "token cache read failed");
                    return Err(e.into());
                }
            }
        }
        info!(user_key, "no stored token cache, starting empty");
        Ok(None)
    }

    /// `load`, falling back to an empty never-persisted cache.
    pub async fn load_or_empty(&self, user_key: &str) -> Result<LoadedCache> {
        Ok(self.load(user_key).await?.unwrap_or_default())
    }

    /// Persist `loaded` if it changed since it was read.
    ///
    /// Returns whether a write happened. On success the cache is marked
    /// clean and its version advanced, so a second call is a no-op.
    pub async fn save(&self, user_key: &str, loaded: &mut LoadedCache) -> Result<bool> {
        if !loaded.cache.has_state_changed() {
            debug!(user_key, "token cache unchanged, skipping write");
            return Ok(false);
        }
        let data = loaded.cache.to_vec()?;
        let version = self.store.put(user_key, data, loaded.version).await?;
        loaded.version = Some(version);
        loaded.cache.mark_clean();
        debug!(user_key, version, "persisted token cache");
        Ok(true)
    }
}

/// In-process `BlobStore`.
///
/// Counts reads and writes and can simulate read-after-write lag by
/// answering the next N reads with not-found.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    lagging_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `reads` reads with not-found even if the key exists.
    pub fn with_read_lag(self, reads: usize) -> Self {
        self.lagging_reads.store(reads, Ordering::SeqCst);
        self
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored bytes for `key`, bypassing lag simulation.
    pub async fn raw(&self, key: &str) -> Option<StoredBlob> {
        self.blobs.lock().await.get(key).cloned()
    }
}

impl BlobStore for MemoryStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<StoredBlob, StoreError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let lagging = self
                .lagging_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lagging {
                return Err(StoreError::NotFound(key.to_string()));
            }
            self.blobs
                .lock()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<u64, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut blobs = self.blobs.lock().await;
            let current = blobs.get(key).map(|b| b.version);
            if current != expected_version {
                return Err(StoreError::Conflict(key.to_string()));
            }
            let version = current.map_or(1, |v| v + 1);
            blobs.insert(key.to_string(), StoredBlob { data, version });
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(version)
        })
    }
}
