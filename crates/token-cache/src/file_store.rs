//! File-backed blob store
//!
//! One file per user key under a directory: `{dir}/{user_key}.json`, holding
//! the cache document and its version. The document is embedded verbatim so
//! section order (and with it match order) survives a round trip. Writes use atomic temp-file + rename
//! so a crash never leaves a half-written cache, and files are 0600 since
//! they hold refresh tokens. A tokio Mutex serializes the version check and
//! the write within this process.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{BlobStore, StoredBlob};

type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u64,
    cache: Box<RawValue>,
}

pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Store rooted at `dir`, created (0700 on unix) if missing.
    pub async fn open(dir: PathBuf) -> StoreResult<Self> {
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::Backend(format!("creating store directory: {e}")))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                    .await
                    .map_err(|e| {
                        StoreError::Backend(format!("setting store directory permissions: {e}"))
                    })?;
            }
            info!(dir = %dir.display(), "created token cache directory");
        }
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for `key`. Keys are `{oid}.{tid}`; anything that could escape the
    /// directory is rejected.
    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(StoreError::Backend(format!("invalid user key {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn read_envelope(path: &Path, key: &str) -> StoreResult<Envelope> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(StoreError::Backend(format!("reading cache file: {e}"))),
        };
        serde_json::from_slice(&contents)
            .map_err(|e| StoreError::Backend(format!("parsing cache file: {e}")))
    }
}

impl BlobStore for FileStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<StoredBlob>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let envelope = Self::read_envelope(&path, key).await?;
            Ok(StoredBlob {
                data: envelope.cache.get().as_bytes().to_vec(),
                version: envelope.version,
            })
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<u64>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let cache: Box<RawValue> = serde_json::from_slice(&data)
                .map_err(|e| StoreError::Backend(format!("cache blob is not JSON: {e}")))?;

            let _guard = self.write_lock.lock().await;
            let current = match Self::read_envelope(&path, key).await {
                Ok(envelope) => Some(envelope.version),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            if current != expected_version {
                debug!(key, ?current, ?expected_version, "rejecting stale cache write");
                return Err(StoreError::Conflict(key.to_string()));
            }

            let version = current.map_or(1, |v| v + 1);
            write_atomic(&path, &Envelope { version, cache }).await?;
            Ok(version)
        })
    }
}

/// Write `envelope` to `path` atomically.
///
/// Writes a temp file in the same directory, then renames it over the
/// target. Permissions are 0600 (owner read/write only).
async fn write_atomic(path: &Path, envelope: &Envelope) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(envelope)
        .map_err(|e| StoreError::Backend(format!("serializing cache file: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Backend("cache path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Backend("cache path has no file name".into()))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| StoreError::Backend(format!("writing temp cache file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StoreError::Backend(format!("setting cache file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Backend(format!("renaming temp cache file: {e}")))?;

    debug!(path = %path.display(), version = envelope.version, "persisted cache file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AccessToken, NewTokens, TokenCache};
    use crate::store::{CredentialStoreAdapter, LoadedCache, RetryPolicy};
    use std::sync::Arc;
    use std::time::Duration;

    fn cache_bytes() -> Vec<u8> {
        let mut cache = TokenCache::new();
        cache.add_tokens(NewTokens {
            oid: "u1".into(),
            tid: "t".into(),
            environment: "login.microsoftonline.com".into(),
            client_id: "client".into(),
            username: "u1@example.com".into(),
            access_token: "at".into(),
            scopes: vec!["api://x/read".into()],
            expires_on: 10_000,
            extended_expires_on: None,
            id_token: None,
            refresh_token: Some("rt".into()),
            cached_at: 1_000,
        });
        cache.to_vec().unwrap()
    }

    #[tokio::test]
    async fn roundtrip_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("caches")).await.unwrap();

        let version = store.put("u1.t", cache_bytes(), None).await.unwrap();
        assert_eq!(version, 1);

        let blob = store.get("u1.t").await.unwrap();
        assert_eq!(blob.version, 1);
        let cache = TokenCache::from_slice(&blob.data).unwrap();
        assert_eq!(cache.find(|_: &AccessToken| true)[0].secret, "at");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        let err = store.get("nobody.t").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("nobody.t".into()));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();

        store.put("u1.t", cache_bytes(), None).await.unwrap();
        assert_eq!(store.put("u1.t", cache_bytes(), Some(1)).await.unwrap(), 2);

        let err = store.put("u1.t", cache_bytes(), Some(1)).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict("u1.t".into()));
        let err = store.put("u1.t", cache_bytes(), None).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict("u1.t".into()));
    }

    #[tokio::test]
    async fn path_traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        for key in ["../escape", "a/b", "", ".hidden"] {
            let err = store.put(key, cache_bytes(), None).await.unwrap_err();
            assert!(matches!(err, StoreError::Backend(_)), "{key:?} got: {err:?}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        store.put("u1.t", cache_bytes(), None).await.unwrap();

        let metadata = tokio::fs::metadata(dir.path().join("u1.t.json")).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "cache file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn reload_keeps_access_token_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().to_path_buf()).await.unwrap());
        let adapter = CredentialStoreAdapter::new(store);

        let mut loaded = LoadedCache::empty();
        for scope in ["zzz", "aaa"] {
            loaded.cache.add_tokens(NewTokens {
                oid: "u1".into(),
                tid: "t".into(),
                environment: "login.microsoftonline.com".into(),
                client_id: "client".into(),
                username: "u1@example.com".into(),
                access_token: format!("at-{scope}"),
                scopes: vec![scope.into()],
                expires_on: 10_000,
                extended_expires_on: None,
                id_token: None,
                refresh_token: None,
                cached_at: 1_000,
            });
        }
        adapter.save("u1.t", &mut loaded).await.unwrap();

        let reloaded = adapter.load("u1.t").await.unwrap().unwrap();
        let order: Vec<&str> = reloaded
            .cache
            .find(|_: &AccessToken| true)
            .into_iter()
            .map(|t| t.secret.as_str())
            .collect();
        assert_eq!(order, vec!["at-zzz", "at-aaa"]);
    }

    #[tokio::test]
    async fn adapter_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().to_path_buf()).await.unwrap());
        let adapter = CredentialStoreAdapter::with_retry(
            store,
            RetryPolicy {
                attempts: 1,
                backoff: Duration::ZERO,
            },
        );

        assert!(adapter.load("u1.t").await.unwrap().is_none());

        let mut loaded = LoadedCache::empty();
        loaded.cache = TokenCache::from_slice(&cache_bytes()).unwrap();
        loaded.cache.mark_dirty();
        assert!(adapter.save("u1.t", &mut loaded).await.unwrap());

        let reloaded = adapter.load("u1.t").await.unwrap().unwrap();
        assert_eq!(
            reloaded.cache.find(|_: &AccessToken| true),
            loaded.cache.find(|_: &AccessToken| true)
        );
    }
}
