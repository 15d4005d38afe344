//! Per-user serialization of cache read-modify-write
//!
//! Two concurrent requests for the same user must not both load the cache,
//! refresh, and save: the second save would drop the refresh token the first
//! one just obtained. Each user key gets its own async mutex; requests for
//! different users never contend.
//!
//! Entries are held weakly and pruned on the next acquisition once no guard
//! references them, so the map only ever holds users with requests in flight.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

#[derive(Default)]
pub struct UserLocks {
    entries: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_key`'s cache.
    pub async fn lock(&self, user_key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.retain(|_, weak| weak.strong_count() > 0);
            match entries.get(user_key).and_then(Weak::upgrade) {
                Some(entry) => entry,
                None => {
                    let entry = Arc::new(Mutex::new(()));
                    entries.insert(user_key.to_string(), Arc::downgrade(&entry));
                    entry
                }
            }
        };
        trace!(user_key, "waiting for user lock");
        entry.lock_owned().await
    }

    /// Number of users with a live lock entry.
    pub async fn active(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|w| w.strong_count() > 0).count()
    }
}
