//! Content cache and build cache.
//!
//! - [`Cache`]: typed, at-most-once `fetch` over a byte-oriented [`CacheStore`]
//! - [`BuildCache`]: resolve/lookup memoization with watch-driven invalidation

mod build;
mod store;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

pub use build::BuildCache;
pub use store::{DEFAULT_CAPACITY, FileStore, MemoryStore, NullStore};

/// Key/value storage of serialized cache entries.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &str);

    fn clear(&self);
}

/// Typed front of a [`CacheStore`], shareable between environments.
///
/// Computation per key happens at most once at a time: concurrent callers
/// for the same key wait for the first one and then read its value.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    inflight: Arc<DashMap<String, Arc<ReentrantMutex<()>>>>,
}

impl Cache {
    pub fn new(store: impl CacheStore + 'static) -> Self {
        Self::from_store(Arc::new(store))
    }

    pub fn from_store(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Decoded value under `key`; undecodable entries count as misses.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.store.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                crate::debug!("cache"; "discarding undecodable entry {}: {}", key, e);
                None
            }
        }
    }

    /// Store a value; store failures are logged, not raised.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let result = serde_json::to_vec(value)
            .map_err(Into::into)
            .and_then(|bytes| self.store.set(key, bytes));
        if let Err(e) = result {
            crate::log!("cache"; "failed to store {}: {}", key, e);
        }
    }

    pub fn delete(&self, key: &str) {
        self.store.delete(key);
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Read-through lookup: compute and commit on a miss.
    pub fn fetch<T, F>(&self, key: &str, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        self.fetch_with(key, |_| true, compute)
    }

    /// Like [`fetch`](Self::fetch), but a cached value rejected by `valid` is
    /// recomputed and overwritten.
    ///
    /// A failed computation commits nothing.
    pub fn fetch_with<T, V, F>(&self, key: &str, valid: V, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        V: FnOnce(&T) -> bool,
        F: FnOnce() -> Result<T>,
    {
        let lock = Arc::clone(
            self.inflight
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
                .value(),
        );

        let result = {
            let _guard = lock.lock();
            match self.get::<T>(key) {
                Some(value) if valid(&value) => {
                    crate::debug!("cache"; "hit {}", key);
                    Ok(value)
                }
                _ => compute().inspect(|value| self.set(key, value)),
            }
        };

        drop(lock);
        self.inflight
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(MemoryStore::default())
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("inflight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}
