use crate::bucket::BucketState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Predicate handed to [`TokenStore::retain`]: `(key, state) -> keep`.
pub type RetainFn<'a> = &'a (dyn Fn(&str, &BucketState) -> bool + Send + Sync);

/// Abstract storage interface for bucket state.
///
/// This trait is designed to support both in-memory and distributed backends.
/// It assumes a key-value model where each value is a [`BucketState`], and
/// that writes can be made conditional on the value previously read.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current state for a key.
    async fn get(&self, key: &str) -> Result<Option<BucketState>, Self::Error>;

    /// Write `new` only if the stored state still equals `expected`.
    ///
    /// `expected == None` means the key must be absent. Returns `Ok(false)`
    /// when another writer got there first and the caller must re-read.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> Result<bool, Self::Error>;

    /// Drop every entry for which `keep` returns false, atomically per entry.
    ///
    /// Returns how many entries were removed.
    async fn retain(&self, keep: RetainFn<'_>) -> Result<usize, Self::Error>;

    /// Number of stored buckets.
    async fn len(&self) -> Result<usize, Self::Error>;
}

/// Simple in-memory token store.
///
/// Clones share the same map, so one store can back several limiters.
#[derive(Default, Clone, Debug)]
pub struct InMemoryTokenStore {
    data: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written BucketState,
    // so a poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BucketState>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    type Error = std::convert::Infallible;

    async fn get(&self, key: &str) -> Result<Option<BucketState>, Self::Error> {
        Ok(self.lock().get(key).copied())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> Result<bool, Self::Error> {
        let mut guard = self.lock();
        if guard.get(key).copied() != expected {
            return Ok(false);
        }
        guard.insert(key.to_string(), new);
        Ok(true)
    }

    async fn retain(&self, keep: RetainFn<'_>) -> Result<usize, Self::Error> {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|key, state| keep(key, state));
        Ok(before - guard.len())
    }

    async fn len(&self) -> Result<usize, Self::Error> {
        Ok(self.lock().len())
    }
}
