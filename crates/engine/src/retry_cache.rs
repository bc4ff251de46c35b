//! Retry state that survives transaction rollbacks.
//!
//! Every failed attempt for a logical item is registered under its key. After
//! the rollback the chunk is replayed, and the engine looks the key up again to
//! learn whether the item still has attempts left or must be recovered.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ConfigError;

pub const DEFAULT_CAPACITY: usize = 4096;

/// Identity of a logical item (or of a whole chunk write).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Item(u64),
    Named(String),
    Batch(Vec<ItemKey>),
}

impl ItemKey {
    pub fn of<T: Hash>(item: &T) -> Self {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        ItemKey::Item(hasher.finish())
    }
}

/// Maps items to their retry keys.
pub type KeyGenerator<I> = Arc<dyn Fn(&I) -> ItemKey + Send + Sync>;

pub fn hash_key_generator<I: Hash>() -> KeyGenerator<I> {
    Arc::new(|item: &I| ItemKey::of(item))
}

/// Failure history of one key.
#[derive(Debug)]
pub struct RetryContext {
    pub attempts: u32,
    /// Whether the failure was eligible for retry at all.
    pub retryable: bool,
    /// No attempts left: the next replay must recover the item.
    pub exhausted: bool,
    pub last_error: anyhow::Error,
}

/// Snapshot of a context without its error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub exhausted: bool,
}

#[derive(Debug)]
pub struct RetryContextCache {
    contexts: Mutex<HashMap<ItemKey, RetryContext>>,
    capacity: usize,
}

impl Default for RetryContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RetryContextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemKey, RetryContext>> {
        // Contexts stay consistent under panic: every update is a single insert.
        match self.contexts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self, key: &ItemKey) -> Option<RetryState> {
        self.lock().get(key).map(|ctx| RetryState {
            attempts: ctx.attempts,
            exhausted: ctx.exhausted,
        })
    }

    pub fn is_exhausted(&self, key: &ItemKey) -> bool {
        self.state(key).is_some_and(|s| s.exhausted)
    }

    /// Record one more failed attempt.
    ///
    /// `can_retry` receives the attempt count including this failure.
    pub fn register_failure(
        &self,
        key: &ItemKey,
        err: anyhow::Error,
        retryable: bool,
        can_retry: impl FnOnce(u32) -> bool,
    ) -> Result<RetryState, ConfigError> {
        let mut contexts = self.lock();
        let attempts = match contexts.get(key) {
            Some(ctx) => ctx.attempts + 1,
            None if contexts.len() >= self.capacity => {
                return Err(ConfigError::RetryCacheFull {
                    capacity: self.capacity,
                });
            }
            None => 1,
        };
        let exhausted = !(retryable && can_retry(attempts));
        contexts.insert(
            key.clone(),
            RetryContext {
                attempts,
                retryable,
                exhausted,
                last_error: err,
            },
        );
        Ok(RetryState {
            attempts,
            exhausted,
        })
    }

    /// Remove and return the context, for recovery.
    pub fn take(&self, key: &ItemKey) -> Option<RetryContext> {
        self.lock().remove(key)
    }

    pub fn discard(&self, key: &ItemKey) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
