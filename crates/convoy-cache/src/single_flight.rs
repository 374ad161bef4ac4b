use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

/// Per-key mutual exclusion for cache operations.
///
/// Concurrent operations on the same hash serialize behind one lock while
/// distinct hashes proceed fully in parallel. This replaces a directory-wide
/// lock: the cache directory is shared, but contention is only real when two
/// workers touch the same artifact.
#[derive(Default)]
pub(crate) struct SingleFlight {
    // Entries accumulate for the lifetime of a run, bounded by the number
    // of distinct task hashes.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, creating it on first use.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("single flight lock poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
