//! Per-resource concurrency pools
//!
//! Bounded-concurrency gates keyed by resource identity (an agent tool
//! name, or the shared auxiliary key for commands like test runners).
//! Admission is FIFO. Pools are created lazily and owned by an explicit
//! registry rather than module globals, so limits are testable in isolation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::debug;

/// Shared pool key for auxiliary (non-agent) commands.
pub const AUX_POOL_KEY: &str = "__aux__";

/// Lazily-created, keyed semaphore pools.
pub struct PoolRegistry {
    default_limit: Mutex<usize>,
    limits: Mutex<HashMap<String, usize>>,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl PoolRegistry {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: Mutex::new(default_limit.max(1)),
            limits: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Configured limit for `key`.
    pub fn limit_for(&self, key: &str) -> usize {
        let per_key = self
            .limits
            .lock()
            .ok()
            .and_then(|limits| limits.get(key).copied());
        per_key
            .or_else(|| self.default_limit.lock().ok().map(|limit| *limit))
            .unwrap_or(1)
            .max(1)
    }

    /// Change the limit for `key` and clear existing pools so the new limit
    /// applies to subsequently created pools. In-flight pools keep their
    /// original limit until their last holder releases.
    pub fn set_limit(&self, key: impl Into<String>, limit: usize) {
        let key = key.into();
        debug!("pool limit for {key} -> {limit}");
        if let Ok(mut limits) = self.limits.lock() {
            limits.insert(key, limit.max(1));
        }
        if let Ok(mut pools) = self.pools.lock() {
            pools.clear();
        }
    }

    /// Change the default limit; clears pools like `set_limit`.
    pub fn set_default_limit(&self, limit: usize) {
        if let Ok(mut default) = self.default_limit.lock() {
            *default = limit.max(1);
        }
        if let Ok(mut pools) = self.pools.lock() {
            pools.clear();
        }
    }

    fn pool(&self, key: &str) -> Arc<Semaphore> {
        let limit = self.limit_for(key);
        match self.pools.lock() {
            Ok(mut pools) => Arc::clone(
                pools
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(limit))),
            ),
            // Poisoned map: fall back to a throwaway gate rather than panic.
            Err(_) => Arc::new(Semaphore::new(limit)),
        }
    }

    /// Await a free slot for `key`, run `fut`, release the slot on
    /// completion or failure.
    pub async fn run<F, T>(&self, key: &str, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let pool = self.pool(key);
        // The semaphore is never closed; acquisition only fails if it were.
        let _permit = pool.acquire_owned().await.ok();
        fut.await
    }
}
