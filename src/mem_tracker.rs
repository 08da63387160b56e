//! Process memory tracker port.
//!
//! Reports memory reserved and consumed by fragments executing on this
//! backend, broken down by pool. Consulted lazily just before local stats
//! are published to the cluster topic; never used for local decisions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read-only view into the process-wide memory tracker.
pub trait PoolMemTracker: Send + Sync {
    /// Memory reserved on this backend by fragments of `pool`: the mem
    /// limit for queries that have one, current consumption otherwise.
    fn pool_mem_reserved(&self, pool: &str) -> i64;

    /// Current consumption on this backend by fragments of `pool`.
    fn pool_mem_usage(&self, pool: &str) -> i64;
}

/// Tracker for deployments where the backend executes no fragments.
#[derive(Debug, Default)]
pub struct NoopMemTracker;

impl PoolMemTracker for NoopMemTracker {
    fn pool_mem_reserved(&self, _pool: &str) -> i64 {
        0
    }

    fn pool_mem_usage(&self, _pool: &str) -> i64 {
        0
    }
}

/// Settable tracker used by embedders that account memory elsewhere.
#[derive(Debug, Default)]
pub struct StaticMemTracker {
    by_pool: RwLock<HashMap<String, (i64, i64)>>,
}

impl StaticMemTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_pool(&self, pool: impl Into<String>, reserved: i64, usage: i64) {
        self.by_pool
            .write()
            .unwrap()
            .insert(pool.into(), (reserved, usage));
    }
}

impl PoolMemTracker for StaticMemTracker {
    fn pool_mem_reserved(&self, pool: &str) -> i64 {
        self.by_pool.read().unwrap().get(pool).map_or(0, |v| v.0)
    }

    fn pool_mem_usage(&self, pool: &str) -> i64 {
        self.by_pool.read().unwrap().get(pool).map_or(0, |v| v.1)
    }
}
