//! Request pool service port: user-to-pool resolution and pool configs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::PoolConfig;
use crate::error::AdmissionError;

/// Name assigned to requests that do not ask for a specific pool.
pub const DEFAULT_POOL_NAME: &str = "default-pool";

/// Resolves users to pools and serves pool configuration snapshots.
#[async_trait]
pub trait RequestPoolService: Send + Sync {
    /// Maps a submitting user and an optionally requested pool name to the
    /// pool the request will be admitted under.
    async fn resolve_pool(&self, user: &str, requested_pool: &str)
        -> Result<String, AdmissionError>;

    /// Snapshot of the configuration for `pool_name`.
    async fn pool_config(&self, pool_name: &str) -> Result<PoolConfig, AdmissionError>;
}

/// In-memory pool service. Unknown pools resolve to a default config so a
/// cluster without placement rules still admits queries.
#[derive(Debug, Default)]
pub struct StaticPoolService {
    pools: RwLock<HashMap<String, PoolConfig>>,
}

impl StaticPoolService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_pool(&self, name: impl Into<String>, config: PoolConfig) {
        self.pools.write().await.insert(name.into(), config);
    }
}

#[async_trait]
impl RequestPoolService for StaticPoolService {
    async fn resolve_pool(
        &self,
        _user: &str,
        requested_pool: &str,
    ) -> Result<String, AdmissionError> {
        if requested_pool.is_empty() {
            Ok(DEFAULT_POOL_NAME.to_string())
        } else {
            Ok(requested_pool.to_string())
        }
    }

    async fn pool_config(&self, pool_name: &str) -> Result<PoolConfig, AdmissionError> {
        Ok(self.pools.read().await.get(pool_name).cloned().unwrap_or_default())
    }
}
