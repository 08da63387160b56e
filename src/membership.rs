//! Cluster membership port.
//!
//! The membership service tells the controller which executor hosts exist
//! and how much memory each one allows admission to commit. The controller
//! only ever reads immutable snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Admission-relevant description of one executor host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDescriptor {
    /// Memory on this host available for admission; <= 0 means unlimited.
    pub admit_mem_limit: i64,
}

/// Point-in-time view of the executor group.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub hosts: HashMap<String, HostDescriptor>,
}

impl ClusterSnapshot {
    /// Number of executors, clamped to a minimum of 1 so that scalable
    /// pool limits never collapse to zero on a starting cluster.
    pub fn cluster_size(&self) -> i64 {
        std::cmp::max(1, self.hosts.len() as i64)
    }

    pub fn host_mem_limit(&self, host: &str) -> Option<i64> {
        self.hosts.get(host).map(|h| h.admit_mem_limit)
    }
}

/// Source of cluster membership snapshots.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn snapshot(&self) -> ClusterSnapshot;
}

/// In-memory membership used by embedders and tests.
#[derive(Debug, Default)]
pub struct StaticMembership {
    snapshot: RwLock<ClusterSnapshot>,
}

impl StaticMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds a membership of `count` hosts named `host-<i>:25000`, each
    /// with the same admission memory limit.
    pub fn with_hosts(count: usize, admit_mem_limit: i64) -> Arc<Self> {
        let hosts = (0..count)
            .map(|i| (format!("host-{i}:25000"), HostDescriptor { admit_mem_limit }))
            .collect();
        Arc::new(Self { snapshot: RwLock::new(ClusterSnapshot { hosts }) })
    }

    pub async fn set_hosts(&self, hosts: HashMap<String, HostDescriptor>) {
        *self.snapshot.write().await = ClusterSnapshot { hosts };
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot.read().await.clone()
    }
}
