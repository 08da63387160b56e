//! Engine-wide defaults and per-pool configuration snapshots.
//!
//! Pool configs are read-only snapshots resolved through the request pool
//! service; the controller never mutates them. A limit value of 0 means
//! "unconfigured" and a negative value disables the pool outright.

use serde::{Deserialize, Serialize};

/// Engine-wide admission defaults, fixed at controller construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Default time a request may wait in the queue before it is timed out.
    /// Used when the pool does not configure its own timeout.
    pub queue_wait_timeout_ms: i64,

    /// Interval at which the cluster messaging bus delivers topic updates.
    /// Admission state older than twice this interval is considered stale.
    pub statestore_update_interval_ms: i64,

    /// Physical memory of this host; per-backend memory to admit is capped
    /// here since both user-provided limits and planner estimates can be
    /// unreasonable.
    pub physical_mem_bytes: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_wait_timeout_ms: 60_000,
            statestore_update_interval_ms: 500,
            physical_mem_bytes: i64::MAX,
        }
    }
}

/// Per-pool admission policy, as returned by the request pool service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Aggregate cluster-wide memory that may be admitted to this pool.
    pub max_mem_resources: i64,

    /// Maximum number of concurrently running queries across the cluster.
    pub max_requests: i64,

    /// Maximum number of requests queued at a single coordinator.
    pub max_queued: i64,

    /// Lower bound applied to every query's per-backend memory limit.
    pub min_query_mem_limit: i64,

    /// Upper bound applied to every query's per-backend memory limit.
    pub max_query_mem_limit: i64,

    /// Whether the MEM_LIMIT query option is clamped by the pool's
    /// min/max query mem limits.
    pub clamp_mem_limit_query_option: bool,

    /// Per-executor multipliers used to derive the limits above when the
    /// absolute values are unconfigured. Scale with cluster size.
    pub max_running_queries_multiple: f64,
    pub max_queued_queries_multiple: f64,
    pub max_memory_multiple: i64,

    /// Pool-specific queue timeout; 0 falls back to the engine default.
    pub queue_timeout_ms: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_mem_resources: 0,
            max_requests: 0,
            max_queued: 0,
            min_query_mem_limit: 0,
            max_query_mem_limit: 0,
            clamp_mem_limit_query_option: true,
            max_running_queries_multiple: 0.0,
            max_queued_queries_multiple: 0.0,
            max_memory_multiple: 0,
            queue_timeout_ms: 0,
        }
    }
}
