//! Per-pool admission statistics.
//!
//! Each pool tracks this coordinator's own contribution eagerly
//! (`local_stats`, `local_mem_admitted`) and the last-received contribution
//! of every remote coordinator. Cluster-wide aggregates are recomputed
//! whenever a topic delta is processed and adjusted eagerly by local
//! admissions, so decisions always see locally-committed memory even when
//! remote state is in flight. All methods expect the admission lock held.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::feasibility;
use crate::metrics::PoolMetrics;
use crate::schedule::QuerySchedule;
use crate::topic::LocalPoolStats;

const HISTOGRAM_NUM_OF_BINS: usize = 128;
const HISTOGRAM_BIN_SIZE: i64 = 1024 * 1024 * 1024;
const EMA_MULTIPLIER: f64 = 0.2;

/// Why a request left the queue, for counter bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    Admitted,
    TimedOut,
    Cancelled,
    Rejected,
}

/// Copy of the numbers feasibility checks need; lets the pure predicate
/// layer work on values instead of borrowed stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatsSnapshot {
    pub agg_num_running: i64,
    pub agg_num_queued: i64,
    pub local_num_queued: i64,
    pub effective_mem_reserved: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PoolCounters {
    total_admitted: i64,
    total_rejected: i64,
    total_queued: i64,
    total_dequeued: i64,
    total_timed_out: i64,
    total_released: i64,
    time_in_queue_ms: i64,
}

pub struct PoolStats {
    name: String,
    coordinator_id: String,

    /// Cluster-wide estimates over `local_stats` and `remote_stats`.
    agg_num_running: i64,
    agg_num_queued: i64,
    agg_mem_reserved: i64,

    /// Memory admitted by this coordinator across all backends. Exact and
    /// immediate, unlike the topic-fed aggregate; not published.
    local_mem_admitted: i64,

    local_stats: LocalPoolStats,
    remote_stats: HashMap<String, LocalPoolStats>,

    /// Count of released queries per peak-memory bin; the last bin is
    /// open-ended.
    peak_mem_histogram: Vec<i64>,

    wait_time_ms_ema: f64,
    counters: PoolCounters,
    metrics: PoolMetrics,
}

impl PoolStats {
    pub fn new(name: impl Into<String>, coordinator_id: impl Into<String>, metrics: PoolMetrics) -> Self {
        Self {
            name: name.into(),
            coordinator_id: coordinator_id.into(),
            agg_num_running: 0,
            agg_num_queued: 0,
            agg_mem_reserved: 0,
            local_mem_admitted: 0,
            local_stats: LocalPoolStats::default(),
            remote_stats: HashMap::new(),
            peak_mem_histogram: vec![0; HISTOGRAM_NUM_OF_BINS],
            wait_time_ms_ema: 0.0,
            counters: PoolCounters::default(),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agg_num_running(&self) -> i64 {
        self.agg_num_running
    }

    pub fn agg_num_queued(&self) -> i64 {
        self.agg_num_queued
    }

    pub fn agg_mem_reserved(&self) -> i64 {
        self.agg_mem_reserved
    }

    pub fn local_mem_admitted(&self) -> i64 {
        self.local_mem_admitted
    }

    pub fn local_stats(&self) -> &LocalPoolStats {
        &self.local_stats
    }

    /// The memory figure used by every feasibility check: topic-fed
    /// aggregates win in the steady state, locally admitted memory wins
    /// while updates are still in flight.
    pub fn effective_mem_reserved(&self) -> i64 {
        std::cmp::max(self.agg_mem_reserved, self.local_mem_admitted)
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            agg_num_running: self.agg_num_running,
            agg_num_queued: self.agg_num_queued,
            local_num_queued: self.local_stats.num_queued,
            effective_mem_reserved: self.effective_mem_reserved(),
        }
    }

    // Admission lifecycle.

    pub fn admit(&mut self, schedule: &QuerySchedule) {
        self.agg_num_running += 1;
        self.local_mem_admitted += schedule.cluster_mem_to_admit();
        self.local_stats.num_admitted_running += 1;
        self.counters.total_admitted += 1;
        self.metrics.total_admitted.inc();
        self.publish_local_gauges();
    }

    pub fn release(&mut self, schedule: &QuerySchedule, peak_mem_consumption: i64) {
        self.agg_num_running -= 1;
        self.local_mem_admitted -= schedule.cluster_mem_to_admit();
        self.local_stats.num_admitted_running -= 1;
        self.clamp_negative_counts();
        self.counters.total_released += 1;
        self.metrics.total_released.inc();
        self.record_peak_mem(peak_mem_consumption);
        self.publish_local_gauges();
    }

    pub fn queue(&mut self) {
        self.agg_num_queued += 1;
        self.local_stats.num_queued += 1;
        self.counters.total_queued += 1;
        self.metrics.total_queued.inc();
        self.publish_local_gauges();
    }

    pub fn dequeue(&mut self, outcome: DequeueOutcome) {
        self.agg_num_queued -= 1;
        self.local_stats.num_queued -= 1;
        self.clamp_negative_counts();
        match outcome {
            DequeueOutcome::TimedOut => {
                self.counters.total_timed_out += 1;
                self.metrics.total_timed_out.inc();
            }
            DequeueOutcome::Rejected => {
                self.counters.total_rejected += 1;
                self.metrics.total_rejected.inc();
            }
            DequeueOutcome::Admitted | DequeueOutcome::Cancelled => {
                self.counters.total_dequeued += 1;
                self.metrics.total_dequeued.inc();
            }
        }
        self.publish_local_gauges();
    }

    pub fn reject(&mut self) {
        self.counters.total_rejected += 1;
        self.metrics.total_rejected.inc();
    }

    /// Adds a completed queue wait to the totals and the moving average.
    pub fn update_wait_time(&mut self, wait_time_ms: i64) {
        let wait_time_ms = std::cmp::max(0, wait_time_ms);
        self.counters.time_in_queue_ms += wait_time_ms;
        self.metrics.time_in_queue_ms.inc_by(wait_time_ms as u64);
        self.wait_time_ms_ema =
            self.wait_time_ms_ema * (1.0 - EMA_MULTIPLIER) + wait_time_ms as f64 * EMA_MULTIPLIER;
    }

    // Topic synchronization.

    /// Refreshes the published backend memory figures from the process
    /// memory tracker. Called just before this pool's stats go out.
    pub fn update_mem_tracker_stats(&mut self, tracker: &dyn crate::mem_tracker::PoolMemTracker) {
        self.local_stats.backend_mem_reserved = tracker.pool_mem_reserved(&self.name);
        self.local_stats.backend_mem_usage = tracker.pool_mem_usage(&self.name);
        self.metrics.local_backend_mem_reserved.set(self.local_stats.backend_mem_reserved);
        self.metrics.local_backend_mem_usage.set(self.local_stats.backend_mem_usage);
    }

    /// Drops all remote contributions; a full topic delta follows.
    pub fn clear_remote_stats(&mut self) {
        self.remote_stats.clear();
    }

    /// Stores or removes the latest stats of a remote coordinator.
    pub fn update_remote_stats(&mut self, coordinator_id: &str, stats: Option<LocalPoolStats>) {
        match stats {
            Some(stats) => {
                debug!(pool = %self.name, coordinator = coordinator_id,
                    running = stats.num_admitted_running, queued = stats.num_queued,
                    mem_reserved = stats.backend_mem_reserved, "remote stats update");
                self.remote_stats.insert(coordinator_id.to_string(), stats);
            }
            None => {
                debug!(pool = %self.name, coordinator = coordinator_id, "remote stats removed");
                self.remote_stats.remove(coordinator_id);
            }
        }
    }

    /// Recomputes the aggregate fields from the local and remote
    /// contributions, folding each backend's reserved memory into
    /// `host_mem_reserved` so the caller obtains the per-host aggregate
    /// across all pools.
    pub fn update_aggregates(&mut self, host_mem_reserved: &mut HashMap<String, i64>) {
        let mut num_running = 0;
        let mut num_queued = 0;
        let mut mem_reserved = 0;
        let local = (self.coordinator_id.clone(), &self.local_stats);
        for (host, stats) in self
            .remote_stats
            .iter()
            .map(|(h, s)| (h.as_str(), s))
            .chain(std::iter::once((local.0.as_str(), local.1)))
        {
            num_running += stats.num_admitted_running;
            num_queued += stats.num_queued;
            mem_reserved += stats.backend_mem_reserved;
            *host_mem_reserved.entry(host.to_string()).or_insert(0) +=
                stats.backend_mem_reserved;
        }
        self.agg_num_running = num_running;
        self.agg_num_queued = num_queued;
        self.agg_mem_reserved = mem_reserved;
        self.metrics.agg_num_running.set(num_running);
        self.metrics.agg_num_queued.set(num_queued);
        self.metrics.agg_mem_reserved.set(mem_reserved);
        debug!(pool = %self.name, num_running, num_queued, mem_reserved, "updated aggregates");
    }

    /// Mirrors the configured and derived pool limits into gauges.
    pub fn update_config_metrics(&mut self, cfg: &PoolConfig, cluster_size: i64) {
        self.metrics.pool_max_mem_resources.set(cfg.max_mem_resources);
        self.metrics.pool_max_requests.set(cfg.max_requests);
        self.metrics.pool_max_queued.set(cfg.max_queued);
        self.metrics.pool_max_mem_derived.set(feasibility::pool_max_mem(cfg, cluster_size));
        self.metrics
            .pool_max_requests_derived
            .set(feasibility::pool_max_requests(cfg, cluster_size));
        self.metrics.pool_max_queued_derived.set(feasibility::pool_max_queued(cfg, cluster_size));
    }

    // Introspection.

    pub fn to_json(&self, cfg: &PoolConfig, cluster_size: i64) -> serde_json::Value {
        let histogram: Vec<i64> = {
            let last = self.peak_mem_histogram.iter().rposition(|&c| c != 0);
            match last {
                Some(idx) => self.peak_mem_histogram[..=idx].to_vec(),
                None => Vec::new(),
            }
        };
        json!({
            "pool_name": self.name,
            "agg_num_running": self.agg_num_running,
            "agg_num_queued": self.agg_num_queued,
            "agg_mem_reserved": self.agg_mem_reserved,
            "local_mem_admitted": self.local_mem_admitted,
            "local_stats": {
                "num_admitted_running": self.local_stats.num_admitted_running,
                "num_queued": self.local_stats.num_queued,
                "backend_mem_reserved": self.local_stats.backend_mem_reserved,
                "backend_mem_usage": self.local_stats.backend_mem_usage,
            },
            "pool_max_mem_resources": cfg.max_mem_resources,
            "pool_max_requests": cfg.max_requests,
            "pool_max_queued": cfg.max_queued,
            "max_query_mem_limit": cfg.max_query_mem_limit,
            "min_query_mem_limit": cfg.min_query_mem_limit,
            "clamp_mem_limit_query_option": cfg.clamp_mem_limit_query_option,
            "max_running_queries_multiple": cfg.max_running_queries_multiple,
            "max_queued_queries_multiple": cfg.max_queued_queries_multiple,
            "max_memory_multiple": cfg.max_memory_multiple,
            "max_mem_derived": feasibility::pool_max_mem(cfg, cluster_size),
            "max_requests_derived": feasibility::pool_max_requests(cfg, cluster_size),
            "max_queued_derived": feasibility::pool_max_queued(cfg, cluster_size),
            "total_admitted": self.counters.total_admitted,
            "total_rejected": self.counters.total_rejected,
            "total_queued": self.counters.total_queued,
            "total_dequeued": self.counters.total_dequeued,
            "total_timed_out": self.counters.total_timed_out,
            "total_released": self.counters.total_released,
            "time_in_queue_ms": self.counters.time_in_queue_ms,
            "wait_time_ms_ema": self.wait_time_ms_ema,
            "peak_mem_histogram_bin_size": HISTOGRAM_BIN_SIZE,
            "peak_mem_histogram": histogram,
        })
    }

    /// Clears the informational stats: totals, histogram and wait-time
    /// average. Live accounting is untouched.
    pub fn reset_informational_stats(&mut self) {
        self.counters = PoolCounters::default();
        self.peak_mem_histogram.iter_mut().for_each(|bin| *bin = 0);
        self.wait_time_ms_ema = 0.0;
    }

    fn record_peak_mem(&mut self, peak_mem_consumption: i64) {
        let bin = std::cmp::min(
            std::cmp::max(0, peak_mem_consumption / HISTOGRAM_BIN_SIZE) as usize,
            HISTOGRAM_NUM_OF_BINS - 1,
        );
        self.peak_mem_histogram[bin] += 1;
    }

    fn clamp_negative_counts(&mut self) {
        for (value, what) in [
            (&mut self.agg_num_running, "agg_num_running"),
            (&mut self.agg_num_queued, "agg_num_queued"),
            (&mut self.local_mem_admitted, "local_mem_admitted"),
            (&mut self.local_stats.num_admitted_running, "num_admitted_running"),
            (&mut self.local_stats.num_queued, "num_queued"),
        ] {
            if *value < 0 {
                debug_assert!(false, "{what} went negative in pool {}", self.name);
                warn!(pool = %self.name, stat = what, value = *value,
                    "admission counter went negative; clamping to zero");
                *value = 0;
            }
        }
    }

    fn publish_local_gauges(&self) {
        self.metrics.agg_num_running.set(self.agg_num_running);
        self.metrics.agg_num_queued.set(self.agg_num_queued);
        self.metrics.local_mem_admitted.set(self.local_mem_admitted);
        self.metrics.local_num_admitted_running.set(self.local_stats.num_admitted_running);
        self.metrics.local_num_queued.set(self.local_stats.num_queued);
    }
}

impl std::fmt::Debug for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolStats")
            .field("name", &self.name)
            .field("agg_num_running", &self.agg_num_running)
            .field("agg_num_queued", &self.agg_num_queued)
            .field("agg_mem_reserved", &self.agg_mem_reserved)
            .field("local_mem_admitted", &self.local_mem_admitted)
            .field("local_stats", &self.local_stats)
            .field("remote_coordinators", &self.remote_stats.len())
            .finish()
    }
}
