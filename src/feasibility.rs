//! Pure admission predicates and pool-limit derivations.
//!
//! Everything here is arithmetic over value snapshots: no locks, no I/O.
//! The controller copies the numbers it holds under the admission lock
//! into [`PoolStatsSnapshot`] and [`HostMemView`] and asks these functions
//! for a verdict. Failed checks return the reason string that ends up in
//! logs and query profiles.

use std::collections::HashMap;

use crate::config::PoolConfig;
use crate::error::AdmissionError;
use crate::membership::ClusterSnapshot;
use crate::pool_stats::PoolStatsSnapshot;
use crate::schedule::QuerySchedule;

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;

/// Renders a byte count the way operators read them in reasons and logs.
pub fn mem_string(bytes: i64) -> String {
    let sign = if bytes < 0 { "-" } else { "" };
    let magnitude = bytes.unsigned_abs() as f64;
    if magnitude >= GIB as f64 {
        format!("{sign}{:.2} GB", magnitude / GIB as f64)
    } else if magnitude >= MIB as f64 {
        format!("{sign}{:.2} MB", magnitude / MIB as f64)
    } else if magnitude >= KIB as f64 {
        format!("{sign}{:.2} KB", magnitude / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Borrowed view of the host-level memory maps and the membership
/// snapshot used for per-host feasibility checks.
#[derive(Clone, Copy)]
pub struct HostMemView<'a> {
    pub host_mem_reserved: &'a HashMap<String, i64>,
    pub host_mem_admitted: &'a HashMap<String, i64>,
    pub membership: &'a ClusterSnapshot,
}

// Pool-limit derivations. An absolute value > 0 wins; otherwise the
// per-executor multiplier scales with cluster size; 0 leaves the limit
// unconfigured (unlimited, or queuing disabled for max_queued).

pub fn pool_max_mem(cfg: &PoolConfig, cluster_size: i64) -> i64 {
    if cfg.max_mem_resources > 0 {
        cfg.max_mem_resources
    } else if cfg.max_memory_multiple > 0 {
        cfg.max_memory_multiple.saturating_mul(cluster_size)
    } else {
        0
    }
}

pub fn pool_max_mem_description(cfg: &PoolConfig, cluster_size: i64) -> String {
    if cfg.max_mem_resources > 0 {
        format!("pool max mem resources {} (configured statically)", mem_string(cfg.max_mem_resources))
    } else if cfg.max_memory_multiple > 0 {
        format!(
            "pool max mem resources {} ({} per executor over {} executors)",
            mem_string(pool_max_mem(cfg, cluster_size)),
            mem_string(cfg.max_memory_multiple),
            cluster_size
        )
    } else {
        "pool max mem resources unlimited".to_string()
    }
}

pub fn pool_max_requests(cfg: &PoolConfig, cluster_size: i64) -> i64 {
    if cfg.max_requests > 0 {
        cfg.max_requests
    } else if cfg.max_running_queries_multiple > 0.0 {
        (cfg.max_running_queries_multiple * cluster_size as f64).ceil() as i64
    } else {
        0
    }
}

pub fn pool_max_requests_description(cfg: &PoolConfig, cluster_size: i64) -> String {
    if cfg.max_requests > 0 {
        "max running queries configured statically".to_string()
    } else if cfg.max_running_queries_multiple > 0.0 {
        format!(
            "max running queries calculated as {} per executor over {} executors",
            cfg.max_running_queries_multiple, cluster_size
        )
    } else {
        "max running queries unlimited".to_string()
    }
}

pub fn pool_max_queued(cfg: &PoolConfig, cluster_size: i64) -> i64 {
    if cfg.max_queued > 0 {
        cfg.max_queued
    } else if cfg.max_queued_queries_multiple > 0.0 {
        (cfg.max_queued_queries_multiple * cluster_size as f64).ceil() as i64
    } else {
        0
    }
}

pub fn pool_max_queued_description(cfg: &PoolConfig, cluster_size: i64) -> String {
    if cfg.max_queued > 0 {
        "max queued queries configured statically".to_string()
    } else if cfg.max_queued_queries_multiple > 0.0 {
        format!(
            "max queued queries calculated as {} per executor over {} executors",
            cfg.max_queued_queries_multiple, cluster_size
        )
    } else {
        "queuing disabled".to_string()
    }
}

/// A pool is disabled when an operator sets a negative limit.
pub fn pool_disabled(cfg: &PoolConfig) -> bool {
    cfg.max_mem_resources < 0 || cfg.max_requests < 0 || cfg.max_queued < 0
}

/// Whether the pool bounds the number of concurrently running queries.
pub fn pool_limits_running_queries(cfg: &PoolConfig) -> bool {
    cfg.max_requests > 0 || cfg.max_running_queries_multiple > 0.0
}

/// Whether the pool memory limit is fixed rather than scaling with the
/// cluster. Only a fixed limit justifies rejecting a request outright as
/// never-fitting; a scalable limit may grow.
pub fn pool_has_fixed_mem_limit(cfg: &PoolConfig) -> bool {
    cfg.max_mem_resources > 0 && cfg.max_memory_multiple <= 0
}

/// Sanity of the pool configuration for the current cluster size.
pub fn is_pool_config_valid_for_cluster(
    cfg: &PoolConfig,
    cluster_size: i64,
) -> Result<(), String> {
    if cfg.min_query_mem_limit < 0 || cfg.max_query_mem_limit < 0 {
        return Err("query memory limits must not be negative".to_string());
    }
    if cfg.max_query_mem_limit > 0 && cfg.min_query_mem_limit > cfg.max_query_mem_limit {
        return Err(format!(
            "pool min_query_mem_limit {} is greater than max_query_mem_limit {}",
            mem_string(cfg.min_query_mem_limit),
            mem_string(cfg.max_query_mem_limit)
        ));
    }
    let max_mem = pool_max_mem(cfg, cluster_size);
    if max_mem > 0 && cfg.min_query_mem_limit > max_mem {
        return Err(format!(
            "pool min_query_mem_limit {} is greater than {}",
            mem_string(cfg.min_query_mem_limit),
            pool_max_mem_description(cfg, cluster_size)
        ));
    }
    Ok(())
}

/// Whether `schedule` can be admitted right now. `admit_from_queue`
/// bypasses the queue-empty requirement for requests already at the head
/// of the queue; everyone else must wait behind queued requests even when
/// resources would fit, or FIFO within the pool breaks.
pub fn can_admit_request(
    schedule: &QuerySchedule,
    cfg: &PoolConfig,
    cluster_size: i64,
    stats: PoolStatsSnapshot,
    queue_len: usize,
    hosts: HostMemView<'_>,
    admit_from_queue: bool,
) -> Result<(), String> {
    is_pool_config_valid_for_cluster(cfg, cluster_size)?;

    let max_requests = pool_max_requests(cfg, cluster_size);
    if max_requests > 0 && stats.agg_num_running >= max_requests {
        return Err(format!(
            "number of running queries {} is at or over limit {} ({})",
            stats.agg_num_running,
            max_requests,
            pool_max_requests_description(cfg, cluster_size)
        ));
    }

    if !admit_from_queue && queue_len > 0 {
        return Err(format!(
            "queue is not empty (size {queue_len}); queued queries are executed first"
        ));
    }

    has_available_mem_resources(schedule, cfg, cluster_size, stats.effective_mem_reserved, hosts)?;
    can_accommodate_max_initial_reservation(schedule, cfg)?;
    Ok(())
}

/// Checks the pool-wide memory limit and every participating host.
pub fn has_available_mem_resources(
    schedule: &QuerySchedule,
    cfg: &PoolConfig,
    cluster_size: i64,
    effective_mem_reserved: i64,
    hosts: HostMemView<'_>,
) -> Result<(), String> {
    let per_backend = schedule.per_backend_mem_to_admit();
    let cluster_needed = schedule.cluster_mem_to_admit();

    let max_mem = pool_max_mem(cfg, cluster_size);
    if max_mem > 0 && effective_mem_reserved + cluster_needed > max_mem {
        return Err(format!(
            "not enough aggregate memory available in pool {} with {}. Needed {} but only {} was available.",
            schedule.request_pool(),
            pool_max_mem_description(cfg, cluster_size),
            mem_string(cluster_needed),
            mem_string(max_mem - effective_mem_reserved)
        ));
    }

    for backend in schedule.backends() {
        let reserved = hosts.host_mem_reserved.get(&backend.host).copied().unwrap_or(0);
        let admitted = hosts.host_mem_admitted.get(&backend.host).copied().unwrap_or(0);
        let committed = std::cmp::max(reserved, admitted);
        if let Some(limit) = hosts.membership.host_mem_limit(&backend.host) {
            if limit > 0 && committed + per_backend > limit {
                return Err(format!(
                    "not enough memory available on host {}. Needed {} but only {} out of {} was available.",
                    backend.host,
                    mem_string(per_backend),
                    mem_string(limit - committed),
                    mem_string(limit)
                ));
            }
        }
    }
    Ok(())
}

/// The per-backend memory limit the query will run with must cover its
/// largest initial buffer reservation, or the first operator to set up
/// would fail anyway.
pub fn can_accommodate_max_initial_reservation(
    schedule: &QuerySchedule,
    cfg: &PoolConfig,
) -> Result<(), String> {
    let mem_limit = schedule.per_backend_mem_limit();
    let reservation = schedule.largest_min_reservation();
    if mem_limit > 0 && reservation > mem_limit {
        return Err(format!(
            "the query's per-backend memory limit {} cannot accommodate its largest initial reservation {}. \
             Possible causes: (1) pool max_query_mem_limit ({}) is too low; \
             (2) the MEM_LIMIT query option is set too low and the pool configures no memory bounds; \
             (3) pool min_query_mem_limit ({}) is too low; \
             (4) pool min_query_mem_limit would raise the limit but clamp_mem_limit_query_option is disabled.",
            mem_string(mem_limit),
            mem_string(reservation),
            mem_string(cfg.max_query_mem_limit),
            mem_string(cfg.min_query_mem_limit)
        ));
    }
    Ok(())
}

/// Conditions under which a request is rejected without ever queueing:
/// the pool is disabled, the request can never fit, or the queue is full.
pub fn reject_immediately(
    schedule: &QuerySchedule,
    cfg: &PoolConfig,
    cluster_size: i64,
    stats: PoolStatsSnapshot,
) -> Option<AdmissionError> {
    let pool = schedule.request_pool().to_string();

    if pool_disabled(cfg) {
        return Some(AdmissionError::Rejected {
            pool,
            reason: "pool is disabled by configuration".to_string(),
        });
    }

    if pool_has_fixed_mem_limit(cfg) {
        let max_mem = pool_max_mem(cfg, cluster_size);
        let cluster_needed = schedule.cluster_mem_to_admit();
        if cluster_needed > max_mem {
            return Some(AdmissionError::Infeasible {
                pool,
                reason: format!(
                    "request memory needed {} is greater than {}",
                    mem_string(cluster_needed),
                    pool_max_mem_description(cfg, cluster_size)
                ),
            });
        }
    }

    if let Err(reason) = can_accommodate_max_initial_reservation(schedule, cfg) {
        return Some(AdmissionError::Infeasible { pool, reason });
    }

    let max_queued = pool_max_queued(cfg, cluster_size);
    if max_queued > 0 && stats.agg_num_queued >= max_queued {
        return Some(AdmissionError::PoolFull {
            pool,
            reason: format!(
                "queue is full, limit {} ({}), num_queued {}",
                max_queued,
                pool_max_queued_description(cfg, cluster_size),
                stats.agg_num_queued
            ),
        });
    }
    None
}

/// How many requests this coordinator may dequeue in one pass.
///
/// Each coordinator takes a share of the pool's free slots proportional
/// to its fraction of the cluster-wide queue, which bounds the
/// over-admission when many coordinators see resources free up at once.
pub fn max_to_dequeue(
    queue_len: usize,
    stats: PoolStatsSnapshot,
    cfg: &PoolConfig,
    cluster_size: i64,
) -> i64 {
    if !pool_limits_running_queries(cfg) {
        return queue_len as i64;
    }
    let max_requests = pool_max_requests(cfg, cluster_size);
    let slots_available = max_requests - stats.agg_num_running;
    if slots_available <= 0 {
        return 0;
    }
    let queue_ratio =
        stats.local_num_queued as f64 / std::cmp::max(1, stats.agg_num_queued) as f64;
    // ceil so a coordinator with any queued work makes progress.
    std::cmp::max(1, (slots_available as f64 * queue_ratio).ceil() as i64)
}
