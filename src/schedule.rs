//! Per-query schedule descriptor consumed by the admission controller.
//!
//! A schedule names the target pool, the set of backends the query will
//! execute on and the query's memory requirements. Before an admission
//! decision the per-backend memory to admit is reconciled against the
//! pool's min/max query memory limits and the query's largest initial
//! reservation; the result is stored on the schedule and drives all
//! subsequent feasibility checks and accounting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::PoolConfig;

/// Headroom left above the largest initial reservation when deriving the
/// minimum usable memory limit from it.
const RESERVATION_MIN_MEM_HEADROOM: i64 = 100 * 1024 * 1024;

/// Minimum memory limit that still leaves room for the given initial
/// reservation. A limit below this would fail at operator startup.
pub fn min_mem_limit_from_reservation(reservation_bytes: i64) -> i64 {
    if reservation_bytes <= 0 {
        return 0;
    }
    std::cmp::max(
        reservation_bytes + RESERVATION_MIN_MEM_HEADROOM,
        (reservation_bytes * 5) / 4,
    )
}

/// Execution parameters for one participating backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendExecParams {
    pub host: String,

    /// Sum of the minimum buffer reservations of all fragment instances
    /// placed on this backend.
    pub min_mem_reservation_bytes: i64,
}

impl BackendExecParams {
    pub fn new(host: impl Into<String>, min_mem_reservation_bytes: i64) -> Self {
        Self { host: host.into(), min_mem_reservation_bytes }
    }
}

/// Ordered key/value annotations attached to a query while it moves
/// through admission. Rendered into the query's runtime profile.
#[derive(Debug, Default)]
pub struct RuntimeProfile {
    events: Mutex<BTreeMap<String, String>>,
}

impl RuntimeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an annotation, replacing any previous value for the key.
    pub async fn set(&self, key: &str, value: &str) {
        let mut events = self.events.lock().await;
        events.insert(key.to_string(), value.to_string());
    }

    /// Snapshot of all annotations recorded so far.
    pub async fn events(&self) -> BTreeMap<String, String> {
        self.events.lock().await.clone()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.events.lock().await.get(key).cloned()
    }
}

/// The admission-relevant view of a scheduled query.
///
/// The admission-derived fields are written only with the admission lock
/// held; plain atomics keep the struct shareable with the submitting task
/// without another lock.
#[derive(Debug)]
pub struct QuerySchedule {
    query_id: Uuid,
    request_pool: String,
    per_backend_exec_params: Vec<BackendExecParams>,
    per_host_mem_estimate: i64,
    mem_limit_query_option: Option<i64>,
    largest_min_reservation: i64,
    per_backend_mem_to_admit: AtomicI64,
    per_backend_mem_limit: AtomicI64,
    profile: RuntimeProfile,
}

impl QuerySchedule {
    pub fn new(
        query_id: Uuid,
        request_pool: impl Into<String>,
        per_backend_exec_params: Vec<BackendExecParams>,
        per_host_mem_estimate: i64,
    ) -> Self {
        let largest_min_reservation = per_backend_exec_params
            .iter()
            .map(|p| p.min_mem_reservation_bytes)
            .max()
            .unwrap_or(0);
        Self {
            query_id,
            request_pool: request_pool.into(),
            per_backend_exec_params,
            per_host_mem_estimate,
            mem_limit_query_option: None,
            largest_min_reservation,
            per_backend_mem_to_admit: AtomicI64::new(0),
            per_backend_mem_limit: AtomicI64::new(-1),
            profile: RuntimeProfile::new(),
        }
    }

    /// Sets the MEM_LIMIT query option. Values <= 0 are treated as unset.
    pub fn with_mem_limit(mut self, mem_limit: i64) -> Self {
        self.mem_limit_query_option = (mem_limit > 0).then_some(mem_limit);
        self
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn request_pool(&self) -> &str {
        &self.request_pool
    }

    pub fn backends(&self) -> &[BackendExecParams] {
        &self.per_backend_exec_params
    }

    pub fn largest_min_reservation(&self) -> i64 {
        self.largest_min_reservation
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    /// Per-backend memory used for admission accounting. Valid only after
    /// `update_memory_requirements` ran for the target pool.
    pub fn per_backend_mem_to_admit(&self) -> i64 {
        self.per_backend_mem_to_admit.load(Ordering::Relaxed)
    }

    /// The memory limit the query will execute with; -1 means unlimited.
    pub fn per_backend_mem_limit(&self) -> i64 {
        self.per_backend_mem_limit.load(Ordering::Relaxed)
    }

    /// Aggregate memory to admit across all participating backends.
    pub fn cluster_mem_to_admit(&self) -> i64 {
        self.per_backend_mem_to_admit()
            .saturating_mul(self.per_backend_exec_params.len() as i64)
    }

    /// Reconciles the MEM_LIMIT hint, the planner estimate, the largest
    /// initial reservation and the pool's min/max query mem limits into
    /// the per-backend memory to admit and the execution memory limit.
    ///
    /// When the pool configures neither bound the traditional behaviour is
    /// kept: the estimate is used for admission only and the query runs
    /// without a memory limit unless one was set explicitly.
    pub fn update_memory_requirements(&self, pool_cfg: &PoolConfig, physical_mem: i64) {
        let mimic_old_behaviour =
            pool_cfg.min_query_mem_limit == 0 && pool_cfg.max_query_mem_limit == 0;

        let has_query_option = self.mem_limit_query_option.is_some();
        let mut mem_to_admit = match self.mem_limit_query_option {
            Some(limit) => limit,
            None => {
                let mut estimate = self.per_host_mem_estimate;
                if !mimic_old_behaviour {
                    estimate = std::cmp::max(
                        estimate,
                        min_mem_limit_from_reservation(self.largest_min_reservation),
                    );
                }
                estimate
            }
        };

        if !has_query_option || pool_cfg.clamp_mem_limit_query_option {
            if pool_cfg.min_query_mem_limit > 0 {
                mem_to_admit = std::cmp::max(mem_to_admit, pool_cfg.min_query_mem_limit);
            }
            if pool_cfg.max_query_mem_limit > 0 {
                mem_to_admit = std::cmp::min(mem_to_admit, pool_cfg.max_query_mem_limit);
            }
        }

        if physical_mem > 0 {
            mem_to_admit = std::cmp::min(mem_to_admit, physical_mem);
        }

        self.per_backend_mem_to_admit.store(mem_to_admit, Ordering::Relaxed);
        let mem_limit = if mimic_old_behaviour && !has_query_option { -1 } else { mem_to_admit };
        self.per_backend_mem_limit.store(mem_limit, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: i64 = 1024 * 1024;
    const GB: i64 = 1024 * MB;

    fn schedule_on(hosts: usize, estimate: i64) -> QuerySchedule {
        let backends = (0..hosts)
            .map(|i| BackendExecParams::new(format!("host-{i}:25000"), 0))
            .collect();
        QuerySchedule::new(Uuid::new_v4(), "q1", backends, estimate)
    }

    #[test]
    fn mem_limit_option_wins_without_pool_bounds() {
        let schedule = schedule_on(4, 2 * GB).with_mem_limit(3 * GB);
        schedule.update_memory_requirements(&PoolConfig::default(), i64::MAX);
        assert_eq!(schedule.per_backend_mem_to_admit(), 3 * GB);
        assert_eq!(schedule.per_backend_mem_limit(), 3 * GB);
        assert_eq!(schedule.cluster_mem_to_admit(), 12 * GB);
    }

    #[test]
    fn estimate_without_bounds_keeps_unlimited_exec_limit() {
        let schedule = schedule_on(2, 2 * GB);
        schedule.update_memory_requirements(&PoolConfig::default(), i64::MAX);
        assert_eq!(schedule.per_backend_mem_to_admit(), 2 * GB);
        assert_eq!(schedule.per_backend_mem_limit(), -1);
    }

    #[test]
    fn estimate_is_raised_to_cover_reservation_when_pool_has_bounds() {
        let backends = vec![
            BackendExecParams::new("host-0:25000", 600 * MB),
            BackendExecParams::new("host-1:25000", 400 * MB),
        ];
        let schedule = QuerySchedule::new(Uuid::new_v4(), "q1", backends, 100 * MB);
        let cfg = PoolConfig { max_query_mem_limit: 8 * GB, ..Default::default() };
        schedule.update_memory_requirements(&cfg, i64::MAX);
        assert_eq!(
            schedule.per_backend_mem_to_admit(),
            min_mem_limit_from_reservation(600 * MB)
        );
        assert_eq!(schedule.per_backend_mem_limit(), schedule.per_backend_mem_to_admit());
    }

    #[test]
    fn pool_bounds_clamp_the_query_option() {
        let schedule = schedule_on(1, 0).with_mem_limit(10 * GB);
        let cfg = PoolConfig {
            min_query_mem_limit: GB,
            max_query_mem_limit: 2 * GB,
            clamp_mem_limit_query_option: true,
            ..Default::default()
        };
        schedule.update_memory_requirements(&cfg, i64::MAX);
        assert_eq!(schedule.per_backend_mem_to_admit(), 2 * GB);
    }

    #[test]
    fn unclamped_query_option_ignores_pool_bounds() {
        let schedule = schedule_on(1, 0).with_mem_limit(10 * GB);
        let cfg = PoolConfig {
            min_query_mem_limit: GB,
            max_query_mem_limit: 2 * GB,
            clamp_mem_limit_query_option: false,
            ..Default::default()
        };
        schedule.update_memory_requirements(&cfg, i64::MAX);
        assert_eq!(schedule.per_backend_mem_to_admit(), 10 * GB);
    }

    #[test]
    fn physical_mem_caps_the_result() {
        let schedule = schedule_on(1, 0).with_mem_limit(10 * GB);
        schedule.update_memory_requirements(&PoolConfig::default(), 4 * GB);
        assert_eq!(schedule.per_backend_mem_to_admit(), 4 * GB);
    }

    #[tokio::test]
    async fn profile_set_replaces_previous_value() {
        let schedule = schedule_on(1, GB);
        schedule.profile().set("Admission result", "Queued").await;
        schedule.profile().set("Admission result", "Admitted (queued)").await;
        assert_eq!(
            schedule.profile().get("Admission result").await.as_deref(),
            Some("Admitted (queued)")
        );
    }
}
