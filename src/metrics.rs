//! Prometheus metrics for the admission controller.
//!
//! All metrics are labeled by pool and registered once at controller
//! construction; each pool gets a pre-resolved handle set when its stats
//! are created.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

macro_rules! counter_vec {
    ($registry:expr, $name:expr, $help:expr) => {{
        let vec = IntCounterVec::new(Opts::new($name, $help), &["pool"])?;
        $registry.register(Box::new(vec.clone()))?;
        vec
    }};
}

macro_rules! gauge_vec {
    ($registry:expr, $name:expr, $help:expr) => {{
        let vec = IntGaugeVec::new(Opts::new($name, $help), &["pool"])?;
        $registry.register(Box::new(vec.clone()))?;
        vec
    }};
}

/// Labeled metric families shared by all pools.
#[derive(Clone)]
pub struct AdmissionMetrics {
    total_admitted: IntCounterVec,
    total_rejected: IntCounterVec,
    total_queued: IntCounterVec,
    total_dequeued: IntCounterVec,
    total_timed_out: IntCounterVec,
    total_released: IntCounterVec,
    time_in_queue_ms: IntCounterVec,

    agg_num_running: IntGaugeVec,
    agg_num_queued: IntGaugeVec,
    agg_mem_reserved: IntGaugeVec,
    local_mem_admitted: IntGaugeVec,
    local_num_admitted_running: IntGaugeVec,
    local_num_queued: IntGaugeVec,
    local_backend_mem_reserved: IntGaugeVec,
    local_backend_mem_usage: IntGaugeVec,

    pool_max_mem_resources: IntGaugeVec,
    pool_max_requests: IntGaugeVec,
    pool_max_queued: IntGaugeVec,
    pool_max_mem_derived: IntGaugeVec,
    pool_max_requests_derived: IntGaugeVec,
    pool_max_queued_derived: IntGaugeVec,
}

impl AdmissionMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            total_admitted: counter_vec!(
                registry,
                "nimbus_admission_total_admitted",
                "Queries admitted by this coordinator"
            ),
            total_rejected: counter_vec!(
                registry,
                "nimbus_admission_total_rejected",
                "Queries rejected by this coordinator"
            ),
            total_queued: counter_vec!(
                registry,
                "nimbus_admission_total_queued",
                "Queries queued by this coordinator"
            ),
            total_dequeued: counter_vec!(
                registry,
                "nimbus_admission_total_dequeued",
                "Queries dequeued by this coordinator, excluding timeouts"
            ),
            total_timed_out: counter_vec!(
                registry,
                "nimbus_admission_total_timed_out",
                "Queries that timed out waiting for admission"
            ),
            total_released: counter_vec!(
                registry,
                "nimbus_admission_total_released",
                "Admitted queries released after completion"
            ),
            time_in_queue_ms: counter_vec!(
                registry,
                "nimbus_admission_time_in_queue_ms",
                "Total milliseconds spent by queries in the queue"
            ),
            agg_num_running: gauge_vec!(
                registry,
                "nimbus_admission_agg_num_running",
                "Cluster-wide running query estimate for the pool"
            ),
            agg_num_queued: gauge_vec!(
                registry,
                "nimbus_admission_agg_num_queued",
                "Cluster-wide queued request estimate for the pool"
            ),
            agg_mem_reserved: gauge_vec!(
                registry,
                "nimbus_admission_agg_mem_reserved",
                "Cluster-wide reserved memory estimate for the pool"
            ),
            local_mem_admitted: gauge_vec!(
                registry,
                "nimbus_admission_local_mem_admitted",
                "Memory admitted by this coordinator for the pool"
            ),
            local_num_admitted_running: gauge_vec!(
                registry,
                "nimbus_admission_local_num_admitted_running",
                "Locally admitted queries still running"
            ),
            local_num_queued: gauge_vec!(
                registry,
                "nimbus_admission_local_num_queued",
                "Requests waiting in the local queue"
            ),
            local_backend_mem_reserved: gauge_vec!(
                registry,
                "nimbus_admission_local_backend_mem_reserved",
                "Memory reserved on this backend by the pool's fragments"
            ),
            local_backend_mem_usage: gauge_vec!(
                registry,
                "nimbus_admission_local_backend_mem_usage",
                "Memory consumed on this backend by the pool's fragments"
            ),
            pool_max_mem_resources: gauge_vec!(
                registry,
                "nimbus_admission_pool_max_mem_resources",
                "Configured aggregate memory limit of the pool"
            ),
            pool_max_requests: gauge_vec!(
                registry,
                "nimbus_admission_pool_max_requests",
                "Configured concurrency limit of the pool"
            ),
            pool_max_queued: gauge_vec!(
                registry,
                "nimbus_admission_pool_max_queued",
                "Configured queue capacity of the pool"
            ),
            pool_max_mem_derived: gauge_vec!(
                registry,
                "nimbus_admission_pool_max_mem_derived",
                "Memory limit derived for the current cluster size"
            ),
            pool_max_requests_derived: gauge_vec!(
                registry,
                "nimbus_admission_pool_max_requests_derived",
                "Concurrency limit derived for the current cluster size"
            ),
            pool_max_queued_derived: gauge_vec!(
                registry,
                "nimbus_admission_pool_max_queued_derived",
                "Queue capacity derived for the current cluster size"
            ),
        })
    }

    /// Resolves per-pool handles for `pool`.
    pub fn for_pool(&self, pool: &str) -> PoolMetrics {
        let label = &[pool];
        PoolMetrics {
            total_admitted: self.total_admitted.with_label_values(label),
            total_rejected: self.total_rejected.with_label_values(label),
            total_queued: self.total_queued.with_label_values(label),
            total_dequeued: self.total_dequeued.with_label_values(label),
            total_timed_out: self.total_timed_out.with_label_values(label),
            total_released: self.total_released.with_label_values(label),
            time_in_queue_ms: self.time_in_queue_ms.with_label_values(label),
            agg_num_running: self.agg_num_running.with_label_values(label),
            agg_num_queued: self.agg_num_queued.with_label_values(label),
            agg_mem_reserved: self.agg_mem_reserved.with_label_values(label),
            local_mem_admitted: self.local_mem_admitted.with_label_values(label),
            local_num_admitted_running: self.local_num_admitted_running.with_label_values(label),
            local_num_queued: self.local_num_queued.with_label_values(label),
            local_backend_mem_reserved: self.local_backend_mem_reserved.with_label_values(label),
            local_backend_mem_usage: self.local_backend_mem_usage.with_label_values(label),
            pool_max_mem_resources: self.pool_max_mem_resources.with_label_values(label),
            pool_max_requests: self.pool_max_requests.with_label_values(label),
            pool_max_queued: self.pool_max_queued.with_label_values(label),
            pool_max_mem_derived: self.pool_max_mem_derived.with_label_values(label),
            pool_max_requests_derived: self.pool_max_requests_derived.with_label_values(label),
            pool_max_queued_derived: self.pool_max_queued_derived.with_label_values(label),
        }
    }
}

/// Metric handles for a single pool.
#[derive(Clone)]
pub struct PoolMetrics {
    pub total_admitted: IntCounter,
    pub total_rejected: IntCounter,
    pub total_queued: IntCounter,
    pub total_dequeued: IntCounter,
    pub total_timed_out: IntCounter,
    pub total_released: IntCounter,
    pub time_in_queue_ms: IntCounter,

    pub agg_num_running: IntGauge,
    pub agg_num_queued: IntGauge,
    pub agg_mem_reserved: IntGauge,
    pub local_mem_admitted: IntGauge,
    pub local_num_admitted_running: IntGauge,
    pub local_num_queued: IntGauge,
    pub local_backend_mem_reserved: IntGauge,
    pub local_backend_mem_usage: IntGauge,

    pub pool_max_mem_resources: IntGauge,
    pub pool_max_requests: IntGauge,
    pub pool_max_queued: IntGauge,
    pub pool_max_mem_derived: IntGauge,
    pub pool_max_requests_derived: IntGauge,
    pub pool_max_queued_derived: IntGauge,
}
