//! The admission controller façade.
//!
//! Every coordinator embeds one instance. Incoming queries are admitted
//! immediately, queued, or rejected based on per-pool policy and the
//! cluster-wide statistics exchanged over the request-queue topic; a
//! background task drains the queues whenever resources free up.
//!
//! One coarse lock guards all pool stats, queues and host maps. Critical
//! sections are short arithmetic over small maps; submitters suspend only
//! while waiting on their outcome cell with the lock released, and the
//! dequeue task suspends only on its wakeup signal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, PoolConfig};
use crate::error::AdmissionError;
use crate::feasibility::{self, mem_string, HostMemView};
use crate::mem_tracker::PoolMemTracker;
use crate::membership::{ClusterMembership, ClusterSnapshot};
use crate::metrics::AdmissionMetrics;
use crate::pool_service::RequestPoolService;
use crate::pool_stats::{DequeueOutcome, PoolStats};
use crate::queue::{remove_node, AdmissionOutcome, AdmissionOutcomeCell, QueueNode, RequestQueue};
use crate::schedule::QuerySchedule;
use crate::topic::{self, LocalPoolStats, TopicDelta, TopicDeltaMap, TopicItem};

// Profile annotation keys and values.
pub const PROFILE_INFO_KEY_ADMISSION_RESULT: &str = "Admission result";
pub const PROFILE_INFO_VAL_ADMIT_IMMEDIATELY: &str = "Admitted immediately";
pub const PROFILE_INFO_VAL_QUEUED: &str = "Queued";
pub const PROFILE_INFO_VAL_CANCELLED_IN_QUEUE: &str = "Cancelled (queued)";
pub const PROFILE_INFO_VAL_ADMIT_QUEUED: &str = "Admitted (queued)";
pub const PROFILE_INFO_VAL_REJECTED: &str = "Rejected";
pub const PROFILE_INFO_VAL_TIME_OUT: &str = "Timed out";
pub const PROFILE_INFO_KEY_INITIAL_QUEUE_REASON: &str = "Initial admission queue reason";
pub const PROFILE_INFO_KEY_LAST_QUEUED_REASON: &str = "Latest admission queue reason";
pub const PROFILE_INFO_KEY_ADMITTED_MEM: &str = "Cluster Memory Admitted";
pub const PROFILE_INFO_KEY_STALENESS_WARNING: &str = "Request State Staleness";
pub const PROFILE_INFO_KEY_TIME_SINCE_LAST_UPDATE: &str =
    "Time since last made admission decision (ms)";

/// State behind the admission lock.
#[derive(Default)]
struct ControllerState {
    pool_stats: BTreeMap<String, PoolStats>,
    request_queues: BTreeMap<String, RequestQueue>,

    /// Config snapshots cached at submission so the dequeue task never
    /// calls back into the pool service.
    pool_configs: HashMap<String, PoolConfig>,

    /// Pools whose local stats changed since the last outgoing update.
    pools_for_updates: HashSet<String>,

    /// Per-host reserved memory aggregated from topic updates, all pools.
    host_mem_reserved: HashMap<String, i64>,

    /// Per-host memory admitted by this coordinator, all pools.
    host_mem_admitted: HashMap<String, i64>,

    last_topic_update: Option<Instant>,
}

impl ControllerState {
    fn pool_stats_mut(
        &mut self,
        metrics: &AdmissionMetrics,
        coordinator_id: &str,
        pool: &str,
    ) -> &mut PoolStats {
        self.pool_stats
            .entry(pool.to_string())
            .or_insert_with(|| PoolStats::new(pool, coordinator_id, metrics.for_pool(pool)))
    }

    fn queue_mut(&mut self, pool: &str) -> &mut RequestQueue {
        self.request_queues.entry(pool.to_string()).or_default()
    }

    fn queue_len(&self, pool: &str) -> usize {
        self.request_queues.get(pool).map_or(0, |q| q.len())
    }
}

struct ControllerInner {
    config: ControllerConfig,

    /// This coordinator's id, also the key suffix of its topic items.
    coordinator_id: String,

    membership: Arc<dyn ClusterMembership>,
    pool_service: Arc<dyn RequestPoolService>,
    mem_tracker: Arc<dyn PoolMemTracker>,
    metrics: AdmissionMetrics,

    state: Mutex<ControllerState>,
    dequeue_notify: Notify,
    done: AtomicBool,
}

/// Coordinator-local admission controller.
pub struct AdmissionController {
    inner: Arc<ControllerInner>,
}

impl AdmissionController {
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        pool_service: Arc<dyn RequestPoolService>,
        mem_tracker: Arc<dyn PoolMemTracker>,
        registry: &prometheus::Registry,
        config: ControllerConfig,
        coordinator_id: impl Into<String>,
    ) -> Result<Self, prometheus::Error> {
        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                coordinator_id: coordinator_id.into(),
                membership,
                pool_service,
                mem_tracker,
                metrics: AdmissionMetrics::new(registry)?,
                state: Mutex::new(ControllerState::default()),
                dequeue_notify: Notify::new(),
                done: AtomicBool::new(false),
            }),
        })
    }

    /// Spawns the dequeue task. Call once after construction.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            ControllerInner::dequeue_loop(inner).await;
        });
        info!(coordinator = %self.inner.coordinator_id, "admission controller started");
    }

    /// Submits a request for admission and blocks until it is admitted,
    /// rejected, timed out, or cancelled through `admit_outcome`.
    ///
    /// On `Ok(())` the query is admitted and `release_query` must be
    /// called once it finishes.
    pub async fn submit_for_admission(
        &self,
        schedule: &Arc<QuerySchedule>,
        admit_outcome: &Arc<AdmissionOutcomeCell>,
    ) -> Result<(), AdmissionError> {
        let inner = &self.inner;
        if inner.done.load(Ordering::Acquire) {
            admit_outcome.try_set(AdmissionOutcome::RejectedOrTimedOut);
            return Err(AdmissionError::ShuttingDown);
        }

        let pool_name = schedule.request_pool().to_string();
        let cfg = inner.pool_service.pool_config(&pool_name).await?;
        let snapshot = inner.membership.snapshot().await;
        let cluster_size = snapshot.cluster_size();

        let mut state = inner.state.lock().await;
        state.pool_configs.insert(pool_name.clone(), cfg.clone());
        state
            .pool_stats_mut(&inner.metrics, &inner.coordinator_id, &pool_name)
            .update_config_metrics(&cfg, cluster_size);

        if let Err(reason) = feasibility::is_pool_config_valid_for_cluster(&cfg, cluster_size) {
            let error = AdmissionError::InvalidPoolConfig { pool: pool_name.clone(), reason };
            inner.reject_locked(&mut state, schedule, admit_outcome, &error).await;
            return Err(error);
        }

        schedule.update_memory_requirements(&cfg, inner.config.physical_mem_bytes);

        let stats_snapshot = state
            .pool_stats_mut(&inner.metrics, &inner.coordinator_id, &pool_name)
            .snapshot();
        if let Some(error) =
            feasibility::reject_immediately(schedule, &cfg, cluster_size, stats_snapshot)
        {
            inner.reject_locked(&mut state, schedule, admit_outcome, &error).await;
            return Err(error);
        }

        let queue_len = state.queue_len(&pool_name);
        let can_admit = feasibility::can_admit_request(
            schedule,
            &cfg,
            cluster_size,
            stats_snapshot,
            queue_len,
            HostMemView {
                host_mem_reserved: &state.host_mem_reserved,
                host_mem_admitted: &state.host_mem_admitted,
                membership: &snapshot,
            },
            false,
        );

        let not_admitted_reason = match can_admit {
            Ok(()) => {
                if admit_outcome.try_set(AdmissionOutcome::Admitted)
                    == AdmissionOutcome::Cancelled
                {
                    debug!(query_id = %schedule.query_id(), "request cancelled before admission");
                    return Err(AdmissionError::Cancelled);
                }
                inner.admit_query_locked(&mut state, schedule, None).await;
                return Ok(());
            }
            Err(reason) => reason,
        };

        // Queueing disabled means reject rather than wait.
        if feasibility::pool_max_queued(&cfg, cluster_size) <= 0 {
            let error = AdmissionError::PoolFull {
                pool: pool_name.clone(),
                reason: format!("queuing is disabled for this pool; {not_admitted_reason}"),
            };
            inner.reject_locked(&mut state, schedule, admit_outcome, &error).await;
            return Err(error);
        }

        let node =
            QueueNode::new(Arc::clone(schedule), Arc::clone(admit_outcome), not_admitted_reason);
        state.queue_mut(&pool_name).push_back(Arc::clone(&node));
        state
            .pool_stats_mut(&inner.metrics, &inner.coordinator_id, &pool_name)
            .queue();
        state.pools_for_updates.insert(pool_name.clone());

        info!(query_id = %schedule.query_id(), pool = %pool_name,
            reason = %node.initial_queue_reason, "query queued");
        let profile = schedule.profile();
        profile.set(PROFILE_INFO_KEY_ADMISSION_RESULT, PROFILE_INFO_VAL_QUEUED).await;
        profile
            .set(PROFILE_INFO_KEY_INITIAL_QUEUE_REASON, &node.initial_queue_reason)
            .await;
        let (staleness, ms_since_update) = inner.staleness_locked(&state, "");
        if let Some(ms) = ms_since_update {
            profile
                .set(PROFILE_INFO_KEY_TIME_SINCE_LAST_UPDATE, &ms.to_string())
                .await;
        }
        if !staleness.is_empty() {
            profile.set(PROFILE_INFO_KEY_STALENESS_WARNING, &staleness).await;
        }
        drop(state);

        let timeout_ms = if cfg.queue_timeout_ms > 0 {
            cfg.queue_timeout_ms
        } else {
            std::cmp::max(1, inner.config.queue_wait_timeout_ms)
        };
        let waited =
            tokio::time::timeout(Duration::from_millis(timeout_ms as u64), admit_outcome.wait())
                .await;

        let mut state = inner.state.lock().await;
        let outcome = match waited {
            Ok(outcome) => outcome,
            // The wait expired; we only time the request out if nobody
            // decided its fate first.
            Err(_) => admit_outcome.try_set(AdmissionOutcome::RejectedOrTimedOut),
        };
        let removed_by_us = remove_node(state.queue_mut(&pool_name), &node);

        match outcome {
            AdmissionOutcome::Admitted => {
                // The dequeue task removed the node, admitted the query
                // and annotated the profile before finalizing the cell.
                drop(state);
                Ok(())
            }
            AdmissionOutcome::Cancelled => {
                if removed_by_us {
                    state
                        .pool_stats_mut(&inner.metrics, &inner.coordinator_id, &pool_name)
                        .dequeue(DequeueOutcome::Cancelled);
                    state.pools_for_updates.insert(pool_name.clone());
                }
                drop(state);
                profile
                    .set(PROFILE_INFO_KEY_ADMISSION_RESULT, PROFILE_INFO_VAL_CANCELLED_IN_QUEUE)
                    .await;
                info!(query_id = %schedule.query_id(), pool = %pool_name,
                    "query cancelled while queued");
                Err(AdmissionError::Cancelled)
            }
            AdmissionOutcome::RejectedOrTimedOut => {
                if removed_by_us {
                    state
                        .pool_stats_mut(&inner.metrics, &inner.coordinator_id, &pool_name)
                        .dequeue(DequeueOutcome::TimedOut);
                    state.pools_for_updates.insert(pool_name.clone());
                    drop(state);
                    let reason = format!(
                        "admission for query exceeded timeout {timeout_ms}ms in pool {pool_name}. \
                         Queued reason: {}",
                        node.initial_queue_reason
                    );
                    profile
                        .set(PROFILE_INFO_KEY_ADMISSION_RESULT, PROFILE_INFO_VAL_TIME_OUT)
                        .await;
                    warn!(query_id = %schedule.query_id(), pool = %pool_name, %reason,
                        "query timed out in admission queue");
                    Err(AdmissionError::TimedOut { pool: pool_name, reason })
                } else {
                    // Failed by the dequeue task: bookkeeping already done
                    // and the precise error recorded on the node.
                    drop(state);
                    profile
                        .set(PROFILE_INFO_KEY_ADMISSION_RESULT, PROFILE_INFO_VAL_REJECTED)
                        .await;
                    let error = node.fail_error.get().cloned().unwrap_or_else(|| {
                        AdmissionError::Rejected {
                            pool: pool_name,
                            reason: "rejected while queued".to_string(),
                        }
                    });
                    Err(error)
                }
            }
        }
    }

    /// Releases resources of an admitted query. Non-blocking beyond the
    /// admission lock; wakes the dequeue task.
    pub async fn release_query(&self, schedule: &QuerySchedule, peak_mem_consumption: i64) {
        let inner = &self.inner;
        let pool_name = schedule.request_pool();
        let mut state = inner.state.lock().await;
        state
            .pool_stats_mut(&inner.metrics, &inner.coordinator_id, pool_name)
            .release(schedule, peak_mem_consumption);
        let per_backend = schedule.per_backend_mem_to_admit();
        for backend in schedule.backends() {
            if let Some(admitted) = state.host_mem_admitted.get_mut(&backend.host) {
                *admitted -= per_backend;
                if *admitted < 0 {
                    debug_assert!(false, "host admitted memory went negative");
                    warn!(host = %backend.host,
                        "host admitted memory went negative; clamping to zero");
                    *admitted = 0;
                }
            }
        }
        state.pools_for_updates.insert(pool_name.to_string());
        drop(state);
        inner.dequeue_notify.notify_one();
        debug!(query_id = %schedule.query_id(), pool = %pool_name,
            peak_mem = %mem_string(peak_mem_consumption), "released query");
    }

    /// Messaging-bus callback: collects outgoing updates for pools whose
    /// stats changed, folds incoming deltas into the remote stats and
    /// recomputes the cluster aggregates.
    pub async fn update_pool_stats(&self, incoming: &TopicDeltaMap) -> Vec<TopicItem> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let outgoing = inner.collect_pool_updates_locked(&mut state);
        if let Some(delta) = incoming.get(topic::REQUEST_QUEUE_TOPIC) {
            inner.handle_topic_delta_locked(&mut state, delta);
            ControllerInner::update_cluster_aggregates_locked(&mut state);
            state.last_topic_update = Some(Instant::now());
        }
        drop(state);
        inner.dequeue_notify.notify_one();
        outgoing
    }

    /// Serializes one pool; `None` if no query was ever submitted to it.
    pub async fn pool_to_json(&self, pool_name: &str) -> Option<serde_json::Value> {
        let snapshot = self.inner.membership.snapshot().await;
        let state = self.inner.state.lock().await;
        self.inner.pool_to_json_locked(&state, pool_name, snapshot.cluster_size())
    }

    /// Serializes every known pool, keyed by pool name.
    pub async fn all_pools_to_json(&self) -> serde_json::Value {
        let snapshot = self.inner.membership.snapshot().await;
        let state = self.inner.state.lock().await;
        let mut pools = serde_json::Map::new();
        for pool_name in state.pool_stats.keys() {
            if let Some(value) =
                self.inner.pool_to_json_locked(&state, pool_name, snapshot.cluster_size())
            {
                pools.insert(pool_name.clone(), value);
            }
        }
        json!({ "snapshot_time": Utc::now().to_rfc3339(), "resource_pools": pools })
    }

    /// Per-host `(mem_reserved, mem_admitted)` pairs for the debug page.
    pub async fn per_host_mem_reserved_and_admitted(&self) -> BTreeMap<String, (i64, i64)> {
        let state = self.inner.state.lock().await;
        let mut hosts: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        for (host, reserved) in &state.host_mem_reserved {
            hosts.entry(host.clone()).or_default().0 = *reserved;
        }
        for (host, admitted) in &state.host_mem_admitted {
            hosts.entry(host.clone()).or_default().1 = *admitted;
        }
        hosts
    }

    /// Warning string when the topic state is stale, empty otherwise.
    pub async fn staleness_detail(&self, prefix: &str) -> String {
        let state = self.inner.state.lock().await;
        self.inner.staleness_locked(&state, prefix).0
    }

    /// Clears the informational stats of one pool.
    pub async fn reset_pool_informational_stats(&self, pool_name: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(stats) = state.pool_stats.get_mut(pool_name) {
            stats.reset_informational_stats();
        }
    }

    /// Clears the informational stats of every pool.
    pub async fn reset_all_informational_stats(&self) {
        let mut state = self.inner.state.lock().await;
        for stats in state.pool_stats.values_mut() {
            stats.reset_informational_stats();
        }
    }

    /// Stops the dequeue task and fails every queued request.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.done.store(true, Ordering::Release);
        let mut state = inner.state.lock().await;
        let pools: Vec<String> = state.request_queues.keys().cloned().collect();
        for pool_name in pools {
            inner.fail_queued_locked(&mut state, &pool_name, &AdmissionError::ShuttingDown);
        }
        drop(state);
        inner.dequeue_notify.notify_one();
        info!(coordinator = %self.inner.coordinator_id, "admission controller shut down");
    }
}

impl ControllerInner {
    /// Applies the accounting for an admitted query. `queued_at` is set
    /// when the request came off the queue.
    async fn admit_query_locked(
        &self,
        state: &mut ControllerState,
        schedule: &Arc<QuerySchedule>,
        queued_at: Option<Instant>,
    ) {
        let pool_name = schedule.request_pool();
        {
            let stats = state.pool_stats_mut(&self.metrics, &self.coordinator_id, pool_name);
            stats.admit(schedule);
            if let Some(queued_at) = queued_at {
                stats.update_wait_time(queued_at.elapsed().as_millis() as i64);
            }
        }
        let per_backend = schedule.per_backend_mem_to_admit();
        for backend in schedule.backends() {
            *state.host_mem_admitted.entry(backend.host.clone()).or_insert(0) += per_backend;
        }
        state.pools_for_updates.insert(pool_name.to_string());

        debug!(query_id = %schedule.query_id(), pool = %pool_name,
            cluster_mem = %mem_string(schedule.cluster_mem_to_admit()),
            from_queue = queued_at.is_some(), "admitted query");
        let profile = schedule.profile();
        let result = if queued_at.is_some() {
            PROFILE_INFO_VAL_ADMIT_QUEUED
        } else {
            PROFILE_INFO_VAL_ADMIT_IMMEDIATELY
        };
        profile.set(PROFILE_INFO_KEY_ADMISSION_RESULT, result).await;
        profile
            .set(PROFILE_INFO_KEY_ADMITTED_MEM, &mem_string(schedule.cluster_mem_to_admit()))
            .await;
    }

    /// Records an immediate rejection: counter, profile, outcome cell.
    async fn reject_locked(
        &self,
        state: &mut ControllerState,
        schedule: &Arc<QuerySchedule>,
        admit_outcome: &Arc<AdmissionOutcomeCell>,
        error: &AdmissionError,
    ) {
        let pool_name = schedule.request_pool();
        state.pool_stats_mut(&self.metrics, &self.coordinator_id, pool_name).reject();
        warn!(query_id = %schedule.query_id(), pool = %pool_name, %error, "rejected query");
        schedule
            .profile()
            .set(PROFILE_INFO_KEY_ADMISSION_RESULT, PROFILE_INFO_VAL_REJECTED)
            .await;
        admit_outcome.try_set(AdmissionOutcome::RejectedOrTimedOut);
    }

    /// Fails every request queued in `pool_name` with `error`. Used for
    /// invalid pool configs and shutdown.
    fn fail_queued_locked(
        &self,
        state: &mut ControllerState,
        pool_name: &str,
        error: &AdmissionError,
    ) {
        let nodes: Vec<Arc<QueueNode>> = state
            .request_queues
            .get_mut(pool_name)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default();
        if nodes.is_empty() {
            return;
        }
        warn!(pool = %pool_name, count = nodes.len(), %error, "failing queued requests");
        for node in nodes {
            let outcome = match node.outcome.try_set(AdmissionOutcome::RejectedOrTimedOut) {
                AdmissionOutcome::RejectedOrTimedOut => {
                    let _ = node.fail_error.set(error.clone());
                    DequeueOutcome::Rejected
                }
                AdmissionOutcome::Cancelled => DequeueOutcome::Cancelled,
                // Cannot happen: admission removes a node before setting
                // its outcome, and we drained the queue under the lock.
                AdmissionOutcome::Admitted => continue,
            };
            state
                .pool_stats_mut(&self.metrics, &self.coordinator_id, pool_name)
                .dequeue(outcome);
        }
        state.pools_for_updates.insert(pool_name.to_string());
    }

    /// Serializes the local stats of every dirty pool into topic items,
    /// refreshing the backend memory figures first.
    fn collect_pool_updates_locked(&self, state: &mut ControllerState) -> Vec<TopicItem> {
        let dirty: Vec<String> = state.pools_for_updates.drain().collect();
        let mut items = Vec::with_capacity(dirty.len());
        for pool_name in dirty {
            if let Some(stats) = state.pool_stats.get_mut(&pool_name) {
                stats.update_mem_tracker_stats(self.mem_tracker.as_ref());
                let key = topic::make_pool_topic_key(&pool_name, &self.coordinator_id);
                match TopicItem::update(key, stats.local_stats()) {
                    Ok(item) => items.push(item),
                    Err(error) => warn!(pool = %pool_name, %error,
                        "failed to serialize pool stats for topic update"),
                }
            }
        }
        items
    }

    /// Folds one incoming delta into the remote stats. A full delta
    /// resets all remote state first.
    fn handle_topic_delta_locked(&self, state: &mut ControllerState, delta: &TopicDelta) {
        if !delta.is_delta {
            for stats in state.pool_stats.values_mut() {
                stats.clear_remote_stats();
            }
        }
        for item in &delta.items {
            let Some((pool_name, coordinator_id)) = topic::parse_pool_topic_key(&item.key) else {
                warn!(key = %item.key, "ignoring topic item with malformed key");
                continue;
            };
            // Local stats are authoritative here; skip our own echoes.
            if coordinator_id == self.coordinator_id {
                continue;
            }
            let stats = state.pool_stats_mut(&self.metrics, &self.coordinator_id, pool_name);
            if item.deleted {
                stats.update_remote_stats(coordinator_id, None);
            } else {
                match serde_json::from_slice::<LocalPoolStats>(&item.payload) {
                    Ok(remote) => stats.update_remote_stats(coordinator_id, Some(remote)),
                    Err(error) => warn!(key = %item.key, %error,
                        "failed to deserialize topic item; skipping"),
                }
            }
        }
    }

    /// Recomputes every pool's aggregates and the per-host reserved map.
    fn update_cluster_aggregates_locked(state: &mut ControllerState) {
        state.host_mem_reserved.clear();
        let ControllerState { pool_stats, host_mem_reserved, .. } = state;
        for stats in pool_stats.values_mut() {
            stats.update_aggregates(host_mem_reserved);
        }
    }

    fn staleness_locked(&self, state: &ControllerState, prefix: &str) -> (String, Option<i64>) {
        let threshold_ms = 2 * self.config.statestore_update_interval_ms;
        match state.last_topic_update {
            None => (
                format!("{prefix}no admission control updates have been received from the cluster topic"),
                None,
            ),
            Some(last) => {
                let ms = last.elapsed().as_millis() as i64;
                if ms > threshold_ms {
                    (
                        format!(
                            "{prefix}admission control information from the cluster topic is \
                             stale: {ms} ms since the last update"
                        ),
                        Some(ms),
                    )
                } else {
                    (String::new(), Some(ms))
                }
            }
        }
    }

    fn pool_to_json_locked(
        &self,
        state: &ControllerState,
        pool_name: &str,
        cluster_size: i64,
    ) -> Option<serde_json::Value> {
        let stats = state.pool_stats.get(pool_name)?;
        let cfg = state.pool_configs.get(pool_name).cloned().unwrap_or_default();
        let mut value = stats.to_json(&cfg, cluster_size);
        if let Some(map) = value.as_object_mut() {
            map.insert("local_queue_size".to_string(), json!(state.queue_len(pool_name)));
            map.insert(
                "staleness_detail".to_string(),
                json!(self.staleness_locked(state, "").0),
            );
        }
        Some(value)
    }

    /// Background task draining the per-pool queues. Woken by releases,
    /// topic updates and shutdown; tolerates spurious wakeups.
    async fn dequeue_loop(inner: Arc<ControllerInner>) {
        info!(coordinator = %inner.coordinator_id, "dequeue loop started");
        loop {
            let notified = inner.dequeue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if inner.done.load(Ordering::Acquire) {
                break;
            }

            let has_queued = {
                let state = inner.state.lock().await;
                state.request_queues.values().any(|queue| !queue.is_empty())
            };
            if has_queued {
                let snapshot = inner.membership.snapshot().await;
                inner.try_dequeue(&snapshot).await;
            }

            if inner.done.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
        info!(coordinator = %inner.coordinator_id, "dequeue loop exiting");
    }

    /// One pass over all pools with queued requests, admitting in FIFO
    /// order up to the dequeue heuristic. A head request that cannot be
    /// admitted blocks the rest of its pool.
    async fn try_dequeue(&self, snapshot: &ClusterSnapshot) {
        let cluster_size = snapshot.cluster_size();
        let mut state = self.state.lock().await;
        let pools: Vec<String> = state
            .request_queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(pool, _)| pool.clone())
            .collect();

        for pool_name in pools {
            let cfg = state.pool_configs.get(&pool_name).cloned().unwrap_or_default();
            if let Err(reason) = feasibility::is_pool_config_valid_for_cluster(&cfg, cluster_size)
            {
                let error =
                    AdmissionError::InvalidPoolConfig { pool: pool_name.clone(), reason };
                self.fail_queued_locked(&mut state, &pool_name, &error);
                continue;
            }

            let stats_snapshot = state
                .pool_stats
                .get(&pool_name)
                .map(|stats| stats.snapshot())
                .unwrap_or_default();
            let queue_len = state.queue_len(&pool_name);
            let max_to_dequeue =
                feasibility::max_to_dequeue(queue_len, stats_snapshot, &cfg, cluster_size);
            if max_to_dequeue == 0 {
                continue;
            }
            debug!(pool = %pool_name, max_to_dequeue, queue_len, "dequeue pass");

            let mut num_dequeued = 0;
            while num_dequeued < max_to_dequeue {
                let Some(node) =
                    state.request_queues.get(&pool_name).and_then(|q| q.front()).cloned()
                else {
                    break;
                };

                // Drop heads that were cancelled while waiting.
                if node.outcome.get() == Some(AdmissionOutcome::Cancelled) {
                    if let Some(queue) = state.request_queues.get_mut(&pool_name) {
                        queue.pop_front();
                    }
                    state
                        .pool_stats_mut(&self.metrics, &self.coordinator_id, &pool_name)
                        .dequeue(DequeueOutcome::Cancelled);
                    state.pools_for_updates.insert(pool_name.clone());
                    continue;
                }

                let stats_snapshot = state
                    .pool_stats
                    .get(&pool_name)
                    .map(|stats| stats.snapshot())
                    .unwrap_or_default();
                let can_admit = feasibility::can_admit_request(
                    &node.schedule,
                    &cfg,
                    cluster_size,
                    stats_snapshot,
                    state.queue_len(&pool_name),
                    HostMemView {
                        host_mem_reserved: &state.host_mem_reserved,
                        host_mem_admitted: &state.host_mem_admitted,
                        membership: snapshot,
                    },
                    true,
                );
                match can_admit {
                    Err(reason) => {
                        debug!(query_id = %node.schedule.query_id(), pool = %pool_name,
                            %reason, "could not dequeue query");
                        node.schedule
                            .profile()
                            .set(PROFILE_INFO_KEY_LAST_QUEUED_REASON, &reason)
                            .await;
                        break;
                    }
                    Ok(()) => {
                        if let Some(queue) = state.request_queues.get_mut(&pool_name) {
                            queue.pop_front();
                        }
                        if node.outcome.try_set(AdmissionOutcome::Admitted)
                            == AdmissionOutcome::Cancelled
                        {
                            state
                                .pool_stats_mut(&self.metrics, &self.coordinator_id, &pool_name)
                                .dequeue(DequeueOutcome::Cancelled);
                            state.pools_for_updates.insert(pool_name.clone());
                            continue;
                        }
                        state
                            .pool_stats_mut(&self.metrics, &self.coordinator_id, &pool_name)
                            .dequeue(DequeueOutcome::Admitted);
                        self.admit_query_locked(&mut state, &node.schedule, Some(node.queued_at))
                            .await;
                        num_dequeued += 1;
                    }
                }
            }
        }
    }
}
