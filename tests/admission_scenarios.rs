//! End-to-end admission scenarios on embedded controllers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use nimbus_admission::controller::{
    PROFILE_INFO_KEY_ADMISSION_RESULT, PROFILE_INFO_KEY_INITIAL_QUEUE_REASON,
    PROFILE_INFO_VAL_ADMIT_QUEUED, PROFILE_INFO_VAL_CANCELLED_IN_QUEUE,
};
use nimbus_admission::topic::REQUEST_QUEUE_TOPIC;
use nimbus_admission::{
    AdmissionController, AdmissionError, AdmissionOutcome, AdmissionOutcomeCell,
    BackendExecParams, ClusterMembership, ControllerConfig, PoolConfig, PoolMemTracker,
    QuerySchedule, RequestPoolService, StaticMemTracker, StaticMembership, StaticPoolService,
    TopicDelta, TopicDeltaMap, TopicItem,
};

const GB: i64 = 1024 * 1024 * 1024;

struct Coordinator {
    controller: Arc<AdmissionController>,
    pools: Arc<StaticPoolService>,
    mem_tracker: Arc<StaticMemTracker>,
}

/// Builds a started controller over `hosts` executors with `host_mem_gb`
/// of admission memory each.
fn coordinator(id: &str, hosts: usize, host_mem_gb: i64) -> Coordinator {
    let membership = StaticMembership::with_hosts(hosts, host_mem_gb * GB);
    let pools = StaticPoolService::new();
    let mem_tracker = StaticMemTracker::new();
    let registry = prometheus::Registry::new();
    let controller = AdmissionController::new(
        membership as Arc<dyn ClusterMembership>,
        Arc::clone(&pools) as Arc<dyn RequestPoolService>,
        Arc::clone(&mem_tracker) as Arc<dyn PoolMemTracker>,
        &registry,
        ControllerConfig::default(),
        id,
    )
    .unwrap();
    controller.start();
    Coordinator { controller: Arc::new(controller), pools, mem_tracker }
}

fn schedule(pool: &str, hosts: usize, per_backend_gb: i64) -> Arc<QuerySchedule> {
    let backends = (0..hosts)
        .map(|i| BackendExecParams::new(format!("host-{i}:25000"), 0))
        .collect();
    Arc::new(
        QuerySchedule::new(Uuid::new_v4(), pool, backends, 0)
            .with_mem_limit(per_backend_gb * GB),
    )
}

async fn wait_for_queue_len(controller: &AdmissionController, pool: &str, len: usize) {
    for _ in 0..500 {
        if let Some(value) = controller.pool_to_json(pool).await {
            if value["local_queue_size"] == json!(len) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool {pool} queue never reached length {len}");
}

fn delta_for(items: Vec<TopicItem>) -> TopicDeltaMap {
    HashMap::from([(
        REQUEST_QUEUE_TOPIC.to_string(),
        TopicDelta { is_delta: true, items },
    )])
}

#[tokio::test]
async fn simple_admit_accounts_memory_on_every_host() {
    let node = coordinator("coord-0:25000", 10, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig { max_mem_resources: 500 * GB, max_queued: 1, ..Default::default() },
        )
        .await;

    let query = schedule("q1", 10, 40);
    let outcome = AdmissionOutcomeCell::new();
    node.controller.submit_for_admission(&query, &outcome).await.unwrap();
    assert_eq!(outcome.get(), Some(AdmissionOutcome::Admitted));

    let pool = node.controller.pool_to_json("q1").await.unwrap();
    assert_eq!(pool["local_mem_admitted"], json!(400 * GB));
    assert_eq!(pool["agg_num_running"], json!(1));
    assert_eq!(pool["total_admitted"], json!(1));

    let hosts = node.controller.per_host_mem_reserved_and_admitted().await;
    assert_eq!(hosts.len(), 10);
    for (_, (_, admitted)) in &hosts {
        assert_eq!(*admitted, 40 * GB);
    }

    // Admit-then-release is an identity on the local accounting.
    node.controller.release_query(&query, 12 * GB).await;
    let pool = node.controller.pool_to_json("q1").await.unwrap();
    assert_eq!(pool["local_mem_admitted"], json!(0));
    assert_eq!(pool["agg_num_running"], json!(0));
    let hosts = node.controller.per_host_mem_reserved_and_admitted().await;
    for (_, (_, admitted)) in &hosts {
        assert_eq!(*admitted, 0);
    }
}

#[tokio::test]
async fn query_queues_on_pool_memory_and_admits_after_release() {
    let node = coordinator("coord-0:25000", 10, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig { max_mem_resources: 500 * GB, max_queued: 10, ..Default::default() },
        )
        .await;

    let first = schedule("q1", 10, 50);
    let first_outcome = AdmissionOutcomeCell::new();
    node.controller.submit_for_admission(&first, &first_outcome).await.unwrap();

    let second = schedule("q1", 10, 40);
    let second_outcome = AdmissionOutcomeCell::new();
    let submitter = {
        let controller = Arc::clone(&node.controller);
        let second = Arc::clone(&second);
        let second_outcome = Arc::clone(&second_outcome);
        tokio::spawn(async move { controller.submit_for_admission(&second, &second_outcome).await })
    };

    wait_for_queue_len(&node.controller, "q1", 1).await;
    let reason = second.profile().get(PROFILE_INFO_KEY_INITIAL_QUEUE_REASON).await.unwrap();
    assert!(reason.contains("aggregate memory"), "{reason}");

    // The pool is still full, so the request stays queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second_outcome.get(), None);

    node.controller.release_query(&first, 48 * GB).await;
    submitter.await.unwrap().unwrap();
    assert_eq!(second_outcome.get(), Some(AdmissionOutcome::Admitted));
    assert_eq!(
        second.profile().get(PROFILE_INFO_KEY_ADMISSION_RESULT).await.as_deref(),
        Some(PROFILE_INFO_VAL_ADMIT_QUEUED)
    );

    let pool = node.controller.pool_to_json("q1").await.unwrap();
    assert_eq!(pool["local_mem_admitted"], json!(400 * GB));
    assert_eq!(pool["agg_num_queued"], json!(0));
}

#[tokio::test]
async fn submission_is_rejected_when_the_queue_is_full() {
    let node = coordinator("coord-0:25000", 10, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig { max_mem_resources: 500 * GB, max_queued: 1, ..Default::default() },
        )
        .await;

    let running = schedule("q1", 10, 50);
    node.controller.submit_for_admission(&running, &AdmissionOutcomeCell::new()).await.unwrap();

    let queued = schedule("q1", 10, 40);
    let queued_outcome = AdmissionOutcomeCell::new();
    let submitter = {
        let controller = Arc::clone(&node.controller);
        let queued = Arc::clone(&queued);
        let queued_outcome = Arc::clone(&queued_outcome);
        tokio::spawn(async move { controller.submit_for_admission(&queued, &queued_outcome).await })
    };
    wait_for_queue_len(&node.controller, "q1", 1).await;

    let rejected = schedule("q1", 10, 40);
    let error = node
        .controller
        .submit_for_admission(&rejected, &AdmissionOutcomeCell::new())
        .await
        .unwrap_err();
    match &error {
        AdmissionError::PoolFull { reason, .. } => {
            assert!(reason.contains("queue is full"), "{reason}")
        }
        other => panic!("expected PoolFull, got {other}"),
    }

    // The failed submission left the queue untouched.
    let pool = node.controller.pool_to_json("q1").await.unwrap();
    assert_eq!(pool["agg_num_queued"], json!(1));
    assert_eq!(pool["total_rejected"], json!(1));

    queued_outcome.try_set(AdmissionOutcome::Cancelled);
    assert!(matches!(submitter.await.unwrap(), Err(AdmissionError::Cancelled)));
}

#[tokio::test]
async fn reservation_larger_than_mem_limit_is_rejected_outright() {
    let node = coordinator("coord-0:25000", 1, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig {
                min_query_mem_limit: GB,
                max_query_mem_limit: GB,
                clamp_mem_limit_query_option: true,
                max_queued: 10,
                ..Default::default()
            },
        )
        .await;

    let backends = vec![BackendExecParams::new("host-0:25000", 2 * GB)];
    let query = Arc::new(QuerySchedule::new(Uuid::new_v4(), "q1", backends, GB));
    let outcome = AdmissionOutcomeCell::new();
    let error = node.controller.submit_for_admission(&query, &outcome).await.unwrap_err();
    match &error {
        AdmissionError::Infeasible { reason, .. } => {
            assert!(reason.contains("max_query_mem_limit (1.00 GB)"), "{reason}");
            assert!(reason.contains("largest initial reservation 2.00 GB"), "{reason}");
        }
        other => panic!("expected Infeasible, got {other}"),
    }
    assert_eq!(outcome.get(), Some(AdmissionOutcome::RejectedOrTimedOut));
}

#[tokio::test]
async fn topic_exchange_bounds_over_admission_across_coordinators() {
    let pool_cfg = PoolConfig { max_mem_resources: 500 * GB, ..Default::default() };
    let a = coordinator("host-0:25000", 10, 1000);
    let b = coordinator("host-1:25000", 10, 1000);
    a.pools.set_pool("q1", pool_cfg.clone()).await;
    b.pools.set_pool("q1", pool_cfg).await;

    // Both coordinators admit 400 GB concurrently; each sees nothing
    // reserved yet, so both decisions are locally correct.
    a.controller
        .submit_for_admission(&schedule("q1", 10, 40), &AdmissionOutcomeCell::new())
        .await
        .unwrap();
    b.controller
        .submit_for_admission(&schedule("q1", 10, 40), &AdmissionOutcomeCell::new())
        .await
        .unwrap();

    // Fragments start executing and the memory trackers pick them up.
    a.mem_tracker.set_pool("q1", 400 * GB, 300 * GB);
    b.mem_tracker.set_pool("q1", 400 * GB, 300 * GB);

    // Two heartbeats: each side publishes its stats and consumes the
    // other's.
    let from_a = a.controller.update_pool_stats(&HashMap::new()).await;
    let from_b = b.controller.update_pool_stats(&delta_for(from_a)).await;
    let from_a = a.controller.update_pool_stats(&delta_for(from_b)).await;
    assert!(from_a.is_empty(), "no further local changes to publish");

    for node in [&a, &b] {
        let pool = node.controller.pool_to_json("q1").await.unwrap();
        assert_eq!(pool["agg_mem_reserved"], json!(800 * GB));
        assert_eq!(pool["agg_num_running"], json!(2));

        // With 800 GB effectively reserved against a 500 GB pool, a new
        // submission cannot be admitted; queuing is disabled here so it
        // fails fast instead of waiting.
        let error = node
            .controller
            .submit_for_admission(&schedule("q1", 10, 40), &AdmissionOutcomeCell::new())
            .await
            .unwrap_err();
        match &error {
            AdmissionError::PoolFull { reason, .. } => {
                assert!(reason.contains("aggregate memory"), "{reason}")
            }
            other => panic!("expected PoolFull, got {other}"),
        }
    }
}

#[tokio::test]
async fn cancellation_while_queued_never_admits() {
    let node = coordinator("coord-0:25000", 10, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig { max_mem_resources: 500 * GB, max_queued: 10, ..Default::default() },
        )
        .await;

    let running = schedule("q1", 10, 50);
    node.controller.submit_for_admission(&running, &AdmissionOutcomeCell::new()).await.unwrap();

    let cancelled = schedule("q1", 10, 40);
    let cancelled_outcome = AdmissionOutcomeCell::new();
    let submitter = {
        let controller = Arc::clone(&node.controller);
        let cancelled = Arc::clone(&cancelled);
        let cancelled_outcome = Arc::clone(&cancelled_outcome);
        tokio::spawn(async move {
            controller.submit_for_admission(&cancelled, &cancelled_outcome).await
        })
    };
    wait_for_queue_len(&node.controller, "q1", 1).await;

    cancelled_outcome.try_set(AdmissionOutcome::Cancelled);
    assert!(matches!(submitter.await.unwrap(), Err(AdmissionError::Cancelled)));
    assert_eq!(
        cancelled.profile().get(PROFILE_INFO_KEY_ADMISSION_RESULT).await.as_deref(),
        Some(PROFILE_INFO_VAL_CANCELLED_IN_QUEUE)
    );

    // Freeing the pool later must not resurrect the cancelled request.
    node.controller.release_query(&running, 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pool = node.controller.pool_to_json("q1").await.unwrap();
    assert_eq!(pool["agg_num_queued"], json!(0));
    assert_eq!(pool["agg_num_running"], json!(0));
}

#[tokio::test]
async fn queued_request_times_out_with_the_queue_reason() {
    let node = coordinator("coord-0:25000", 1, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig {
                max_mem_resources: 10 * GB,
                max_queued: 10,
                queue_timeout_ms: 100,
                ..Default::default()
            },
        )
        .await;

    let running = schedule("q1", 1, 10);
    node.controller.submit_for_admission(&running, &AdmissionOutcomeCell::new()).await.unwrap();

    let waiting = schedule("q1", 1, 10);
    let error = node
        .controller
        .submit_for_admission(&waiting, &AdmissionOutcomeCell::new())
        .await
        .unwrap_err();
    match &error {
        AdmissionError::TimedOut { reason, .. } => {
            assert!(reason.contains("exceeded timeout 100ms"), "{reason}");
            assert!(reason.contains("aggregate memory"), "{reason}");
        }
        other => panic!("expected TimedOut, got {other}"),
    }

    let pool = node.controller.pool_to_json("q1").await.unwrap();
    assert_eq!(pool["agg_num_queued"], json!(0));
    assert_eq!(pool["total_timed_out"], json!(1));
}

#[tokio::test]
async fn shutdown_fails_queued_requests_and_new_submissions() {
    let node = coordinator("coord-0:25000", 10, 100);
    node.pools
        .set_pool(
            "q1",
            PoolConfig { max_mem_resources: 500 * GB, max_queued: 10, ..Default::default() },
        )
        .await;

    let running = schedule("q1", 10, 50);
    node.controller.submit_for_admission(&running, &AdmissionOutcomeCell::new()).await.unwrap();

    let queued = schedule("q1", 10, 40);
    let submitter = {
        let controller = Arc::clone(&node.controller);
        let queued = Arc::clone(&queued);
        tokio::spawn(async move {
            controller.submit_for_admission(&queued, &AdmissionOutcomeCell::new()).await
        })
    };
    wait_for_queue_len(&node.controller, "q1", 1).await;

    node.controller.shutdown().await;
    assert!(matches!(submitter.await.unwrap(), Err(AdmissionError::ShuttingDown)));

    let late = schedule("q1", 10, 1);
    assert!(matches!(
        node.controller.submit_for_admission(&late, &AdmissionOutcomeCell::new()).await,
        Err(AdmissionError::ShuttingDown)
    ));
}

#[tokio::test]
async fn staleness_detail_reports_missing_and_old_updates() {
    let node = coordinator("coord-0:25000", 1, 100);
    let detail = node.controller.staleness_detail("Warning: ").await;
    assert!(detail.contains("no admission control updates"), "{detail}");

    node.controller.update_pool_stats(&delta_for(Vec::new())).await;
    assert_eq!(node.controller.staleness_detail("").await, "");
}
