//! Coordinator-side admission control for the Nimbus analytical query
//! engine.
//!
//! Each coordinator embeds an [`AdmissionController`]; together they
//! throttle submitted queries so that per-pool concurrency and memory stay
//! within policy. There is no central arbiter: coordinators exchange
//! per-pool statistics over a pub/sub topic and make decisions against a
//! mix of exact local accounting and eventually-consistent remote state,
//! which makes the configured limits soft under concurrent submission.
//!
//! A request is admitted immediately when its pool has room, queued until
//! resources free up, rejected when the pool or its queue is full or the
//! request can never fit, or cancelled by the caller through the shared
//! outcome cell.

pub mod config;
pub mod controller;
pub mod error;
pub mod feasibility;
pub mod mem_tracker;
pub mod membership;
pub mod metrics;
pub mod pool_service;
pub mod pool_stats;
pub mod queue;
pub mod schedule;
pub mod topic;

pub use config::{ControllerConfig, PoolConfig};
pub use controller::AdmissionController;
pub use error::AdmissionError;
pub use mem_tracker::{NoopMemTracker, PoolMemTracker, StaticMemTracker};
pub use membership::{ClusterMembership, ClusterSnapshot, HostDescriptor, StaticMembership};
pub use pool_service::{RequestPoolService, StaticPoolService};
pub use queue::{AdmissionOutcome, AdmissionOutcomeCell};
pub use schedule::{BackendExecParams, QuerySchedule, RuntimeProfile};
pub use topic::{LocalPoolStats, TopicDelta, TopicDeltaMap, TopicItem};
