//! Admission outcomes and the per-pool request queue.
//!
//! The outcome cell is a single-assignment slot shared between the
//! submitting task, the dequeue loop and an optional canceller; the first
//! writer wins and every later writer learns who won. Queue nodes are
//! owned by their submitter, the queue stores shared references only, and
//! a node is always removed from the queue before its outcome is final.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::AdmissionError;
use crate::schedule::QuerySchedule;

/// Final admission decision for a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted,
    RejectedOrTimedOut,
    Cancelled,
}

const OUTCOME_UNSET: u8 = 0;
const OUTCOME_ADMITTED: u8 = 1;
const OUTCOME_REJECTED_OR_TIMED_OUT: u8 = 2;
const OUTCOME_CANCELLED: u8 = 3;

fn encode(outcome: AdmissionOutcome) -> u8 {
    match outcome {
        AdmissionOutcome::Admitted => OUTCOME_ADMITTED,
        AdmissionOutcome::RejectedOrTimedOut => OUTCOME_REJECTED_OR_TIMED_OUT,
        AdmissionOutcome::Cancelled => OUTCOME_CANCELLED,
    }
}

fn decode(raw: u8) -> Option<AdmissionOutcome> {
    match raw {
        OUTCOME_ADMITTED => Some(AdmissionOutcome::Admitted),
        OUTCOME_REJECTED_OR_TIMED_OUT => Some(AdmissionOutcome::RejectedOrTimedOut),
        OUTCOME_CANCELLED => Some(AdmissionOutcome::Cancelled),
        _ => None,
    }
}

/// Multi-producer, single-assignment outcome slot.
#[derive(Debug, Default)]
pub struct AdmissionOutcomeCell {
    state: AtomicU8,
    notify: Notify,
}

impl AdmissionOutcomeCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attempts to finalize the outcome. Returns the value the cell holds
    /// afterwards, which is `outcome` only if this call won the race.
    pub fn try_set(&self, outcome: AdmissionOutcome) -> AdmissionOutcome {
        match self.state.compare_exchange(
            OUTCOME_UNSET,
            encode(outcome),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.notify.notify_waiters();
                outcome
            }
            // Already decided; report the winner.
            Err(current) => decode(current).unwrap_or(outcome),
        }
    }

    pub fn get(&self) -> Option<AdmissionOutcome> {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Waits until the outcome is decided.
    pub async fn wait(&self) -> AdmissionOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.get() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// A queued admission request. Lives on the submitter's side; the queue
/// holds `Arc` references until the request is admitted, rejected, timed
/// out or cancelled.
#[derive(Debug)]
pub struct QueueNode {
    pub schedule: Arc<QuerySchedule>,
    pub outcome: Arc<AdmissionOutcomeCell>,

    /// Why the request could not be admitted immediately.
    pub initial_queue_reason: String,

    pub queued_at: Instant,

    /// Set by the dequeue loop when it fails a queued request, so the
    /// submitter can return the precise error.
    pub fail_error: OnceLock<AdmissionError>,
}

impl QueueNode {
    pub fn new(
        schedule: Arc<QuerySchedule>,
        outcome: Arc<AdmissionOutcomeCell>,
        initial_queue_reason: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            schedule,
            outcome,
            initial_queue_reason,
            queued_at: Instant::now(),
            fail_error: OnceLock::new(),
        })
    }
}

/// Insertion-ordered queue of waiting requests for one pool.
pub type RequestQueue = VecDeque<Arc<QueueNode>>;

/// Removes `node` from `queue` if still present. Returns whether this
/// caller performed the removal and therefore owns the bookkeeping.
pub fn remove_node(queue: &mut RequestQueue, node: &Arc<QueueNode>) -> bool {
    if let Some(pos) = queue.iter().position(|n| Arc::ptr_eq(n, node)) {
        queue.remove(pos);
        true
    } else {
        false
    }
}
