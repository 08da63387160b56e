//! Error types produced by the admission controller.
//!
//! Every rejection carries the human-readable reason that is also written
//! to the query profile, so callers can surface it without re-deriving it.

use thiserror::Error;

/// Outcome-bearing error for a submission that was not admitted.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("invalid pool config for pool {pool}: {reason}")]
    InvalidPoolConfig { pool: String, reason: String },

    #[error("rejected query from pool {pool}: {reason}")]
    Rejected { pool: String, reason: String },

    #[error("rejected query from pool {pool}: {reason}")]
    PoolFull { pool: String, reason: String },

    #[error("request can never be admitted to pool {pool}: {reason}")]
    Infeasible { pool: String, reason: String },

    #[error("admission for query timed out in pool {pool}: {reason}")]
    TimedOut { pool: String, reason: String },

    #[error("admission cancelled by the client")]
    Cancelled,

    #[error("admission controller is shutting down")]
    ShuttingDown,

    #[error("request pool service error: {0}")]
    PoolService(String),
}

impl AdmissionError {
    /// The reason string recorded in the query profile, if the error has one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::InvalidPoolConfig { reason, .. }
            | Self::Rejected { reason, .. }
            | Self::PoolFull { reason, .. }
            | Self::Infeasible { reason, .. }
            | Self::TimedOut { reason, .. } => Some(reason),
            Self::Cancelled | Self::ShuttingDown | Self::PoolService(_) => None,
        }
    }
}
