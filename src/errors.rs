//! Typed error hierarchy for the scheduling engine.
//!
//! `EngineError` names every failure the dispatcher distinguishes. Most of
//! them never escape a scheduling tick: they are turned into job or worktree
//! state transitions, or logged as a skip.

use flowpatch_common::FailureReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Another owner holds a valid lease. A normal race, retried next tick.
    #[error("Job {job_id} is leased by {holder}")]
    ClaimConflict { job_id: String, holder: String },

    #[error("No {resource} slot available")]
    CapacityExhausted { resource: &'static str },

    #[error("Executor failed for job {job_id}: {message}")]
    ExecutorFailure { job_id: String, message: String },

    #[error("Executor for job {job_id} exceeded {minutes} minutes")]
    ExecutorTimeout { job_id: String, minutes: u64 },

    #[error("Failed to create worktree {worktree_id}: {message}")]
    WorktreeCreationFailure {
        worktree_id: String,
        message: String,
    },

    /// The local executor must be cancelled and its result discarded.
    #[error("Lease on job {job_id} lost by {owner_id}")]
    LeaseLost { job_id: String, owner_id: String },

    #[error("Label reconciliation failed for card {card_id}: {message}")]
    ReconciliationFailure { card_id: String, message: String },

    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Worktree {id} not found")]
    WorktreeNotFound { id: String },

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Card {id} not found")]
    CardNotFound { id: String },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Reason code persisted on the job when this error ends an attempt.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::ExecutorFailure { .. } => Some(FailureReason::ExecutorFailure),
            Self::ExecutorTimeout { .. } => Some(FailureReason::ExecutorTimeout),
            Self::WorktreeCreationFailure { .. } => Some(FailureReason::WorktreeCreationFailure),
            Self::LeaseLost { .. } => Some(FailureReason::LeaseLost),
            _ => None,
        }
    }

    /// Outcomes of normal contention rather than faults.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::ClaimConflict { .. } | Self::CapacityExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_conflict_carries_holder() {
        let err = EngineError::ClaimConflict {
            job_id: "job-1".into(),
            holder: "dispatcher-b".into(),
        };
        match &err {
            EngineError::ClaimConflict { holder, .. } => assert_eq!(holder, "dispatcher-b"),
            _ => panic!("Expected ClaimConflict"),
        }
        assert!(err.is_skip());
        assert!(err.to_string().contains("dispatcher-b"));
    }

    #[test]
    fn timeout_maps_to_distinct_reason_code() {
        let err = EngineError::ExecutorTimeout {
            job_id: "job-1".into(),
            minutes: 25,
        };
        assert_eq!(err.failure_reason(), Some(FailureReason::ExecutorTimeout));
        assert!(err.to_string().contains("25"));
        assert!(!err.is_skip());
    }

    #[test]
    fn lease_lost_and_creation_failure_have_reason_codes() {
        let lost = EngineError::LeaseLost {
            job_id: "j".into(),
            owner_id: "o".into(),
        };
        assert_eq!(lost.failure_reason(), Some(FailureReason::LeaseLost));
        let wt = EngineError::WorktreeCreationFailure {
            worktree_id: "wt-1".into(),
            message: "fatal: invalid reference".into(),
        };
        assert_eq!(
            wt.failure_reason(),
            Some(FailureReason::WorktreeCreationFailure)
        );
    }

    #[test]
    fn bookkeeping_errors_have_no_reason_code() {
        assert_eq!(EngineError::LockPoisoned.failure_reason(), None);
        let err = EngineError::JobNotFound { id: "x".into() };
        assert_eq!(err.failure_reason(), None);
        assert!(err.to_string().contains("x"));
    }

    #[test]
    fn converts_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, EngineError::Other(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::LockPoisoned);
        assert_std_error(&EngineError::CapacityExhausted { resource: "worker" });
    }
}
