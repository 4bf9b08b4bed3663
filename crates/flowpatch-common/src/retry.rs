//! Retry and cooldown decisions for failed jobs.
//!
//! The policy is a pure function of the job record: it never reads a clock
//! or touches the store. The dispatcher turns the decision into a state
//! transition (`running -> queued` with a `not_before` gate, or a terminal
//! `failed`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::{FailureReason, Job, JobType};

pub const DEFAULT_RETRY_COOLDOWN_MINUTES: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    RetryNow,
    RetryAfter { minutes: u32 },
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    AttemptsExhausted { attempts: u32, max_attempts: u32 },
    NotRetryable { failure: FailureReason },
}

impl std::fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttemptsExhausted {
                attempts,
                max_attempts,
            } => write!(f, "gave up after {} of {} attempts", attempts, max_attempts),
            Self::NotRetryable { failure } => write!(f, "{} is not retryable", failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub cooldown_minutes: u32,
    /// Per-type overrides of [`JobType::default_max_attempts`].
    pub max_attempts: HashMap<JobType, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cooldown_minutes: DEFAULT_RETRY_COOLDOWN_MINUTES,
            max_attempts: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(cooldown_minutes: u32) -> Self {
        Self {
            cooldown_minutes,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, job_type: JobType, max_attempts: u32) -> Self {
        self.max_attempts.insert(job_type, max_attempts);
        self
    }

    pub fn max_attempts_for(&self, job_type: JobType) -> u32 {
        self.max_attempts
            .get(&job_type)
            .copied()
            .unwrap_or_else(|| job_type.default_max_attempts())
    }

    /// Decide what happens to `job` after the attempt numbered
    /// `job.attempt_count` failed with `job.failure_reason`.
    ///
    /// A missing failure reason is treated as a plain executor failure.
    pub fn decide(&self, job: &Job) -> RetryDecision {
        let failure = job.failure_reason.unwrap_or(FailureReason::ExecutorFailure);
        if !failure.is_retryable() {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable { failure },
            };
        }

        let max_attempts = self.max_attempts_for(job.job_type);
        if job.attempt_count >= max_attempts {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::AttemptsExhausted {
                    attempts: job.attempt_count,
                    max_attempts,
                },
            };
        }

        match self.cooldown_minutes {
            0 => RetryDecision::RetryNow,
            minutes => RetryDecision::RetryAfter { minutes },
        }
    }
}
