//! Durable job queue: enqueue with duplicate suppression, ordered selection
//! of the next claimable job, and the user-facing cancel/approve edges.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use flowpatch_common::priority::{DEFAULT_PRIORITY, priority_from_labels};
use flowpatch_common::{Clock, FailureReason, Job, JobState, NewJob};
use uuid::Uuid;

use crate::config::QueueStrategy;
use crate::engine::db::{DbHandle, EngineDb, InsertOutcome, Mutation};
use crate::engine::events::{EngineEvent, EventBus};
use crate::errors::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(String),
    /// An equivalent job is already queued or running; nothing was inserted.
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => id,
        }
    }
}

/// What the dispatcher knows about the pool when asking for work.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub strategy: QueueStrategy,
    pub max_concurrent_worktrees: u32,
    /// Jobs already tried during this tick.
    pub skip: HashSet<String>,
}

impl PoolState {
    pub fn new(strategy: QueueStrategy, max_concurrent_worktrees: u32) -> Self {
        Self {
            strategy,
            max_concurrent_worktrees,
            skip: HashSet::new(),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job was not executing and is now `canceled`.
    Canceled { previous: JobState },
    /// The job is executing under a valid lease; its owner will stop it.
    Requested { owner_id: Option<String> },
    AlreadyTerminal(JobState),
}

#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    clock: Arc<dyn Clock>,
    events: EventBus,
    priority_field: Arc<RwLock<Option<String>>>,
}

impl JobQueue {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            db,
            clock,
            events,
            priority_field: Arc::new(RwLock::new(None)),
        }
    }

    /// Label field used to derive default priorities from next enqueue on.
    pub fn set_priority_field(&self, field: Option<String>) {
        *self
            .priority_field
            .write()
            .unwrap_or_else(|e| e.into_inner()) = field;
    }

    fn priority_field(&self) -> Option<String> {
        self.priority_field
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueOutcome, EngineError> {
        let now = self.clock.now();
        let field = self.priority_field();
        let job_type = new_job.job_type();
        let (outcome, job) = self
            .db
            .call(move |db| Self::insert(db, new_job, field, now))
            .await??;

        match &outcome {
            EnqueueOutcome::Enqueued(id) => {
                tracing::info!(job_id = %id, job_type = %job_type, priority = job.priority, "job enqueued");
                self.events.emit(EngineEvent::JobEnqueued {
                    job_id: id.clone(),
                    job_type,
                    project_id: job.project_id.clone(),
                    priority: job.priority,
                });
            }
            EnqueueOutcome::Duplicate(id) => {
                tracing::debug!(job_id = %id, job_type = %job_type, "duplicate enqueue ignored");
            }
        }
        Ok(outcome)
    }

    fn insert(
        db: &EngineDb,
        new_job: NewJob,
        field: Option<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Result<(EnqueueOutcome, Job), EngineError>> {
        if db.get_project(&new_job.project_id)?.is_none() {
            return Ok(Err(EngineError::ProjectNotFound {
                id: new_job.project_id,
            }));
        }
        let card = match &new_job.card_id {
            Some(card_id) => match db.get_card(card_id)? {
                Some(card) => Some(card),
                None => {
                    return Ok(Err(EngineError::CardNotFound {
                        id: card_id.clone(),
                    }));
                }
            },
            None => None,
        };
        let priority = new_job.priority.unwrap_or_else(|| match &card {
            Some(card) => priority_from_labels(&card.labels, field.as_deref()),
            None => DEFAULT_PRIORITY,
        });

        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: new_job.job_type(),
            project_id: new_job.project_id,
            card_id: new_job.card_id,
            payload: new_job.payload,
            state: JobState::Queued,
            priority,
            attempt_count: 1,
            lease_owner_id: None,
            lease_expires_at: None,
            not_before: None,
            last_failure_at: None,
            approval_deadline: None,
            approved: false,
            cancel_requested: false,
            result: None,
            last_error: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let outcome = match db.insert_job(&job)? {
            InsertOutcome::Inserted => EnqueueOutcome::Enqueued(job.id.clone()),
            InsertOutcome::Duplicate(existing) => EnqueueOutcome::Duplicate(existing),
        };
        Ok(Ok((outcome, job)))
    }

    /// The next job the dispatcher can actually execute.
    ///
    /// Worktree-requiring jobs whose project has no free slot are passed
    /// over so that one saturated project never blocks the rest.
    pub async fn next_claimable(&self, pool: &PoolState) -> Result<Option<Job>, EngineError> {
        let now = self.clock.now();
        let pool = pool.clone();
        let job = self
            .db
            .call(move |db| {
                for job in db.claimable_jobs(now, pool.strategy)? {
                    if pool.skip.contains(&job.id) {
                        continue;
                    }
                    if job.job_type.requires_worktree()
                        && !Self::has_worktree_slot(db, &job, pool.max_concurrent_worktrees, now)?
                    {
                        tracing::trace!(job_id = %job.id, project_id = %job.project_id, "no worktree slot");
                        continue;
                    }
                    return Ok(Some(job));
                }
                Ok(None)
            })
            .await?;
        Ok(job)
    }

    fn has_worktree_slot(
        db: &EngineDb,
        job: &Job,
        ceiling: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if db.worktree_locked_by(&job.id)?.is_some() {
            return Ok(true);
        }
        if db.idle_worktree(&job.project_id, now)?.is_some() {
            return Ok(true);
        }
        Ok(db.count_active_worktrees(&job.project_id)? < ceiling)
    }

    /// Push a still-queued job back by `minutes` after a failure that
    /// happened before it was claimed. Does not consume an attempt.
    pub async fn defer(
        &self,
        job_id: &str,
        minutes: u32,
        error: String,
        reason: FailureReason,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let id = job_id.to_string();
        let deferred = self
            .db
            .call(move |db| {
                db.modify_job(&id, now, |job| {
                    if job.state != JobState::Queued {
                        return Ok(Mutation::Abort(false));
                    }
                    job.not_before = Some(now + Duration::minutes(minutes as i64));
                    job.last_failure_at = Some(now);
                    job.last_error = Some(error.clone());
                    job.failure_reason = Some(reason);
                    Ok(Mutation::Commit(true))
                })
            })
            .await?;
        match deferred {
            None => Err(EngineError::JobNotFound {
                id: job_id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, EngineError> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.get_job(&id))
            .await?
            .ok_or_else(|| EngineError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, EngineError> {
        Ok(self.db.call(move |db| db.list_jobs(state)).await?)
    }

    /// Cancel a job that is not executing, or flag an executing one so its
    /// owner stops it at the next lease renewal.
    pub async fn request_cancel(&self, job_id: &str) -> Result<CancelOutcome, EngineError> {
        let now = self.clock.now();
        let id = job_id.to_string();
        let outcome = self
            .db
            .call(move |db| {
                db.modify_job(&id, now, |job| {
                    let previous = job.state;
                    match previous {
                        s if s.is_terminal() => Ok(Mutation::Abort(CancelOutcome::AlreadyTerminal(s))),
                        JobState::Running if job.has_valid_lease(now) => {
                            job.cancel_requested = true;
                            Ok(Mutation::Commit(CancelOutcome::Requested {
                                owner_id: job.lease_owner_id.clone(),
                            }))
                        }
                        _ => {
                            job.state = JobState::Canceled;
                            job.lease_owner_id = None;
                            job.lease_expires_at = None;
                            job.failure_reason = Some(FailureReason::Canceled);
                            job.last_error = Some("Canceled by user".to_string());
                            Ok(Mutation::Commit(CancelOutcome::Canceled { previous }))
                        }
                    }
                })
            })
            .await?;
        let outcome = outcome.ok_or_else(|| EngineError::JobNotFound {
            id: job_id.to_string(),
        })?;
        if let CancelOutcome::Canceled { previous } = &outcome {
            tracing::info!(job_id = %job_id, previous = %previous, "job canceled");
            self.events.emit(EngineEvent::JobCanceled {
                job_id: job_id.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Approve a job parked in `pending_approval` so it can resume.
    pub async fn approve(&self, job_id: &str) -> Result<(), EngineError> {
        let now = self.clock.now();
        let id = job_id.to_string();
        let outcome = self
            .db
            .call(move |db| {
                db.modify_job(&id, now, |job| {
                    if job.state != JobState::PendingApproval {
                        return Ok(Mutation::Abort(Err(job.state)));
                    }
                    job.approved = true;
                    Ok(Mutation::Commit(Ok(())))
                })
            })
            .await?;
        match outcome {
            None => Err(EngineError::JobNotFound {
                id: job_id.to_string(),
            }),
            Some(Err(state)) => Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: state.to_string(),
                to: JobState::Running.to_string(),
            }),
            Some(Ok(())) => {
                tracing::info!(job_id = %job_id, "job approved");
                Ok(())
            }
        }
    }

    /// Fail every pending approval whose deadline passed without an approval.
    /// Returns the failed jobs so their worktrees can be reclaimed.
    pub async fn expire_approvals(&self) -> Result<Vec<Job>, EngineError> {
        let now = self.clock.now();
        let expired = self
            .db
            .call(move |db| {
                let mut failed = Vec::new();
                for candidate in db.expired_approvals(now)? {
                    let job = db.modify_job(&candidate.id, now, |job| {
                        let past_deadline = job.approval_deadline.is_some_and(|at| at <= now);
                        if job.state != JobState::PendingApproval || job.approved || !past_deadline {
                            return Ok(Mutation::Abort(None));
                        }
                        job.state = JobState::Failed;
                        job.failure_reason = Some(FailureReason::ApprovalTimeout);
                        job.last_error = Some(format!(
                            "Approval timed out: not resumed before {}",
                            job.approval_deadline
                                .map(|at| at.to_rfc3339())
                                .unwrap_or_default()
                        ));
                        job.last_failure_at = Some(now);
                        Ok(Mutation::Commit(Some(job.clone())))
                    })?;
                    if let Some(Some(job)) = job {
                        failed.push(job);
                    }
                }
                Ok(failed)
            })
            .await?;

        for job in &expired {
            tracing::warn!(job_id = %job.id, "pending approval timed out");
            self.events.emit(EngineEvent::JobFailed {
                job_id: job.id.clone(),
                reason: FailureReason::ApprovalTimeout,
                error: job.last_error.clone().unwrap_or_default(),
                will_retry: false,
            });
        }
        Ok(expired)
    }
}
