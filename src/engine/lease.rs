//! Job ownership on top of the store's compare-and-swap.
//!
//! A lease is the `(lease_owner_id, lease_expires_at)` pair on the job row.
//! Every operation here is one read-modify-write of that row, so two
//! dispatchers (in this process or another) can never both hold a valid
//! lease on the same job. Expired leases are treated as absent.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flowpatch_common::{Clock, FailureReason, Job, JobState, Lease, ResultEnvelope};

use crate::engine::db::{DbHandle, Mutation};
use crate::errors::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted(Lease),
    /// Someone else holds a valid lease, or the job is not claimable.
    Denied { holder: Option<String> },
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    /// The lease was extended. Carries any cancel request made by another
    /// process since the last renewal.
    Renewed { cancel_requested: bool },
    Lost,
}

/// Terminal state written by [`LeaseStore::release`].
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Succeeded(ResultEnvelope),
    Failed {
        result: Option<ResultEnvelope>,
        error: String,
        reason: FailureReason,
    },
    Canceled {
        error: Option<String>,
    },
}

impl Terminal {
    pub fn state(&self) -> JobState {
        match self {
            Self::Succeeded(_) => JobState::Succeeded,
            Self::Failed { .. } => JobState::Failed,
            Self::Canceled { .. } => JobState::Canceled,
        }
    }
}

enum Owned {
    Yes,
    No { holder: Option<String> },
}

fn owned_by(job: &Job, owner_id: &str) -> Owned {
    if job.state == JobState::Running && job.lease_owner_id.as_deref() == Some(owner_id) {
        Owned::Yes
    } else {
        Owned::No {
            holder: job.lease_owner_id.clone(),
        }
    }
}

fn clear_lease(job: &mut Job) {
    job.lease_owner_id = None;
    job.lease_expires_at = None;
}

#[derive(Clone)]
pub struct LeaseStore {
    db: DbHandle,
    clock: Arc<dyn Clock>,
}

impl LeaseStore {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Take the lease on `job_id` and move it to `running`.
    ///
    /// Succeeds for a queued job past its `not_before`, an approved pending
    /// approval, or a running job whose lease expired.
    pub async fn claim(
        &self,
        job_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, EngineError> {
        let now = self.clock.now();
        let id = job_id.to_string();
        let owner = owner_id.to_string();
        let outcome = self
            .db
            .call(move |db| {
                db.modify_job(&id, now, |job| {
                    let claimable = match job.state {
                        JobState::Queued => job.not_before.is_none_or(|at| at <= now),
                        JobState::PendingApproval => job.approved,
                        JobState::Running => !job.has_valid_lease(now),
                        _ => false,
                    };
                    if !claimable {
                        let holder = job
                            .has_valid_lease(now)
                            .then(|| job.lease_owner_id.clone())
                            .flatten();
                        return Ok(Mutation::Abort(ClaimOutcome::Denied { holder }));
                    }
                    let expires_at = now + ttl;
                    job.state = JobState::Running;
                    job.lease_owner_id = Some(owner.clone());
                    job.lease_expires_at = Some(expires_at);
                    job.not_before = None;
                    job.approval_deadline = None;
                    job.cancel_requested = false;
                    Ok(Mutation::Commit(ClaimOutcome::Granted(Lease {
                        job_id: job.id.clone(),
                        owner_id: owner.clone(),
                        expires_at,
                    })))
                })
            })
            .await?;
        outcome.ok_or_else(|| EngineError::JobNotFound {
            id: job_id.to_string(),
        })
    }

    /// Extend the lease. Fails when the caller is not the owner or the lease
    /// already expired.
    pub async fn renew(&self, job_id: &str, owner_id: &str, ttl: Duration) -> Result<bool, EngineError> {
        Ok(matches!(
            self.heartbeat(job_id, owner_id, ttl).await?,
            Renewal::Renewed { .. }
        ))
    }

    /// [`Self::renew`], also reporting cross-process cancel requests.
    pub async fn heartbeat(
        &self,
        job_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Renewal, EngineError> {
        let now = self.clock.now();
        let id = job_id.to_string();
        let owner = owner_id.to_string();
        let renewal = self
            .db
            .call(move |db| {
                db.modify_job(&id, now, |job| {
                    if !matches!(owned_by(job, &owner), Owned::Yes) || !job.has_valid_lease(now) {
                        return Ok(Mutation::Abort(Renewal::Lost));
                    }
                    job.lease_expires_at = Some(now + ttl);
                    Ok(Mutation::Commit(Renewal::Renewed {
                        cancel_requested: job.cancel_requested,
                    }))
                })
            })
            .await?;
        Ok(renewal.unwrap_or(Renewal::Lost))
    }

    /// Clear the lease and write a terminal state.
    pub async fn release(
        &self,
        job_id: &str,
        owner_id: &str,
        terminal: Terminal,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        self.release_with(job_id, owner_id, move |job| {
            job.state = terminal.state();
            match &terminal {
                Terminal::Succeeded(result) => {
                    job.result = Some(result.clone());
                    job.last_error = None;
                    job.failure_reason = None;
                }
                Terminal::Failed {
                    result,
                    error,
                    reason,
                } => {
                    job.result = result.clone();
                    job.last_error = Some(error.clone());
                    job.failure_reason = Some(*reason);
                    job.last_failure_at = Some(now);
                }
                Terminal::Canceled { error } => {
                    job.last_error = error.clone();
                    job.failure_reason = Some(FailureReason::Canceled);
                }
            }
        })
        .await
    }

    /// Hand a failed attempt back to the queue for another try.
    /// Consumes an attempt.
    pub async fn release_for_retry(
        &self,
        job_id: &str,
        owner_id: &str,
        not_before: Option<DateTime<Utc>>,
        error: String,
        reason: FailureReason,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        self.release_with(job_id, owner_id, move |job| {
            job.state = JobState::Queued;
            job.attempt_count += 1;
            job.not_before = not_before;
            job.last_failure_at = Some(now);
            job.last_error = Some(error.clone());
            job.failure_reason = Some(reason);
            job.result = None;
        })
        .await
    }

    /// Hand the job back without consuming an attempt (shutdown, lost
    /// worktree lock race).
    pub async fn release_to_queue(&self, job_id: &str, owner_id: &str) -> Result<(), EngineError> {
        self.release_with(job_id, owner_id, |job| {
            job.state = JobState::Queued;
        })
        .await
    }

    /// Park the job until a human approves it or `deadline` passes.
    pub async fn release_pending_approval(
        &self,
        job_id: &str,
        owner_id: &str,
        result: ResultEnvelope,
        deadline: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.release_with(job_id, owner_id, move |job| {
            job.state = JobState::PendingApproval;
            job.result = Some(result.clone());
            job.approval_deadline = Some(deadline);
            job.approved = false;
        })
        .await
    }

    async fn release_with(
        &self,
        job_id: &str,
        owner_id: &str,
        apply: impl Fn(&mut Job) + Send + 'static,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let id = job_id.to_string();
        let owner = owner_id.to_string();
        let outcome = self
            .db
            .call(move |db| {
                db.modify_job(&id, now, |job| {
                    if let Owned::No { holder } = owned_by(job, &owner) {
                        return Ok(Mutation::Abort(Err(holder)));
                    }
                    let from = job.state;
                    apply(job);
                    if !from.can_transition_to(job.state) {
                        return Ok(Mutation::Abort(Ok(Some((from, job.state)))));
                    }
                    clear_lease(job);
                    Ok(Mutation::Commit(Ok(None)))
                })
            })
            .await?;

        match outcome {
            None => Err(EngineError::JobNotFound {
                id: job_id.to_string(),
            }),
            Some(Err(_holder)) => Err(EngineError::LeaseLost {
                job_id: job_id.to_string(),
                owner_id: owner_id.to_string(),
            }),
            Some(Ok(Some((from, to)))) => Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }),
            Some(Ok(None)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::db::EngineDb;
    use crate::engine::db::tests::{new_job, seed_project, t0};
    use flowpatch_common::ManualClock;
    use flowpatch_common::job::{JobPayload, WorkerRunPayload};

    fn setup() -> (DbHandle, Arc<ManualClock>, LeaseStore) {
        let db = EngineDb::new_in_memory().unwrap();
        seed_project(&db, "web").unwrap();
        db.insert_job(&new_job(
            "job-1",
            "web",
            JobPayload::WorkerRun(WorkerRunPayload::default()),
        ))
        .unwrap();
        let handle = DbHandle::new(db);
        let clock = Arc::new(ManualClock::new(t0()));
        let store = LeaseStore::new(handle.clone(), clock.clone());
        (handle, clock, store)
    }

    fn ttl() -> Duration {
        Duration::seconds(300)
    }

    fn job(handle: &DbHandle) -> Job {
        handle.lock_sync().unwrap().get_job("job-1").unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_claim_moves_job_to_running_with_future_expiry() {
        let (handle, _clock, store) = setup();
        let outcome = store.claim("job-1", "alpha", ttl()).await.unwrap();
        let ClaimOutcome::Granted(lease) = outcome else {
            panic!("expected grant");
        };
        assert_eq!(lease.expires_at, t0() + ttl());

        let stored = job(&handle);
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(stored.lease_owner_id.as_deref(), Some("alpha"));
        assert!(stored.lease_expires_at.unwrap() > t0());
        assert_eq!(stored.updated_at, t0());
    }

    #[tokio::test]
    async fn test_concurrent_claims_grant_exactly_one() {
        let (_handle, _clock, store) = setup();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .claim("job-1", &format!("owner-{}", i), ttl())
                    .await
                    .unwrap()
            }));
        }
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap().is_granted() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_second_claim_denied_with_holder_then_reclaimed_after_expiry() {
        let (handle, clock, store) = setup();
        assert!(store.claim("job-1", "alpha", ttl()).await.unwrap().is_granted());

        let denied = store.claim("job-1", "beta", ttl()).await.unwrap();
        assert_eq!(
            denied,
            ClaimOutcome::Denied {
                holder: Some("alpha".to_string())
            }
        );

        clock.advance(Duration::seconds(301));
        assert!(store.claim("job-1", "beta", ttl()).await.unwrap().is_granted());
        assert_eq!(job(&handle).lease_owner_id.as_deref(), Some("beta"));

        // The crashed owner can no longer renew or release
        assert!(!store.renew("job-1", "alpha", ttl()).await.unwrap());
        let err = store
            .release("job-1", "alpha", Terminal::Succeeded(ResultEnvelope::success()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_renew_extends_and_fails_after_expiry() {
        let (handle, clock, store) = setup();
        store.claim("job-1", "alpha", ttl()).await.unwrap();

        clock.advance(Duration::seconds(150));
        assert!(store.renew("job-1", "alpha", ttl()).await.unwrap());
        assert_eq!(
            job(&handle).lease_expires_at,
            Some(t0() + Duration::seconds(450))
        );
        assert!(!store.renew("job-1", "beta", ttl()).await.unwrap());

        clock.advance(Duration::seconds(301));
        assert!(!store.renew("job-1", "alpha", ttl()).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancel_request() {
        let (handle, _clock, store) = setup();
        store.claim("job-1", "alpha", ttl()).await.unwrap();
        {
            let db = handle.lock_sync().unwrap();
            let mut j = db.get_job("job-1").unwrap().unwrap();
            j.cancel_requested = true;
            assert!(db.compare_and_swap_job(&j).unwrap());
        }
        assert_eq!(
            store.heartbeat("job-1", "alpha", ttl()).await.unwrap(),
            Renewal::Renewed {
                cancel_requested: true
            }
        );
    }

    #[tokio::test]
    async fn test_release_writes_terminal_state_and_clears_lease() {
        let (handle, _clock, store) = setup();
        store.claim("job-1", "alpha", ttl()).await.unwrap();
        store
            .release(
                "job-1",
                "alpha",
                Terminal::Failed {
                    result: Some(ResultEnvelope::failure("tests failed")),
                    error: "tests failed".into(),
                    reason: FailureReason::ExecutorFailure,
                },
            )
            .await
            .unwrap();

        let stored = job(&handle);
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("tests failed"));
        assert_eq!(stored.failure_reason, Some(FailureReason::ExecutorFailure));
        assert!(stored.lease_owner_id.is_none());
        assert!(stored.lease_expires_at.is_none());

        // Terminal jobs are never claimable again
        assert!(!store.claim("job-1", "alpha", ttl()).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_release_for_retry_consumes_attempt_and_gates_claim() {
        let (handle, clock, store) = setup();
        store.claim("job-1", "alpha", ttl()).await.unwrap();
        let not_before = t0() + Duration::minutes(30);
        store
            .release_for_retry(
                "job-1",
                "alpha",
                Some(not_before),
                "boom".into(),
                FailureReason::ExecutorFailure,
            )
            .await
            .unwrap();

        let stored = job(&handle);
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.not_before, Some(not_before));

        clock.advance(Duration::minutes(29));
        assert!(!store.claim("job-1", "alpha", ttl()).await.unwrap().is_granted());
        clock.advance(Duration::minutes(1));
        assert!(store.claim("job-1", "alpha", ttl()).await.unwrap().is_granted());
        assert!(job(&handle).not_before.is_none());
    }

    #[tokio::test]
    async fn test_release_to_queue_keeps_attempt_count() {
        let (handle, _clock, store) = setup();
        store.claim("job-1", "alpha", ttl()).await.unwrap();
        store.release_to_queue("job-1", "alpha").await.unwrap();
        let stored = job(&handle);
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.lease_owner_id.is_none());
    }

    #[tokio::test]
    async fn test_pending_approval_requires_approval_to_reclaim() {
        let (handle, _clock, store) = setup();
        store.claim("job-1", "alpha", ttl()).await.unwrap();
        store
            .release_pending_approval(
                "job-1",
                "alpha",
                ResultEnvelope::pending_approval(),
                t0() + Duration::minutes(10),
            )
            .await
            .unwrap();
        let stored = job(&handle);
        assert_eq!(stored.state, JobState::PendingApproval);
        assert!(stored.lease_owner_id.is_none());

        assert!(!store.claim("job-1", "alpha", ttl()).await.unwrap().is_granted());
        {
            let db = handle.lock_sync().unwrap();
            let mut j = db.get_job("job-1").unwrap().unwrap();
            j.approved = true;
            assert!(db.compare_and_swap_job(&j).unwrap());
        }
        assert!(store.claim("job-1", "alpha", ttl()).await.unwrap().is_granted());
        assert!(job(&handle).approval_deadline.is_none());
    }

    #[tokio::test]
    async fn test_claim_unknown_job_is_not_found() {
        let (_handle, _clock, store) = setup();
        let err = store.claim("missing", "alpha", ttl()).await.unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound { .. }));
    }
}
