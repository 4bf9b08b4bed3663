//! Worker pool dispatcher.
//!
//! Each tick re-derives everything from the store: it runs maintenance,
//! works out free capacity, then claims jobs in queue order and hands each
//! to a supervisor task. The only in-memory state is the map of jobs this
//! process is executing, used for capacity and cancellation.
//!
//! ```text
//! tick ─► maintenance ─► next_claimable ─► acquire worktree ─► claim ─► lock ─► supervise
//!                                                                                 │
//!          release lease + worktree, retry policy, reconcile labels ◄── complete ◄┘
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use flowpatch_common::{
    Clock, FailureReason, Job, JobPayload, NewJob, ReleaseOutcome, ResultEnvelope, ResultStatus,
    RetryDecision, Worktree, WorktreeStatus,
};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfigWatcher, FlowpatchToml};
use crate::engine::db::DbHandle;
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::executor::{ExecutionRequest, Executor, LogObserver, forward_logs, log_channel};
use crate::engine::lease::{ClaimOutcome, LeaseStore, Renewal, Terminal};
use crate::engine::queue::{CancelOutcome, EnqueueOutcome, JobQueue, PoolState};
use crate::engine::reconciler::{Reconciler, RemoteTracker};
use crate::engine::worktree::{GitBackend, WorktreePool};
use crate::errors::EngineError;

/// How long shutdown waits for supervisors to hand their jobs back.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// How long a finished attempt waits for its log forwarder to drain.
const LOG_DRAIN_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::error!(error = %e, "failed to install signal handlers");
                        return;
                    }
                };
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("Received ctrl-c, initiating graceful shutdown");
        }

        token_clone.cancel();
    });

    token
}

/// External collaborators of a dispatcher.
pub struct DispatcherDeps {
    pub db: DbHandle,
    pub clock: Arc<dyn Clock>,
    pub git: Arc<dyn GitBackend>,
    pub executor: Arc<dyn Executor>,
    pub tracker: Option<Arc<dyn RemoteTracker>>,
    pub observer: Arc<dyn LogObserver>,
    pub events: EventBus,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub config_reloaded: bool,
    pub approvals_expired: Vec<String>,
    pub locks_reclaimed: Vec<String>,
    pub worktrees_promoted: Vec<String>,
    pub worktrees_cleaned: Vec<String>,
    pub claimed: Vec<String>,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Canceled,
    Shutdown,
    LeaseLost,
    Timeout,
}

/// Cancellation token plus the first reason it was fired for.
#[derive(Clone, Default)]
struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl StopSignal {
    fn stop(&self, reason: StopReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
    }

    fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RunningJob {
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

struct Settings {
    current: FlowpatchToml,
    watcher: Option<ConfigWatcher>,
}

/// Everything a supervisor needs to finish a job.
struct Attempt {
    job: Job,
    worktree: Option<Worktree>,
    working_dir: PathBuf,
    stop: StopSignal,
}

#[derive(Clone)]
pub struct Dispatcher {
    owner_id: String,
    settings: Arc<Mutex<Settings>>,
    execution_limit: Option<std::time::Duration>,
    db: DbHandle,
    clock: Arc<dyn Clock>,
    leases: LeaseStore,
    queue: JobQueue,
    pool: WorktreePool,
    reconciler: Reconciler,
    executor: Arc<dyn Executor>,
    observer: Arc<dyn LogObserver>,
    events: EventBus,
    running: Arc<tokio::sync::Mutex<HashMap<String, RunningJob>>>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, config: FlowpatchToml, watcher: Option<ConfigWatcher>) -> Self {
        let DispatcherDeps {
            db,
            clock,
            git,
            executor,
            tracker,
            observer,
            events,
        } = deps;
        let queue = JobQueue::new(db.clone(), clock.clone(), events.clone());
        queue.set_priority_field(config.worker_pool.priority_field.clone());
        let pool = WorktreePool::new(
            db.clone(),
            git,
            clock.clone(),
            events.clone(),
            config.worktree.clone(),
        );
        let reconciler = Reconciler::new(db.clone(), tracker, clock.clone(), config.labels.clone());
        let short = Uuid::new_v4().simple().to_string();
        Self {
            owner_id: format!("dispatcher-{}", &short[..8]),
            settings: Arc::new(Mutex::new(Settings {
                current: config,
                watcher,
            })),
            execution_limit: None,
            leases: LeaseStore::new(db.clone(), clock.clone()),
            db,
            clock,
            queue,
            pool,
            reconciler,
            executor,
            observer,
            events,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Override `dispatcher.max_execution_minutes` with a finer limit.
    pub fn with_execution_limit(mut self, limit: std::time::Duration) -> Self {
        self.execution_limit = Some(limit);
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn pool(&self) -> &WorktreePool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> FlowpatchToml {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    /// Ids of jobs currently executing in this process.
    pub async fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ── User-facing operations ───────────────────────────────────────

    pub async fn enqueue(&self, new_job: NewJob) -> Result<EnqueueOutcome, EngineError> {
        let outcome = self.queue.enqueue(new_job).await?;
        if matches!(outcome, EnqueueOutcome::Enqueued(_)) {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Cancel a job wherever it is. A job executing here is stopped right
    /// away; one executing elsewhere is flagged for its owner.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, EngineError> {
        if let Some(entry) = self.running.lock().await.get(job_id) {
            entry.stop.stop(StopReason::Canceled);
            return Ok(CancelOutcome::Requested {
                owner_id: Some(self.owner_id.clone()),
            });
        }

        let outcome = self.queue.request_cancel(job_id).await?;
        if let CancelOutcome::Canceled { previous } = &outcome
            && *previous == flowpatch_common::JobState::PendingApproval
        {
            let job = self.queue.get(job_id).await?;
            self.release_held_worktree(&job, ReleaseOutcome::Canceled {
                rollback: self.rollback_on_cancel(&job),
            })
            .await?;
        }
        Ok(outcome)
    }

    pub async fn approve(&self, job_id: &str) -> Result<(), EngineError> {
        self.queue.approve(job_id).await?;
        self.wake.notify_one();
        Ok(())
    }

    // ── Loop ─────────────────────────────────────────────────────────

    /// Tick until `shutdown` fires, then stop local executors and hand
    /// their jobs back to the queue.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut period = self.tick_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(owner_id = %self.owner_id, "dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            let report = self.tick().await;
            if !report.claimed.is_empty() || !report.errors.is_empty() {
                tracing::debug!(claimed = report.claimed.len(), errors = report.errors.len(), "tick");
            }

            let next = self.tick_interval();
            if next != period {
                period = next;
                ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            }
        }

        self.shutdown().await;
        tracing::info!(owner_id = %self.owner_id, "dispatcher stopped");
    }

    fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config().dispatcher.tick_interval_ms.max(10))
    }

    /// Stop every local executor and wait for their jobs to be requeued.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.running.lock().await;
            running
                .values_mut()
                .filter_map(|entry| {
                    entry.stop.stop(StopReason::Shutdown);
                    entry.handle.take()
                })
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "handing running jobs back to the queue");
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles)).await.is_err() {
            tracing::warn!("timed out waiting for executors to stop");
        }
    }

    /// Wait for every job executing now to finish on its own.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.running.lock().await;
            running.values_mut().filter_map(|e| e.handle.take()).collect()
        };
        join_all(handles).await;
    }

    /// Reload config and run the maintenance steps without claiming work.
    pub async fn maintenance(&self) -> TickReport {
        let mut report = TickReport {
            config_reloaded: self.reload_config(),
            ..Default::default()
        };
        self.maintain(&mut report).await;
        report
    }

    /// One scheduling pass. Never fails: errors are logged and reported.
    pub async fn tick(&self) -> TickReport {
        let mut report = self.maintenance().await;

        let config = self.config();
        let mut pool_state = PoolState::new(
            config.worker_pool.queue_strategy,
            config.worktree.max_concurrent_worktrees,
        );
        let executing = {
            let running = self.running.lock().await;
            pool_state.skip.extend(running.keys().cloned());
            running.len()
        };
        let capacity = config.worker_pool.max_workers.saturating_sub(executing);

        while report.claimed.len() < capacity {
            let job = match self.queue.next_claimable(&pool_state).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to select next job");
                    report.errors.push(e.to_string());
                    break;
                }
            };
            pool_state.skip.insert(job.id.clone());
            let job_id = job.id.clone();
            match self.try_start(job, &config).await {
                Ok(true) => report.claimed.push(job_id),
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_skip() => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to start job");
                    report.errors.push(format!("{}: {}", job_id, e));
                }
            }
        }
        report
    }

    fn reload_config(&self) -> bool {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let Some(watcher) = settings.watcher.as_mut() else {
            return false;
        };
        match watcher.refresh() {
            Ok(false) => false,
            Ok(true) => {
                let next = watcher.current().clone();
                for warning in next.validate() {
                    tracing::warn!("config: {}", warning);
                }
                self.pool.configure(next.worktree.clone());
                self.reconciler.configure(next.labels.clone());
                self.queue
                    .set_priority_field(next.worker_pool.priority_field.clone());
                settings.current = next;
                tracing::info!("configuration reloaded");
                true
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "config reload failed, keeping previous configuration");
                false
            }
        }
    }

    async fn maintain(&self, report: &mut TickReport) {
        match self.queue.expire_approvals().await {
            Ok(expired) => {
                for job in expired {
                    let outcome = ReleaseOutcome::Canceled {
                        rollback: self.rollback_on_cancel(&job),
                    };
                    if let Err(e) = self.release_held_worktree(&job, outcome).await {
                        report.errors.push(e.to_string());
                    }
                    report.approvals_expired.push(job.id);
                }
            }
            Err(e) => report.errors.push(e.to_string()),
        }
        match self.pool.reclaim_stale_locks().await {
            Ok(ids) => report.locks_reclaimed = ids,
            Err(e) => report.errors.push(e.to_string()),
        }
        match self.pool.promote_idle().await {
            Ok(ids) => report.worktrees_promoted = ids,
            Err(e) => report.errors.push(e.to_string()),
        }
        match self.pool.sweep_cleanup().await {
            Ok(ids) => report.worktrees_cleaned = ids,
            Err(e) => report.errors.push(e.to_string()),
        }
        for error in &report.errors {
            tracing::warn!(error = %error, "maintenance step failed");
        }
    }

    /// Take `job` if possible. `Ok(false)` is a normal skip.
    async fn try_start(&self, job: Job, config: &FlowpatchToml) -> Result<bool, EngineError> {
        let project_id = job.project_id.clone();
        let project = self
            .db
            .call(move |db| db.get_project(&project_id))
            .await?
            .ok_or_else(|| EngineError::ProjectNotFound {
                id: job.project_id.clone(),
            })?;

        let worktree = if job.job_type.requires_worktree() {
            match self.pool.acquire(&project, &job).await {
                Ok(Some(wt)) => Some(wt),
                Ok(None) => {
                    let skip = EngineError::CapacityExhausted { resource: "worktree" };
                    tracing::debug!(job_id = %job.id, "{}", skip);
                    return Ok(false);
                }
                Err(e @ EngineError::WorktreeCreationFailure { .. }) => {
                    self.defer_after_worktree_failure(&job, e, config).await?;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        let resume = worktree
            .as_ref()
            .is_some_and(|wt| wt.locked_by_job_id.as_deref() == Some(job.id.as_str()));

        let ttl = config.lease.job_lease();
        match self.leases.claim(&job.id, &self.owner_id, ttl).await? {
            ClaimOutcome::Granted(_) => {}
            ClaimOutcome::Denied { holder } => {
                let skip = EngineError::ClaimConflict {
                    job_id: job.id.clone(),
                    holder: holder.unwrap_or_else(|| "nobody".to_string()),
                };
                tracing::debug!("{}", skip);
                return Ok(false);
            }
        }

        if let Some(wt) = &worktree
            && !self.pool.lock(&wt.id, &job.id, ttl).await?
        {
            // Another dispatcher took the idle worktree between acquire and lock
            self.leases.release_to_queue(&job.id, &self.owner_id).await?;
            tracing::debug!(job_id = %job.id, worktree_id = %wt.id, "worktree lock lost, job requeued");
            return Ok(false);
        }

        // A reused worktree still carries the previous card's branch
        let worktree = match worktree {
            Some(wt) if !resume => match self.pool.assign_branch(&wt, &project, &job).await {
                Ok(wt) => Some(wt),
                Err(e) => {
                    self.leases.release_to_queue(&job.id, &self.owner_id).await?;
                    if matches!(e, EngineError::WorktreeCreationFailure { .. }) {
                        self.defer_after_worktree_failure(&job, e, config).await?;
                        return Ok(false);
                    }
                    return Err(e);
                }
            },
            other => other,
        };

        tracing::info!(job_id = %job.id, job_type = %job.job_type, owner_id = %self.owner_id, attempt = job.attempt_count, "job claimed");
        self.events.emit(EngineEvent::JobClaimed {
            job_id: job.id.clone(),
            owner_id: self.owner_id.clone(),
            attempt: job.attempt_count,
        });

        let working_dir = worktree
            .as_ref()
            .map(|wt| PathBuf::from(&wt.path))
            .unwrap_or_else(|| PathBuf::from(&project.path));
        let stop = StopSignal::default();
        let attempt = Attempt {
            job,
            worktree,
            working_dir,
            stop: stop.clone(),
        };
        let job_id = attempt.job.id.clone();

        let mut running = self.running.lock().await;
        running.insert(
            job_id.clone(),
            RunningJob {
                stop,
                handle: None,
            },
        );
        let this = self.clone();
        let handle = tokio::spawn(async move { this.supervise(attempt).await });
        if let Some(entry) = running.get_mut(&job_id) {
            entry.handle = Some(handle);
        }
        Ok(true)
    }

    /// Hold `job` back for the retry cooldown without consuming an attempt.
    async fn defer_after_worktree_failure(
        &self,
        job: &Job,
        err: EngineError,
        config: &FlowpatchToml,
    ) -> Result<(), EngineError> {
        let minutes = config.retry.cooldown_minutes;
        let reason = err.failure_reason().unwrap_or(FailureReason::WorktreeCreationFailure);
        self.queue.defer(&job.id, minutes, err.to_string(), reason).await?;
        tracing::warn!(job_id = %job.id, minutes, error = %err, "job deferred");
        self.events.emit(EngineEvent::JobFailed {
            job_id: job.id.clone(),
            reason,
            error: err.to_string(),
            will_retry: true,
        });
        Ok(())
    }

    // ── Supervision ──────────────────────────────────────────────────

    async fn supervise(self, attempt: Attempt) {
        let config = self.config();
        let ttl = config.lease.job_lease();
        let job_id = attempt.job.id.clone();

        let (sink, stream) = log_channel(config.dispatcher.log_buffer_lines);
        let mut forwarder = tokio::spawn(forward_logs(job_id.clone(), stream, self.observer.clone()));

        let request = ExecutionRequest {
            job_id: job_id.clone(),
            job_type: attempt.job.job_type,
            payload: attempt.job.payload.clone(),
            working_dir: attempt.working_dir.clone(),
            attempt: attempt.job.attempt_count,
        };
        let run = self.executor.run(request, sink, attempt.stop.token.clone());
        tokio::pin!(run);

        let period = (ttl / 2)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1))
            .max(std::time::Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let limit = self.execution_limit.unwrap_or_else(|| {
            std::time::Duration::from_secs(config.dispatcher.max_execution_minutes * 60)
        });
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let (result, interrupted) = loop {
            tokio::select! {
                result = &mut run => {
                    // A stop that lands after a finished run does not change its outcome
                    let interrupted = match &result {
                        Ok(_) => attempt.stop.reason().filter(|r| *r == StopReason::LeaseLost),
                        Err(_) => attempt.stop.reason(),
                    };
                    break (result, interrupted);
                }
                _ = heartbeat.tick(), if attempt.stop.reason().is_none() => {
                    self.heartbeat(&attempt, ttl).await;
                }
                _ = &mut deadline, if attempt.stop.reason().is_none() => {
                    tracing::warn!(job_id = %job_id, limit_secs = limit.as_secs(), "execution limit reached");
                    attempt.stop.stop(StopReason::Timeout);
                }
            }
        };
        // Output still held by a leaked sink is not worth waiting for
        if tokio::time::timeout(LOG_DRAIN_GRACE, &mut forwarder).await.is_err() {
            tracing::debug!(job_id = %job_id, "log forwarder still open, aborting");
            forwarder.abort();
        }

        let minutes = config.dispatcher.max_execution_minutes;
        if let Err(e) = self.complete(&attempt, result, interrupted, minutes).await {
            tracing::error!(job_id = %job_id, error = %e, "failed to record job outcome");
        }

        self.running.lock().await.remove(&job_id);
        self.wake.notify_one();
    }

    async fn heartbeat(&self, attempt: &Attempt, ttl: Duration) {
        let job_id = &attempt.job.id;
        match self.leases.heartbeat(job_id, &self.owner_id, ttl).await {
            Ok(Renewal::Renewed { cancel_requested }) => {
                if let Some(wt) = &attempt.worktree {
                    match self.pool.renew_lock(&wt.id, job_id, ttl).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(job_id = %job_id, worktree_id = %wt.id, "worktree lock not renewed"),
                        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "worktree lock renewal failed"),
                    }
                }
                if cancel_requested {
                    tracing::info!(job_id = %job_id, "cancel requested by another process");
                    attempt.stop.stop(StopReason::Canceled);
                }
            }
            Ok(Renewal::Lost) => {
                let lost = EngineError::LeaseLost {
                    job_id: job_id.clone(),
                    owner_id: self.owner_id.clone(),
                };
                tracing::warn!("{}", lost);
                attempt.stop.stop(StopReason::LeaseLost);
            }
            // Transient store trouble; the lease still has half its TTL
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "lease renewal failed"),
        }
    }

    async fn complete(
        &self,
        attempt: &Attempt,
        result: anyhow::Result<ResultEnvelope>,
        interrupted: Option<StopReason>,
        limit_minutes: u64,
    ) -> Result<(), EngineError> {
        let job = &attempt.job;
        let rollback = self.rollback_on_cancel(job);

        match interrupted {
            Some(StopReason::Shutdown) => {
                self.leases.release_to_queue(&job.id, &self.owner_id).await?;
                self.release_worktree(attempt, ReleaseOutcome::Canceled { rollback })
                    .await;
                tracing::info!(job_id = %job.id, "job handed back on shutdown");
                return Ok(());
            }
            Some(StopReason::LeaseLost) => {
                // Someone else may own the job now; leave its row alone
                self.release_worktree(attempt, ReleaseOutcome::Canceled { rollback: true })
                    .await;
                tracing::warn!(job_id = %job.id, "result discarded after lease loss");
                return Ok(());
            }
            Some(StopReason::Canceled) => {
                self.leases
                    .release(
                        &job.id,
                        &self.owner_id,
                        Terminal::Canceled {
                            error: Some("Canceled by user".to_string()),
                        },
                    )
                    .await?;
                self.release_worktree(attempt, ReleaseOutcome::Canceled { rollback })
                    .await;
                tracing::info!(job_id = %job.id, "job canceled");
                self.events.emit(EngineEvent::JobCanceled {
                    job_id: job.id.clone(),
                });
                return Ok(());
            }
            Some(StopReason::Timeout) => {
                let err = EngineError::ExecutorTimeout {
                    job_id: job.id.clone(),
                    minutes: limit_minutes,
                };
                self.release_worktree(attempt, ReleaseOutcome::Canceled { rollback })
                    .await;
                return self.fail(job, err, None).await;
            }
            None => {}
        }

        match result {
            Err(e) => {
                self.release_worktree(attempt, ReleaseOutcome::Completed).await;
                let err = EngineError::ExecutorFailure {
                    job_id: job.id.clone(),
                    message: format!("{:#}", e),
                };
                self.fail(job, err, None).await
            }
            Ok(envelope) => match envelope.status {
                ResultStatus::Success => self.succeed(attempt, envelope).await,
                ResultStatus::Failure => {
                    self.release_worktree(attempt, ReleaseOutcome::Completed).await;
                    let err = EngineError::ExecutorFailure {
                        job_id: job.id.clone(),
                        message: envelope
                            .error
                            .clone()
                            .unwrap_or_else(|| "Executor reported failure".to_string()),
                    };
                    self.fail(job, err, Some(envelope)).await
                }
                ResultStatus::PendingApproval => self.park(attempt, envelope).await,
            },
        }
    }

    async fn succeed(&self, attempt: &Attempt, envelope: ResultEnvelope) -> Result<(), EngineError> {
        let job = &attempt.job;
        self.leases
            .release(&job.id, &self.owner_id, Terminal::Succeeded(envelope.clone()))
            .await?;
        self.release_worktree(attempt, ReleaseOutcome::Completed).await;
        tracing::info!(job_id = %job.id, "job succeeded");
        self.events.emit(EngineEvent::JobSucceeded {
            job_id: job.id.clone(),
        });

        if let Err(e) = self.reconciler.reconcile(job, &envelope).await {
            tracing::warn!(job_id = %job.id, error = %e, "label reconciliation failed");
        }
        Ok(())
    }

    /// Apply the retry policy to a failed attempt.
    async fn fail(
        &self,
        job: &Job,
        err: EngineError,
        envelope: Option<ResultEnvelope>,
    ) -> Result<(), EngineError> {
        let reason = err.failure_reason().unwrap_or(FailureReason::ExecutorFailure);
        let error = err.to_string();
        let policy = self.config().retry_policy();
        let mut failed = job.clone();
        failed.failure_reason = Some(reason);
        let decision = policy.decide(&failed);

        let now = self.clock.now();
        let will_retry = match decision {
            RetryDecision::RetryNow => {
                self.leases
                    .release_for_retry(&job.id, &self.owner_id, None, error.clone(), reason)
                    .await?;
                true
            }
            RetryDecision::RetryAfter { minutes } => {
                let not_before = now + Duration::minutes(minutes as i64);
                self.leases
                    .release_for_retry(&job.id, &self.owner_id, Some(not_before), error.clone(), reason)
                    .await?;
                true
            }
            RetryDecision::GiveUp { reason: give_up } => {
                self.leases
                    .release(
                        &job.id,
                        &self.owner_id,
                        Terminal::Failed {
                            result: envelope,
                            error: format!("{} ({})", error, give_up),
                            reason,
                        },
                    )
                    .await?;
                false
            }
        };

        tracing::warn!(job_id = %job.id, reason = %reason, attempt = job.attempt_count, will_retry, error = %error, "job attempt failed");
        self.events.emit(EngineEvent::JobFailed {
            job_id: job.id.clone(),
            reason,
            error,
            will_retry,
        });
        Ok(())
    }

    /// Park the job for approval, keeping its worktree reserved until the
    /// approval deadline.
    async fn park(&self, attempt: &Attempt, envelope: ResultEnvelope) -> Result<(), EngineError> {
        let job = &attempt.job;
        let deadline = self.clock.now() + self.config().lease.worktree_lock();
        self.leases
            .release_pending_approval(&job.id, &self.owner_id, envelope, deadline)
            .await?;
        if let Some(wt) = &attempt.worktree {
            self.pool.extend_lock(&wt.id, &job.id, deadline).await?;
        }
        tracing::info!(job_id = %job.id, deadline = %deadline, "job awaiting approval");
        self.events.emit(EngineEvent::JobPendingApproval {
            job_id: job.id.clone(),
            worktree_id: attempt.worktree.as_ref().map(|wt| wt.id.clone()),
        });
        Ok(())
    }

    async fn release_worktree(&self, attempt: &Attempt, outcome: ReleaseOutcome) {
        let Some(wt) = &attempt.worktree else {
            return;
        };
        match self.pool.release(&wt.id, &attempt.job.id, outcome).await {
            Ok(status) => self.tear_down_if_broken(&wt.id, status).await,
            Err(e) => {
                tracing::warn!(job_id = %attempt.job.id, worktree_id = %wt.id, error = %e, "worktree release failed");
            }
        }
    }

    /// A worktree left in `error` by its release goes on the next sweep.
    async fn tear_down_if_broken(&self, worktree_id: &str, status: WorktreeStatus) {
        if status != WorktreeStatus::Error {
            return;
        }
        if let Err(e) = self.pool.schedule_cleanup(worktree_id, 0).await {
            tracing::warn!(worktree_id = %worktree_id, error = %e, "cleanup not scheduled");
        }
    }

    /// Release whatever worktree `job` still holds (pending approval paths).
    async fn release_held_worktree(&self, job: &Job, outcome: ReleaseOutcome) -> Result<(), EngineError> {
        let job_id = job.id.clone();
        let held = self
            .db
            .call(move |db| db.worktree_locked_by(&job_id))
            .await?;
        if let Some(wt) = held {
            let status = self.pool.release(&wt.id, &job.id, outcome).await?;
            self.tear_down_if_broken(&wt.id, status).await;
        }
        Ok(())
    }

    fn rollback_on_cancel(&self, job: &Job) -> bool {
        let default = self.config().worktree.rollback_on_cancel;
        match &job.payload {
            JobPayload::WorkerRun(p) => p.rollback_on_cancel.unwrap_or(default),
            _ => default,
        }
    }
}
