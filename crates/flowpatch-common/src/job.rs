use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::CardStatus;

/// Every kind of schedulable work the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SyncPoll,
    SyncPush,
    WorkerRun,
    WebhookIngest,
    WorkspaceEnsure,
    IndexBuild,
    IndexRefresh,
    IndexWatchStart,
    IndexWatchStop,
    DocsRefresh,
    ConfigValidate,
    ContextPreview,
    Repair,
    Migrate,
}

impl JobType {
    pub const ALL: [JobType; 14] = [
        Self::SyncPoll,
        Self::SyncPush,
        Self::WorkerRun,
        Self::WebhookIngest,
        Self::WorkspaceEnsure,
        Self::IndexBuild,
        Self::IndexRefresh,
        Self::IndexWatchStart,
        Self::IndexWatchStop,
        Self::DocsRefresh,
        Self::ConfigValidate,
        Self::ContextPreview,
        Self::Repair,
        Self::Migrate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncPoll => "sync_poll",
            Self::SyncPush => "sync_push",
            Self::WorkerRun => "worker_run",
            Self::WebhookIngest => "webhook_ingest",
            Self::WorkspaceEnsure => "workspace_ensure",
            Self::IndexBuild => "index_build",
            Self::IndexRefresh => "index_refresh",
            Self::IndexWatchStart => "index_watch_start",
            Self::IndexWatchStop => "index_watch_stop",
            Self::DocsRefresh => "docs_refresh",
            Self::ConfigValidate => "config_validate",
            Self::ContextPreview => "context_preview",
            Self::Repair => "repair",
            Self::Migrate => "migrate",
        }
    }

    /// Job types that mutate a checkout and therefore need their own worktree.
    pub fn requires_worktree(&self) -> bool {
        matches!(self, Self::WorkerRun)
    }

    /// Job types whose success is mirrored onto the remote tracker's labels.
    pub fn reconciles_labels(&self) -> bool {
        matches!(self, Self::WorkerRun | Self::SyncPush)
    }

    /// Attempts allowed before the retry policy gives up. A value of 1 means
    /// the job never retries automatically.
    pub fn default_max_attempts(&self) -> u32 {
        match self {
            Self::SyncPoll | Self::SyncPush | Self::WebhookIngest | Self::WorkerRun => 3,
            Self::IndexBuild | Self::IndexRefresh | Self::DocsRefresh => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid job type: {}", s))
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    PendingApproval,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::PendingApproval => "pending_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether `self -> next` is a legal edge of the job state machine.
    ///
    /// `Running -> Queued` is the retry edge; only the retry policy and a
    /// graceful shutdown take it.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, PendingApproval)
                | (Running, Canceled)
                | (Running, Queued)
                | (PendingApproval, Running)
                | (PendingApproval, Failed)
                | (PendingApproval, Canceled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "pending_approval" => Ok(Self::PendingApproval),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Machine-readable cause persisted alongside a job's error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ExecutorFailure,
    ExecutorTimeout,
    ApprovalTimeout,
    WorktreeCreationFailure,
    LeaseLost,
    Canceled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutorFailure => "executor_failure",
            Self::ExecutorTimeout => "executor_timeout",
            Self::ApprovalTimeout => "approval_timeout",
            Self::WorktreeCreationFailure => "worktree_creation_failure",
            Self::LeaseLost => "lease_lost",
            Self::Canceled => "canceled",
        }
    }

    /// Reasons the retry policy is allowed to act on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutorFailure | Self::ExecutorTimeout | Self::WorktreeCreationFailure
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executor_failure" => Ok(Self::ExecutorFailure),
            "executor_timeout" => Ok(Self::ExecutorTimeout),
            "approval_timeout" => Ok(Self::ApprovalTimeout),
            "worktree_creation_failure" => Ok(Self::WorktreeCreationFailure),
            "lease_lost" => Ok(Self::LeaseLost),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid failure reason: {}", s)),
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPollPayload {
    pub full_resync: bool,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPushPayload {
    /// Card status to publish to the remote tracker.
    pub status: Option<CardStatus>,
    /// Non-status labels to keep on the remote issue.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRunPayload {
    pub title: Option<String>,
    pub prompt: Option<String>,
    /// Overrides the project's default branch as the worktree base.
    pub base_branch: Option<String>,
    /// Overrides the pool-wide `rollback_on_cancel` setting for this run.
    pub rollback_on_cancel: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookIngestPayload {
    pub delivery_id: String,
    pub event: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexBuildPayload {
    pub full: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexRefreshPayload {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPreviewPayload {
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairPayload {
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratePayload {
    pub to_version: u32,
}

/// Payload for job types that take no input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// Typed job input, one variant per [`JobType`].
///
/// Serialized as `{"type": "<job_type>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    SyncPoll(SyncPollPayload),
    SyncPush(SyncPushPayload),
    WorkerRun(WorkerRunPayload),
    WebhookIngest(WebhookIngestPayload),
    WorkspaceEnsure(EmptyPayload),
    IndexBuild(IndexBuildPayload),
    IndexRefresh(IndexRefreshPayload),
    IndexWatchStart(EmptyPayload),
    IndexWatchStop(EmptyPayload),
    DocsRefresh(EmptyPayload),
    ConfigValidate(EmptyPayload),
    ContextPreview(ContextPreviewPayload),
    Repair(RepairPayload),
    Migrate(MigratePayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::SyncPoll(_) => JobType::SyncPoll,
            Self::SyncPush(_) => JobType::SyncPush,
            Self::WorkerRun(_) => JobType::WorkerRun,
            Self::WebhookIngest(_) => JobType::WebhookIngest,
            Self::WorkspaceEnsure(_) => JobType::WorkspaceEnsure,
            Self::IndexBuild(_) => JobType::IndexBuild,
            Self::IndexRefresh(_) => JobType::IndexRefresh,
            Self::IndexWatchStart(_) => JobType::IndexWatchStart,
            Self::IndexWatchStop(_) => JobType::IndexWatchStop,
            Self::DocsRefresh(_) => JobType::DocsRefresh,
            Self::ConfigValidate(_) => JobType::ConfigValidate,
            Self::ContextPreview(_) => JobType::ContextPreview,
            Self::Repair(_) => JobType::Repair,
            Self::Migrate(_) => JobType::Migrate,
        }
    }

    /// Build a payload from a job type and its untagged JSON body.
    pub fn from_parts(job_type: JobType, body: serde_json::Value) -> serde_json::Result<Self> {
        let body = if body.is_null() {
            serde_json::json!({})
        } else {
            body
        };
        serde_json::from_value(serde_json::json!({
            "type": job_type.as_str(),
            "payload": body,
        }))
    }
}

// ── Results ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    PendingApproval,
}

/// Terminal output of an executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultEnvelope {
    pub fn success() -> Self {
        Self {
            status: ResultStatus::Success,
            artifacts: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            artifacts: None,
            error: Some(error.into()),
        }
    }

    pub fn pending_approval() -> Self {
        Self {
            status: ResultStatus::PendingApproval,
            artifacts: None,
            error: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: serde_json::Value) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Card status an executor asked the reconciler to apply, if any.
    pub fn card_status(&self) -> Option<CardStatus> {
        self.artifacts
            .as_ref()?
            .get("card_status")?
            .as_str()?
            .parse()
            .ok()
    }
}

// ── Job record ───────────────────────────────────────────────────────

/// Durable job record as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub project_id: String,
    pub card_id: Option<String>,
    pub payload: JobPayload,
    pub state: JobState,
    pub priority: i32,
    pub attempt_count: u32,
    pub lease_owner_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// The job is not claimable before this instant (retry cooldown).
    pub not_before: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Pending approvals not resumed by this instant are failed.
    pub approval_deadline: Option<DateTime<Utc>>,
    pub approved: bool,
    pub cancel_requested: bool,
    pub result: Option<ResultEnvelope>,
    pub last_error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped by every write.
    pub version: i64,
}

impl Job {
    pub fn has_valid_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner_id.is_some() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// Whether a dispatcher may claim this job at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => self.not_before.is_none_or(|at| at <= now),
            JobState::PendingApproval => self.approved,
            JobState::Running => !self.has_valid_lease(now),
            _ => false,
        }
    }
}

/// Input to `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub project_id: String,
    pub card_id: Option<String>,
    pub payload: JobPayload,
    /// Explicit priority; when absent the queue derives one from card labels.
    pub priority: Option<i32>,
}

impl NewJob {
    pub fn new(project_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            project_id: project_id.into(),
            card_id: None,
            payload,
            priority: None,
        }
    }

    pub fn for_card(mut self, card_id: impl Into<String>) -> Self {
        self.card_id = Some(card_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }
}
