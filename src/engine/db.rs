use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use flowpatch_common::{
    Card, CardStatus, FailureReason, Job, JobPayload, JobState, JobType, Project, ResultEnvelope,
    Worktree, WorktreeStatus,
};

use crate::config::QueueStrategy;
use crate::errors::EngineError;

/// How many times a read-modify-write is retried when another writer bumps
/// the row version between the read and the write.
const CAS_ATTEMPTS: usize = 5;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| EngineError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI commands,
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::LockPoisoned.into())
    }
}

/// Result of a conditional job insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An equivalent job is already queued or running.
    Duplicate(String),
}

/// Decision returned by a read-modify-write closure.
pub enum Mutation<T> {
    /// Write the modified row and return the value.
    Commit(T),
    /// Leave the row untouched and return the value.
    Abort(T),
}

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    path TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    remote_repo TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'ready',
                    labels TEXT NOT NULL DEFAULT '[]',
                    remote_issue_number INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    card_id TEXT REFERENCES cards(id) ON DELETE SET NULL,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'queued',
                    priority INTEGER NOT NULL DEFAULT 2,
                    attempt_count INTEGER NOT NULL DEFAULT 1,
                    lease_owner_id TEXT,
                    lease_expires_at TEXT,
                    not_before TEXT,
                    last_failure_at TEXT,
                    approval_deadline TEXT,
                    approved INTEGER NOT NULL DEFAULT 0,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    result TEXT,
                    last_error TEXT,
                    failure_reason TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS worktrees (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    branch_name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'creating',
                    locked_by_job_id TEXT,
                    lock_expires_at TEXT,
                    run_count INTEGER NOT NULL DEFAULT 0,
                    cleanup_after TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_used_at TEXT,
                    version INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_cards_project ON cards(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
                CREATE INDEX IF NOT EXISTS idx_jobs_dedupe ON jobs(job_type, project_id, card_id);
                CREATE INDEX IF NOT EXISTS idx_worktrees_project ON worktrees(project_id, status);
                CREATE INDEX IF NOT EXISTS idx_worktrees_lock ON worktrees(locked_by_job_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, project: &Project) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (id, name, path, default_branch, remote_repo, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project.id,
                    project.name,
                    project.path,
                    project.default_branch,
                    project.remote_repo,
                    ts(project.created_at),
                ],
            )
            .context("Failed to insert project")?;
        self.get_project(&project.id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                project_row,
            )
            .optional()
            .context("Failed to query project")?
            .map(ProjectRow::into_project)
            .transpose()
    }

    /// Look a project up by id, falling back to its name.
    pub fn find_project(&self, key: &str) -> Result<Option<Project>> {
        if let Some(project) = self.get_project(key)? {
            return Ok(Some(project));
        }
        self.conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1"),
                params![key],
                project_row,
            )
            .optional()
            .context("Failed to query project by name")?
            .map(ProjectRow::into_project)
            .transpose()
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY created_at, name"
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    // ── Cards ─────────────────────────────────────────────────────────

    pub fn create_card(&self, card: &Card) -> Result<Card> {
        let labels = serde_json::to_string(&card.labels).context("Failed to encode labels")?;
        self.conn
            .execute(
                "INSERT INTO cards (id, project_id, title, status, labels, remote_issue_number,
                                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    card.id,
                    card.project_id,
                    card.title,
                    card.status.as_str(),
                    labels,
                    card.remote_issue_number,
                    ts(card.created_at),
                    ts(card.updated_at),
                ],
            )
            .context("Failed to insert card")?;
        self.get_card(&card.id)?.context("Card not found after insert")
    }

    pub fn get_card(&self, id: &str) -> Result<Option<Card>> {
        self.conn
            .query_row(
                &format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1"),
                params![id],
                card_row,
            )
            .optional()
            .context("Failed to query card")?
            .map(CardRow::into_card)
            .transpose()
    }

    pub fn list_cards(&self, project_id: &str) -> Result<Vec<Card>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CARD_COLUMNS} FROM cards WHERE project_id = ?1 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare list_cards")?;
        let rows = stmt
            .query_map(params![project_id], card_row)
            .context("Failed to query cards")?;
        let mut cards = Vec::new();
        for row in rows {
            cards.push(row.context("Failed to read card row")?.into_card()?);
        }
        Ok(cards)
    }

    /// Write a card's status and labels back to the local mirror.
    pub fn update_card(&self, card: &Card) -> Result<()> {
        let labels = serde_json::to_string(&card.labels).context("Failed to encode labels")?;
        let changed = self
            .conn
            .execute(
                "UPDATE cards SET status = ?1, labels = ?2, updated_at = ?3 WHERE id = ?4",
                params![card.status.as_str(), labels, ts(card.updated_at), card.id],
            )
            .context("Failed to update card")?;
        if changed == 0 {
            anyhow::bail!("Card {} not found", card.id);
        }
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Insert `job` unless a job with the same type, project and card is
    /// already queued or running. Check and insert are one statement.
    pub fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        let payload = serde_json::to_string(&job.payload).context("Failed to encode payload")?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO jobs (id, job_type, project_id, card_id, payload, state, priority,
                                   attempt_count, not_before, created_at, updated_at, version)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 0
                 WHERE NOT EXISTS (
                     SELECT 1 FROM jobs
                     WHERE job_type = ?2 AND project_id = ?3 AND card_id IS ?4
                       AND state IN ('queued', 'running')
                 )",
                params![
                    job.id,
                    job.job_type.as_str(),
                    job.project_id,
                    job.card_id,
                    payload,
                    job.state.as_str(),
                    job.priority,
                    job.attempt_count,
                    job.not_before.map(ts),
                    ts(job.created_at),
                ],
            )
            .context("Failed to insert job")?;
        if inserted > 0 {
            return Ok(InsertOutcome::Inserted);
        }

        let existing: String = self
            .conn
            .query_row(
                "SELECT id FROM jobs
                 WHERE job_type = ?1 AND project_id = ?2 AND card_id IS ?3
                   AND state IN ('queued', 'running')
                 ORDER BY created_at, rowid LIMIT 1",
                params![job.job_type.as_str(), job.project_id, job.card_id],
                |row| row.get(0),
            )
            .context("Failed to look up duplicate job")?;
        Ok(InsertOutcome::Duplicate(existing))
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                job_row,
            )
            .optional()
            .context("Failed to query job")?
            .map(JobRow::into_job)
            .transpose()
    }

    /// Jobs in creation order, optionally restricted to one state.
    pub fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE (?1 IS NULL OR state = ?1)
                 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![state.map(|s| s.as_str())], job_row)
            .context("Failed to query jobs")?;
        collect_jobs(rows)
    }

    /// Every job a dispatcher could claim at `now`, in queue order.
    pub fn claimable_jobs(&self, now: DateTime<Utc>, strategy: QueueStrategy) -> Result<Vec<Job>> {
        let order = match strategy {
            QueueStrategy::Priority => "priority, created_at, rowid",
            QueueStrategy::Fifo => "created_at, rowid",
        };
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE (state = 'queued' AND (not_before IS NULL OR not_before <= ?1))
                    OR (state = 'pending_approval' AND approved = 1)
                    OR (state = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= ?1))
                 ORDER BY {order}"
            ))
            .context("Failed to prepare claimable_jobs")?;
        let rows = stmt
            .query_map(params![ts(now)], job_row)
            .context("Failed to query claimable jobs")?;
        collect_jobs(rows)
    }

    /// Pending approvals whose deadline has passed.
    pub fn expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state = 'pending_approval' AND approved = 0
                   AND approval_deadline IS NOT NULL AND approval_deadline <= ?1
                 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare expired_approvals")?;
        let rows = stmt
            .query_map(params![ts(now)], job_row)
            .context("Failed to query expired approvals")?;
        collect_jobs(rows)
    }

    /// Write every mutable column of `job` if the stored version still
    /// equals `job.version`. Returns false when another writer got there first.
    pub fn compare_and_swap_job(&self, job: &Job) -> Result<bool> {
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode job result")?;
        let payload = serde_json::to_string(&job.payload).context("Failed to encode payload")?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET
                    payload = ?1, state = ?2, priority = ?3, attempt_count = ?4,
                    lease_owner_id = ?5, lease_expires_at = ?6, not_before = ?7,
                    last_failure_at = ?8, approval_deadline = ?9, approved = ?10,
                    cancel_requested = ?11, result = ?12, last_error = ?13,
                    failure_reason = ?14, updated_at = ?15, version = version + 1
                 WHERE id = ?16 AND version = ?17",
                params![
                    payload,
                    job.state.as_str(),
                    job.priority,
                    job.attempt_count,
                    job.lease_owner_id,
                    job.lease_expires_at.map(ts),
                    job.not_before.map(ts),
                    job.last_failure_at.map(ts),
                    job.approval_deadline.map(ts),
                    job.approved,
                    job.cancel_requested,
                    result,
                    job.last_error,
                    job.failure_reason.map(|r| r.as_str()),
                    ts(job.updated_at),
                    job.id,
                    job.version,
                ],
            )
            .context("Failed to compare-and-swap job")?;
        Ok(changed == 1)
    }

    /// Read-modify-write a job on top of [`Self::compare_and_swap_job`].
    ///
    /// `f` sees the freshest row on every attempt; it is re-run when a
    /// concurrent writer wins the race. Returns `None` if the job is missing.
    pub fn modify_job<T>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        mut f: impl FnMut(&mut Job) -> Result<Mutation<T>>,
    ) -> Result<Option<T>> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut job) = self.get_job(id)? else {
                return Ok(None);
            };
            match f(&mut job)? {
                Mutation::Abort(value) => return Ok(Some(value)),
                Mutation::Commit(value) => {
                    job.updated_at = now;
                    if self.compare_and_swap_job(&job)? {
                        return Ok(Some(value));
                    }
                }
            }
        }
        anyhow::bail!("Job {} kept changing during compare-and-swap", id)
    }

    // ── Worktrees ─────────────────────────────────────────────────────

    /// Insert a `creating` worktree only if the project is below `ceiling`
    /// slots. Counting and allocating happen in one statement.
    pub fn allocate_worktree(&self, worktree: &Worktree, ceiling: u32) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO worktrees (id, project_id, branch_name, path, status, run_count,
                                        created_at, updated_at, version)
                 SELECT ?1, ?2, ?3, ?4, 'creating', 0, ?5, ?5, 0
                 WHERE (SELECT COUNT(*) FROM worktrees
                        WHERE project_id = ?2
                          AND status IN ('creating', 'ready', 'running')) < ?6",
                params![
                    worktree.id,
                    worktree.project_id,
                    worktree.branch_name,
                    worktree.path,
                    ts(worktree.created_at),
                    ceiling,
                ],
            )
            .context("Failed to allocate worktree slot")?;
        Ok(inserted == 1)
    }

    pub fn get_worktree(&self, id: &str) -> Result<Option<Worktree>> {
        self.conn
            .query_row(
                &format!("SELECT {WORKTREE_COLUMNS} FROM worktrees WHERE id = ?1"),
                params![id],
                worktree_row,
            )
            .optional()
            .context("Failed to query worktree")?
            .map(WorktreeRow::into_worktree)
            .transpose()
    }

    pub fn list_worktrees(&self, project_id: Option<&str>) -> Result<Vec<Worktree>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WORKTREE_COLUMNS} FROM worktrees
                 WHERE (?1 IS NULL OR project_id = ?1)
                 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare list_worktrees")?;
        let rows = stmt
            .query_map(params![project_id], worktree_row)
            .context("Failed to query worktrees")?;
        collect_worktrees(rows)
    }

    pub fn worktrees_with_status(&self, status: WorktreeStatus) -> Result<Vec<Worktree>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WORKTREE_COLUMNS} FROM worktrees WHERE status = ?1
                 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare worktrees_with_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], worktree_row)
            .context("Failed to query worktrees by status")?;
        collect_worktrees(rows)
    }

    /// Oldest unlocked `ready` worktree of a project.
    pub fn idle_worktree(&self, project_id: &str, now: DateTime<Utc>) -> Result<Option<Worktree>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {WORKTREE_COLUMNS} FROM worktrees
                     WHERE project_id = ?1 AND status = 'ready'
                       AND (locked_by_job_id IS NULL OR lock_expires_at IS NULL
                            OR lock_expires_at <= ?2)
                     ORDER BY created_at, rowid LIMIT 1"
                ),
                params![project_id, ts(now)],
                worktree_row,
            )
            .optional()
            .context("Failed to query idle worktree")?
            .map(WorktreeRow::into_worktree)
            .transpose()
    }

    /// The worktree currently locked by `job_id`, if any.
    pub fn worktree_locked_by(&self, job_id: &str) -> Result<Option<Worktree>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {WORKTREE_COLUMNS} FROM worktrees
                     WHERE locked_by_job_id = ?1 AND status = 'running'
                     ORDER BY created_at, rowid LIMIT 1"
                ),
                params![job_id],
                worktree_row,
            )
            .optional()
            .context("Failed to query worktree by lock holder")?
            .map(WorktreeRow::into_worktree)
            .transpose()
    }

    /// Worktrees of a project that occupy a concurrency slot.
    pub fn count_active_worktrees(&self, project_id: &str) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM worktrees
                 WHERE project_id = ?1 AND status IN ('creating', 'ready', 'running')",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count active worktrees")
    }

    /// Running worktrees whose lock has expired.
    pub fn expired_worktree_locks(&self, now: DateTime<Utc>) -> Result<Vec<Worktree>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WORKTREE_COLUMNS} FROM worktrees
                 WHERE status = 'running'
                   AND (lock_expires_at IS NULL OR lock_expires_at <= ?1)
                 ORDER BY created_at, rowid"
            ))
            .context("Failed to prepare expired_worktree_locks")?;
        let rows = stmt
            .query_map(params![ts(now)], worktree_row)
            .context("Failed to query expired worktree locks")?;
        collect_worktrees(rows)
    }

    pub fn compare_and_swap_worktree(&self, worktree: &Worktree) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE worktrees SET
                    branch_name = ?1, path = ?2, status = ?3, locked_by_job_id = ?4,
                    lock_expires_at = ?5, run_count = ?6, cleanup_after = ?7,
                    last_error = ?8, updated_at = ?9, last_used_at = ?10,
                    version = version + 1
                 WHERE id = ?11 AND version = ?12",
                params![
                    worktree.branch_name,
                    worktree.path,
                    worktree.status.as_str(),
                    worktree.locked_by_job_id,
                    worktree.lock_expires_at.map(ts),
                    worktree.run_count,
                    worktree.cleanup_after.map(ts),
                    worktree.last_error,
                    ts(worktree.updated_at),
                    worktree.last_used_at.map(ts),
                    worktree.id,
                    worktree.version,
                ],
            )
            .context("Failed to compare-and-swap worktree")?;
        Ok(changed == 1)
    }

    /// Read-modify-write a worktree; see [`Self::modify_job`].
    pub fn modify_worktree<T>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        mut f: impl FnMut(&mut Worktree) -> Result<Mutation<T>>,
    ) -> Result<Option<T>> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut worktree) = self.get_worktree(id)? else {
                return Ok(None);
            };
            match f(&mut worktree)? {
                Mutation::Abort(value) => return Ok(Some(value)),
                Mutation::Commit(value) => {
                    worktree.updated_at = now;
                    if self.compare_and_swap_worktree(&worktree)? {
                        return Ok(Some(value));
                    }
                }
            }
        }
        anyhow::bail!("Worktree {} kept changing during compare-and-swap", id)
    }
}

// ── Timestamps ────────────────────────────────────────────────────────

/// Fixed-precision RFC 3339 so that string order is chronological order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", value))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

// ── Internal row helpers ──────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, name, path, default_branch, remote_repo, created_at";

struct ProjectRow {
    id: String,
    name: String,
    path: String,
    default_branch: String,
    remote_repo: Option<String>,
    created_at: String,
}

fn project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        default_branch: row.get(3)?,
        remote_repo: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        Ok(Project {
            id: self.id,
            name: self.name,
            path: self.path,
            default_branch: self.default_branch,
            remote_repo: self.remote_repo,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const CARD_COLUMNS: &str =
    "id, project_id, title, status, labels, remote_issue_number, created_at, updated_at";

struct CardRow {
    id: String,
    project_id: String,
    title: String,
    status: String,
    labels: String,
    remote_issue_number: Option<i64>,
    created_at: String,
    updated_at: String,
}

fn card_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CardRow> {
    Ok(CardRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        labels: row.get(4)?,
        remote_issue_number: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl CardRow {
    fn into_card(self) -> Result<Card> {
        let labels: Vec<String> =
            serde_json::from_str(&self.labels).context("Failed to parse card labels JSON")?;
        Ok(Card {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            status: parse_enum::<CardStatus>(&self.status, "card status")?,
            labels,
            remote_issue_number: self.remote_issue_number,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const JOB_COLUMNS: &str = "id, job_type, project_id, card_id, payload, state, priority, \
     attempt_count, lease_owner_id, lease_expires_at, not_before, last_failure_at, \
     approval_deadline, approved, cancel_requested, result, last_error, failure_reason, \
     created_at, updated_at, version";

/// Intermediate row struct for reading jobs before converting strings and
/// JSON columns into typed values.
struct JobRow {
    id: String,
    job_type: String,
    project_id: String,
    card_id: Option<String>,
    payload: String,
    state: String,
    priority: i32,
    attempt_count: u32,
    lease_owner_id: Option<String>,
    lease_expires_at: Option<String>,
    not_before: Option<String>,
    last_failure_at: Option<String>,
    approval_deadline: Option<String>,
    approved: bool,
    cancel_requested: bool,
    result: Option<String>,
    last_error: Option<String>,
    failure_reason: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        job_type: row.get(1)?,
        project_id: row.get(2)?,
        card_id: row.get(3)?,
        payload: row.get(4)?,
        state: row.get(5)?,
        priority: row.get(6)?,
        attempt_count: row.get(7)?,
        lease_owner_id: row.get(8)?,
        lease_expires_at: row.get(9)?,
        not_before: row.get(10)?,
        last_failure_at: row.get(11)?,
        approval_deadline: row.get(12)?,
        approved: row.get(13)?,
        cancel_requested: row.get(14)?,
        result: row.get(15)?,
        last_error: row.get(16)?,
        failure_reason: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
        version: row.get(20)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let payload: JobPayload =
            serde_json::from_str(&self.payload).context("Failed to parse job payload JSON")?;
        let result: Option<ResultEnvelope> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse job result JSON")?;
        let failure_reason = self
            .failure_reason
            .as_deref()
            .map(|r| parse_enum::<FailureReason>(r, "failure reason"))
            .transpose()?;
        Ok(Job {
            id: self.id,
            job_type: parse_enum::<JobType>(&self.job_type, "job type")?,
            project_id: self.project_id,
            card_id: self.card_id,
            payload,
            state: parse_enum::<JobState>(&self.state, "job state")?,
            priority: self.priority,
            attempt_count: self.attempt_count,
            lease_owner_id: self.lease_owner_id,
            lease_expires_at: parse_opt_ts(self.lease_expires_at)?,
            not_before: parse_opt_ts(self.not_before)?,
            last_failure_at: parse_opt_ts(self.last_failure_at)?,
            approval_deadline: parse_opt_ts(self.approval_deadline)?,
            approved: self.approved,
            cancel_requested: self.cancel_requested,
            result,
            last_error: self.last_error,
            failure_reason,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            version: self.version,
        })
    }
}

fn collect_jobs(
    rows: impl Iterator<Item = rusqlite::Result<JobRow>>,
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.context("Failed to read job row")?.into_job()?);
    }
    Ok(jobs)
}

const WORKTREE_COLUMNS: &str = "id, project_id, branch_name, path, status, locked_by_job_id, \
     lock_expires_at, run_count, cleanup_after, last_error, created_at, updated_at, \
     last_used_at, version";

struct WorktreeRow {
    id: String,
    project_id: String,
    branch_name: String,
    path: String,
    status: String,
    locked_by_job_id: Option<String>,
    lock_expires_at: Option<String>,
    run_count: u32,
    cleanup_after: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    last_used_at: Option<String>,
    version: i64,
}

fn worktree_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorktreeRow> {
    Ok(WorktreeRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        branch_name: row.get(2)?,
        path: row.get(3)?,
        status: row.get(4)?,
        locked_by_job_id: row.get(5)?,
        lock_expires_at: row.get(6)?,
        run_count: row.get(7)?,
        cleanup_after: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        last_used_at: row.get(12)?,
        version: row.get(13)?,
    })
}

impl WorktreeRow {
    fn into_worktree(self) -> Result<Worktree> {
        Ok(Worktree {
            id: self.id,
            project_id: self.project_id,
            branch_name: self.branch_name,
            path: self.path,
            status: parse_enum::<WorktreeStatus>(&self.status, "worktree status")?,
            locked_by_job_id: self.locked_by_job_id,
            lock_expires_at: parse_opt_ts(self.lock_expires_at)?,
            run_count: self.run_count,
            cleanup_after: parse_opt_ts(self.cleanup_after)?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_used_at: parse_opt_ts(self.last_used_at)?,
            version: self.version,
        })
    }
}

fn collect_worktrees(
    rows: impl Iterator<Item = rusqlite::Result<WorktreeRow>>,
) -> Result<Vec<Worktree>> {
    let mut worktrees = Vec::new();
    for row in rows {
        worktrees.push(row.context("Failed to read worktree row")?.into_worktree()?);
    }
    Ok(worktrees)
}

// ── Tests ─────────────────────────────────────────────────────────────
