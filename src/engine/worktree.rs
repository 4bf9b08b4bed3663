//! Worktree pool: isolated git working copies, one per running job.
//!
//! Slots are bounded per project by `max_concurrent_worktrees`. All state
//! lives in the `worktrees` table; git work happens through [`GitBackend`]
//! so the lifecycle can be tested without a repository.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flowpatch_common::worktree::{branch_name, slugify};
use flowpatch_common::{
    Clock, Job, JobPayload, JobState, Project, ReleaseOutcome, Worktree, WorktreeStatus,
};
use tokio::process::Command;
use uuid::Uuid;

use crate::config::WorktreeSection;
use crate::engine::db::{DbHandle, Mutation};
use crate::engine::events::{EngineEvent, EventBus};
use crate::errors::EngineError;

const SLUG_MAX_LEN: usize = 30;

// ── Git seam ─────────────────────────────────────────────────────────

#[async_trait]
pub trait GitBackend: Send + Sync {
    /// `git worktree add -b <branch> <path> <base>` inside `repo`.
    async fn create(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()>;

    /// Hard-reset the worktree onto `base` and drop untracked files.
    async fn reset_to_base(&self, path: &Path, base: &str) -> Result<()>;

    /// Throw away uncommitted changes, keeping the branch where it is.
    async fn discard_changes(&self, path: &Path) -> Result<()>;

    /// Check out a new `branch` started at `base` inside the worktree.
    async fn switch_branch(&self, path: &Path, branch: &str, base: &str) -> Result<()>;

    async fn remove(&self, repo: &Path, path: &Path) -> Result<()>;

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Whether the local branch tracks a remote branch (was ever pushed).
    async fn branch_has_upstream(&self, repo: &Path, branch: &str) -> Result<bool>;
}

/// [`GitBackend`] over the `git` executable, with branch inspection through
/// libgit2.
#[derive(Debug, Default, Clone)]
pub struct GitCli;

impl GitCli {
    async fn git(dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Worktree path contains invalid UTF-8: {}", path.display()))
}

#[async_trait]
impl GitBackend for GitCli {
    async fn create(&self, repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
        let parent = path
            .parent()
            .context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        Self::git(repo, &["worktree", "add", "-b", branch, path_str(path)?, base]).await?;
        Ok(())
    }

    async fn reset_to_base(&self, path: &Path, base: &str) -> Result<()> {
        Self::git(path, &["reset", "--hard", base]).await?;
        Self::git(path, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn discard_changes(&self, path: &Path) -> Result<()> {
        Self::git(path, &["reset", "--hard", "HEAD"]).await?;
        Self::git(path, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn switch_branch(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        Self::git(path, &["checkout", "-B", branch, base]).await?;
        Ok(())
    }

    async fn remove(&self, repo: &Path, path: &Path) -> Result<()> {
        if let Err(e) = Self::git(repo, &["worktree", "remove", "--force", path_str(path)?]).await {
            // Half-created worktrees are not registered with git
            if !path.exists() {
                Self::git(repo, &["worktree", "prune"]).await?;
                return Ok(());
            }
            tracing::debug!(path = %path.display(), error = %e, "git worktree remove failed, deleting directory");
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            Self::git(repo, &["worktree", "prune"]).await?;
        }
        Ok(())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        Self::git(repo, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn branch_has_upstream(&self, repo: &Path, branch: &str) -> Result<bool> {
        let repo = repo.to_path_buf();
        let branch = branch.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let repo = git2::Repository::open(&repo)
                .with_context(|| format!("Failed to open repository {}", repo.display()))?;
            let local = match repo.find_branch(&branch, git2::BranchType::Local) {
                Ok(b) => b,
                Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(false),
                Err(e) => return Err(e).context("Failed to look up branch"),
            };
            Ok(local.upstream().is_ok())
        })
        .await
        .context("Branch inspection task panicked")?
    }
}

// ── Pool ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WorktreePool {
    db: DbHandle,
    git: Arc<dyn GitBackend>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: Arc<RwLock<WorktreeSection>>,
}

impl WorktreePool {
    pub fn new(
        db: DbHandle,
        git: Arc<dyn GitBackend>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: WorktreeSection,
    ) -> Self {
        Self {
            db,
            git,
            clock,
            events,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn configure(&self, config: WorktreeSection) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn config(&self) -> WorktreeSection {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Find or create a worktree for `job`.
    ///
    /// Order: the worktree this job already holds (approval resume), an
    /// idle `ready` one, then a fresh one if the project has a free slot.
    /// `Ok(None)` means the project is at its ceiling. The returned worktree
    /// still has to be [`lock`](Self::lock)ed.
    pub async fn acquire(&self, project: &Project, job: &Job) -> Result<Option<Worktree>, EngineError> {
        let now = self.clock.now();
        let config = self.config();
        let job_id = job.id.clone();
        let project_id = project.id.clone();
        let existing = self
            .db
            .call(move |db| {
                if let Some(held) = db.worktree_locked_by(&job_id)? {
                    return Ok(Some(held));
                }
                db.idle_worktree(&project_id, now)
            })
            .await?;
        if existing.is_some() {
            return Ok(existing);
        }

        let draft = self.draft(project, job, &config, now).await?;
        let ceiling = config.max_concurrent_worktrees;
        let row = draft.clone();
        let allocated = self
            .db
            .call(move |db| db.allocate_worktree(&row, ceiling))
            .await?;
        if !allocated {
            tracing::debug!(project_id = %project.id, ceiling, "worktree ceiling reached");
            return Ok(None);
        }

        let base = base_branch(project, job);
        let created = self
            .git
            .create(
                Path::new(&project.path),
                Path::new(&draft.path),
                &draft.branch_name,
                &base,
            )
            .await;

        match created {
            Ok(()) => {
                let worktree = self
                    .set_status(&draft.id, |wt| {
                        wt.status = WorktreeStatus::Ready;
                    })
                    .await?;
                tracing::info!(worktree_id = %draft.id, branch = %draft.branch_name, path = %draft.path, "worktree created");
                Ok(Some(worktree))
            }
            Err(e) => {
                let message = format!("{:#}", e);
                let delay = Duration::minutes(config.cleanup_delay_minutes as i64);
                let msg = message.clone();
                self.set_status(&draft.id, move |wt| {
                    wt.status = WorktreeStatus::Error;
                    wt.last_error = Some(msg.clone());
                    wt.cleanup_after = Some(now + delay);
                })
                .await?;
                tracing::warn!(worktree_id = %draft.id, error = %message, "worktree creation failed");
                Err(EngineError::WorktreeCreationFailure {
                    worktree_id: draft.id,
                    message,
                })
            }
        }
    }

    async fn draft(
        &self,
        project: &Project,
        job: &Job,
        config: &WorktreeSection,
        now: DateTime<Utc>,
    ) -> Result<Worktree, EngineError> {
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("wt-{}", &simple[..8]);
        let branch = self.branch_for(project, job, config, &id).await?;
        let path: PathBuf = config.root_for(Path::new(&project.path)).join(&id);
        Ok(Worktree {
            id,
            project_id: project.id.clone(),
            branch_name: branch,
            path: path.to_string_lossy().into_owned(),
            status: WorktreeStatus::Creating,
            locked_by_job_id: None,
            lock_expires_at: None,
            run_count: 0,
            cleanup_after: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
            version: 0,
        })
    }

    /// Branch name for `job` in worktree `worktree_id`, slugged from the card
    /// title when there is one.
    async fn branch_for(
        &self,
        project: &Project,
        job: &Job,
        config: &WorktreeSection,
        worktree_id: &str,
    ) -> Result<String, EngineError> {
        let card_title = match job.card_id.clone() {
            Some(card_id) => self
                .db
                .call(move |db| db.get_card(&card_id))
                .await?
                .map(|card| card.title),
            None => None,
        };
        let title = card_title
            .or_else(|| match &job.payload {
                JobPayload::WorkerRun(p) => p.title.clone(),
                _ => None,
            })
            .unwrap_or_else(|| job.job_type.to_string());

        Ok(branch_name(
            &config.branch_pattern,
            &config.branch_prefix,
            worktree_id,
            &slugify(&title, SLUG_MAX_LEN),
            &project.name,
        ))
    }

    /// Give a reused worktree a branch named after `job`'s card.
    ///
    /// Call after [`lock`](Self::lock). The new branch starts at the job's
    /// base; the previous branch is deleted unless it was pushed. A git
    /// failure puts the worktree in `error` and frees it.
    pub async fn assign_branch(
        &self,
        worktree: &Worktree,
        project: &Project,
        job: &Job,
    ) -> Result<Worktree, EngineError> {
        let config = self.config();
        let branch = self.branch_for(project, job, &config, &worktree.id).await?;
        if branch == worktree.branch_name {
            return Ok(worktree.clone());
        }

        let repo = Path::new(&project.path);
        let base = base_branch(project, job);
        if let Err(e) = self
            .git
            .switch_branch(Path::new(&worktree.path), &branch, &base)
            .await
        {
            let message = format!("{:#}", e);
            let now = self.clock.now();
            let delay = Duration::minutes(config.cleanup_delay_minutes as i64);
            let holder = job.id.clone();
            let msg = message.clone();
            self.set_status(&worktree.id, move |wt| {
                if wt.locked_by_job_id.as_deref() == Some(holder.as_str()) {
                    wt.status = WorktreeStatus::Error;
                    wt.locked_by_job_id = None;
                    wt.lock_expires_at = None;
                    wt.last_error = Some(msg.clone());
                    wt.cleanup_after = Some(now + delay);
                }
            })
            .await?;
            tracing::warn!(worktree_id = %worktree.id, branch = %branch, error = %message, "branch switch failed");
            return Err(EngineError::WorktreeCreationFailure {
                worktree_id: worktree.id.clone(),
                message,
            });
        }

        let previous = worktree.branch_name.clone();
        match self.git.branch_has_upstream(repo, &previous).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.git.delete_branch(repo, &previous).await {
                    tracing::debug!(worktree_id = %worktree.id, branch = %previous, error = %e, "previous branch not deleted");
                }
            }
            Err(e) => tracing::debug!(worktree_id = %worktree.id, branch = %previous, error = %e, "previous branch not inspected"),
        }

        let renamed = branch.clone();
        let updated = self
            .set_status(&worktree.id, move |wt| {
                wt.branch_name = renamed.clone();
            })
            .await?;
        tracing::info!(worktree_id = %worktree.id, from = %previous, to = %branch, "worktree branch reassigned");
        Ok(updated)
    }

    async fn set_status(
        &self,
        worktree_id: &str,
        apply: impl Fn(&mut Worktree) + Send + 'static,
    ) -> Result<Worktree, EngineError> {
        let now = self.clock.now();
        let id = worktree_id.to_string();
        self.db
            .call(move |db| {
                db.modify_worktree(&id, now, |wt| {
                    apply(wt);
                    Ok(Mutation::Commit(()))
                })?;
                db.get_worktree(&id)
            })
            .await?
            .ok_or_else(|| EngineError::WorktreeNotFound {
                id: worktree_id.to_string(),
            })
    }

    /// `ready → running` for `job_id`. Also succeeds when the job already
    /// holds the lock (approval resume), refreshing its expiry.
    pub async fn lock(&self, worktree_id: &str, job_id: &str, ttl: Duration) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let id = worktree_id.to_string();
        let holder = job_id.to_string();
        let locked = self
            .db
            .call(move |db| {
                db.modify_worktree(&id, now, |wt| {
                    let resume = wt.status == WorktreeStatus::Running
                        && wt.locked_by_job_id.as_deref() == Some(holder.as_str());
                    if resume {
                        wt.lock_expires_at = Some(now + ttl);
                        return Ok(Mutation::Commit(true));
                    }
                    if wt.status != WorktreeStatus::Ready || wt.is_locked_at(now) {
                        return Ok(Mutation::Abort(false));
                    }
                    wt.status = WorktreeStatus::Running;
                    wt.locked_by_job_id = Some(holder.clone());
                    wt.lock_expires_at = Some(now + ttl);
                    wt.run_count += 1;
                    wt.last_used_at = Some(now);
                    wt.cleanup_after = None;
                    Ok(Mutation::Commit(true))
                })
            })
            .await?;
        let locked = locked.ok_or_else(|| EngineError::WorktreeNotFound {
            id: worktree_id.to_string(),
        })?;
        if locked {
            tracing::debug!(worktree_id = %worktree_id, job_id = %job_id, "worktree locked");
            self.events.emit(EngineEvent::WorktreeLocked {
                worktree_id: worktree_id.to_string(),
                job_id: job_id.to_string(),
            });
        }
        Ok(locked)
    }

    pub async fn renew_lock(&self, worktree_id: &str, job_id: &str, ttl: Duration) -> Result<bool, EngineError> {
        let until = self.clock.now() + ttl;
        self.extend_lock(worktree_id, job_id, until).await
    }

    /// Move the lock expiry to `until`; used to keep a pending-approval
    /// worktree reserved up to the approval deadline.
    pub async fn extend_lock(
        &self,
        worktree_id: &str,
        job_id: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let id = worktree_id.to_string();
        let holder = job_id.to_string();
        let extended = self
            .db
            .call(move |db| {
                db.modify_worktree(&id, now, |wt| {
                    if wt.status != WorktreeStatus::Running
                        || wt.locked_by_job_id.as_deref() != Some(holder.as_str())
                    {
                        return Ok(Mutation::Abort(false));
                    }
                    wt.lock_expires_at = Some(until);
                    Ok(Mutation::Commit(true))
                })
            })
            .await?;
        Ok(extended.unwrap_or(false))
    }

    /// Unlock after a job finished with the worktree.
    ///
    /// Returns the resulting status. A worktree no longer locked by `job_id`
    /// is left alone.
    pub async fn release(
        &self,
        worktree_id: &str,
        job_id: &str,
        outcome: ReleaseOutcome,
    ) -> Result<WorktreeStatus, EngineError> {
        let id = worktree_id.to_string();
        let (worktree, project) = self
            .db
            .call(move |db| {
                let Some(wt) = db.get_worktree(&id)? else {
                    return Ok(None);
                };
                let project = db.get_project(&wt.project_id)?;
                Ok(Some((wt, project)))
            })
            .await?
            .ok_or_else(|| EngineError::WorktreeNotFound {
                id: worktree_id.to_string(),
            })?;

        if worktree.locked_by_job_id.as_deref() != Some(job_id) {
            tracing::warn!(worktree_id = %worktree_id, job_id = %job_id, holder = ?worktree.locked_by_job_id, "release by non-holder ignored");
            return Ok(worktree.status);
        }
        let project = project.ok_or_else(|| EngineError::ProjectNotFound {
            id: worktree.project_id.clone(),
        })?;

        let path = Path::new(&worktree.path);
        let git_result = match outcome {
            ReleaseOutcome::Completed => self.git.reset_to_base(path, &project.default_branch).await,
            ReleaseOutcome::Canceled { rollback: true } => self.git.discard_changes(path).await,
            ReleaseOutcome::Canceled { rollback: false } => Ok(()),
        };

        let config = self.config();
        let now = self.clock.now();
        let next = match &git_result {
            Err(_) => WorktreeStatus::Error,
            Ok(()) if config.recycle_after_runs > 0 && worktree.run_count >= config.recycle_after_runs => {
                WorktreeStatus::CleanupPending
            }
            Ok(()) => WorktreeStatus::Ready,
        };
        let error = git_result.err().map(|e| format!("{:#}", e));
        let cleanup_after = match next {
            WorktreeStatus::CleanupPending => now,
            _ => now + Duration::minutes(config.cleanup_delay_minutes as i64),
        };

        let id = worktree_id.to_string();
        let holder = job_id.to_string();
        let err = error.clone();
        let released = self
            .db
            .call(move |db| {
                db.modify_worktree(&id, now, |wt| {
                    if wt.locked_by_job_id.as_deref() != Some(holder.as_str()) {
                        return Ok(Mutation::Abort(false));
                    }
                    wt.status = next;
                    wt.locked_by_job_id = None;
                    wt.lock_expires_at = None;
                    wt.last_used_at = Some(now);
                    wt.cleanup_after = Some(cleanup_after);
                    wt.last_error = err.clone();
                    Ok(Mutation::Commit(true))
                })
            })
            .await?;

        if released == Some(true) {
            match &error {
                Some(e) => tracing::warn!(worktree_id = %worktree_id, job_id = %job_id, error = %e, "worktree release failed"),
                None => tracing::info!(worktree_id = %worktree_id, job_id = %job_id, status = %next, "worktree released"),
            }
            self.events.emit(EngineEvent::WorktreeReleased {
                worktree_id: worktree_id.to_string(),
                status: next.to_string(),
            });
        }
        Ok(next)
    }

    /// Mark an idle worktree for removal `delay_minutes` from now.
    pub async fn schedule_cleanup(&self, worktree_id: &str, delay_minutes: u32) -> Result<(), EngineError> {
        let now = self.clock.now();
        let id = worktree_id.to_string();
        let found = self
            .db
            .call(move |db| {
                db.modify_worktree(&id, now, |wt| {
                    if !matches!(wt.status, WorktreeStatus::Ready | WorktreeStatus::Error) {
                        return Ok(Mutation::Abort(()));
                    }
                    wt.cleanup_after = Some(now + Duration::minutes(delay_minutes as i64));
                    Ok(Mutation::Commit(()))
                })
            })
            .await?;
        found.ok_or_else(|| EngineError::WorktreeNotFound {
            id: worktree_id.to_string(),
        })
    }

    /// `ready|error → cleanup_pending` for unlocked worktrees whose cleanup
    /// time has come. Returns the promoted ids.
    pub async fn promote_idle(&self) -> Result<Vec<String>, EngineError> {
        let now = self.clock.now();
        let promoted = self
            .db
            .call(move |db| {
                let mut candidates = db.worktrees_with_status(WorktreeStatus::Ready)?;
                candidates.extend(db.worktrees_with_status(WorktreeStatus::Error)?);
                let mut promoted = Vec::new();
                for candidate in candidates {
                    let moved = db.modify_worktree(&candidate.id, now, |wt| {
                        let due = wt.cleanup_after.is_some_and(|at| at <= now);
                        let idle = matches!(wt.status, WorktreeStatus::Ready | WorktreeStatus::Error);
                        if !due || !idle || wt.is_locked_at(now) {
                            return Ok(Mutation::Abort(false));
                        }
                        wt.status = WorktreeStatus::CleanupPending;
                        wt.locked_by_job_id = None;
                        wt.lock_expires_at = None;
                        Ok(Mutation::Commit(true))
                    })?;
                    if moved == Some(true) {
                        promoted.push(candidate.id);
                    }
                }
                Ok(promoted)
            })
            .await?;
        for id in &promoted {
            tracing::debug!(worktree_id = %id, "worktree idle, cleanup pending");
        }
        Ok(promoted)
    }

    /// Remove every `cleanup_pending` worktree from disk. Branches that were
    /// never pushed are deleted with it. Returns the cleaned ids.
    pub async fn sweep_cleanup(&self) -> Result<Vec<String>, EngineError> {
        let pending = self
            .db
            .call(|db| {
                let mut pending = Vec::new();
                for wt in db.worktrees_with_status(WorktreeStatus::CleanupPending)? {
                    if let Some(project) = db.get_project(&wt.project_id)? {
                        pending.push((wt, project));
                    }
                }
                Ok(pending)
            })
            .await?;

        let mut cleaned = Vec::new();
        for (wt, project) in pending {
            let repo = Path::new(&project.path);
            let result = self.remove_from_disk(repo, &wt).await;
            let now = self.clock.now();
            let id = wt.id.clone();
            let error = result.as_ref().err().map(|e| format!("{:#}", e));
            let err = error.clone();
            let delay = Duration::minutes(self.config().cleanup_delay_minutes as i64);
            self.db
                .call(move |db| {
                    db.modify_worktree(&id, now, |row| {
                        if row.status != WorktreeStatus::CleanupPending {
                            return Ok(Mutation::Abort(()));
                        }
                        match &err {
                            None => row.status = WorktreeStatus::Cleaned,
                            Some(e) => {
                                row.status = WorktreeStatus::Error;
                                row.last_error = Some(e.clone());
                                row.cleanup_after = Some(now + delay);
                            }
                        }
                        Ok(Mutation::Commit(()))
                    })
                })
                .await?;
            match error {
                None => {
                    tracing::info!(worktree_id = %wt.id, "worktree cleaned");
                    self.events.emit(EngineEvent::WorktreeCleaned {
                        worktree_id: wt.id.clone(),
                    });
                    cleaned.push(wt.id);
                }
                Some(e) => tracing::warn!(worktree_id = %wt.id, error = %e, "worktree cleanup failed"),
            }
        }
        Ok(cleaned)
    }

    async fn remove_from_disk(&self, repo: &Path, wt: &Worktree) -> Result<()> {
        self.git.remove(repo, Path::new(&wt.path)).await?;
        if !self.git.branch_has_upstream(repo, &wt.branch_name).await? {
            if let Err(e) = self.git.delete_branch(repo, &wt.branch_name).await {
                // Branch may never have been created
                tracing::debug!(worktree_id = %wt.id, branch = %wt.branch_name, error = %e, "branch not deleted");
            }
        }
        Ok(())
    }

    /// Force-release running worktrees whose lock expired while their job
    /// holds no valid lease. Uncommitted changes are discarded.
    pub async fn reclaim_stale_locks(&self) -> Result<Vec<String>, EngineError> {
        let now = self.clock.now();
        let stale = self
            .db
            .call(move |db| {
                let mut stale = Vec::new();
                for wt in db.expired_worktree_locks(now)? {
                    let Some(job_id) = wt.locked_by_job_id.clone() else {
                        stale.push((wt, None));
                        continue;
                    };
                    // An approved job keeps its worktree until it is claimed again
                    let alive = db.get_job(&job_id)?.is_some_and(|job| {
                        job.has_valid_lease(now)
                            || (job.state == JobState::PendingApproval && job.approved)
                    });
                    if !alive {
                        stale.push((wt, Some(job_id)));
                    }
                }
                Ok(stale)
            })
            .await?;

        let mut reclaimed = Vec::new();
        for (wt, job_id) in stale {
            match job_id {
                Some(job_id) => {
                    tracing::warn!(worktree_id = %wt.id, job_id = %job_id, "reclaiming stale worktree lock");
                    self.release(&wt.id, &job_id, ReleaseOutcome::Canceled { rollback: true })
                        .await?;
                }
                None => {
                    // Running without a holder: nothing to roll back
                    self.set_status(&wt.id, |row| {
                        row.status = WorktreeStatus::Ready;
                        row.lock_expires_at = None;
                    })
                    .await?;
                }
            }
            reclaimed.push(wt.id);
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, worktree_id: &str) -> Result<Worktree, EngineError> {
        let id = worktree_id.to_string();
        self.db
            .call(move |db| db.get_worktree(&id))
            .await?
            .ok_or_else(|| EngineError::WorktreeNotFound {
                id: worktree_id.to_string(),
            })
    }

    pub async fn list(&self, project_id: Option<String>) -> Result<Vec<Worktree>, EngineError> {
        Ok(self
            .db
            .call(move |db| db.list_worktrees(project_id.as_deref()))
            .await?)
    }
}

fn base_branch(project: &Project, job: &Job) -> String {
    match &job.payload {
        JobPayload::WorkerRun(p) => p
            .base_branch
            .clone()
            .unwrap_or_else(|| project.default_branch.clone()),
        _ => project.default_branch.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::db::EngineDb;
    use crate::engine::db::tests::{new_job, seed_project, t0};
    use flowpatch_common::ManualClock;
    use flowpatch_common::job::WorkerRunPayload;
    use std::sync::Mutex;

    /// Records git calls; `create`, `reset_to_base` and `switch_branch` fail
    /// while their flag is set.
    #[derive(Default)]
    pub(crate) struct FakeGit {
        pub calls: Mutex<Vec<String>>,
        pub fail_create: std::sync::atomic::AtomicBool,
        pub fail_reset: std::sync::atomic::AtomicBool,
        pub fail_switch: std::sync::atomic::AtomicBool,
        pub pushed: Mutex<Vec<String>>,
    }

    impl FakeGit {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl GitBackend for FakeGit {
        async fn create(&self, _repo: &Path, _path: &Path, branch: &str, base: &str) -> Result<()> {
            self.record(format!("create {} {}", branch, base));
            if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("fatal: invalid reference: {}", base);
            }
            Ok(())
        }

        async fn reset_to_base(&self, _path: &Path, base: &str) -> Result<()> {
            self.record(format!("reset {}", base));
            if self.fail_reset.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("fatal: could not reset index file");
            }
            Ok(())
        }

        async fn switch_branch(&self, _path: &Path, branch: &str, base: &str) -> Result<()> {
            self.record(format!("switch {} {}", branch, base));
            if self.fail_switch.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("fatal: a branch named '{}' already exists", branch);
            }
            Ok(())
        }

        async fn discard_changes(&self, _path: &Path) -> Result<()> {
            self.record("discard".to_string());
            Ok(())
        }

        async fn remove(&self, _repo: &Path, path: &Path) -> Result<()> {
            self.record(format!("remove {}", path.display()));
            Ok(())
        }

        async fn delete_branch(&self, _repo: &Path, branch: &str) -> Result<()> {
            self.record(format!("delete-branch {}", branch));
            Ok(())
        }

        async fn branch_has_upstream(&self, _repo: &Path, branch: &str) -> Result<bool> {
            Ok(self.pushed.lock().unwrap().iter().any(|b| b == branch))
        }
    }

    struct Fixture {
        db: DbHandle,
        clock: Arc<ManualClock>,
        git: Arc<FakeGit>,
        pool: WorktreePool,
        project: Project,
    }

    fn fixture(config: WorktreeSection) -> Fixture {
        let db = EngineDb::new_in_memory().unwrap();
        let project = seed_project(&db, "web").unwrap();
        let db = DbHandle::new(db);
        let clock = Arc::new(ManualClock::new(t0()));
        let git = Arc::new(FakeGit::default());
        let pool = WorktreePool::new(
            db.clone(),
            git.clone(),
            clock.clone(),
            EventBus::default(),
            config,
        );
        Fixture {
            db,
            clock,
            git,
            pool,
            project,
        }
    }

    fn worker_job(id: &str) -> Job {
        new_job(
            id,
            "web",
            JobPayload::WorkerRun(WorkerRunPayload {
                title: Some("Fix Login Redirect".into()),
                ..Default::default()
            }),
        )
    }

    fn lock_ttl() -> Duration {
        Duration::minutes(10)
    }

    #[tokio::test]
    async fn test_acquire_creates_worktree_with_branch_pattern() {
        let f = fixture(WorktreeSection::default());
        let job = worker_job("job-1");
        let wt = f.pool.acquire(&f.project, &job).await.unwrap().unwrap();

        assert_eq!(wt.status, WorktreeStatus::Ready);
        assert!(wt.id.starts_with("wt-"));
        assert_eq!(wt.branch_name, format!("flowpatch/{}-fix-login-redirect", wt.id));
        assert_eq!(wt.path, format!("/tmp/web/.worktrees/{}", wt.id));
        assert_eq!(f.git.calls(), vec![format!("create {} main", wt.branch_name)]);
    }

    #[tokio::test]
    async fn test_ceiling_blocks_second_worktree() {
        let f = fixture(WorktreeSection::default());
        let first = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        assert!(f.pool.lock(&first.id, "job-1", lock_ttl()).await.unwrap());

        let second = f.pool.acquire(&f.project, &worker_job("job-2")).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_ceiling() {
        let f = fixture(WorktreeSection {
            max_concurrent_worktrees: 2,
            ..Default::default()
        });
        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = f.pool.clone();
            let project = f.project.clone();
            handles.push(tokio::spawn(async move {
                let job = worker_job(&format!("job-{}", i));
                let wt = pool.acquire(&project, &job).await.unwrap();
                if let Some(wt) = &wt {
                    pool.lock(&wt.id, &job.id, Duration::minutes(10)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let db = f.db.lock_sync().unwrap();
        assert_eq!(db.count_active_worktrees("web").unwrap(), 2);
        let created = f.git.calls().iter().filter(|c| c.starts_with("create")).count();
        assert_eq!(created, 2);
    }

    #[tokio::test]
    async fn test_release_completed_resets_and_allows_reuse() {
        let f = fixture(WorktreeSection::default());
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap();

        let status = f.pool.release(&wt.id, "job-1", ReleaseOutcome::Completed).await.unwrap();
        assert_eq!(status, WorktreeStatus::Ready);
        assert!(f.git.calls().contains(&"reset main".to_string()));

        let reused = f.pool.acquire(&f.project, &worker_job("job-2")).await.unwrap().unwrap();
        assert_eq!(reused.id, wt.id);
        assert!(f.pool.lock(&reused.id, "job-2", lock_ttl()).await.unwrap());
        assert_eq!(f.pool.get(&wt.id).await.unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn test_rollback_on_cancel_and_recycle_are_independent() {
        // Recycling off, no rollback: working copy preserved, back to ready
        let f = fixture(WorktreeSection::default());
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap();
        let status = f
            .pool
            .release(&wt.id, "job-1", ReleaseOutcome::Canceled { rollback: false })
            .await
            .unwrap();
        assert_eq!(status, WorktreeStatus::Ready);
        assert!(!f.git.calls().iter().any(|c| c == "discard"));

        // Recycling after one run, with rollback: discarded, then retired
        let f = fixture(WorktreeSection {
            recycle_after_runs: 1,
            ..Default::default()
        });
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap();
        let status = f
            .pool
            .release(&wt.id, "job-1", ReleaseOutcome::Canceled { rollback: true })
            .await
            .unwrap();
        assert_eq!(status, WorktreeStatus::CleanupPending);
        assert!(f.git.calls().iter().any(|c| c == "discard"));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_ignored() {
        let f = fixture(WorktreeSection::default());
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap();
        let status = f.pool.release(&wt.id, "job-9", ReleaseOutcome::Completed).await.unwrap();
        assert_eq!(status, WorktreeStatus::Running);
        assert!(!f.pool.lock(&wt.id, "job-2", lock_ttl()).await.unwrap());
    }

    #[tokio::test]
    async fn test_creation_failure_frees_slot() {
        let f = fixture(WorktreeSection::default());
        f.git.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap_err();
        let EngineError::WorktreeCreationFailure { worktree_id, .. } = err else {
            panic!("expected creation failure, got {err:?}");
        };
        let wt = f.pool.get(&worktree_id).await.unwrap();
        assert_eq!(wt.status, WorktreeStatus::Error);
        assert!(wt.last_error.unwrap().contains("invalid reference"));

        f.git.fail_create.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idle_worktrees_promoted_then_swept() {
        let f = fixture(WorktreeSection::default());
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap();
        f.pool.release(&wt.id, "job-1", ReleaseOutcome::Completed).await.unwrap();

        f.clock.advance(Duration::minutes(29));
        assert!(f.pool.promote_idle().await.unwrap().is_empty());
        f.clock.advance(Duration::minutes(1));
        assert_eq!(f.pool.promote_idle().await.unwrap(), vec![wt.id.clone()]);

        assert_eq!(f.pool.sweep_cleanup().await.unwrap(), vec![wt.id.clone()]);
        assert_eq!(f.pool.get(&wt.id).await.unwrap().status, WorktreeStatus::Cleaned);
        let calls = f.git.calls();
        assert!(calls.contains(&format!("remove {}", wt.path)));
        assert!(calls.contains(&format!("delete-branch {}", wt.branch_name)));
    }

    #[tokio::test]
    async fn test_sweep_keeps_pushed_branches() {
        let f = fixture(WorktreeSection::default());
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.git.pushed.lock().unwrap().push(wt.branch_name.clone());
        f.pool.schedule_cleanup(&wt.id, 0).await.unwrap();
        f.pool.promote_idle().await.unwrap();
        f.pool.sweep_cleanup().await.unwrap();
        assert!(!f.git.calls().iter().any(|c| c.starts_with("delete-branch")));
    }

    fn titled_job(id: &str, title: &str) -> Job {
        new_job(
            id,
            "web",
            JobPayload::WorkerRun(WorkerRunPayload {
                title: Some(title.into()),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_reused_worktree_switches_to_branch_for_new_job() {
        let f = fixture(WorktreeSection::default());
        let first = worker_job("job-1");
        let wt = f.pool.acquire(&f.project, &first).await.unwrap().unwrap();
        assert!(f.pool.lock(&wt.id, &first.id, lock_ttl()).await.unwrap());
        let same = f.pool.assign_branch(&wt, &f.project, &first).await.unwrap();
        assert_eq!(same.branch_name, wt.branch_name);
        f.pool
            .release(&wt.id, &first.id, ReleaseOutcome::Completed)
            .await
            .unwrap();

        let second = titled_job("job-2", "Add Search");
        let reused = f.pool.acquire(&f.project, &second).await.unwrap().unwrap();
        assert_eq!(reused.id, wt.id);
        assert!(f.pool.lock(&reused.id, &second.id, lock_ttl()).await.unwrap());
        let renamed = f.pool.assign_branch(&reused, &f.project, &second).await.unwrap();

        assert_eq!(renamed.branch_name, format!("flowpatch/{}-add-search", wt.id));
        assert_eq!(renamed.locked_by_job_id.as_deref(), Some("job-2"));
        assert_eq!(f.pool.get(&wt.id).await.unwrap().branch_name, renamed.branch_name);
        let calls = f.git.calls();
        assert!(calls.contains(&format!("switch {} main", renamed.branch_name)));
        assert!(calls.contains(&format!("delete-branch {}", wt.branch_name)));
    }

    #[tokio::test]
    async fn test_branch_switch_failure_frees_worktree_in_error() {
        let f = fixture(WorktreeSection::default());
        let first = worker_job("job-1");
        let wt = f.pool.acquire(&f.project, &first).await.unwrap().unwrap();
        f.pool.lock(&wt.id, &first.id, lock_ttl()).await.unwrap();
        f.pool
            .release(&wt.id, &first.id, ReleaseOutcome::Completed)
            .await
            .unwrap();

        f.git.fail_switch.store(true, std::sync::atomic::Ordering::SeqCst);
        let second = titled_job("job-2", "Add Search");
        let reused = f.pool.acquire(&f.project, &second).await.unwrap().unwrap();
        f.pool.lock(&reused.id, &second.id, lock_ttl()).await.unwrap();
        let err = f
            .pool
            .assign_branch(&reused, &f.project, &second)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorktreeCreationFailure { .. }));

        let wt = f.pool.get(&wt.id).await.unwrap();
        assert_eq!(wt.status, WorktreeStatus::Error);
        assert!(wt.locked_by_job_id.is_none());
        assert!(wt.last_error.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_stale_lock_reclaimed_when_job_lease_gone() {
        let f = fixture(WorktreeSection::default());
        let job = worker_job("job-1");
        f.db.lock_sync().unwrap().insert_job(&job).unwrap();
        let wt = f.pool.acquire(&f.project, &job).await.unwrap().unwrap();
        f.pool.lock(&wt.id, &job.id, lock_ttl()).await.unwrap();

        f.clock.advance(Duration::minutes(5));
        assert!(f.pool.reclaim_stale_locks().await.unwrap().is_empty());
        f.clock.advance(Duration::minutes(5));
        assert_eq!(f.pool.reclaim_stale_locks().await.unwrap(), vec![wt.id.clone()]);

        let wt = f.pool.get(&wt.id).await.unwrap();
        assert_eq!(wt.status, WorktreeStatus::Ready);
        assert!(wt.locked_by_job_id.is_none());
        assert!(f.git.calls().iter().any(|c| c == "discard"));
    }

    #[tokio::test]
    async fn test_lock_resume_by_same_job_refreshes_expiry() {
        let f = fixture(WorktreeSection::default());
        let wt = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap();
        f.clock.advance(Duration::minutes(3));

        let again = f.pool.acquire(&f.project, &worker_job("job-1")).await.unwrap().unwrap();
        assert_eq!(again.id, wt.id);
        assert!(f.pool.lock(&wt.id, "job-1", lock_ttl()).await.unwrap());
        let wt = f.pool.get(&wt.id).await.unwrap();
        assert_eq!(wt.lock_expires_at, Some(t0() + Duration::minutes(13)));
        assert_eq!(wt.run_count, 1);
    }
}
