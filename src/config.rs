//! Configuration for the scheduling engine.
//!
//! Settings are read from `.flowpatch/flowpatch.toml`. Every key is optional.
//! Layering is file → environment → CLI:
//!
//! ```toml
//! [worker_pool]
//! max_workers = 2
//! queue_strategy = "priority"
//! priority_field = "priority"
//!
//! [worktree]
//! branch_prefix = "flowpatch/"
//! branch_pattern = "{prefix}{id}-{slug}"
//! max_concurrent_worktrees = 1
//! cleanup_delay_minutes = 30
//! recycle_after_runs = 0
//! rollback_on_cancel = true
//!
//! [lease]
//! job_lease_seconds = 300
//! worktree_lock_minutes = 10
//!
//! [retry]
//! cooldown_minutes = 30
//! max_attempts = { worker_run = 3, repair = 2 }
//!
//! [dispatcher]
//! tick_interval_ms = 2000
//! max_execution_minutes = 25
//! log_buffer_lines = 1000
//!
//! [executor]
//! command = "claude"
//! args = ["--print"]
//!
//! [labels]
//! create_missing = false
//! worker_success_status = "in_review"
//! color = "ededed"
//! status_labels = { in_progress = "status::in-progress" }
//! ```
//!
//! Environment overrides: `FLOWPATCH_MAX_WORKERS`, `FLOWPATCH_EXECUTOR_CMD`,
//! `FLOWPATCH_QUEUE_STRATEGY`.

use anyhow::{Context, Result};
use flowpatch_common::retry::DEFAULT_RETRY_COOLDOWN_MINUTES;
use flowpatch_common::worktree::{DEFAULT_BRANCH_PATTERN, DEFAULT_BRANCH_PREFIX};
use flowpatch_common::{CardStatus, JobType, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const CONFIG_DIR: &str = ".flowpatch";
pub const CONFIG_FILE: &str = "flowpatch.toml";

/// How the queue orders claimable jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    /// Oldest first.
    Fifo,
    /// Smallest priority first, then oldest.
    #[default]
    Priority,
}

impl std::fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStrategy::Fifo => write!(f, "fifo"),
            QueueStrategy::Priority => write!(f, "priority"),
        }
    }
}

impl std::str::FromStr for QueueStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fifo" => Ok(QueueStrategy::Fifo),
            "priority" => Ok(QueueStrategy::Priority),
            _ => anyhow::bail!(
                "Invalid queue strategy '{}'. Valid values: fifo, priority",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolSection {
    /// Concurrency ceiling across all projects
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub queue_strategy: QueueStrategy,
    /// Label field consulted for default job priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_field: Option<String>,
}

fn default_max_workers() -> usize {
    2
}

impl Default for WorkerPoolSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_strategy: QueueStrategy::default(),
            priority_field: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeSection {
    /// Directory holding worktrees. Defaults to `<project>/.worktrees`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Placeholders: `{prefix}`, `{id}`, `{slug}`, `{project}`
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    /// Per-project ceiling on creating/ready/running worktrees
    #[serde(default = "default_max_concurrent_worktrees")]
    pub max_concurrent_worktrees: u32,
    #[serde(default = "default_cleanup_delay_minutes")]
    pub cleanup_delay_minutes: u32,
    /// Recycle a worktree after this many runs. 0 disables recycling.
    #[serde(default)]
    pub recycle_after_runs: u32,
    #[serde(default = "default_true")]
    pub rollback_on_cancel: bool,
}

fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}

fn default_branch_pattern() -> String {
    DEFAULT_BRANCH_PATTERN.to_string()
}

fn default_max_concurrent_worktrees() -> u32 {
    1
}

fn default_cleanup_delay_minutes() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for WorktreeSection {
    fn default() -> Self {
        Self {
            root: None,
            branch_prefix: default_branch_prefix(),
            branch_pattern: default_branch_pattern(),
            max_concurrent_worktrees: default_max_concurrent_worktrees(),
            cleanup_delay_minutes: default_cleanup_delay_minutes(),
            recycle_after_runs: 0,
            rollback_on_cancel: true,
        }
    }
}

impl WorktreeSection {
    pub fn root_for(&self, project_path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_path.join(root),
            None => project_path.join(".worktrees"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_job_lease_seconds")]
    pub job_lease_seconds: u64,
    /// Ceiling on how long a pending approval keeps its worktree locked
    #[serde(default = "default_worktree_lock_minutes")]
    pub worktree_lock_minutes: u32,
}

fn default_job_lease_seconds() -> u64 {
    300
}

fn default_worktree_lock_minutes() -> u32 {
    10
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            job_lease_seconds: default_job_lease_seconds(),
            worktree_lock_minutes: default_worktree_lock_minutes(),
        }
    }
}

impl LeaseSection {
    pub fn job_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_lease_seconds as i64)
    }

    pub fn worktree_lock(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.worktree_lock_minutes as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
    /// Per job type overrides, keyed by job type name
    #[serde(default)]
    pub max_attempts: BTreeMap<String, u32>,
}

fn default_cooldown_minutes() -> u32 {
    DEFAULT_RETRY_COOLDOWN_MINUTES
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            cooldown_minutes: default_cooldown_minutes(),
            max_attempts: BTreeMap::new(),
        }
    }
}

impl RetrySection {
    /// Build the retry policy. Unknown job type keys are ignored here and
    /// reported by `validate`.
    pub fn to_policy(&self) -> RetryPolicy {
        self.max_attempts.iter().fold(
            RetryPolicy::new(self.cooldown_minutes),
            |policy, (name, max)| match name.parse::<JobType>() {
                Ok(job_type) => policy.with_max_attempts(job_type, *max),
                Err(_) => policy,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_execution_minutes")]
    pub max_execution_minutes: u64,
    /// Per-job cap on buffered log lines; the oldest line is dropped first
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
}

fn default_tick_interval_ms() -> u64 {
    2000
}

fn default_max_execution_minutes() -> u64 {
    25
}

fn default_log_buffer_lines() -> usize {
    1000
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_execution_minutes: default_max_execution_minutes(),
            log_buffer_lines: default_log_buffer_lines(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_executor_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_executor_command() -> String {
    "claude".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelsSection {
    /// Create status labels missing on the remote instead of reporting them
    #[serde(default)]
    pub create_missing: bool,
    #[serde(default = "default_worker_success_status")]
    pub worker_success_status: CardStatus,
    /// Color for created labels, hex without `#`
    #[serde(default = "default_label_color")]
    pub color: String,
    /// Card status name → remote label name
    #[serde(default = "default_status_labels")]
    pub status_labels: BTreeMap<String, String>,
}

fn default_worker_success_status() -> CardStatus {
    CardStatus::InReview
}

fn default_status_labels() -> BTreeMap<String, String> {
    CardStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), default_status_label(*s)))
        .collect()
}

fn default_status_label(status: CardStatus) -> String {
    format!("status::{}", status.as_str().replace('_', "-"))
}

fn default_label_color() -> String {
    "ededed".to_string()
}

impl Default for LabelsSection {
    fn default() -> Self {
        Self {
            create_missing: false,
            worker_success_status: default_worker_success_status(),
            status_labels: default_status_labels(),
            color: default_label_color(),
        }
    }
}

impl LabelsSection {
    /// Remote label for `status`, falling back to `status::<name>`.
    pub fn label_for(&self, status: CardStatus) -> String {
        self.status_labels
            .get(status.as_str())
            .cloned()
            .unwrap_or_else(|| default_status_label(status))
    }

    /// Every configured status label, one per card status.
    pub fn all_status_labels(&self) -> Vec<String> {
        CardStatus::ALL.iter().map(|s| self.label_for(*s)).collect()
    }
}

/// The complete flowpatch.toml configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlowpatchToml {
    #[serde(default)]
    pub worker_pool: WorkerPoolSection,
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub labels: LabelsSection,
}

impl FlowpatchToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flowpatch.toml")
    }

    /// Load from `<config_dir>/flowpatch.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize flowpatch.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("FLOWPATCH_MAX_WORKERS").and_then(|v| v.trim().parse().ok()) {
            self.worker_pool.max_workers = n;
        }
        if let Some(cmd) = lookup("FLOWPATCH_EXECUTOR_CMD").filter(|v| !v.trim().is_empty()) {
            self.executor.command = cmd;
        }
        if let Some(strategy) =
            lookup("FLOWPATCH_QUEUE_STRATEGY").and_then(|v| v.parse::<QueueStrategy>().ok())
        {
            self.worker_pool.queue_strategy = strategy;
        }
    }

    pub fn apply_process_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    pub fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(n) = overrides.max_workers {
            self.worker_pool.max_workers = n;
        }
        if let Some(ref cmd) = overrides.executor_cmd {
            self.executor.command = cmd.clone();
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.worker_pool.max_workers == 0 {
            warnings.push("worker_pool.max_workers is 0: no job will ever run".to_string());
        }
        if self.worktree.max_concurrent_worktrees == 0 {
            warnings.push(
                "worktree.max_concurrent_worktrees is 0: worker_run jobs will never run"
                    .to_string(),
            );
        }
        if !self.worktree.branch_pattern.contains("{id}") {
            warnings.push(format!(
                "worktree.branch_pattern '{}' has no {{id}} placeholder: branch names may collide",
                self.worktree.branch_pattern
            ));
        }
        if self.lease.job_lease_seconds < 10 {
            warnings.push(format!(
                "lease.job_lease_seconds = {} is too short to renew reliably",
                self.lease.job_lease_seconds
            ));
        }
        if self.dispatcher.tick_interval_ms == 0 {
            warnings.push("dispatcher.tick_interval_ms is 0".to_string());
        }
        if self.dispatcher.log_buffer_lines == 0 {
            warnings.push("dispatcher.log_buffer_lines is 0: all log lines are dropped".to_string());
        }
        if self.dispatcher.max_execution_minutes * 60 < self.lease.job_lease_seconds {
            warnings.push(
                "dispatcher.max_execution_minutes is shorter than the job lease".to_string(),
            );
        }
        if self.executor.command.trim().is_empty() {
            warnings.push("executor.command is empty".to_string());
        }
        for (name, max) in &self.retry.max_attempts {
            if name.parse::<JobType>().is_err() {
                warnings.push(format!("retry.max_attempts: unknown job type '{}'", name));
            } else if *max == 0 {
                warnings.push(format!(
                    "retry.max_attempts.{} is 0: treated as a single attempt",
                    name
                ));
            }
        }
        for (status, label) in &self.labels.status_labels {
            if status.parse::<CardStatus>().is_err() {
                warnings.push(format!("labels.status_labels: unknown card status '{}'", status));
            }
            if label.trim().is_empty() {
                warnings.push(format!("labels.status_labels.{} is empty", status));
            }
        }

        warnings
    }
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub max_workers: Option<usize>,
    pub executor_cmd: Option<String>,
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct FlowpatchConfig {
    pub project_dir: PathBuf,
    /// Path to the .flowpatch directory
    pub config_dir: PathBuf,
    pub toml: FlowpatchToml,
    pub overrides: CliOverrides,
}

impl FlowpatchConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_cli_args(project_dir, CliOverrides::default())
    }

    /// Load file → environment → CLI.
    pub fn with_cli_args(project_dir: PathBuf, overrides: CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = load_layered(&config_dir, &overrides)?;
        Ok(Self {
            project_dir,
            config_dir,
            toml,
            overrides,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn db_file(&self) -> PathBuf {
        self.config_dir.join("flowpatch.db")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn watcher(&self) -> ConfigWatcher {
        ConfigWatcher::new(self.config_file(), self.toml.clone(), self.overrides.clone())
    }
}

fn load_layered(config_dir: &Path, overrides: &CliOverrides) -> Result<FlowpatchToml> {
    let mut toml = FlowpatchToml::load_or_default(config_dir)?;
    toml.apply_process_env();
    toml.apply_cli(overrides);
    Ok(toml)
}

/// Modification stamp used to detect config file changes.
type Stamp = Option<(SystemTime, u64)>;

fn stamp(path: &Path) -> Stamp {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Reloads flowpatch.toml when the file changes on disk.
///
/// A reload that fails to parse keeps the previous configuration.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    stamp: Stamp,
    current: FlowpatchToml,
    overrides: CliOverrides,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, current: FlowpatchToml, overrides: CliOverrides) -> Self {
        let stamp = stamp(&path);
        Self {
            path,
            stamp,
            current,
            overrides,
        }
    }

    pub fn current(&self) -> &FlowpatchToml {
        &self.current
    }

    /// Reload if the file changed since the last look. Returns `Ok(true)` when
    /// a new configuration took effect.
    pub fn refresh(&mut self) -> Result<bool> {
        let now = stamp(&self.path);
        if now == self.stamp {
            return Ok(false);
        }
        self.stamp = now;

        let mut next = if now.is_some() {
            FlowpatchToml::load(&self.path)?
        } else {
            FlowpatchToml::default()
        };
        next.apply_process_env();
        next.apply_cli(&self.overrides);

        if next == self.current {
            return Ok(false);
        }
        self.current = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let cfg = FlowpatchToml::default();
        assert_eq!(cfg.worker_pool.max_workers, 2);
        assert_eq!(cfg.worker_pool.queue_strategy, QueueStrategy::Priority);
        assert_eq!(cfg.worktree.max_concurrent_worktrees, 1);
        assert_eq!(cfg.worktree.cleanup_delay_minutes, 30);
        assert_eq!(cfg.worktree.branch_prefix, "flowpatch/");
        assert!(cfg.worktree.rollback_on_cancel);
        assert_eq!(cfg.lease.job_lease_seconds, 300);
        assert_eq!(cfg.lease.worktree_lock_minutes, 10);
        assert_eq!(cfg.retry.cooldown_minutes, 30);
        assert_eq!(cfg.dispatcher.max_execution_minutes, 25);
        assert_eq!(cfg.dispatcher.log_buffer_lines, 1000);
        assert_eq!(cfg.labels.label_for(CardStatus::InProgress), "status::in-progress");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_other_defaults() {
        let cfg = FlowpatchToml::parse(
            r#"
            [worker_pool]
            max_workers = 4
            queue_strategy = "fifo"

            [retry]
            max_attempts = { repair = 2 }

            [labels]
            status_labels = { in_review = "Needs Review" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker_pool.max_workers, 4);
        assert_eq!(cfg.worker_pool.queue_strategy, QueueStrategy::Fifo);
        assert_eq!(cfg.lease.job_lease_seconds, 300);
        assert_eq!(cfg.retry_policy().max_attempts_for(JobType::Repair), 2);
        assert_eq!(cfg.retry_policy().max_attempts_for(JobType::Migrate), 1);
        assert_eq!(cfg.labels.label_for(CardStatus::InReview), "Needs Review");
        assert_eq!(cfg.labels.label_for(CardStatus::Done), "status::done");
    }

    #[test]
    fn test_parse_rejects_bad_strategy() {
        let err = FlowpatchToml::parse("[worker_pool]\nqueue_strategy = \"lifo\"\n");
        assert!(err.is_err());
        assert!("LIFO".parse::<QueueStrategy>().is_err());
        assert_eq!("FIFO".parse::<QueueStrategy>().unwrap(), QueueStrategy::Fifo);
    }

    #[test]
    fn test_validate_reports_problems() {
        let cfg = FlowpatchToml::parse(
            r#"
            [worker_pool]
            max_workers = 0

            [worktree]
            branch_pattern = "work/{slug}"

            [retry]
            max_attempts = { bogus_type = 2 }

            [labels]
            status_labels = { archived = "status::archived" }
            "#,
        )
        .unwrap();
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("max_workers")));
        assert!(warnings.iter().any(|w| w.contains("{id}")));
        assert!(warnings.iter().any(|w| w.contains("bogus_type")));
        assert!(warnings.iter().any(|w| w.contains("archived")));
    }

    #[test]
    fn test_env_then_cli_layering() {
        let env: HashMap<&str, &str> = [
            ("FLOWPATCH_MAX_WORKERS", "6"),
            ("FLOWPATCH_EXECUTOR_CMD", "my-agent"),
            ("FLOWPATCH_QUEUE_STRATEGY", "fifo"),
        ]
        .into_iter()
        .collect();

        let mut cfg = FlowpatchToml::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.worker_pool.max_workers, 6);
        assert_eq!(cfg.executor.command, "my-agent");
        assert_eq!(cfg.worker_pool.queue_strategy, QueueStrategy::Fifo);

        cfg.apply_cli(&CliOverrides {
            max_workers: Some(1),
            executor_cmd: None,
        });
        assert_eq!(cfg.worker_pool.max_workers, 1);
        assert_eq!(cfg.executor.command, "my-agent");
    }

    #[test]
    fn test_env_ignores_garbage() {
        let mut cfg = FlowpatchToml::default();
        cfg.apply_env(|k| match k {
            "FLOWPATCH_MAX_WORKERS" => Some("many".to_string()),
            "FLOWPATCH_QUEUE_STRATEGY" => Some("random".to_string()),
            _ => None,
        });
        assert_eq!(cfg, FlowpatchToml::default());
    }

    #[test]
    fn test_save_and_load_or_default() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(FlowpatchToml::load_or_default(dir.path())?, FlowpatchToml::default());

        let mut cfg = FlowpatchToml::default();
        cfg.worktree.recycle_after_runs = 5;
        cfg.save(&dir.path().join(CONFIG_FILE))?;
        let loaded = FlowpatchToml::load_or_default(dir.path())?;
        assert_eq!(loaded.worktree.recycle_after_runs, 5);
        Ok(())
    }

    #[test]
    fn test_watcher_reloads_on_change_and_keeps_previous_on_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[worker_pool]\nmax_workers = 3\n")?;

        let initial = FlowpatchToml::load(&path)?;
        let mut watcher = ConfigWatcher::new(path.clone(), initial, CliOverrides::default());
        assert!(!watcher.refresh()?);

        std::fs::write(&path, "[worker_pool]\nmax_workers = 5\n\n[lease]\njob_lease_seconds = 60\n")?;
        assert!(watcher.refresh()?);
        assert_eq!(watcher.current().worker_pool.max_workers, 5);

        std::fs::write(&path, "[worker_pool\nmax_workers = ")?;
        assert!(watcher.refresh().is_err());
        assert_eq!(watcher.current().worker_pool.max_workers, 5);
        Ok(())
    }

    #[test]
    fn test_worktree_root_resolution() {
        let mut section = WorktreeSection::default();
        let project = Path::new("/repo");
        assert_eq!(section.root_for(project), PathBuf::from("/repo/.worktrees"));
        section.root = Some(PathBuf::from("trees"));
        assert_eq!(section.root_for(project), PathBuf::from("/repo/trees"));
        section.root = Some(PathBuf::from("/var/trees"));
        assert_eq!(section.root_for(project), PathBuf::from("/var/trees"));
    }
}
