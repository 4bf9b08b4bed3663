//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `project`       | `Init`, `Project`, `Card`                          |
//! | `jobs`          | `Enqueue`, `Jobs`, `Cancel`, `Approve`             |
//! | `worktrees`     | `Worktrees`, `Sweep`                               |
//! | `dispatch`      | `Dispatch`                                         |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod dispatch;
pub mod jobs;
pub mod project;
pub mod worktrees;

pub use config::cmd_config;
pub use dispatch::cmd_dispatch;
pub use jobs::{EnqueueArgs, cmd_approve, cmd_cancel, cmd_enqueue, cmd_jobs};
pub use project::{cmd_card, cmd_init, cmd_project};
pub use worktrees::{cmd_sweep, cmd_worktrees};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use flowpatch::config::{CliOverrides, FlowpatchConfig};
use flowpatch::engine::{
    CommandExecutor, DbHandle, Dispatcher, DispatcherDeps, EngineDb, EventBus, GitCli,
    TracingLogObserver,
};
use flowpatch::errors::EngineError;
use flowpatch_common::SystemClock;

use super::Cli;

/// An opened project directory: resolved configuration plus the store.
pub struct Workspace {
    pub config: FlowpatchConfig,
    pub db: DbHandle,
}

impl Workspace {
    pub fn open(project_dir: &Path, cli: &Cli, overrides: CliOverrides) -> Result<Self> {
        let config = FlowpatchConfig::with_cli_args(project_dir.to_path_buf(), overrides)?;
        let db_path = match &cli.db_path {
            Some(path) => path.clone(),
            None => {
                if !config.config_dir.is_dir() {
                    anyhow::bail!(
                        "No .flowpatch directory in {}. Run 'flowpatch init' first.",
                        config.project_dir.display()
                    );
                }
                config.db_file()
            }
        };
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = EngineDb::new(&db_path).map_err(EngineError::Database)?;
        Ok(Self {
            config,
            db: DbHandle::new(db),
        })
    }

    /// A dispatcher wired to the real git CLI and the configured executor.
    pub fn dispatcher(&self, watch: bool) -> Dispatcher {
        let toml = &self.config.toml;
        let deps = DispatcherDeps {
            db: self.db.clone(),
            clock: Arc::new(SystemClock),
            git: Arc::new(GitCli),
            executor: Arc::new(CommandExecutor::from_config(&toml.executor)),
            tracker: None,
            observer: Arc::new(TracingLogObserver),
            events: EventBus::default(),
        };
        let watcher = watch.then(|| self.config.watcher());
        Dispatcher::new(deps, toml.clone(), watcher)
    }

    /// Resolve a project by id or name.
    pub async fn project(&self, key: &str) -> Result<flowpatch_common::Project> {
        let lookup = key.to_string();
        self.db
            .call(move |db| db.find_project(&lookup))
            .await?
            .ok_or_else(|| EngineError::ProjectNotFound { id: key.to_string() }.into())
    }
}
