use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "flowpatch")]
#[command(version, about = "Job scheduler and git worktree orchestrator for kanban coding workers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true, env = "FLOWPATCH_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Database path. Defaults to .flowpatch/flowpatch.db
    #[arg(long, global = true, env = "FLOWPATCH_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .flowpatch/ with a default config and an empty database
    Init,
    /// Register or list projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Mirror or list kanban cards
    Card {
        #[command(subcommand)]
        command: CardCommands,
    },
    /// Add a job to the queue
    Enqueue {
        /// Job type, e.g. worker_run, sync_poll, index_build
        job_type: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        card: Option<String>,
        /// JSON payload for the job type
        #[arg(long)]
        payload: Option<String>,
        /// Explicit priority, 0 is most urgent
        #[arg(long)]
        priority: Option<i32>,
    },
    /// List jobs
    Jobs {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a job
    Cancel { job_id: String },
    /// Approve a job waiting in pending_approval
    Approve { job_id: String },
    /// List worktrees
    Worktrees {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run maintenance once: approval expiry, stale locks, cleanup
    Sweep,
    /// Run the dispatcher loop
    Dispatch {
        /// Run a single tick and wait for the claimed jobs to finish
        #[arg(long)]
        once: bool,
        /// Overrides worker_pool.max_workers
        #[arg(long)]
        max_workers: Option<usize>,
        /// Overrides executor.command
        #[arg(long)]
        executor_cmd: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Register a git repository
    Add {
        /// Path to the repository
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "main")]
        default_branch: String,
        /// owner/repo on the remote tracker
        #[arg(long)]
        remote: Option<String>,
    },
    List,
}

#[derive(Subcommand, Clone)]
pub enum CardCommands {
    /// Add a card mirror
    Add {
        #[arg(long)]
        project: String,
        #[arg(long)]
        title: String,
        /// Repeatable
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long, default_value = "ready")]
        status: String,
        /// Remote issue number
        #[arg(long)]
        issue: Option<i64>,
    },
    List {
        #[arg(long)]
        project: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // The dispatcher also writes a rolling JSON log once .flowpatch/ exists
    let config_dir = project_dir.join(flowpatch::config::CONFIG_DIR);
    let log_dir = (matches!(cli.command, Commands::Dispatch { .. }) && config_dir.is_dir())
        .then(|| config_dir.join("logs"));
    let _log_guard = flowpatch::logging::init(cli.verbose, cli.log_json, log_dir.as_deref())?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir, &cli)?,
        Commands::Project { command } => cmd::cmd_project(&project_dir, &cli, command).await?,
        Commands::Card { command } => cmd::cmd_card(&project_dir, &cli, command).await?,
        Commands::Enqueue {
            job_type,
            project,
            card,
            payload,
            priority,
        } => {
            cmd::cmd_enqueue(
                &project_dir,
                &cli,
                cmd::EnqueueArgs {
                    job_type,
                    project,
                    card: card.as_deref(),
                    payload: payload.as_deref(),
                    priority: *priority,
                },
            )
            .await?
        }
        Commands::Jobs { state, json } => {
            cmd::cmd_jobs(&project_dir, &cli, state.as_deref(), *json).await?
        }
        Commands::Cancel { job_id } => cmd::cmd_cancel(&project_dir, &cli, job_id).await?,
        Commands::Approve { job_id } => cmd::cmd_approve(&project_dir, &cli, job_id).await?,
        Commands::Worktrees { project, json } => {
            cmd::cmd_worktrees(&project_dir, &cli, project.clone(), *json).await?
        }
        Commands::Sweep => cmd::cmd_sweep(&project_dir, &cli).await?,
        Commands::Dispatch {
            once,
            max_workers,
            executor_cmd,
        } => {
            let overrides = flowpatch::config::CliOverrides {
                max_workers: *max_workers,
                executor_cmd: executor_cmd.clone(),
            };
            cmd::cmd_dispatch(&project_dir, &cli, overrides, *once).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
