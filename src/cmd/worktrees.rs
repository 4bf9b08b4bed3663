//! Worktree pool inspection: `flowpatch worktrees`, `flowpatch sweep`.

use std::path::Path;

use anyhow::Result;
use flowpatch::config::CliOverrides;

use super::Workspace;
use crate::Cli;

pub async fn cmd_worktrees(
    project_dir: &Path,
    cli: &Cli,
    project: Option<String>,
    json: bool,
) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    let project_id = match project {
        Some(key) => Some(ws.project(&key).await?.id),
        None => None,
    };
    let worktrees = ws.dispatcher(false).pool().list(project_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&worktrees)?);
        return Ok(());
    }
    if worktrees.is_empty() {
        println!("No worktrees.");
        return Ok(());
    }
    for wt in worktrees {
        let lock = match (&wt.locked_by_job_id, wt.lock_expires_at) {
            (Some(job), Some(until)) => format!("locked by {} until {}", job, until.format("%H:%M:%S")),
            (Some(job), None) => format!("locked by {}", job),
            _ => String::new(),
        };
        println!(
            "{:<12} {:<16} {:<14} runs={:<3} {} {}",
            wt.id,
            wt.project_id,
            wt.status.as_str(),
            wt.run_count,
            wt.branch_name,
            lock
        );
        if let Some(err) = &wt.last_error {
            println!("             last error: {}", err);
        }
    }
    Ok(())
}

pub async fn cmd_sweep(project_dir: &Path, cli: &Cli) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    let report = ws.dispatcher(false).maintenance().await;

    println!("Approvals expired:   {}", report.approvals_expired.len());
    println!("Stale locks freed:   {}", report.locks_reclaimed.len());
    println!("Queued for cleanup:  {}", report.worktrees_promoted.len());
    println!("Worktrees removed:   {}", report.worktrees_cleaned.len());
    for error in &report.errors {
        println!("  error: {}", error);
    }
    if !report.errors.is_empty() {
        anyhow::bail!("{} maintenance step(s) failed", report.errors.len());
    }
    Ok(())
}
