//! Queue commands: `flowpatch enqueue`, `jobs`, `cancel`, `approve`.

use std::path::Path;

use anyhow::{Context, Result};
use flowpatch::config::CliOverrides;
use flowpatch::engine::{CancelOutcome, EnqueueOutcome};
use flowpatch_common::{Job, JobPayload, JobState, JobType, NewJob};

use super::Workspace;
use crate::Cli;

pub struct EnqueueArgs<'a> {
    pub job_type: &'a str,
    pub project: &'a str,
    pub card: Option<&'a str>,
    pub payload: Option<&'a str>,
    pub priority: Option<i32>,
}

pub async fn cmd_enqueue(project_dir: &Path, cli: &Cli, args: EnqueueArgs<'_>) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    let job_type: JobType = args.job_type.parse().map_err(anyhow::Error::msg)?;
    let body = match args.payload {
        Some(raw) => serde_json::from_str(raw).context("--payload is not valid JSON")?,
        None => serde_json::Value::Null,
    };
    let payload = JobPayload::from_parts(job_type, body)
        .with_context(|| format!("Invalid payload for {}", job_type))?;
    let project = ws.project(args.project).await?;

    let mut new_job = NewJob::new(project.id, payload);
    if let Some(card) = args.card {
        new_job = new_job.for_card(card);
    }
    if let Some(priority) = args.priority {
        new_job = new_job.with_priority(priority);
    }

    match ws.dispatcher(false).enqueue(new_job).await? {
        EnqueueOutcome::Enqueued(id) => println!("Enqueued {} {}", job_type, id),
        EnqueueOutcome::Duplicate(id) => {
            println!("A {} job for this card is already active: {}", job_type, id)
        }
    }
    Ok(())
}

pub async fn cmd_jobs(project_dir: &Path, cli: &Cli, state: Option<&str>, json: bool) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    let state: Option<JobState> = state
        .map(|s| s.parse().map_err(anyhow::Error::msg))
        .transpose()?;
    let jobs = ws.dispatcher(false).queue().list(state).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<38} {:<16} {:<17} {:>3} {:>3}  {}",
        "ID", "TYPE", "STATE", "PRI", "TRY", "DETAIL"
    );
    for job in &jobs {
        println!(
            "{:<38} {:<16} {:<17} {:>3} {:>3}  {}",
            job.id,
            job.job_type.as_str(),
            job.state.as_str(),
            job.priority,
            job.attempt_count,
            detail(job)
        );
    }
    Ok(())
}

fn detail(job: &Job) -> String {
    if let Some(owner) = &job.lease_owner_id {
        return format!("leased by {}", owner);
    }
    if let Some(at) = job.not_before.filter(|_| job.state == JobState::Queued) {
        return format!("not before {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    match (&job.failure_reason, &job.last_error) {
        (Some(reason), Some(error)) => format!("{}: {}", reason, error),
        (None, Some(error)) => error.clone(),
        _ => String::new(),
    }
}

pub async fn cmd_cancel(project_dir: &Path, cli: &Cli, job_id: &str) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    match ws.dispatcher(false).cancel(job_id).await? {
        CancelOutcome::Canceled { previous } => {
            println!("Canceled {} (was {})", job_id, previous)
        }
        CancelOutcome::Requested { owner_id } => println!(
            "Cancel requested for {}; {} will stop it at its next heartbeat",
            job_id,
            owner_id.as_deref().unwrap_or("the lease owner")
        ),
        CancelOutcome::AlreadyTerminal(state) => {
            println!("Job {} already finished ({})", job_id, state)
        }
    }
    Ok(())
}

pub async fn cmd_approve(project_dir: &Path, cli: &Cli, job_id: &str) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    ws.dispatcher(false).approve(job_id).await?;
    println!("Approved {}; it resumes on the next dispatcher tick", job_id);
    Ok(())
}
