//! Workspace setup and the local project/card mirror: `flowpatch init`,
//! `flowpatch project`, `flowpatch card`.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use flowpatch::config::{CONFIG_DIR, CONFIG_FILE, CliOverrides, FlowpatchToml};
use flowpatch::engine::EngineDb;
use flowpatch_common::worktree::slugify;
use flowpatch_common::{Card, CardStatus, Project};
use uuid::Uuid;

use super::Workspace;
use crate::{CardCommands, Cli, ProjectCommands};

pub fn cmd_init(project_dir: &Path, cli: &Cli) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let was_initialized = config_dir.is_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join(CONFIG_FILE);
    let wrote_config = !config_path.exists();
    if wrote_config {
        FlowpatchToml::default().save(&config_path)?;
    }
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| config_dir.join("flowpatch.db"));
    EngineDb::new(&db_path)?;

    if was_initialized {
        println!(
            "flowpatch already initialized at {}",
            config_dir.display()
        );
    } else {
        println!("Initialized flowpatch at {}", config_dir.display());
    }
    if wrote_config {
        println!("  config:   {}", config_path.display());
    }
    println!("  database: {}", db_path.display());
    println!();
    println!("Next: flowpatch project add <path-to-repo>");
    Ok(())
}

pub async fn cmd_project(project_dir: &Path, cli: &Cli, command: &ProjectCommands) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    match command {
        ProjectCommands::Add {
            path,
            name,
            default_branch,
            remote,
        } => {
            let path = path
                .canonicalize()
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            git2::Repository::open(&path)
                .with_context(|| format!("{} is not a git repository", path.display()))?;
            let name = match name {
                Some(name) => name.clone(),
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("Cannot derive a project name from the path; pass --name")?,
            };
            let project = Project {
                id: slugify(&name, 40),
                name,
                path: path.to_string_lossy().into_owned(),
                default_branch: default_branch.clone(),
                remote_repo: remote.clone(),
                created_at: Utc::now(),
            };
            let project = ws.db.call(move |db| db.create_project(&project)).await?;
            println!("Added project {} ({})", project.id, project.path);
        }
        ProjectCommands::List => {
            let projects = ws.db.call(|db| db.list_projects()).await?;
            if projects.is_empty() {
                println!("No projects registered.");
            }
            for p in projects {
                println!(
                    "{:<24} {:<10} {}{}",
                    p.id,
                    p.default_branch,
                    p.path,
                    p.remote_repo
                        .map(|r| format!("  ({})", r))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

pub async fn cmd_card(project_dir: &Path, cli: &Cli, command: &CardCommands) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, CliOverrides::default())?;
    match command {
        CardCommands::Add {
            project,
            title,
            labels,
            status,
            issue,
        } => {
            let project = ws.project(project).await?;
            let status: CardStatus = status.parse().map_err(anyhow::Error::msg)?;
            let now = Utc::now();
            let short = Uuid::new_v4().simple().to_string();
            let card = Card {
                id: format!("card-{}", &short[..8]),
                project_id: project.id,
                title: title.clone(),
                status,
                labels: labels.clone(),
                remote_issue_number: *issue,
                created_at: now,
                updated_at: now,
            };
            let card = ws.db.call(move |db| db.create_card(&card)).await?;
            println!("Added card {} [{}] {}", card.id, card.status, card.title);
        }
        CardCommands::List { project } => {
            let project = ws.project(project).await?;
            let cards = ws.db.call(move |db| db.list_cards(&project.id)).await?;
            for c in cards {
                println!(
                    "{:<14} {:<12} {:<40} {}",
                    c.id,
                    c.status.as_str(),
                    c.title,
                    c.labels.join(", ")
                );
            }
        }
    }
    Ok(())
}
