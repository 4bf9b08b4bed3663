//! The worker loop: `flowpatch dispatch`.

use std::path::Path;

use anyhow::Result;
use flowpatch::config::CliOverrides;
use flowpatch::engine::install_shutdown_handler;

use super::Workspace;
use crate::Cli;

pub async fn cmd_dispatch(
    project_dir: &Path,
    cli: &Cli,
    overrides: CliOverrides,
    once: bool,
) -> Result<()> {
    let ws = Workspace::open(project_dir, cli, overrides)?;
    for warning in ws.config.validate() {
        tracing::warn!("config: {}", warning);
    }

    let dispatcher = ws.dispatcher(!once);
    tracing::info!(
        owner_id = %dispatcher.owner_id(),
        max_workers = ws.config.toml.worker_pool.max_workers,
        executor = %ws.config.toml.executor.command,
        "starting dispatcher"
    );

    if once {
        let report = dispatcher.tick().await;
        dispatcher.drain().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.errors.is_empty() {
            anyhow::bail!("{} error(s) during tick", report.errors.len());
        }
        return Ok(());
    }

    let shutdown = install_shutdown_handler();
    dispatcher.run(shutdown).await;
    Ok(())
}
