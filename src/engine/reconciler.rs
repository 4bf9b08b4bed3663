//! Mirror card status onto remote tracker labels after a job succeeds.
//!
//! Only `worker_run` and `sync_push` reconcile. A failure here is reported
//! and logged but never changes the outcome of the job.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use flowpatch_common::labels::labels_match;
use flowpatch_common::{
    Card, CardStatus, Clock, Job, JobPayload, JobType, Project, ResultEnvelope, find_matching_label,
};
use serde::{Deserialize, Serialize};

use crate::config::LabelsSection;
use crate::engine::db::DbHandle;
use crate::errors::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// The narrow slice of a GitHub/GitLab client the reconciler needs.
#[async_trait]
pub trait RemoteTracker: Send + Sync {
    async fn list_labels(&self, project: &Project) -> Result<Vec<Label>>;

    /// Replace the full label set of an issue.
    async fn set_labels(&self, project: &Project, issue_number: i64, labels: &[String]) -> Result<()>;

    async fn create_label(&self, project: &Project, label: &Label) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub card_id: String,
    pub status: CardStatus,
    /// The remote label that now carries the status, if one was applied
    pub applied_label: Option<String>,
    pub created_label: bool,
    pub labels: Vec<String>,
    pub diagnostics: Vec<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    db: DbHandle,
    tracker: Option<Arc<dyn RemoteTracker>>,
    clock: Arc<dyn Clock>,
    config: Arc<RwLock<LabelsSection>>,
}

impl Reconciler {
    pub fn new(
        db: DbHandle,
        tracker: Option<Arc<dyn RemoteTracker>>,
        clock: Arc<dyn Clock>,
        config: LabelsSection,
    ) -> Self {
        Self {
            db,
            tracker,
            clock,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn configure(&self, config: LabelsSection) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn config(&self) -> LabelsSection {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Status the card should move to after `job` succeeded with `result`.
    pub fn target_status(&self, job: &Job, result: &ResultEnvelope) -> Option<CardStatus> {
        if let Some(status) = result.card_status() {
            return Some(status);
        }
        match &job.payload {
            JobPayload::SyncPush(p) => p.status,
            JobPayload::WorkerRun(_) => Some(self.config().worker_success_status),
            _ => None,
        }
    }

    /// Apply the status of a succeeded job to its card, locally and on the
    /// remote tracker. `Ok(None)` when the job has nothing to reconcile.
    pub async fn reconcile(
        &self,
        job: &Job,
        result: &ResultEnvelope,
    ) -> Result<Option<ReconcileReport>, EngineError> {
        if !job.job_type.reconciles_labels() {
            return Ok(None);
        }
        let Some(card_id) = job.card_id.clone() else {
            return Ok(None);
        };
        let Some(status) = self.target_status(job, result) else {
            return Ok(None);
        };

        let project_id = job.project_id.clone();
        let lookup_id = card_id.clone();
        let (card, project) = self
            .db
            .call(move |db| Ok((db.get_card(&lookup_id)?, db.get_project(&project_id)?)))
            .await?;
        let mut card = card.ok_or_else(|| EngineError::CardNotFound { id: card_id.clone() })?;
        let project = project.ok_or_else(|| EngineError::ProjectNotFound {
            id: job.project_id.clone(),
        })?;

        let config = self.config();
        let target = config.label_for(status);
        let extra: Vec<String> = match &job.payload {
            JobPayload::SyncPush(p) if job.job_type == JobType::SyncPush => p.labels.clone(),
            _ => Vec::new(),
        };

        let mut report = ReconcileReport {
            card_id: card_id.clone(),
            status,
            applied_label: None,
            created_label: false,
            labels: Vec::new(),
            diagnostics: Vec::new(),
        };

        let remote = match (&self.tracker, card.remote_issue_number) {
            (Some(tracker), Some(issue)) => Some((tracker.clone(), issue)),
            (None, _) => {
                report.diagnostics.push("No remote tracker configured".to_string());
                None
            }
            (Some(_), None) => {
                report
                    .diagnostics
                    .push(format!("Card {} is not linked to a remote issue", card_id));
                None
            }
        };

        let applied = match remote {
            Some((tracker, issue)) => {
                let resolved = self
                    .resolve_label(tracker.as_ref(), &project, &target, &config, &mut report)
                    .await
                    .map_err(|e| failure(&card_id, e))?;
                let labels = merge_labels(&card.labels, &config, resolved.as_deref(), &extra);
                tracker
                    .set_labels(&project, issue, &labels)
                    .await
                    .map_err(|e| failure(&card_id, e))?;
                report.applied_label = resolved;
                labels
            }
            None => merge_labels(&card.labels, &config, Some(&target), &extra),
        };

        card.status = status;
        card.labels = applied.clone();
        card.updated_at = self.clock.now();
        self.save_card(card).await?;
        report.labels = applied;

        for diagnostic in &report.diagnostics {
            tracing::warn!(card_id = %card_id, job_id = %job.id, "{}", diagnostic);
        }
        tracing::info!(card_id = %card_id, job_id = %job.id, status = %status, label = ?report.applied_label, "card status reconciled");
        Ok(Some(report))
    }

    async fn resolve_label(
        &self,
        tracker: &dyn RemoteTracker,
        project: &Project,
        target: &str,
        config: &LabelsSection,
        report: &mut ReconcileReport,
    ) -> Result<Option<String>> {
        let available: Vec<String> = tracker
            .list_labels(project)
            .await?
            .into_iter()
            .map(|l| l.name)
            .collect();
        if let Some(hit) = find_matching_label(target, &available) {
            return Ok(Some(hit.to_string()));
        }
        if config.create_missing {
            tracker
                .create_label(
                    project,
                    &Label {
                        name: target.to_string(),
                        color: Some(config.color.clone()),
                    },
                )
                .await?;
            report.created_label = true;
            return Ok(Some(target.to_string()));
        }
        report.diagnostics.push(format!(
            "Label '{}' does not exist on the remote; enable labels.create_missing to create it",
            target
        ));
        Ok(None)
    }

    async fn save_card(&self, card: Card) -> Result<(), EngineError> {
        Ok(self.db.call(move |db| db.update_card(&card)).await?)
    }
}

fn failure(card_id: &str, e: anyhow::Error) -> EngineError {
    EngineError::ReconciliationFailure {
        card_id: card_id.to_string(),
        message: format!("{:#}", e),
    }
}

/// `current` without any status label, plus `status_label` and `extra`.
fn merge_labels(
    current: &[String],
    config: &LabelsSection,
    status_label: Option<&str>,
    extra: &[String],
) -> Vec<String> {
    let status_labels = config.all_status_labels();
    let mut labels: Vec<String> = current
        .iter()
        .filter(|l| !status_labels.iter().any(|s| labels_match(s, l)))
        .cloned()
        .collect();
    for label in extra.iter().map(String::as_str).chain(status_label) {
        if !labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            labels.push(label.to_string());
        }
    }
    labels
}
