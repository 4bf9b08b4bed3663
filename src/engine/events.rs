use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use flowpatch_common::{FailureReason, JobType};

/// Capacity of the lifecycle event channel. Slow subscribers lag and lose
/// the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Lifecycle event types ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    JobEnqueued {
        job_id: String,
        job_type: JobType,
        project_id: String,
        priority: i32,
    },
    JobClaimed {
        job_id: String,
        owner_id: String,
        attempt: u32,
    },
    JobSucceeded {
        job_id: String,
    },
    JobFailed {
        job_id: String,
        reason: FailureReason,
        error: String,
        /// True when the job went back to the queue for another attempt.
        will_retry: bool,
    },
    JobPendingApproval {
        job_id: String,
        worktree_id: Option<String>,
    },
    JobCanceled {
        job_id: String,
    },
    WorktreeLocked {
        worktree_id: String,
        job_id: String,
    },
    WorktreeReleased {
        worktree_id: String,
        status: String,
    },
    WorktreeCleaned {
        worktree_id: String,
    },
}

/// Best-effort fan-out of [`EngineEvent`]s. Sending never blocks and never
/// fails the caller.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!(?event, "engine event");
        let _ = self.tx.send(event); // Ignore error if no receivers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_and_data() {
        let event = EngineEvent::JobClaimed {
            job_id: "job-1".into(),
            owner_id: "alpha".into(),
            attempt: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_claimed");
        assert_eq!(json["data"]["owner_id"], "alpha");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::JobSucceeded {
            job_id: "job-1".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::WorktreeCleaned {
            worktree_id: "wt-1".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::WorktreeCleaned {
                worktree_id: "wt-1".into()
            }
        );
    }
}
