//! Shared domain types for the flowpatch job scheduling engine.
//!
//! Everything in this crate is pure: models, the tagged job payload union,
//! and the decision functions (retry policy, label matching, priority) that
//! the engine consults without doing I/O.

pub mod clock;
pub mod job;
pub mod labels;
pub mod lease;
pub mod priority;
pub mod project;
pub mod retry;
pub mod worktree;

pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{
    FailureReason, Job, JobPayload, JobState, JobType, NewJob, ResultEnvelope, ResultStatus,
};
pub use labels::find_matching_label;
pub use lease::Lease;
pub use priority::priority_from_labels;
pub use project::{Card, CardStatus, Project};
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
pub use worktree::{ReleaseOutcome, Worktree, WorktreeStatus};
