//! The scheduling engine.
//!
//! - `db`: SQLite store and the compare-and-swap primitives
//! - `lease`: exclusive, expiring job ownership
//! - `queue`: enqueue, ordering, cancel and approve
//! - `worktree`: per-project pool of git worktrees
//! - `executor`: the seam to whatever runs a job, plus log streaming
//! - `reconciler`: card status to remote labels
//! - `dispatcher`: the loop tying it together
//! - `events`: lifecycle notifications

pub mod db;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod lease;
pub mod queue;
pub mod reconciler;
pub mod worktree;

pub use db::{DbHandle, EngineDb};
pub use dispatcher::{Dispatcher, DispatcherDeps, TickReport, install_shutdown_handler};
pub use events::{EngineEvent, EventBus};
pub use executor::{CommandExecutor, Executor, LogObserver, TracingLogObserver};
pub use lease::LeaseStore;
pub use queue::{CancelOutcome, EnqueueOutcome, JobQueue};
pub use reconciler::{Reconciler, RemoteTracker};
pub use worktree::{GitBackend, GitCli, WorktreePool};
