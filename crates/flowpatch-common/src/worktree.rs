use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BRANCH_PREFIX: &str = "flowpatch/";
pub const DEFAULT_BRANCH_PATTERN: &str = "{prefix}{id}-{slug}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Ready,
    Running,
    CleanupPending,
    Cleaned,
    Error,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::CleanupPending => "cleanup_pending",
            Self::Cleaned => "cleaned",
            Self::Error => "error",
        }
    }

    /// Statuses that occupy one of the project's concurrency slots.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, Self::Creating | Self::Ready | Self::Running)
    }
}

impl std::fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorktreeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "cleanup_pending" => Ok(Self::CleanupPending),
            "cleaned" => Ok(Self::Cleaned),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid worktree status: {}", s)),
        }
    }
}

/// An isolated git working copy bound to at most one running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub id: String,
    pub project_id: String,
    pub branch_name: String,
    pub path: String,
    pub status: WorktreeStatus,
    pub locked_by_job_id: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub cleanup_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Worktree {
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_by_job_id.is_some() && self.lock_expires_at.is_some_and(|at| at > now)
    }
}

/// How a job finished with its worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Normal completion: the branch is reset to its base for reuse.
    Completed,
    /// The job was canceled, timed out, or lost its lease.
    Canceled { rollback: bool },
}

/// Lowercase, dash-separated slug of `title`, at most `max_len` bytes.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() <= max_len {
        return slug;
    }
    let cut = slug
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max_len)
        .last()
        .unwrap_or(0);
    slug[..cut].trim_end_matches('-').to_string()
}

/// Expand a branch pattern. Supported placeholders: `{prefix}`, `{id}`,
/// `{slug}`, `{project}`.
pub fn branch_name(pattern: &str, prefix: &str, id: &str, slug: &str, project: &str) -> String {
    let name = pattern
        .replace("{prefix}", prefix)
        .replace("{id}", id)
        .replace("{project}", project)
        .replace("{slug}", slug);
    name.trim_end_matches(['-', '/']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in &[
            "creating",
            "ready",
            "running",
            "cleanup_pending",
            "cleaned",
            "error",
        ] {
            let parsed: WorktreeStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("bogus".parse::<WorktreeStatus>().is_err());
    }

    #[test]
    fn test_slot_occupancy() {
        assert!(WorktreeStatus::Creating.occupies_slot());
        assert!(WorktreeStatus::Ready.occupies_slot());
        assert!(WorktreeStatus::Running.occupies_slot());
        assert!(!WorktreeStatus::CleanupPending.occupies_slot());
        assert!(!WorktreeStatus::Cleaned.occupies_slot());
        assert!(!WorktreeStatus::Error.occupies_slot());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix Login Bug!", 40), "fix-login-bug");
        assert_eq!(slugify("  spaces   everywhere  ", 40), "spaces-everywhere");
        assert_eq!(slugify("a very long title that goes on", 10), "a-very-lon");
        assert_eq!(slugify("trailing dash at cut", 9), "trailing");
        assert_eq!(slugify("", 10), "");
    }

    #[test]
    fn test_branch_name_default_pattern() {
        let name = branch_name(
            DEFAULT_BRANCH_PATTERN,
            DEFAULT_BRANCH_PREFIX,
            "wt-1a2b3c4d",
            "fix-login",
            "web",
        );
        assert_eq!(name, "flowpatch/wt-1a2b3c4d-fix-login");
    }

    #[test]
    fn test_branch_name_empty_slug_drops_separator() {
        let name = branch_name(DEFAULT_BRANCH_PATTERN, "fp/", "wt-1", "", "web");
        assert_eq!(name, "fp/wt-1");
        let name = branch_name("{project}/{id}", "", "wt-1", "x", "web");
        assert_eq!(name, "web/wt-1");
    }
}
