use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A git repository that worktrees are cut from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub default_branch: String,
    /// `owner/repo` on the remote tracker, if the project is mirrored.
    pub remote_repo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Kanban column a card sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Draft,
    Ready,
    InProgress,
    InReview,
    Testing,
    Done,
}

impl CardStatus {
    pub const ALL: [CardStatus; 6] = [
        Self::Draft,
        Self::Ready,
        Self::InProgress,
        Self::InReview,
        Self::Testing,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Testing => "testing",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "testing" => Ok(Self::Testing),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid card status: {}", s)),
        }
    }
}

/// Local mirror of a remote tracker issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: CardStatus,
    pub labels: Vec<String>,
    pub remote_issue_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
