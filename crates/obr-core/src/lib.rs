//! Core domain model for Open Bounty Radar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "obr-core";

/// Origin of a discovered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    IssueSearch,
    BountyPlatform,
}

impl ItemSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemSource::IssueSearch => "issue_search",
            ItemSource::BountyPlatform => "bounty_platform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issue_search" => Some(ItemSource::IssueSearch),
            "bounty_platform" => Some(ItemSource::BountyPlatform),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monetary reward attached to a bounty. Absent entirely for plain
/// labeled issues, so it always travels as `Option<Reward>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub amount: f64,
    pub currency: String,
}

/// Normalized candidate produced by a source adapter, before the store
/// stamps local bookkeeping onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub source: ItemSource,
    pub repo: String,
    pub title: String,
    pub labels: Vec<String>,
    /// Canonical permalink; identity key across the whole store.
    pub url: String,
    pub reward: Option<Reward>,
    pub created_at: DateTime<Utc>,
}

/// Persisted item row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub source: ItemSource,
    pub repo: String,
    pub title: String,
    pub labels: Vec<String>,
    pub url: String,
    pub reward: Option<Reward>,
    pub created_at: DateTime<Utc>,
    /// First local insertion; immutable once set.
    pub first_seen: DateTime<Utc>,
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
}

/// Final status of one mode invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    CompletedDegraded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedDegraded => "completed-degraded",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
