//! Core data model shared by the reconciliation crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "chatsync-core";

/// Identity key used to match chats across stores and to detect duplicates.
pub fn normalize_identity(name: &str) -> String {
    name.to_lowercase().trim().to_string()
}

/// Snapshot of one document-store page, as read during a single run.
///
/// Optional classification fields are `None` when unset; the parse step never
/// stores an empty string. `all_networks` distinguishes an absent property
/// (`None`) from a present but empty tag list (`Some(vec![])`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_networks: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
}

impl Record {
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: None,
            priority: None,
            pipeline: None,
            all_networks: None,
            owner: None,
            created_time: None,
        }
    }

    pub fn identity_key(&self) -> String {
        normalize_identity(&self.name)
    }

    /// Number of populated fields among name, status, tags, owner, priority and pipeline.
    pub fn fill_count(&self) -> usize {
        [
            !self.name.trim().is_empty(),
            is_filled(&self.status),
            self.tag_count() > 0,
            self.has_owner(),
            is_filled(&self.priority),
            is_filled(&self.pipeline),
        ]
        .into_iter()
        .filter(|filled| *filled)
        .count()
    }

    pub fn has_owner(&self) -> bool {
        is_filled(&self.owner)
    }

    pub fn tag_count(&self) -> usize {
        self.all_networks.as_ref().map_or(0, Vec::len)
    }
}

fn is_filled(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Channel,
    Group,
    User,
    #[serde(other)]
    Unknown,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Group => "group",
            Self::User => "user",
            Self::Unknown => "unknown",
        }
    }
}

/// A chat discovered on the messaging platform; produced fresh per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub title: String,
    pub id: i64,
    pub kind: EntityKind,
    pub username: Option<String>,
    pub member_count: Option<u64>,
    pub description: Option<String>,
}

impl SourceEntity {
    pub fn identity_key(&self) -> String {
        normalize_identity(&self.title)
    }
}
