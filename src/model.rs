use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Publisher block of a news article.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Article payload as delivered by the news API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    #[serde(default)]
    pub source: Source,
    pub author: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub url_to_image: Option<String>,
    pub published_at: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    #[serde(flatten)]
    pub article: Article,
    pub bookmarked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CachedArticle {
    #[serde(flatten)]
    pub article: Article,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionKind {
    AddBookmark,
    RemoveBookmark,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::AddBookmark => "add_bookmark",
            ActionKind::RemoveBookmark => "remove_bookmark",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "add_bookmark" => Some(ActionKind::AddBookmark),
            "remove_bookmark" => Some(ActionKind::RemoveBookmark),
            _ => None,
        }
    }
}

/// Replay status of a queued action.
///
/// `Succeeded` is never stored: a confirmed replay deletes its row. It stays so
/// the `status` column vocabulary covers the whole lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "succeeded" => Some(ActionStatus::Succeeded),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }
}

/// A user intent recorded while it could not be confirmed against the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAction {
    /// Monotonic queue position assigned at insertion.
    pub id: i64,
    pub action_id: Uuid,
    pub kind: ActionKind,
    pub payload: Value,
    pub status: ActionStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// On-demand snapshot of the persistent store; never persisted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub bookmarks: u64,
    pub articles: u64,
    pub estimated_size: u64,
}

impl StorageStats {
    pub fn estimated_kib(&self) -> u64 {
        (self.estimated_size + 512) / 1024
    }
}
