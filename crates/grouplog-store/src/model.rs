use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of content categories. Every raw item maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Text,
    Photo,
    Video,
    VideoNote,
    Document,
    Audio,
    Voice,
    Sticker,
    Poll,
    Location,
    Contact,
    /// Media the classifier does not model.
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Text => "text",
            Category::Photo => "photo",
            Category::Video => "video",
            Category::VideoNote => "video_note",
            Category::Document => "document",
            Category::Audio => "audio",
            Category::Voice => "voice",
            Category::Sticker => "sticker",
            Category::Poll => "poll",
            Category::Location => "location",
            Category::Contact => "contact",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => Category::Text,
            "photo" => Category::Photo,
            "video" => Category::Video,
            "video_note" => Category::VideoNote,
            "document" => Category::Document,
            "audio" => Category::Audio,
            "voice" => Category::Voice,
            "sticker" => Category::Sticker,
            "poll" => Category::Poll,
            "location" => Category::Location,
            "contact" => Category::Contact,
            "unknown" => Category::Unknown,
            other => anyhow::bail!("unknown category: {}", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: i64,
    pub title: String,
    pub handle: Option<String>,
    /// Timestamp of the newest persisted message; only ever moves forward.
    #[serde(default)]
    pub last_fetch_position: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub user_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub is_bot: bool,
    #[serde(default)]
    pub soft_deleted: bool,
}

impl ParticipantRecord {
    /// Handle if present, otherwise the numeric id. Used in on-disk paths.
    pub fn handle_or_id(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.user_id.to_string())
    }

    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            self.handle_or_id()
        } else {
            parts.join(" ")
        }
    }
}

/// A downloadable file referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub file_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub category: Category,
}

/// Normalised form of one remote item, produced once by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub message_id: i64,
    pub conversation_id: i64,
    pub sender: Option<ParticipantRecord>,
    pub sent_at: DateTime<Utc>,
    pub body: Option<String>,
    pub caption: Option<String>,
    pub category: Category,
    pub has_attachment: bool,
    pub has_link: bool,
    pub has_sticker: bool,
    pub has_mention: bool,
    /// First link found in the text, if any.
    pub link: Option<String>,
    pub deep_link: String,
    pub tags: Vec<String>,
    pub mentions: Vec<String>,
    pub grouped_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub forwarded_from: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    SkippedDuplicate,
}

/// A persisted message as returned by queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub conversation_id: i64,
    pub sender_id: Option<i64>,
    pub sent_at: DateTime<Utc>,
    pub body: Option<String>,
    pub caption: Option<String>,
    pub category: Category,
    pub has_attachment: bool,
    pub has_link: bool,
    pub has_sticker: bool,
    pub has_mention: bool,
    pub link: Option<String>,
    pub deep_link: String,
    pub grouped_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub forwarded_from: Option<String>,
    pub soft_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub conversation_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
    pub reacted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFileRecord {
    pub conversation_id: i64,
    pub message_id: i64,
    pub file_id: String,
    pub path: String,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub category: Category,
    pub thumbnail_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    BudgetExhausted,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::BudgetExhausted => "budget_exhausted",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "cancelled" => RunStatus::Cancelled,
            "budget_exhausted" => RunStatus::BudgetExhausted,
            "interrupted" => RunStatus::Interrupted,
            "failed" => RunStatus::Failed,
            other => anyhow::bail!("unknown run status: {}", other),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// Resumption point and last-run statistics for one (conversation, account) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchState {
    pub conversation_id: i64,
    pub account: String,
    pub cursor_at: Option<DateTime<Utc>>,
    pub cursor_message_id: Option<i64>,
    pub counts: RunCounts,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemErrorRecord {
    pub conversation_id: i64,
    pub message_id: Option<i64>,
    pub stage: String,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// Filters for [`crate::Store::messages`]. Soft-deleted rows are hidden
/// unless `include_deleted` is set.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub conversation_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub category: Option<Category>,
    pub tag: Option<String>,
    pub has_mention: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub limit: Option<u32>,
}

impl MessageQuery {
    pub fn conversation(conversation_id: i64) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Default::default()
        }
    }
}
