//! Raw payloads as the platform returns them.
//!
//! These shapes are deliberately loose: almost every field is optional and
//! unknown variants collapse into catch-alls, so a single odd message never
//! fails decoding of a whole history page.

use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ApiError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawConversation {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub participants_count: Option<u64>,
}

/// One history item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: i64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub sender: Option<RawUser>,
    /// Message text, or the caption when media is attached.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub media: Option<RawMedia>,
    #[serde(default)]
    pub grouped_id: Option<i64>,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub forwarded_from: Option<String>,
}

/// Text entity; offsets and lengths are in UTF-16 code units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEntity {
    Url { offset: usize, length: usize },
    TextUrl { offset: usize, length: usize, url: String },
    Hashtag { offset: usize, length: usize },
    Mention { offset: usize, length: usize },
    MentionName { offset: usize, length: usize, user_id: i64 },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMedia {
    #[serde(default)]
    pub photo: Option<RawPhoto>,
    #[serde(default)]
    pub document: Option<RawDocument>,
    #[serde(default)]
    pub poll: Option<RawPoll>,
    #[serde(default)]
    pub geo: Option<RawGeo>,
    #[serde(default)]
    pub contact: Option<RawContact>,
    #[serde(default)]
    pub webpage: Option<RawWebPage>,
    /// Media kinds this client does not model (dice, games, invoices...).
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPhoto {
    pub id: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub attributes: Vec<DocumentAttribute>,
}

impl RawDocument {
    pub fn file_name(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            DocumentAttribute::Filename { file_name } => Some(file_name.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentAttribute {
    Sticker {
        #[serde(default)]
        alt: Option<String>,
    },
    Audio {
        #[serde(default)]
        voice: bool,
        #[serde(default)]
        duration: Option<u32>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        performer: Option<String>,
    },
    Video {
        #[serde(default)]
        round_message: bool,
        #[serde(default)]
        duration: Option<u32>,
    },
    Filename {
        file_name: String,
    },
    Animated,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPoll {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answers: Vec<String>,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawGeo {
    pub lat: f64,
    pub long: f64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawContact {
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWebPage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReaction {
    pub user: RawUser,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub custom_emoji_id: Option<i64>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub date: Option<DateTime<Utc>>,
}

/// Window and offset for one history page. Pages come back oldest first,
/// with ids strictly greater than `offset_id` and dates within the bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset_id: Option<i64>,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub phone_code_hash: String,
}

/// Successful end of any handshake: an opaque session blob plus the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthGrant {
    pub session: String,
    pub user: RawUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginToken {
    /// Standard base64 of the raw token bytes.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl LoginToken {
    /// URL to render as a scannable code on the already signed-in device.
    pub fn login_url(&self) -> Result<String, ApiError> {
        let raw = STANDARD
            .decode(self.token.as_bytes())
            .map_err(|e| ApiError::Malformed(format!("login token: {}", e)))?;
        Ok(format!("tg://login?token={}", URL_SAFE_NO_PAD.encode(raw)))
    }
}
