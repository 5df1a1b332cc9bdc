//! Raw item → [`CanonicalMessage`].
//!
//! Pure and infallible: odd or unknown payloads degrade to
//! [`Category::Text`] or [`Category::Unknown`] instead of failing the item.

use grouplog_client::{DocumentAttribute, RawDocument, RawEntity, RawItem, RawMedia, RawUser};
use grouplog_store::{AttachmentRef, CanonicalMessage, Category, ConversationRecord, ParticipantRecord};
use once_cell::sync::Lazy;
use regex::Regex;

static HASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w&/])#(\w+)").expect("hashtag regex"));

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"']+"#).expect("url regex")
});

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w@])@([A-Za-z][A-Za-z0-9_]{2,31})").expect("mention regex"));

/// Slice `text` by UTF-16 code units, the unit entity offsets use.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let end = offset.checked_add(length)?;
    units
        .get(offset..end)
        .and_then(|s| String::from_utf16(s).ok())
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

fn document_has<F>(doc: &RawDocument, pred: F) -> bool
where
    F: Fn(&DocumentAttribute) -> bool,
{
    doc.attributes.iter().any(pred)
}

/// Pick exactly one category. Precedence when several signals are present:
/// sticker, poll, location, contact, voice, video note, audio, video,
/// photo, document.
pub fn categorize(media: Option<&RawMedia>) -> Category {
    let Some(media) = media else {
        return Category::Text;
    };
    let doc = media.document.as_ref();
    let doc_has = |pred: fn(&DocumentAttribute) -> bool| doc.is_some_and(|d| document_has(d, pred));

    if doc_has(|a| matches!(a, DocumentAttribute::Sticker { .. })) {
        Category::Sticker
    } else if media.poll.is_some() {
        Category::Poll
    } else if media.geo.is_some() {
        Category::Location
    } else if media.contact.is_some() {
        Category::Contact
    } else if doc_has(|a| matches!(a, DocumentAttribute::Audio { voice: true, .. })) {
        Category::Voice
    } else if doc_has(|a| matches!(a, DocumentAttribute::Video { round_message: true, .. })) {
        Category::VideoNote
    } else if doc_has(|a| matches!(a, DocumentAttribute::Audio { .. })) {
        Category::Audio
    } else if doc_has(|a| matches!(a, DocumentAttribute::Video { .. } | DocumentAttribute::Animated)) {
        Category::Video
    } else if media.photo.is_some() {
        Category::Photo
    } else if doc.is_some() {
        Category::Document
    } else if media.webpage.is_some() || media.other.is_empty() {
        // A link preview is still a text message.
        Category::Text
    } else {
        Category::Unknown
    }
}

fn extension_for(mime: Option<&str>) -> &'static str {
    match mime.unwrap_or_default() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/x-tgsticker" => "tgs",
        _ => "bin",
    }
}

/// Keep a provider-supplied file name safe to join onto a path.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

fn attachments_for(media: Option<&RawMedia>, category: Category) -> Vec<AttachmentRef> {
    let Some(media) = media else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    if let Some(photo) = &media.photo {
        refs.push(AttachmentRef {
            file_id: photo.id.clone(),
            file_name: format!("photo_{}.jpg", sanitize_file_name(&photo.id)),
            mime_type: Some("image/jpeg".to_string()),
            size: photo.size,
            category: Category::Photo,
        });
    }
    if let Some(doc) = &media.document {
        let file_name = match doc.file_name() {
            Some(name) => sanitize_file_name(name),
            None => format!(
                "{}.{}",
                sanitize_file_name(&doc.id),
                extension_for(doc.mime_type.as_deref())
            ),
        };
        let doc_category = match category {
            Category::Photo | Category::Text | Category::Unknown => Category::Document,
            other => other,
        };
        refs.push(AttachmentRef {
            file_id: doc.id.clone(),
            file_name,
            mime_type: doc.mime_type.clone(),
            size: doc.size,
            category: doc_category,
        });
    }
    refs
}

pub fn participant_from(user: &RawUser) -> ParticipantRecord {
    ParticipantRecord {
        user_id: user.id,
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        username: user.username.clone(),
        phone: user.phone.clone(),
        is_bot: user.bot,
        soft_deleted: false,
    }
}

/// Canonical link back to the item on the platform.
pub fn deep_link(conversation: &ConversationRecord, message_id: i64) -> String {
    match conversation.handle.as_deref().filter(|h| !h.is_empty()) {
        Some(handle) => format!("https://t.me/{}/{}", handle, message_id),
        None => {
            let raw = conversation.id.to_string();
            let peer = raw
                .strip_prefix("-100")
                .unwrap_or_else(|| raw.trim_start_matches('-'));
            format!("https://t.me/c/{}/{}", peer, message_id)
        }
    }
}

struct TextSignals {
    tags: Vec<String>,
    links: Vec<String>,
    mentions: Vec<String>,
}

fn scan_text(text: &str, entities: &[RawEntity]) -> TextSignals {
    let mut signals = TextSignals {
        tags: Vec::new(),
        links: Vec::new(),
        mentions: Vec::new(),
    };

    for entity in entities {
        match entity {
            RawEntity::Hashtag { offset, length } => {
                if let Some(tag) = utf16_slice(text, *offset, *length) {
                    push_unique(&mut signals.tags, tag.trim_start_matches('#').to_lowercase());
                }
            }
            RawEntity::Url { offset, length } => {
                if let Some(url) = utf16_slice(text, *offset, *length) {
                    push_unique(&mut signals.links, url);
                }
            }
            RawEntity::TextUrl { url, .. } => push_unique(&mut signals.links, url.clone()),
            RawEntity::Mention { offset, length } => {
                if let Some(handle) = utf16_slice(text, *offset, *length) {
                    push_unique(
                        &mut signals.mentions,
                        handle.trim_start_matches('@').to_lowercase(),
                    );
                }
            }
            RawEntity::MentionName { user_id, .. } => {
                push_unique(&mut signals.mentions, user_id.to_string())
            }
            RawEntity::Other => {}
        }
    }

    for cap in HASHTAG_RE.captures_iter(text) {
        push_unique(&mut signals.tags, cap[1].to_lowercase());
    }
    for m in URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ')', '!', '?', ';', ':']);
        push_unique(&mut signals.links, url.to_string());
    }
    for cap in MENTION_RE.captures_iter(text) {
        push_unique(&mut signals.mentions, cap[1].to_lowercase());
    }
    signals
}

/// Classify one raw history item from `conversation`.
pub fn classify(item: &RawItem, conversation: &ConversationRecord) -> CanonicalMessage {
    let media = item.media.as_ref();
    let category = categorize(media);
    let text = item
        .message
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let signals = match (&item.message, &text) {
        (Some(raw), Some(_)) => scan_text(raw, &item.entities),
        _ => scan_text("", &[]),
    };
    let mut links = signals.links;
    if let Some(url) = media.and_then(|m| m.webpage.as_ref()).and_then(|w| w.url.clone()) {
        push_unique(&mut links, url);
    }

    let (body, caption) = if category == Category::Text {
        (text, None)
    } else {
        (None, text)
    };
    let attachments = attachments_for(media, category);

    CanonicalMessage {
        message_id: item.id,
        conversation_id: conversation.id,
        sender: item.sender.as_ref().map(participant_from),
        sent_at: item.date,
        body,
        caption,
        category,
        has_attachment: !attachments.is_empty(),
        has_link: !links.is_empty(),
        has_sticker: category == Category::Sticker,
        has_mention: !signals.mentions.is_empty(),
        link: links.into_iter().next(),
        deep_link: deep_link(conversation, item.id),
        tags: signals.tags,
        mentions: signals.mentions,
        grouped_id: item.grouped_id,
        reply_to_message_id: item.reply_to_message_id,
        forwarded_from: item.forwarded_from.clone(),
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grouplog_client::{RawGeo, RawPhoto, RawPoll, RawWebPage};

    fn conversation(handle: Option<&str>) -> ConversationRecord {
        ConversationRecord {
            id: -1001234567890,
            title: "Test".to_string(),
            handle: handle.map(str::to_string),
            last_fetch_position: None,
        }
    }

    fn item(text: Option<&str>, media: Option<RawMedia>) -> RawItem {
        RawItem {
            id: 55,
            date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            sender: Some(RawUser {
                id: 9,
                username: Some("ferris".to_string()),
                ..Default::default()
            }),
            message: text.map(str::to_string),
            entities: vec![],
            media,
            grouped_id: None,
            reply_to_message_id: None,
            forwarded_from: None,
        }
    }

    fn document(attributes: Vec<DocumentAttribute>) -> RawDocument {
        RawDocument {
            id: "doc1".to_string(),
            mime_type: Some("video/mp4".to_string()),
            size: Some(1000),
            attributes,
        }
    }

    #[test]
    fn test_plain_text() {
        let msg = classify(&item(Some("hello world"), None), &conversation(None));
        assert_eq!(msg.category, Category::Text);
        assert_eq!(msg.body.as_deref(), Some("hello world"));
        assert!(msg.caption.is_none());
        assert!(!msg.has_attachment);
        assert_eq!(msg.sender.unwrap().user_id, 9);
    }

    #[test]
    fn test_precedence() {
        let sticker_and_photo = RawMedia {
            photo: Some(RawPhoto {
                id: "p".to_string(),
                size: None,
            }),
            document: Some(document(vec![DocumentAttribute::Sticker { alt: None }])),
            ..Default::default()
        };
        assert_eq!(categorize(Some(&sticker_and_photo)), Category::Sticker);

        let poll_and_geo = RawMedia {
            poll: Some(RawPoll {
                question: "q".to_string(),
                answers: vec![],
                closed: false,
            }),
            geo: Some(RawGeo {
                lat: 0.0,
                long: 0.0,
                title: None,
                address: None,
            }),
            ..Default::default()
        };
        assert_eq!(categorize(Some(&poll_and_geo)), Category::Poll);

        let voice = RawMedia {
            document: Some(document(vec![
                DocumentAttribute::Video {
                    round_message: true,
                    duration: None,
                },
                DocumentAttribute::Audio {
                    voice: true,
                    duration: None,
                    title: None,
                    performer: None,
                },
            ])),
            ..Default::default()
        };
        assert_eq!(categorize(Some(&voice)), Category::Voice);

        let round = RawMedia {
            document: Some(document(vec![DocumentAttribute::Video {
                round_message: true,
                duration: Some(5),
            }])),
            ..Default::default()
        };
        assert_eq!(categorize(Some(&round)), Category::VideoNote);

        let video_with_photo = RawMedia {
            photo: Some(RawPhoto {
                id: "p".to_string(),
                size: None,
            }),
            document: Some(document(vec![DocumentAttribute::Video {
                round_message: false,
                duration: None,
            }])),
            ..Default::default()
        };
        assert_eq!(categorize(Some(&video_with_photo)), Category::Video);

        let plain_doc = RawMedia {
            document: Some(document(vec![DocumentAttribute::Filename {
                file_name: "a.pdf".to_string(),
            }])),
            ..Default::default()
        };
        assert_eq!(categorize(Some(&plain_doc)), Category::Document);
    }

    #[test]
    fn test_unknown_media_degrades() {
        let mut other = std::collections::BTreeMap::new();
        other.insert("dice".to_string(), serde_json::json!({"value": 6}));
        let media = RawMedia {
            other,
            ..Default::default()
        };
        let msg = classify(&item(Some("roll"), Some(media)), &conversation(None));
        assert_eq!(msg.category, Category::Unknown);
        assert_eq!(msg.caption.as_deref(), Some("roll"));

        let preview = RawMedia {
            webpage: Some(RawWebPage {
                url: Some("https://example.com".to_string()),
                title: None,
            }),
            ..Default::default()
        };
        let msg = classify(&item(Some("look"), Some(preview)), &conversation(None));
        assert_eq!(msg.category, Category::Text);
        assert!(msg.has_link);
    }

    #[test]
    fn test_hashtags_normalised_and_deduped() {
        let msg = classify(
            &item(Some("#Rust and #rust, also #Async_IO. not#tag"), None),
            &conversation(None),
        );
        assert_eq!(msg.tags, vec!["rust".to_string(), "async_io".to_string()]);
    }

    #[test]
    fn test_entities_use_utf16_offsets() {
        // "🦀 #Crab": the emoji is two UTF-16 units.
        let mut raw = item(Some("🦀 #Crab @Ferris_bot"), None);
        raw.entities = vec![
            RawEntity::Hashtag {
                offset: 3,
                length: 5,
            },
            RawEntity::Mention {
                offset: 9,
                length: 11,
            },
        ];
        let msg = classify(&raw, &conversation(None));
        assert_eq!(msg.tags, vec!["crab".to_string()]);
        assert_eq!(msg.mentions, vec!["ferris_bot".to_string()]);
        assert!(msg.has_mention);
    }

    #[test]
    fn test_links_detected() {
        let mut raw = item(Some("see https://example.com/a). and click here"), None);
        raw.entities = vec![RawEntity::TextUrl {
            offset: 34,
            length: 10,
            url: "https://docs.rs".to_string(),
        }];
        let msg = classify(&raw, &conversation(None));
        assert!(msg.has_link);
        assert_eq!(msg.link.as_deref(), Some("https://docs.rs"));

        let msg = classify(&item(Some("visit www.rust-lang.org"), None), &conversation(None));
        assert_eq!(msg.link.as_deref(), Some("www.rust-lang.org"));

        let msg = classify(&item(Some("no links here"), None), &conversation(None));
        assert!(!msg.has_link);
    }

    #[test]
    fn test_deep_links() {
        assert_eq!(
            deep_link(&conversation(Some("rustlang")), 55),
            "https://t.me/rustlang/55"
        );
        assert_eq!(
            deep_link(&conversation(None), 55),
            "https://t.me/c/1234567890/55"
        );
    }

    #[test]
    fn test_media_caption_and_attachments() {
        let media = RawMedia {
            document: Some(RawDocument {
                id: "d9".to_string(),
                mime_type: Some("audio/ogg".to_string()),
                size: Some(2048),
                attributes: vec![DocumentAttribute::Audio {
                    voice: true,
                    duration: Some(3),
                    title: None,
                    performer: None,
                }],
            }),
            ..Default::default()
        };
        let msg = classify(&item(Some("  listen #voice "), Some(media)), &conversation(None));
        assert_eq!(msg.category, Category::Voice);
        assert!(msg.body.is_none());
        assert_eq!(msg.caption.as_deref(), Some("listen #voice"));
        assert_eq!(msg.tags, vec!["voice".to_string()]);
        assert!(msg.has_attachment);
        assert_eq!(msg.attachments[0].file_name, "d9.ogg");
        assert_eq!(msg.attachments[0].category, Category::Voice);
    }

    #[test]
    fn test_sticker_flag_and_sanitised_names() {
        let media = RawMedia {
            document: Some(RawDocument {
                id: "s1".to_string(),
                mime_type: Some("image/webp".to_string()),
                size: None,
                attributes: vec![
                    DocumentAttribute::Sticker {
                        alt: Some("😀".to_string()),
                    },
                    DocumentAttribute::Filename {
                        file_name: "../../etc/passwd".to_string(),
                    },
                ],
            }),
            ..Default::default()
        };
        let msg = classify(&item(None, Some(media)), &conversation(None));
        assert!(msg.has_sticker);
        assert_eq!(msg.attachments[0].file_name, "_.._etc_passwd");
    }
}
