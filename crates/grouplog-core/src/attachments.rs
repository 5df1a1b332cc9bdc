//! Attachment download policy and storage layout.
//!
//! Files land under
//! `{root}/{conversation_id}/{sender}/{YYYY-MM-DD}/{message_id}_{HHMMSS}/{file_name}`,
//! so a re-run computes the same path and skips files already on disk.
//! Photos get a locally rendered `{stem}_thumb.jpg`; videos use the
//! provider's preview when it has one.

use std::path::{Path, PathBuf};

use grouplog_store::{AttachmentRef, CanonicalMessage, Category, MediaFileRecord, Store};
use image::ImageFormat;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::StageError;
use crate::governor::Channel;
use crate::remote::Remote;

const THUMBNAIL_EDGE: u32 = 320;

/// Which attachments a run downloads.
#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    pub enabled: bool,
    pub photos: bool,
    pub videos: bool,
    pub documents: bool,
    pub audio: bool,
    pub voice: bool,
    pub max_size_bytes: u64,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Category,
    TooLarge,
}

impl AttachmentPolicy {
    pub fn from_settings(settings: &Settings, root: PathBuf) -> Self {
        let a = &settings.attachments;
        Self {
            enabled: a.enabled,
            photos: a.photos,
            videos: a.videos,
            documents: a.documents,
            audio: a.audio,
            voice: a.voice,
            max_size_bytes: a.max_size_bytes,
            root,
        }
    }

    /// `Ok(())` when the attachment should be downloaded.
    pub fn check(&self, attachment: &AttachmentRef) -> Result<(), SkipReason> {
        if !self.enabled {
            return Err(SkipReason::Disabled);
        }
        let wanted = match attachment.category {
            Category::Photo => self.photos,
            Category::Video | Category::VideoNote => self.videos,
            Category::Document => self.documents,
            Category::Audio => self.audio,
            Category::Voice => self.voice,
            _ => false,
        };
        if !wanted {
            return Err(SkipReason::Category);
        }
        // Unknown sizes are attempted.
        if attachment.size.is_some_and(|size| size > self.max_size_bytes) {
            return Err(SkipReason::TooLarge);
        }
        Ok(())
    }
}

/// Deterministic on-disk location for one attachment of `message`.
pub fn attachment_path(root: &Path, message: &CanonicalMessage, file_name: &str) -> PathBuf {
    let sender = message
        .sender
        .as_ref()
        .map(|s| s.handle_or_id())
        .unwrap_or_else(|| "unknown".to_string());
    root.join(message.conversation_id.to_string())
        .join(sender)
        .join(message.sent_at.format("%Y-%m-%d").to_string())
        .join(format!(
            "{}_{}",
            message.message_id,
            message.sent_at.format("%H%M%S")
        ))
        .join(file_name)
}

/// `photo_1.jpg` → `photo_1_thumb.jpg`, next to the original.
pub fn thumbnail_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{}_thumb.jpg", stem))
}

/// Per-message result. Failures are per attachment and never stop the
/// siblings.
#[derive(Debug, Default)]
pub struct AttachmentReport {
    pub downloaded: Vec<MediaFileRecord>,
    pub already_present: usize,
    pub skipped: usize,
    pub failures: Vec<(String, StageError)>,
    /// The run stopped before every attachment was handled.
    pub interrupted: bool,
    /// The provider kept throttling past the wait limit; the rest were not tried.
    pub throttled: bool,
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn present_on_disk(path: &Path, expected: Option<u64>) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && expected.map_or(true, |size| meta.len() == size),
        Err(_) => false,
    }
}

fn render_thumbnail(bytes: &[u8], target: &Path) -> anyhow::Result<()> {
    let image = image::load_from_memory(bytes)?;
    image
        .thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE)
        .to_rgb8()
        .save_with_format(target, ImageFormat::Jpeg)?;
    Ok(())
}

/// Best effort; a missing preview never fails the attachment.
async fn make_thumbnail(
    remote: &Remote<'_>,
    message: &CanonicalMessage,
    attachment: &AttachmentRef,
    path: &Path,
) -> Option<PathBuf> {
    let target = thumbnail_path(path);
    if present_on_disk(&target, None).await {
        return Some(target);
    }

    match attachment.category {
        Category::Photo => {
            let source = path.to_path_buf();
            let out = target.clone();
            let rendered = tokio::task::spawn_blocking(move || {
                let bytes = std::fs::read(&source)?;
                render_thumbnail(&bytes, &out)
            })
            .await;
            match rendered {
                Ok(Ok(())) => Some(target),
                Ok(Err(e)) => {
                    warn!(file_id = %attachment.file_id, "thumbnail failed: {}", e);
                    None
                }
                Err(e) => {
                    warn!(file_id = %attachment.file_id, "thumbnail task failed: {}", e);
                    None
                }
            }
        }
        Category::Video | Category::VideoNote => {
            let api = remote.api;
            let (conversation_id, message_id) = (message.conversation_id, message.message_id);
            let file_id = attachment.file_id.as_str();
            match remote
                .call(Channel::Media, || {
                    api.download_thumbnail(conversation_id, message_id, file_id)
                })
                .await
            {
                Ok(Some(bytes)) => match write_atomic(&target, &bytes).await {
                    Ok(()) => Some(target),
                    Err(e) => {
                        warn!(file_id, "writing thumbnail failed: {}", e);
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    debug!(file_id, "no provider thumbnail: {}", e);
                    None
                }
            }
        }
        _ => None,
    }
}

async fn fetch_one(
    remote: &Remote<'_>,
    store: &Store,
    message: &CanonicalMessage,
    attachment: &AttachmentRef,
    root: &Path,
) -> Result<(MediaFileRecord, bool), StageError> {
    let path = attachment_path(root, message, &attachment.file_name);
    let present = present_on_disk(&path, attachment.size).await;

    let size = if present {
        debug!(path = %path.display(), "attachment already on disk");
        attachment.size
    } else {
        let api = remote.api;
        let (conversation_id, message_id) = (message.conversation_id, message.message_id);
        let file_id = attachment.file_id.as_str();
        let bytes = remote
            .call(Channel::Media, || api.download(conversation_id, message_id, file_id))
            .await?;
        write_atomic(&path, &bytes).await?;
        Some(bytes.len() as u64)
    };

    let thumbnail = make_thumbnail(remote, message, attachment, &path).await;
    let record = MediaFileRecord {
        conversation_id: message.conversation_id,
        message_id: message.message_id,
        file_id: attachment.file_id.clone(),
        path: path.to_string_lossy().into_owned(),
        size,
        mime_type: attachment.mime_type.clone(),
        category: attachment.category,
        thumbnail_path: thumbnail.map(|p| p.to_string_lossy().into_owned()),
    };
    store.record_media_file(&record).await?;
    Ok((record, present))
}

/// Download every eligible attachment on `message`.
///
/// Only run-fatal failures (expired session, store errors) come back as
/// `Err`; everything else is collected in the report.
pub async fn fetch_attachments(
    remote: &Remote<'_>,
    store: &Store,
    message: &CanonicalMessage,
    policy: &AttachmentPolicy,
) -> Result<AttachmentReport, StageError> {
    let mut report = AttachmentReport::default();

    for attachment in &message.attachments {
        if let Err(reason) = policy.check(attachment) {
            debug!(file_id = %attachment.file_id, ?reason, "attachment skipped");
            report.skipped += 1;
            continue;
        }
        if remote.coordinator.should_stop() {
            report.interrupted = true;
            break;
        }

        match fetch_one(remote, store, message, attachment, &policy.root).await {
            Ok((_, true)) => report.already_present += 1,
            Ok((record, false)) => {
                info!(
                    message_id = message.message_id,
                    path = %record.path,
                    "attachment saved"
                );
                report.downloaded.push(record);
            }
            Err(e) if e.is_stopped() => {
                report.interrupted = true;
                break;
            }
            Err(e) if e.is_run_fatal() => return Err(e),
            Err(e) if e.is_throttled() => {
                warn!(
                    message_id = message.message_id,
                    "attachments throttled past the wait limit"
                );
                report.throttled = true;
                break;
            }
            Err(e) => {
                warn!(
                    message_id = message.message_id,
                    file_id = %attachment.file_id,
                    "attachment failed: {}",
                    e
                );
                report.failures.push((attachment.file_id.clone(), e));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use grouplog_client::mock::{MockOp, MockPlatform};
    use grouplog_client::{
        Connector, DocumentAttribute, MessagingApi, RawConversation, RawDocument, RawItem, RawMedia,
        RawPhoto, RawUser,
    };
    use grouplog_store::ConversationRecord;
    use tokio_util::sync::CancellationToken;

    use crate::classifier::classify;
    use crate::governor::RateGovernor;
    use crate::progress::Coordinator;
    use crate::remote::RetryPolicy;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(640, 480, image::Rgb([200, 10, 10]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn conversation() -> ConversationRecord {
        ConversationRecord {
            id: 5,
            title: "c".to_string(),
            handle: Some("rustaceans".to_string()),
            last_fetch_position: None,
        }
    }

    fn item(id: i64, media: RawMedia) -> RawItem {
        RawItem {
            id,
            date: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 30).unwrap(),
            sender: Some(RawUser {
                id: 9,
                username: Some("ferris".to_string()),
                ..Default::default()
            }),
            message: None,
            entities: vec![],
            media: Some(media),
            grouped_id: None,
            reply_to_message_id: None,
            forwarded_from: None,
        }
    }

    fn photo_media(id: &str) -> RawMedia {
        RawMedia {
            photo: Some(RawPhoto {
                id: id.to_string(),
                size: None,
            }),
            ..Default::default()
        }
    }

    async fn setup() -> (MockPlatform, Arc<dyn MessagingApi>, Store) {
        let platform = MockPlatform::new();
        platform.add_conversation(
            RawConversation {
                id: 5,
                title: "c".to_string(),
                ..Default::default()
            },
            vec![],
        );
        let session = platform.issue_session(RawUser {
            id: 1,
            ..Default::default()
        });
        let api = platform.connector().open(Some(&session));
        api.connect().await.unwrap();
        (platform, api, Store::in_memory().await.unwrap())
    }

    fn policy(root: &Path) -> AttachmentPolicy {
        AttachmentPolicy::from_settings(&Settings::default(), root.to_path_buf())
    }

    #[test]
    fn test_path_layout() {
        let msg = classify(&item(42, photo_media("p1")), &conversation());
        let path = attachment_path(Path::new("/media"), &msg, "photo_p1.jpg");
        assert_eq!(
            path,
            PathBuf::from("/media/5/ferris/2024-03-09/42_140530/photo_p1.jpg")
        );
        assert_eq!(
            thumbnail_path(&path),
            PathBuf::from("/media/5/ferris/2024-03-09/42_140530/photo_p1_thumb.jpg")
        );
    }

    #[test]
    fn test_policy_filters() {
        let policy = AttachmentPolicy {
            voice: false,
            max_size_bytes: 100,
            ..policy(Path::new("/tmp"))
        };
        let mut att = AttachmentRef {
            file_id: "f".to_string(),
            file_name: "f.ogg".to_string(),
            mime_type: None,
            size: Some(10),
            category: Category::Voice,
        };
        assert_eq!(policy.check(&att), Err(SkipReason::Category));
        att.category = Category::VideoNote;
        assert_eq!(policy.check(&att), Ok(()));
        att.size = Some(101);
        assert_eq!(policy.check(&att), Err(SkipReason::TooLarge));
        att.category = Category::Sticker;
        att.size = None;
        assert_eq!(policy.check(&att), Err(SkipReason::Category));
    }

    #[tokio::test]
    async fn test_download_thumbnail_and_skip_existing() {
        let (platform, api, store) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        platform.add_file("p1", png_bytes());
        let msg = classify(&item(42, photo_media("p1")), &conversation());
        store.upsert_message(&msg).await.unwrap();

        let governor = RateGovernor::with_delays([]);
        let retry = RetryPolicy::default();
        let coordinator = Coordinator::new(CancellationToken::new());
        let remote = Remote {
            api: api.as_ref(),
            governor: &governor,
            policy: &retry,
            coordinator: &coordinator,
        };

        let report = fetch_attachments(&remote, &store, &msg, &policy(dir.path()))
            .await
            .unwrap();
        assert_eq!(report.downloaded.len(), 1);
        let record = &report.downloaded[0];
        assert!(Path::new(&record.path).exists());
        let thumb = record.thumbnail_path.as_ref().unwrap();
        let (w, h) = image::image_dimensions(thumb).unwrap();
        assert!(w <= THUMBNAIL_EDGE && h <= THUMBNAIL_EDGE);

        let again = fetch_attachments(&remote, &store, &msg, &policy(dir.path()))
            .await
            .unwrap();
        assert_eq!(again.already_present, 1);
        assert_eq!(platform.count_calls(MockOp::Download), 1);
        assert_eq!(store.media_files(5, 42).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let (platform, api, store) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        platform.fail_file("p1");
        platform.add_file("d1", b"%PDF-1.4".to_vec());
        let media = RawMedia {
            photo: Some(RawPhoto {
                id: "p1".to_string(),
                size: None,
            }),
            document: Some(RawDocument {
                id: "d1".to_string(),
                mime_type: Some("application/pdf".to_string()),
                size: Some(8),
                attributes: vec![DocumentAttribute::Filename {
                    file_name: "notes.pdf".to_string(),
                }],
            }),
            ..Default::default()
        };
        let msg = classify(&item(43, media), &conversation());
        store.upsert_message(&msg).await.unwrap();

        let governor = RateGovernor::with_delays([]);
        let retry = RetryPolicy {
            transient_retries: 1,
            backoff: std::time::Duration::ZERO,
            max_throttle_waits: 1,
        };
        let coordinator = Coordinator::new(CancellationToken::new());
        let remote = Remote {
            api: api.as_ref(),
            governor: &governor,
            policy: &retry,
            coordinator: &coordinator,
        };

        let report = fetch_attachments(&remote, &store, &msg, &policy(dir.path()))
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "p1");
        assert_eq!(report.downloaded.len(), 1);
        assert!(report.downloaded[0].path.ends_with("notes.pdf"));
    }
}
