use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use grouplog_auth::{AccountStatus, Credential, CredentialStore, SessionManager};
use grouplog_client::mock::{MockOp, MockPlatform};
use grouplog_client::{ApiError, RawConversation, RawItem, RawMedia, RawPhoto, RawReaction, RawUser};
use grouplog_core::{
    HandleMode, IngestError, IngestRequest, Ingestor, ProgressSink, ProgressUpdate, RunOutcome,
    Settings, Stage,
};
use grouplog_store::Store;
use tokio_util::sync::CancellationToken;

const CONVERSATION: i64 = -1001000;
const ACCOUNT: &str = "+15550100";

fn at(n: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + n * 600, 0).unwrap()
}

fn sender(id: i64) -> RawUser {
    RawUser {
        id,
        username: Some(format!("member{}", id)),
        ..Default::default()
    }
}

fn item(id: i64) -> RawItem {
    RawItem {
        id,
        date: at(id),
        sender: Some(sender(100 + id % 3)),
        message: Some(format!("update {} #rust", id)),
        entities: vec![],
        media: None,
        grouped_id: None,
        reply_to_message_id: None,
        forwarded_from: None,
    }
}

fn reaction(user: i64) -> RawReaction {
    RawReaction {
        user: sender(user),
        emoji: Some("🔥".to_string()),
        custom_emoji_id: None,
        date: None,
    }
}

/// No pacing, small pages.
fn quick_settings() -> Settings {
    Settings {
        primary_delay_secs: 0.0,
        reaction_delay_secs: 0.0,
        page_size: 3,
        transient_retries: 1,
        transient_backoff_secs: 0.0,
        ..Settings::default()
    }
}

struct Harness {
    platform: MockPlatform,
    sessions: Arc<SessionManager>,
    store: Store,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn new(count: i64) -> Self {
        Self::with_items((1..=count).map(item).collect()).await
    }

    async fn with_items(items: Vec<RawItem>) -> Self {
        let platform = MockPlatform::new();
        for id in items.iter().map(|i| i.id).filter(|id| id % 2 == 0) {
            platform.set_reactions(CONVERSATION, id, vec![reaction(100), reaction(101)]);
        }
        platform.add_conversation(
            RawConversation {
                id: CONVERSATION,
                title: "Rustaceans".to_string(),
                username: Some("rustaceans".to_string()),
                participants_count: Some(3),
            },
            items,
        );

        let dir = tempfile::tempdir().unwrap();
        let mut credentials = CredentialStore::load(&dir.path().join("accounts.json")).unwrap();
        let session = platform.issue_session(RawUser {
            id: 1,
            phone: Some(ACCOUNT.to_string()),
            ..Default::default()
        });
        credentials
            .upsert(Credential {
                account: ACCOUNT.to_string(),
                session,
                user_id: 1,
                username: None,
                created_at: Utc::now(),
                last_used_at: Utc::now(),
                status: Some(AccountStatus::Active),
                status_checked_at: None,
            })
            .unwrap();
        let sessions = Arc::new(SessionManager::new(Arc::new(platform.connector()), credentials));

        Self {
            platform,
            sessions,
            store: Store::in_memory().await.unwrap(),
            dir,
        }
    }

    fn ingestor(&self, settings: Settings) -> Ingestor {
        Ingestor::new(
            self.sessions.clone(),
            self.store.clone(),
            settings,
            self.dir.path().join("media"),
        )
    }
}

fn request() -> IngestRequest {
    IngestRequest::new(ACCOUNT, "@rustaceans")
}

#[tokio::test]
async fn rerun_inserts_nothing_new() {
    let h = Harness::new(10).await;
    let ingestor = h.ingestor(quick_settings());

    let first = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.counts.processed, 10);
    assert_eq!(first.estimated_total, Some(10));
    let reactions = h.store.reaction_count(CONVERSATION).await.unwrap();
    let tags = h.store.tag_count(CONVERSATION).await.unwrap();
    assert_eq!(reactions, 10);
    assert_eq!(tags, 10);

    let second = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(second.counts.processed, 0);

    // Walking everything again still adds nothing.
    let mut rescan = request();
    rescan.full_rescan = true;
    let third = ingestor.ingest(&rescan, CancellationToken::new()).await.unwrap();
    assert_eq!(third.counts.processed, 0);
    assert_eq!(third.counts.skipped, 10);
    assert_eq!(h.store.message_count(CONVERSATION).await.unwrap(), 10);
    assert_eq!(h.store.reaction_count(CONVERSATION).await.unwrap(), reactions);
    assert_eq!(h.store.tag_count(CONVERSATION).await.unwrap(), tags);
}

#[tokio::test]
async fn items_persist_in_order_and_position_tracks_last() {
    let h = Harness::new(8).await;
    let ingestor = h.ingestor(quick_settings());

    let summary = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(summary.last_fetch_position, Some(at(8)));
    let conversation = h.store.conversation(CONVERSATION).await.unwrap().unwrap();
    assert_eq!(conversation.last_fetch_position, Some(at(8)));

    // Reaction sub-fetches follow persistence order.
    let order: Vec<i64> = h
        .platform
        .calls()
        .into_iter()
        .filter(|c| c.op == MockOp::Reactions)
        .filter_map(|c| c.message_id)
        .collect();
    assert_eq!(order, (1..=8).collect::<Vec<_>>());

    let state = h.store.fetch_state(CONVERSATION, ACCOUNT).await.unwrap().unwrap();
    assert_eq!(state.cursor_message_id, Some(8));
}

// Real clock: the store's SQLite worker thread does not mix with paused time.
#[tokio::test]
async fn throttle_wait_replaces_configured_delay() {
    let h = Harness::new(6).await;
    let settings = Settings {
        primary_delay_secs: 0.5,
        reactions_enabled: false,
        ..quick_settings()
    };
    let ingestor = h.ingestor(settings);
    h.platform
        .fail_next(MockOp::HistoryPage, ApiError::Throttled { seconds: 1 });

    let summary = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(summary.counts.processed, 6);

    let pages: Vec<_> = h
        .platform
        .calls()
        .into_iter()
        .filter(|c| c.op == MockOp::HistoryPage)
        .map(|c| c.at)
        .collect();
    // Throttled, retried, then the next page.
    assert_eq!(pages.len(), 4);
    let retry_gap = pages[1] - pages[0];
    assert!(retry_gap >= Duration::from_secs(1));
    // The configured delay would have added another 500ms on top.
    assert!(retry_gap < Duration::from_millis(1450));
    assert!(pages[2] - pages[1] >= Duration::from_millis(500));
}

#[tokio::test]
async fn throttle_past_wait_limit_interrupts_without_errors() {
    let h = Harness::new(6).await;
    let settings = Settings {
        reactions_enabled: false,
        max_throttle_waits: 0,
        ..quick_settings()
    };
    let ingestor = h.ingestor(settings.clone());
    let platform = h.platform.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |update: &ProgressUpdate| {
        if update.stage == Stage::Fetching && update.processed == 3 {
            platform.fail_next(MockOp::HistoryPage, ApiError::Throttled { seconds: 600 });
        }
    });

    let summary = ingestor
        .with_progress(sink)
        .ingest(&request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Interrupted);
    assert_eq!(summary.counts.processed, 3);
    assert_eq!(summary.counts.errored, 0);
    assert!(h.store.item_errors(CONVERSATION).await.unwrap().is_empty());

    let resumed = h
        .ingestor(settings)
        .ingest(&request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.counts.processed, 3);
}

#[tokio::test]
async fn attachment_failure_is_isolated() {
    let mut with_photo = item(4);
    with_photo.message = Some("look".to_string());
    with_photo.media = Some(RawMedia {
        photo: Some(RawPhoto {
            id: "p4".to_string(),
            size: None,
        }),
        ..Default::default()
    });
    let items = (1..=6)
        .map(|id| if id == 4 { with_photo.clone() } else { item(id) })
        .collect();
    let h = Harness::with_items(items).await;
    h.platform.fail_file("p4");
    let ingestor = h.ingestor(quick_settings());

    let summary = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.counts.processed, 6);
    assert_eq!(summary.counts.errored, 1);
    assert!(h.store.message_exists(CONVERSATION, 4).await.unwrap());
    assert!(h.store.message_exists(CONVERSATION, 5).await.unwrap());

    let errors = h.store.item_errors(CONVERSATION).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message_id, Some(4));
    assert_eq!(errors[0].stage, "attachments");
}

#[tokio::test]
async fn cancellation_stops_at_item_boundary() {
    let h = Harness::new(10).await;
    let token = CancellationToken::new();
    let trigger = token.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |update: &ProgressUpdate| {
        if update.stage == Stage::Fetching && update.processed == 4 {
            trigger.cancel();
        }
    });
    let ingestor = h.ingestor(quick_settings()).with_progress(sink);

    let summary = ingestor.ingest(&request(), token).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.counts.processed, 4);
    assert_eq!(h.store.message_count(CONVERSATION).await.unwrap(), 4);

    // Nothing about item 5 went out.
    let calls = h.platform.calls();
    assert!(calls
        .iter()
        .filter(|c| c.op == MockOp::Reactions)
        .all(|c| c.message_id.unwrap_or_default() <= 4));
    assert_eq!(
        calls.iter().filter(|c| c.op == MockOp::HistoryPage).count(),
        2
    );

    // A fresh run picks up where the cancelled one stopped.
    let resumed = h
        .ingestor(quick_settings())
        .ingest(&request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.counts.processed, 6);
    assert_eq!(resumed.counts.skipped, 0);
}

#[tokio::test]
async fn safety_margin_rescan_adds_no_duplicates() {
    let h = Harness::new(10).await;
    let ingestor = h.ingestor(quick_settings());
    ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();

    let mut margin = request();
    margin.since = Some(at(10) - chrono::Duration::days(1));
    let summary = ingestor.ingest(&margin, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.counts.processed, 0);
    assert_eq!(summary.counts.skipped, 10);
    assert_eq!(h.store.message_count(CONVERSATION).await.unwrap(), 10);
    assert_eq!(h.store.reaction_count(CONVERSATION).await.unwrap(), 10);
}

#[tokio::test]
async fn resumes_after_stored_position() {
    let h = Harness::new(10).await;
    let ingestor = h.ingestor(quick_settings());

    let mut first = request();
    first.until = Some(at(7));
    let summary = ingestor.ingest(&first, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.counts.processed, 7);
    assert_eq!(summary.last_fetch_position, Some(at(7)));

    let summary = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(summary.counts.processed, 3);
    assert_eq!(summary.counts.skipped, 0);

    let mut again = request();
    again.since = Some(at(8));
    let summary = ingestor.ingest(&again, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.counts.processed, 0);
    assert_eq!(summary.counts.skipped, 3);
}

#[tokio::test]
async fn access_loss_ends_the_run() {
    let h = Harness::new(3).await;
    let ingestor = h.ingestor(quick_settings());

    let mut missing = request();
    missing.conversation = "@nowhere".to_string();
    let err = ingestor.ingest(&missing, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, IngestError::Access { .. }));

    h.platform
        .fail_next(MockOp::HistoryPage, ApiError::Access("CHANNEL_PRIVATE".to_string()));
    let err = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.root_cause(), IngestError::Access { .. }));
    let state = h.store.fetch_state(CONVERSATION, ACCOUNT).await.unwrap().unwrap();
    assert_eq!(state.status, Some(grouplog_store::RunStatus::Failed));
}

#[tokio::test]
async fn access_loss_mid_run_keeps_partial_counts() {
    let h = Harness::new(6).await;
    let platform = h.platform.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |update: &ProgressUpdate| {
        if update.stage == Stage::Fetching && update.processed == 3 {
            platform.fail_next(MockOp::HistoryPage, ApiError::Access("CHANNEL_PRIVATE".to_string()));
        }
    });
    let ingestor = h.ingestor(quick_settings()).with_progress(sink);

    let err = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.root_cause(), IngestError::Access { .. }));
    let summary = err.partial_summary().expect("partial summary");
    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.counts.processed, 3);
    assert_eq!(summary.reactions_stored, 2);
    assert_eq!(summary.last_fetch_position, Some(at(3)));
    assert!(err.to_string().contains("after 3 new"));
    assert_eq!(h.store.message_count(CONVERSATION).await.unwrap(), 3);
}

#[tokio::test]
async fn stages_follow_the_run() {
    let mut with_photo = item(2);
    with_photo.media = Some(RawMedia {
        photo: Some(RawPhoto {
            id: "p2".to_string(),
            size: None,
        }),
        ..Default::default()
    });
    let h = Harness::with_items(vec![item(1), with_photo]).await;
    h.platform.fail_file("p2");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |update: &ProgressUpdate| {
        recorder.lock().unwrap().push((update.stage, update.conversation_id));
    });
    let ingestor = h.ingestor(quick_settings()).with_progress(sink);

    ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    let seen = seen.lock().unwrap().clone();
    let stages: Vec<Stage> = seen.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Resolving,
            Stage::Counting,
            Stage::Reactions,
            Stage::Fetching,
            Stage::Reactions,
            Stage::Attachments,
            Stage::Fetching,
            Stage::Finished,
        ]
    );
    assert_eq!(seen[0].1, None);
    assert!(seen[1..].iter().all(|(_, id)| *id == Some(CONVERSATION)));
}

#[tokio::test]
async fn expired_session_marks_account() {
    let h = Harness::new(3).await;
    let session = h.sessions.credential(ACCOUNT).await.unwrap().session;
    h.platform.revoke_session(&session);
    let ingestor = h.ingestor(quick_settings());

    let err = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, IngestError::AuthExpired { .. }));
    let credential = h.sessions.credential(ACCOUNT).await.unwrap();
    assert_eq!(credential.status, Some(AccountStatus::Expired));
}

#[tokio::test]
async fn handle_modes_manage_connections() {
    let h = Harness::new(3).await;
    let ingestor = h.ingestor(quick_settings());

    ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(h.platform.open_connections(), 0);

    let mut primary = request();
    primary.handle_mode = HandleMode::Primary;
    primary.full_rescan = true;
    ingestor.ingest(&primary, CancellationToken::new()).await.unwrap();
    assert_eq!(h.platform.open_connections(), 1);
}

#[tokio::test]
async fn concurrent_run_on_same_pair_is_refused() {
    let h = Harness::new(9).await;
    let settings = Settings {
        primary_delay_secs: 0.1,
        reactions_enabled: false,
        ..quick_settings()
    };
    let ingestor = h.ingestor(settings);

    let (first, second) = (request(), request());
    let (a, b) = tokio::join!(
        ingestor.ingest(&first, CancellationToken::new()),
        ingestor.ingest(&second, CancellationToken::new()),
    );
    let refused = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(IngestError::RunInProgress { .. })))
        .count();
    assert_eq!(refused, 1);
    assert_eq!(h.store.message_count(CONVERSATION).await.unwrap(), 9);
}

#[tokio::test]
async fn run_budget_stops_between_items() {
    let h = Harness::new(10).await;
    let settings = Settings {
        primary_delay_secs: 0.3,
        reactions_enabled: false,
        page_size: 1,
        run_budget_secs: Some(1),
        ..quick_settings()
    };
    let ingestor = h.ingestor(settings);

    let summary = ingestor.ingest(&request(), CancellationToken::new()).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::BudgetExhausted);
    assert!(summary.counts.processed < 10);
    assert_eq!(
        h.store.message_count(CONVERSATION).await.unwrap() as u64,
        summary.counts.processed
    );
}
