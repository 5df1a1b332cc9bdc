//! Ingestion orchestrator.
//!
//! One run ingests one conversation with one account: resolve, estimate,
//! then walk the history oldest first. Each item is classified, persisted,
//! enriched with reactions and attachments, and only then does the
//! resumption cursor move past it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use grouplog_auth::{normalize_account, AuthError, Handle, SessionManager};
use grouplog_client::ApiError;
use grouplog_store::{
    CanonicalMessage, ConversationRecord, RunCounts, RunStatus, Store, UpsertOutcome,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::attachments::{fetch_attachments, AttachmentPolicy};
use crate::classifier::classify;
use crate::config::Settings;
use crate::cursor::{FetchCursor, FetchWindow};
use crate::error::{IngestError, StageError};
use crate::governor::{Channel, RateGovernor};
use crate::progress::{Coordinator, NoProgress, ProgressSink, ProgressUpdate, Stage};
use crate::reactions::fetch_reactions;
use crate::remote::{CallFailure, Remote, RetryPolicy};

/// Which session a run goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandleMode {
    /// A single-use connection, closed when the run ends.
    #[default]
    Ephemeral,
    /// The account's long-lived cached connection.
    Primary,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub account: String,
    /// Numeric id, `@handle` or invite link.
    pub conversation: String,
    /// Overrides the stored resumption point.
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Walk the whole window again and redo every sub-fetch.
    pub full_rescan: bool,
    /// `None` follows the settings.
    pub reactions: Option<bool>,
    pub attachments: Option<bool>,
    pub handle_mode: HandleMode,
}

impl IngestRequest {
    pub fn new(account: impl Into<String>, conversation: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            conversation: conversation.into(),
            since: None,
            until: None,
            full_rescan: false,
            reactions: None,
            attachments: None,
            handle_mode: HandleMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    BudgetExhausted,
    /// A page could not be fetched after retries, or the provider kept
    /// throttling; resume later.
    Interrupted,
    /// Ended by access loss, an expired session or a store failure. Only
    /// seen on the summary inside [`IngestError::Aborted`].
    Failed,
}

impl RunOutcome {
    fn status(self) -> RunStatus {
        match self {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
            RunOutcome::BudgetExhausted => RunStatus::BudgetExhausted,
            RunOutcome::Interrupted => RunStatus::Interrupted,
            RunOutcome::Failed => RunStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.status().as_str()
    }
}

/// Returned for every run that got past resolution, including cancelled
/// ones; failed runs carry theirs in [`IngestError::Aborted`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// `None` when the run stopped before the conversation was resolved.
    pub conversation_id: Option<i64>,
    pub conversation_title: Option<String>,
    pub account: String,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub estimated_total: Option<u64>,
    pub reactions_stored: u64,
    pub attachments_saved: u64,
    pub last_fetch_position: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// How far one item's sub-fetches got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemProgress {
    Done,
    /// The run is stopping; the item is redone next time.
    Stopped,
    /// The provider would not lift a throttle; end the run and resume later.
    Throttled,
}

#[derive(Debug, Default)]
struct Tally {
    counts: RunCounts,
    estimated_total: Option<u64>,
    reactions_stored: u64,
    attachments_saved: u64,
}

struct RunContext<'a> {
    remote: Remote<'a>,
    conversation: ConversationRecord,
    account: &'a str,
    reference: &'a str,
    reactions: bool,
    attachments: AttachmentPolicy,
    /// Items at or before this position already had their sub-fetches done.
    done_through: Option<(DateTime<Utc>, i64)>,
}

/// Marks a (conversation, account) pair busy for the lifetime of a run.
struct PairLock<'a> {
    active: &'a Mutex<HashSet<(i64, String)>>,
    key: (i64, String),
}

impl Drop for PairLock<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct Ingestor {
    sessions: Arc<SessionManager>,
    store: Store,
    settings: Settings,
    media_root: PathBuf,
    sink: Arc<dyn ProgressSink>,
    active: Mutex<HashSet<(i64, String)>>,
}

impl Ingestor {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Store,
        settings: Settings,
        media_root: PathBuf,
    ) -> Self {
        Self {
            sessions,
            store,
            settings,
            media_root,
            sink: Arc::new(NoProgress),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run one ingestion. Item-level problems are counted in the summary;
    /// only access loss, an expired session, a concurrent run on the same
    /// pair or a store failure come back as `Err`.
    #[instrument(skip(self, request, cancel), fields(account = %request.account, conversation = %request.conversation))]
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary, IngestError> {
        let account = normalize_account(&request.account);
        let result = match request.handle_mode {
            HandleMode::Ephemeral => {
                self.sessions
                    .acquire_ephemeral(&account, |handle| self.run(handle, request, cancel))
                    .await
            }
            HandleMode::Primary => match self.sessions.acquire(&account).await {
                Ok(handle) => self.run(handle, request, cancel).await,
                Err(e) => Err(e.into()),
            },
        };

        let result = result.map_err(|e| match e {
            IngestError::Auth(AuthError::Expired(account)) => IngestError::AuthExpired { account },
            other => other,
        });
        if let Err(e) = &result {
            if matches!(e.root_cause(), IngestError::AuthExpired { .. }) {
                self.sessions.mark_expired(&account).await;
            }
        }
        result
    }

    fn lock_pair(&self, conversation_id: i64, account: &str) -> Result<PairLock<'_>, IngestError> {
        let key = (conversation_id, account.to_string());
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return Err(IngestError::RunInProgress {
                conversation_id,
                account: account.to_string(),
            });
        }
        Ok(PairLock {
            active: &self.active,
            key,
        })
    }

    async fn run(
        &self,
        handle: Handle,
        request: &IngestRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let coordinator = Coordinator::new(cancel)
            .with_sink(self.sink.clone())
            .with_budget(self.settings.run_budget());
        let governor = RateGovernor::new(&self.settings);
        let policy = RetryPolicy::from_settings(&self.settings);
        let remote = Remote {
            api: handle.api().as_ref(),
            governor: &governor,
            policy: &policy,
            coordinator: &coordinator,
        };
        let account = handle.account();
        let reference = request.conversation.as_str();

        coordinator.report_progress(ProgressUpdate {
            conversation_id: None,
            stage: Stage::Resolving,
            processed: 0,
            skipped: 0,
            errored: 0,
            estimated_total: None,
        });
        let unresolved = |outcome| RunSummary {
            conversation_id: None,
            conversation_title: None,
            account: account.to_string(),
            outcome,
            counts: RunCounts::default(),
            estimated_total: None,
            reactions_stored: 0,
            attachments_saved: 0,
            last_fetch_position: None,
            started_at,
            finished_at: Utc::now(),
        };
        let api = remote.api;
        let raw = match remote
            .call(Channel::Primary, || api.resolve_conversation(reference))
            .await
        {
            Ok(raw) => raw,
            Err(CallFailure::Stopped) => return Ok(unresolved(stop_outcome(&coordinator))),
            Err(CallFailure::Api(ApiError::Throttled { seconds })) => {
                warn!(seconds, "resolution still throttled after the wait limit");
                return Ok(unresolved(RunOutcome::Interrupted));
            }
            Err(CallFailure::Api(e)) => return Err(IngestError::from_api(e, reference, account)),
        };

        let conversation = ConversationRecord {
            id: raw.id,
            title: raw.title,
            handle: raw.username,
            last_fetch_position: None,
        };
        self.store.upsert_conversation(&conversation).await?;
        let conversation = self
            .store
            .conversation(conversation.id)
            .await?
            .unwrap_or(conversation);
        let _lock = self.lock_pair(conversation.id, account)?;

        let stored = self.store.fetch_state(conversation.id, account).await?;
        let stored_cursor = stored
            .as_ref()
            .and_then(|s| s.cursor_at.zip(s.cursor_message_id));
        let window = plan_window(request, stored_cursor, conversation.last_fetch_position);
        info!(
            conversation_id = conversation.id,
            since = ?window.since,
            until = ?window.until,
            "starting ingestion"
        );

        let mut attachments = AttachmentPolicy::from_settings(&self.settings, self.media_root.clone());
        if let Some(enabled) = request.attachments {
            attachments.enabled = enabled;
        }
        let ctx = RunContext {
            remote,
            conversation,
            account,
            reference,
            reactions: request.reactions.unwrap_or(self.settings.reactions_enabled),
            attachments,
            done_through: if request.full_rescan { None } else { stored_cursor },
        };

        self.store.begin_run(ctx.conversation.id, account).await?;
        let mut tally = Tally::default();
        let outcome = self.drive(&ctx, window, &mut tally).await;

        let status = match &outcome {
            Ok(outcome) => outcome.status(),
            Err(_) => RunStatus::Failed,
        };
        let finished = self
            .store
            .finish_run(ctx.conversation.id, account, tally.counts, status)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(conversation_id = ctx.conversation.id, "ingestion failed: {}", e);
                self.report(&ctx, Stage::Finished, &tally);
                // Best effort: the store may be what failed.
                let last_fetch_position = match self.store.conversation(ctx.conversation.id).await {
                    Ok(conversation) => conversation.and_then(|c| c.last_fetch_position),
                    Err(_) => None,
                };
                let summary =
                    summarize(&ctx, RunOutcome::Failed, &tally, last_fetch_position, started_at);
                return Err(IngestError::Aborted {
                    summary: Box::new(summary),
                    source: Box::new(e),
                });
            }
        };
        finished?;

        self.report(&ctx, Stage::Finished, &tally);
        let last_fetch_position = self
            .store
            .conversation(ctx.conversation.id)
            .await?
            .and_then(|c| c.last_fetch_position);
        info!(
            conversation_id = ctx.conversation.id,
            outcome = outcome.as_str(),
            processed = tally.counts.processed,
            skipped = tally.counts.skipped,
            errored = tally.counts.errored,
            "ingestion finished"
        );

        Ok(summarize(&ctx, outcome, &tally, last_fetch_position, started_at))
    }

    async fn drive(
        &self,
        ctx: &RunContext<'_>,
        window: FetchWindow,
        tally: &mut Tally,
    ) -> Result<RunOutcome, IngestError> {
        let coordinator = ctx.remote.coordinator;
        let conversation_id = ctx.conversation.id;
        let mut cursor = FetchCursor::paginate(ctx.remote, conversation_id, window, self.settings.page_size);

        self.report(ctx, Stage::Counting, tally);
        tally.estimated_total = match cursor.estimate_total().await {
            Ok(total) => total,
            Err(CallFailure::Stopped) => None,
            Err(CallFailure::Api(e)) => return Err(IngestError::from_api(e, ctx.reference, ctx.account)),
        };

        loop {
            if coordinator.should_stop() {
                break;
            }
            let item = match cursor.next().await {
                Ok(Some(item)) => item,
                Ok(None) | Err(CallFailure::Stopped) => break,
                Err(CallFailure::Api(e)) if e.is_fatal_to_run() => {
                    return Err(IngestError::from_api(e, ctx.reference, ctx.account));
                }
                Err(CallFailure::Api(ApiError::Throttled { seconds })) => {
                    warn!(
                        conversation_id,
                        seconds, "history still throttled after the wait limit, resume later"
                    );
                    return Ok(RunOutcome::Interrupted);
                }
                Err(CallFailure::Api(e)) => {
                    warn!(conversation_id, "history fetch gave up, resume later: {}", e);
                    tally.counts.errored += 1;
                    self.store
                        .log_item_error(conversation_id, None, "history", &e.to_string())
                        .await?;
                    return Ok(RunOutcome::Interrupted);
                }
            };

            let message = classify(&item, &ctx.conversation);
            let inserted = match self.store.upsert_message(&message).await? {
                UpsertOutcome::Inserted => {
                    tally.counts.processed += 1;
                    true
                }
                UpsertOutcome::SkippedDuplicate => {
                    debug!(conversation_id, message_id = item.id, "already stored");
                    tally.counts.skipped += 1;
                    false
                }
            };

            let pending = ctx.done_through.map_or(true, |done| (item.date, item.id) > done);
            let progress = if inserted || pending {
                self.sub_fetches(ctx, &message, tally).await?
            } else {
                ItemProgress::Done
            };
            // An unfinished item keeps the cursor behind it so the next run
            // redoes its sub-fetches.
            if progress == ItemProgress::Done {
                self.store
                    .advance_cursor(conversation_id, ctx.account, item.date, item.id)
                    .await?;
            }
            self.report(ctx, Stage::Fetching, tally);
            if progress == ItemProgress::Throttled {
                return Ok(RunOutcome::Interrupted);
            }
        }

        Ok(if coordinator.should_stop() {
            stop_outcome(coordinator)
        } else {
            RunOutcome::Completed
        })
    }

    /// Reactions then attachments for one message.
    async fn sub_fetches(
        &self,
        ctx: &RunContext<'_>,
        message: &CanonicalMessage,
        tally: &mut Tally,
    ) -> Result<ItemProgress, IngestError> {
        if ctx.reactions {
            self.report(ctx, Stage::Reactions, tally);
            match fetch_reactions(&ctx.remote, &self.store, message).await {
                Ok(summary) => tally.reactions_stored += summary.inserted as u64,
                Err(e) if e.is_stopped() => return Ok(ItemProgress::Stopped),
                Err(e) if e.is_throttled() => {
                    warn!(
                        message_id = message.message_id,
                        "reactions throttled past the wait limit"
                    );
                    return Ok(ItemProgress::Throttled);
                }
                Err(StageError::Call(CallFailure::Api(ApiError::PrivacyRestricted(reason)))) => {
                    debug!(message_id = message.message_id, "reactions hidden: {}", reason);
                }
                Err(e) => self.stage_failure(ctx, message, "reactions", e, tally).await?,
            }
        }

        if ctx.attachments.enabled && message.has_attachment {
            self.report(ctx, Stage::Attachments, tally);
            match fetch_attachments(&ctx.remote, &self.store, message, &ctx.attachments).await {
                Ok(report) => {
                    tally.attachments_saved += report.downloaded.len() as u64;
                    for (file_id, e) in report.failures {
                        tally.counts.errored += 1;
                        self.store
                            .log_item_error(
                                message.conversation_id,
                                Some(message.message_id),
                                "attachments",
                                &format!("{}: {}", file_id, e),
                            )
                            .await?;
                    }
                    if report.throttled {
                        return Ok(ItemProgress::Throttled);
                    }
                    if report.interrupted {
                        return Ok(ItemProgress::Stopped);
                    }
                }
                Err(e) => self.stage_failure(ctx, message, "attachments", e, tally).await?,
            }
        }
        Ok(ItemProgress::Done)
    }

    async fn stage_failure(
        &self,
        ctx: &RunContext<'_>,
        message: &CanonicalMessage,
        stage: &str,
        error: StageError,
        tally: &mut Tally,
    ) -> Result<(), IngestError> {
        if error.is_run_fatal() {
            return Err(error.into_ingest(ctx.reference, ctx.account));
        }
        warn!(message_id = message.message_id, stage, "sub-fetch failed: {}", error);
        tally.counts.errored += 1;
        self.store
            .log_item_error(
                message.conversation_id,
                Some(message.message_id),
                stage,
                &error.to_string(),
            )
            .await?;
        Ok(())
    }

    fn report(&self, ctx: &RunContext<'_>, stage: Stage, tally: &Tally) {
        ctx.remote.coordinator.report_progress(ProgressUpdate {
            conversation_id: Some(ctx.conversation.id),
            stage,
            processed: tally.counts.processed,
            skipped: tally.counts.skipped,
            errored: tally.counts.errored,
            estimated_total: tally.estimated_total,
        });
    }
}

fn summarize(
    ctx: &RunContext<'_>,
    outcome: RunOutcome,
    tally: &Tally,
    last_fetch_position: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
) -> RunSummary {
    RunSummary {
        conversation_id: Some(ctx.conversation.id),
        conversation_title: Some(ctx.conversation.title.clone()),
        account: ctx.account.to_string(),
        outcome,
        counts: tally.counts,
        estimated_total: tally.estimated_total,
        reactions_stored: tally.reactions_stored,
        attachments_saved: tally.attachments_saved,
        last_fetch_position,
        started_at,
        finished_at: Utc::now(),
    }
}

fn stop_outcome(coordinator: &Coordinator) -> RunOutcome {
    if coordinator.is_cancellation_requested() {
        RunOutcome::Cancelled
    } else {
        RunOutcome::BudgetExhausted
    }
}

/// Where a run starts.
///
/// An explicit `since` (or a full rescan) wins and re-walks already stored
/// items, counting them as skipped. Otherwise the pair's own cursor is
/// resumed silently; failing that, another account's progress on the same
/// conversation is used as an inclusive lower bound.
fn plan_window(
    request: &IngestRequest,
    stored_cursor: Option<(DateTime<Utc>, i64)>,
    last_fetch_position: Option<DateTime<Utc>>,
) -> FetchWindow {
    let until = request.until;
    if request.full_rescan || request.since.is_some() {
        return FetchWindow {
            since: request.since,
            until,
            resume_after: None,
        };
    }
    match stored_cursor {
        Some((at, id)) => FetchWindow {
            since: Some(at),
            until,
            resume_after: Some((at, id)),
        },
        None => FetchWindow {
            since: last_fetch_position,
            until,
            resume_after: None,
        },
    }
}
