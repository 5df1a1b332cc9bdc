//! Forward-only pagination over a conversation's history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use grouplog_client::{PageRequest, RawItem};
use tracing::{debug, warn};

use crate::governor::Channel;
use crate::remote::{CallFailure, Remote};

/// Window for one pagination pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchWindow {
    /// Inclusive lower bound on item dates.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on item dates.
    pub until: Option<DateTime<Utc>>,
    /// Items at or before this (date, id) position were already ingested
    /// and are passed over silently.
    pub resume_after: Option<(DateTime<Utc>, i64)>,
}

/// Lazy, finite, oldest-first sequence of history items.
///
/// Pages are requested only when the buffer runs dry, and never once the
/// coordinator says to stop. Restarting means building a new cursor with
/// an updated window.
pub struct FetchCursor<'a> {
    remote: Remote<'a>,
    conversation_id: i64,
    window: FetchWindow,
    page_size: u32,
    offset_id: Option<i64>,
    buffer: VecDeque<RawItem>,
    exhausted: bool,
    pages: u32,
}

impl<'a> FetchCursor<'a> {
    pub fn paginate(
        remote: Remote<'a>,
        conversation_id: i64,
        window: FetchWindow,
        page_size: u32,
    ) -> Self {
        Self {
            remote,
            conversation_id,
            window,
            page_size: page_size.max(1),
            offset_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
            pages: 0,
        }
    }

    /// Approximate number of items in the window. Best effort: any failure
    /// other than a run-fatal one yields `None`.
    pub async fn estimate_total(&self) -> Result<Option<u64>, CallFailure> {
        let (since, until) = (self.window.since, self.window.until);
        let api = self.remote.api;
        let conversation_id = self.conversation_id;
        let result = self
            .remote
            .call(Channel::Primary, || api.history_count(conversation_id, since, until))
            .await;

        match result {
            Ok(count) => Ok(count),
            Err(CallFailure::Api(e)) if e.is_fatal_to_run() => Err(CallFailure::Api(e)),
            Err(CallFailure::Stopped) => Err(CallFailure::Stopped),
            Err(CallFailure::Api(e)) => {
                warn!(conversation_id = self.conversation_id, "count unavailable: {}", e);
                Ok(None)
            }
        }
    }

    fn already_ingested(&self, item: &RawItem) -> bool {
        self.window
            .resume_after
            .is_some_and(|(at, id)| (item.date, item.id) <= (at, id))
    }

    fn past_until(&self, item: &RawItem) -> bool {
        self.window.until.is_some_and(|until| item.date > until)
    }

    fn before_since(&self, item: &RawItem) -> bool {
        self.window.since.is_some_and(|since| item.date < since)
    }

    /// Next item, or `None` when the window is exhausted or the run has
    /// been asked to stop.
    pub async fn next(&mut self) -> Result<Option<RawItem>, CallFailure> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                if self.past_until(&item) {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Ok(None);
                }
                if self.before_since(&item) || self.already_ingested(&item) {
                    continue;
                }
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            if self.remote.coordinator.should_stop() {
                debug!(conversation_id = self.conversation_id, "stop requested, not fetching next page");
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<(), CallFailure> {
        let request = PageRequest {
            since: self.window.since,
            until: self.window.until,
            offset_id: self.offset_id,
            limit: self.page_size,
        };
        let api = self.remote.api;
        let conversation_id = self.conversation_id;
        let page = match self
            .remote
            .call(Channel::Primary, || api.history_page(conversation_id, &request))
            .await
        {
            Ok(page) => page,
            Err(CallFailure::Stopped) => {
                self.exhausted = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.pages += 1;

        debug!(
            conversation_id,
            page = self.pages,
            items = page.len(),
            "history page"
        );
        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        match page.iter().map(|i| i.id).max() {
            Some(last) if Some(last) > self.offset_id => self.offset_id = Some(last),
            Some(_) => {
                // The page did not move us forward; stop rather than loop.
                warn!(conversation_id, "history page did not advance, stopping");
                self.exhausted = true;
            }
            None => self.exhausted = true,
        }

        let mut page = page;
        page.sort_by_key(|i| (i.date, i.id));
        self.buffer.extend(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::TimeZone;
    use grouplog_client::mock::{MockOp, MockPlatform};
    use grouplog_client::{ApiError, Connector, MessagingApi, RawConversation, RawUser};
    use tokio_util::sync::CancellationToken;

    use crate::governor::RateGovernor;
    use crate::progress::Coordinator;
    use crate::remote::RetryPolicy;

    fn at(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap()
    }

    fn items(n: i64) -> Vec<RawItem> {
        (1..=n)
            .map(|i| RawItem {
                id: i,
                date: at(i),
                sender: None,
                message: Some(format!("item {}", i)),
                entities: vec![],
                media: None,
                grouped_id: None,
                reply_to_message_id: None,
                forwarded_from: None,
            })
            .collect()
    }

    async fn setup(n: i64) -> (MockPlatform, Arc<dyn MessagingApi>) {
        let platform = MockPlatform::new();
        platform.add_conversation(
            RawConversation {
                id: 1,
                title: "c".to_string(),
                ..Default::default()
            },
            items(n),
        );
        let session = platform.issue_session(RawUser {
            id: 1,
            ..Default::default()
        });
        let api = platform.connector().open(Some(&session));
        api.connect().await.unwrap();
        (platform, api)
    }

    async fn drain(cursor: &mut FetchCursor<'_>) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            ids.push(item.id);
        }
        ids
    }

    fn remote<'a>(
        api: &'a dyn MessagingApi,
        governor: &'a RateGovernor,
        policy: &'a RetryPolicy,
        coordinator: &'a Coordinator,
    ) -> Remote<'a> {
        Remote {
            api,
            governor,
            policy,
            coordinator,
        }
    }

    fn no_delay() -> RateGovernor {
        RateGovernor::with_delays([(Channel::Primary, Duration::ZERO)])
    }

    #[tokio::test]
    async fn test_pages_through_in_order() {
        let (platform, api) = setup(7).await;
        let governor = no_delay();
        let policy = RetryPolicy::default();
        let coordinator = Coordinator::new(CancellationToken::new());
        let mut cursor = FetchCursor::paginate(
            remote(api.as_ref(), &governor, &policy, &coordinator),
            1,
            FetchWindow::default(),
            3,
        );

        assert_eq!(cursor.estimate_total().await.unwrap(), Some(7));
        assert_eq!(drain(&mut cursor).await, vec![1, 2, 3, 4, 5, 6, 7]);
        // 3 + 3 + 1, the short page ends it.
        assert_eq!(platform.count_calls(MockOp::HistoryPage), 3);
    }

    #[tokio::test]
    async fn test_window_and_resume_position() {
        let (_platform, api) = setup(10).await;
        let governor = no_delay();
        let policy = RetryPolicy::default();
        let coordinator = Coordinator::new(CancellationToken::new());
        let window = FetchWindow {
            since: Some(at(3)),
            until: Some(at(8)),
            resume_after: Some((at(5), 5)),
        };
        let mut cursor = FetchCursor::paginate(
            remote(api.as_ref(), &governor, &policy, &coordinator),
            1,
            window,
            2,
        );
        assert_eq!(drain(&mut cursor).await, vec![6, 7, 8]);
    }

    #[tokio::test]
    async fn test_count_failure_is_not_fatal() {
        let (platform, api) = setup(2).await;
        platform.fail_next(
            MockOp::HistoryCount,
            ApiError::Rejected {
                status: 400,
                message: "nope".to_string(),
            },
        );
        let governor = no_delay();
        let policy = RetryPolicy::default();
        let coordinator = Coordinator::new(CancellationToken::new());
        let cursor = FetchCursor::paginate(
            remote(api.as_ref(), &governor, &policy, &coordinator),
            1,
            FetchWindow::default(),
            10,
        );
        assert_eq!(cursor.estimate_total().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stops_before_next_page_when_cancelled() {
        let (platform, api) = setup(6).await;
        let governor = no_delay();
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();
        let coordinator = Coordinator::new(token.clone());
        let mut cursor = FetchCursor::paginate(
            remote(api.as_ref(), &governor, &policy, &coordinator),
            1,
            FetchWindow::default(),
            3,
        );

        for expected in 1..=3 {
            assert_eq!(cursor.next().await.unwrap().unwrap().id, expected);
        }
        token.cancel();
        assert!(cursor.next().await.unwrap().is_none());
        assert_eq!(platform.count_calls(MockOp::HistoryPage), 1);
    }

    #[tokio::test]
    async fn test_access_error_propagates() {
        let (platform, api) = setup(2).await;
        platform.fail_next(
            MockOp::HistoryPage,
            ApiError::Access("CHANNEL_PRIVATE".to_string()),
        );
        let governor = no_delay();
        let policy = RetryPolicy::default();
        let coordinator = Coordinator::new(CancellationToken::new());
        let mut cursor = FetchCursor::paginate(
            remote(api.as_ref(), &governor, &policy, &coordinator),
            1,
            FetchWindow::default(),
            10,
        );
        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, CallFailure::Api(e) if e.is_fatal_to_run()));
    }
}
