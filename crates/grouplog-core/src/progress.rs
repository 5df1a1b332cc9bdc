//! Progress reporting and cooperative cancellation.
//!
//! The [`Coordinator`] is threaded through every stage of a run. Stages
//! poll [`Coordinator::should_stop`] before issuing remote calls; the
//! orchestrator reports counts after each item. Host processes can follow
//! a run through the stdout protocol below:
//!
//! ```text
//! GROUPLOG_PROGRESS:{"conversation_id":1,"stage":"fetching","processed":3,...}
//! GROUPLOG_RESULT:{"type":"ingest","status":"completed","data":{...}}
//! ```

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Counting,
    Fetching,
    Reactions,
    Attachments,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// `None` while the conversation is still being resolved.
    pub conversation_id: Option<i64>,
    pub stage: Stage,
    pub processed: u64,
    pub skipped: u64,
    pub errored: u64,
    pub estimated_total: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Discards updates.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

/// Writes `GROUPLOG_PROGRESS:` lines to stdout.
pub struct StdoutProgress;

impl ProgressSink for StdoutProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        emit_progress(update);
    }
}

pub fn emit_progress(update: &ProgressUpdate) {
    if let Ok(json) = serde_json::to_string(update) {
        println!("GROUPLOG_PROGRESS:{}", json);
        let _ = std::io::stdout().flush();
    }
}

/// Emit a final result line for a host process to parse.
pub fn emit_result(result_type: &str, status: &str, data: serde_json::Value) {
    let payload = serde_json::json!({
        "type": result_type,
        "status": status,
        "data": data
    });
    println!("GROUPLOG_RESULT:{}", payload);
    let _ = std::io::stdout().flush();
}

/// Shared run context: cancellation signal, optional wall-clock budget and
/// the progress sink. Purely observational; no retry logic.
pub struct Coordinator {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    sink: Arc<dyn ProgressSink>,
}

impl Coordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            sink: Arc::new(NoProgress),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stop the run once `budget` has elapsed, checked between items.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.deadline = budget.map(|b| Instant::now() + b);
        self
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// True once no new remote call may be started.
    pub fn should_stop(&self) -> bool {
        self.is_cancellation_requested() || self.is_budget_exhausted()
    }

    pub fn report_progress(&self, update: ProgressUpdate) {
        self.sink.on_progress(&update);
    }
}
