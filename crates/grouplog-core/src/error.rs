use grouplog_auth::AuthError;
use grouplog_client::ApiError;
use thiserror::Error;

use crate::pipeline::RunSummary;
use crate::remote::CallFailure;

/// Failures that end an ingestion run or an account operation.
///
/// Item-level problems never surface here; they are counted and logged
/// and the run moves on.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot access conversation {conversation}: {reason}")]
    Access { conversation: String, reason: String },

    #[error("session for {account} has expired; sign in again")]
    AuthExpired { account: String },

    #[error("conversation {conversation_id} is already being ingested with {account}")]
    RunInProgress { conversation_id: i64, account: String },

    #[error("action refused: {0}")]
    GuardRefused(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    /// A run-fatal failure after the run got going; `summary` holds the
    /// counts reached before it.
    #[error(
        "{source} (after {} new, {} skipped, {} errored)",
        .summary.counts.processed,
        .summary.counts.skipped,
        .summary.counts.errored
    )]
    Aborted {
        summary: Box<RunSummary>,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// The failure itself, without the partial-run wrapper.
    pub fn root_cause(&self) -> &IngestError {
        match self {
            IngestError::Aborted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// What the run had done before it failed, when it got that far.
    pub fn partial_summary(&self) -> Option<&RunSummary> {
        match self {
            IngestError::Aborted { summary, .. } => Some(summary),
            _ => None,
        }
    }

    /// Fold a run-fatal provider error into the user-facing variant.
    pub fn from_api(err: ApiError, conversation: &str, account: &str) -> Self {
        match err {
            ApiError::Access(reason) => IngestError::Access {
                conversation: conversation.to_string(),
                reason,
            },
            ApiError::AuthExpired(_) => IngestError::AuthExpired {
                account: account.to_string(),
            },
            other => IngestError::Api(other),
        }
    }
}

/// Failure of a per-message sub-fetch (reactions, attachments).
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Call(#[from] CallFailure),

    #[error("file system: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl StageError {
    /// The stage gave up because the run is stopping, not because of a fault.
    pub fn is_stopped(&self) -> bool {
        matches!(self, StageError::Call(CallFailure::Stopped))
    }

    /// The provider kept throttling past the configured number of waits.
    pub fn is_throttled(&self) -> bool {
        matches!(self, StageError::Call(CallFailure::Api(ApiError::Throttled { .. })))
    }

    /// Fold a run-fatal stage failure into the run's error.
    pub fn into_ingest(self, conversation: &str, account: &str) -> IngestError {
        match self {
            StageError::Call(CallFailure::Api(e)) => IngestError::from_api(e, conversation, account),
            StageError::Call(CallFailure::Stopped) => IngestError::Store(anyhow::anyhow!("run stopped")),
            StageError::Io(e) => IngestError::Store(e.into()),
            StageError::Store(e) => IngestError::Store(e),
        }
    }

    /// Whether this ends the run rather than just the item.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            StageError::Call(CallFailure::Api(ApiError::AuthExpired(_))) => true,
            StageError::Store(_) => true,
            _ => false,
        }
    }
}
