//! Conversation ingestion: pacing, pagination, classification and the
//! orchestrator that ties them to the store.

pub mod accounts;
pub mod attachments;
pub mod classifier;
pub mod config;
pub mod cursor;
pub mod error;
pub mod governor;
pub mod pipeline;
pub mod progress;
pub mod reactions;
pub mod remote;

pub use accounts::{AccountService, EnvOperator, OperatorIdentity, LOCAL_OPERATOR};
pub use attachments::{attachment_path, AttachmentPolicy};
pub use classifier::classify;
pub use config::{GroupLogPaths, Settings};
pub use cursor::{FetchCursor, FetchWindow};
pub use error::{IngestError, StageError};
pub use governor::{Channel, GuardDecision, GuardedActions, RateGovernor};
pub use pipeline::{HandleMode, IngestRequest, Ingestor, RunOutcome, RunSummary};
pub use progress::{
    emit_progress, emit_result, Coordinator, NoProgress, ProgressSink, ProgressUpdate, Stage,
    StdoutProgress,
};
pub use remote::{CallFailure, Remote, RetryPolicy};

pub use grouplog_auth::{AuthOutcome, AuthSecret, Challenge, SessionManager};
pub use grouplog_store::Store;
