//! Local relational store for ingested conversations.

pub mod model;
mod store;

pub use model::{
    AttachmentRef, CanonicalMessage, Category, ConversationRecord, FetchState, ItemErrorRecord,
    MediaFileRecord, MessageQuery, ParticipantRecord, ReactionRecord, RunCounts, RunStatus,
    StoredMessage, UpsertOutcome,
};
pub use store::Store;
