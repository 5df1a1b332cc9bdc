//! Client side of the remote messaging platform.
//!
//! - [`MessagingApi`]: every remote operation the pipeline issues
//! - [`Connector`]: builds a client bound to one session blob
//! - [`HttpApi`]: the reqwest-backed gateway implementation
//! - [`ApiError`]: provider failures folded into actionable classes

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod error;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod types;

pub use error::ApiError;
pub use http::{HttpApi, HttpConnector};
pub use types::{
    AuthGrant, CodeRequest, DocumentAttribute, LoginToken, PageRequest, RawContact,
    RawConversation, RawDocument, RawEntity, RawGeo, RawItem, RawMedia, RawPhoto, RawPoll,
    RawReaction, RawUser, RawWebPage,
};

/// Remote operations, issued against one authenticated (or pending) session.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Open the underlying connection. Idempotent.
    async fn connect(&self) -> Result<(), ApiError>;

    /// Close the connection. The session blob stays valid.
    async fn disconnect(&self) -> Result<(), ApiError>;

    /// Lightweight round trip returning the signed-in user.
    async fn me(&self) -> Result<RawUser, ApiError>;

    /// Ask the platform to deliver a one-time code to `phone`.
    async fn send_code(&self, phone: &str) -> Result<CodeRequest, ApiError>;

    /// Exchange the one-time code. Fails with [`ApiError::PasswordRequired`]
    /// when the account has a second factor.
    async fn sign_in(
        &self,
        phone: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> Result<AuthGrant, ApiError>;

    /// Finish a sign-in that stopped at the second factor.
    async fn check_password(&self, password: &str) -> Result<AuthGrant, ApiError>;

    /// Start an out-of-band login; the token is scanned on another device.
    async fn export_login_token(&self) -> Result<LoginToken, ApiError>;

    /// Poll an exported token. Fails with [`ApiError::Pending`] until scanned.
    async fn accept_login_token(&self, token: &str) -> Result<AuthGrant, ApiError>;

    /// Invalidate the session on the platform side.
    async fn log_out(&self) -> Result<(), ApiError>;

    /// Resolve a numeric id, public handle or invite link to a conversation.
    async fn resolve_conversation(&self, reference: &str) -> Result<RawConversation, ApiError>;

    /// Best-effort item count in the window; `None` when the platform won't say.
    async fn history_count(
        &self,
        conversation_id: i64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<u64>, ApiError>;

    /// One page of history, oldest first.
    async fn history_page(
        &self,
        conversation_id: i64,
        request: &PageRequest,
    ) -> Result<Vec<RawItem>, ApiError>;

    async fn reactions(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> Result<Vec<RawReaction>, ApiError>;

    async fn download(
        &self,
        conversation_id: i64,
        message_id: i64,
        file_id: &str,
    ) -> Result<Vec<u8>, ApiError>;

    /// Provider-rendered preview for media we can't decode locally (video).
    async fn download_thumbnail(
        &self,
        conversation_id: i64,
        message_id: i64,
        file_id: &str,
    ) -> Result<Option<Vec<u8>>, ApiError>;
}

/// Factory for clients. `session` is `None` for a fresh handshake.
pub trait Connector: Send + Sync {
    fn open(&self, session: Option<&str>) -> Arc<dyn MessagingApi>;
}
