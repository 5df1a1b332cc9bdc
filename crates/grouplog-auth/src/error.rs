use grouplog_client::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("session for {0} has expired; sign in again")]
    Expired(String),

    #[error("login token has not been scanned yet")]
    Pending,

    #[error("this challenge does not accept that kind of secret")]
    ChallengeMismatch,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
