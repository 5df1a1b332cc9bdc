//! Account credentials and session handles.

pub mod credential;
pub mod error;
pub mod session;

pub use credential::{normalize_account, AccountStatus, Credential, CredentialStore};
pub use error::AuthError;
pub use session::{AuthOutcome, AuthSecret, Challenge, Handle, SessionManager};
