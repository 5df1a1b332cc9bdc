//! Session management: one lazily-connected primary handle per account,
//! plus single-use ephemeral handles for validation and background fetches.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use grouplog_client::{
    ApiError, AuthGrant, Connector, LoginToken, MessagingApi, RawConversation,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::credential::{normalize_account, AccountStatus, Credential, CredentialStore};
use crate::AuthError;

/// An authenticated client bound to one account.
#[derive(Clone)]
pub struct Handle {
    account: String,
    api: Arc<dyn MessagingApi>,
}

impl Handle {
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn api(&self) -> &Arc<dyn MessagingApi> {
        &self.api
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("account", &self.account).finish()
    }
}

/// Pending handshake state returned by `begin_*` and consumed by `complete_auth`.
pub enum Challenge {
    /// A one-time code was sent to the phone.
    Code {
        account: String,
        phone_code_hash: String,
        client: Arc<dyn MessagingApi>,
    },
    /// The code was accepted; the second-factor password is still needed.
    Password {
        account: String,
        client: Arc<dyn MessagingApi>,
    },
    /// An out-of-band token waiting to be scanned by a signed-in device.
    Token {
        token: LoginToken,
        client: Arc<dyn MessagingApi>,
    },
}

impl Challenge {
    /// Scannable URL for token challenges.
    pub fn login_url(&self) -> Option<Result<String, ApiError>> {
        match self {
            Challenge::Token { token, .. } => Some(token.login_url()),
            _ => None,
        }
    }

    fn client(&self) -> &Arc<dyn MessagingApi> {
        match self {
            Challenge::Code { client, .. }
            | Challenge::Password { client, .. }
            | Challenge::Token { client, .. } => client,
        }
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::Code { account, .. } => write!(f, "Challenge::Code({})", account),
            Challenge::Password { account, .. } => write!(f, "Challenge::Password({})", account),
            Challenge::Token { token, .. } => {
                write!(f, "Challenge::Token(expires {})", token.expires_at)
            }
        }
    }
}

/// Secret supplied by the operator to answer a [`Challenge`].
#[derive(Debug, Clone)]
pub enum AuthSecret {
    /// One-time code, with the second-factor password if already known.
    Code {
        code: String,
        password: Option<String>,
    },
    Password(String),
    /// The token was scanned on another device.
    Scanned,
}

#[derive(Debug)]
pub enum AuthOutcome {
    Authorized(Credential),
    /// Prompt for the password and call `complete_auth` again with it.
    PasswordNeeded(Challenge),
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    store: Mutex<CredentialStore>,
    primaries: Mutex<HashMap<String, Handle>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, store: CredentialStore) -> Self {
        Self {
            connector,
            store: Mutex::new(store),
            primaries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn list_accounts(&self) -> Vec<Credential> {
        self.store.lock().await.list()
    }

    pub async fn credential(&self, account: &str) -> Option<Credential> {
        self.store.lock().await.get(account).cloned()
    }

    async fn require_credential(&self, account: &str) -> Result<Credential, AuthError> {
        self.credential(account)
            .await
            .ok_or_else(|| AuthError::UnknownAccount(account.to_string()))
    }

    /// Phase one of the code handshake: have the platform send a code.
    #[instrument(skip(self))]
    pub async fn begin_auth(&self, account: &str) -> Result<Challenge, AuthError> {
        let account = normalize_account(account);
        let client = self.connector.open(None);
        client.connect().await?;
        let request = client.send_code(&account).await?;
        info!("one-time code requested for {}", account);
        Ok(Challenge::Code {
            account,
            phone_code_hash: request.phone_code_hash,
            client,
        })
    }

    /// Phase one of the out-of-band handshake: export a scannable token.
    #[instrument(skip(self))]
    pub async fn begin_token_auth(&self) -> Result<Challenge, AuthError> {
        let client = self.connector.open(None);
        client.connect().await?;
        let token = client.export_login_token().await?;
        Ok(Challenge::Token { token, client })
    }

    /// Phase two of either handshake. Only a successful grant touches the
    /// credential store; failures leave prior state as it was.
    pub async fn complete_auth(
        &self,
        challenge: &Challenge,
        secret: AuthSecret,
    ) -> Result<AuthOutcome, AuthError> {
        let (account, grant) = match (challenge, secret) {
            (
                Challenge::Code {
                    account,
                    phone_code_hash,
                    client,
                },
                AuthSecret::Code { code, password },
            ) => match client.sign_in(account, phone_code_hash, &code).await {
                Ok(grant) => (account.clone(), grant),
                Err(ApiError::PasswordRequired) => match password {
                    Some(password) => (account.clone(), client.check_password(&password).await?),
                    None => {
                        debug!("second factor required for {}", account);
                        return Ok(AuthOutcome::PasswordNeeded(Challenge::Password {
                            account: account.clone(),
                            client: client.clone(),
                        }));
                    }
                },
                Err(e) => return Err(e.into()),
            },
            (Challenge::Password { account, client }, AuthSecret::Password(password)) => {
                (account.clone(), client.check_password(&password).await?)
            }
            (Challenge::Token { token, client }, AuthSecret::Scanned) => {
                match client.accept_login_token(&token.token).await {
                    Ok(grant) => (account_label(&grant), grant),
                    Err(ApiError::Pending) => return Err(AuthError::Pending),
                    Err(e) => return Err(e.into()),
                }
            }
            _ => return Err(AuthError::ChallengeMismatch),
        };

        let credential = self.persist_grant(&account, grant).await?;
        if let Err(e) = challenge.client().disconnect().await {
            warn!("failed to close handshake connection: {}", e);
        }
        Ok(AuthOutcome::Authorized(credential))
    }

    async fn persist_grant(&self, account: &str, grant: AuthGrant) -> Result<Credential, AuthError> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let created_at = store.get(account).map(|c| c.created_at).unwrap_or(now);
        let credential = Credential {
            account: account.to_string(),
            session: grant.session,
            user_id: grant.user.id,
            username: grant.user.username,
            created_at,
            last_used_at: now,
            status: Some(AccountStatus::Active),
            status_checked_at: Some(now),
        };
        store.upsert(credential.clone())?;
        drop(store);

        // A cached primary still carries the old session.
        if let Some(old) = self.primaries.lock().await.remove(&normalize_account(account)) {
            let _ = old.api.disconnect().await;
        }
        info!("account {} authorized", account);
        Ok(credential)
    }

    /// Primary handle for `account`, connected on first use and then cached.
    #[instrument(skip(self))]
    pub async fn acquire(&self, account: &str) -> Result<Handle, AuthError> {
        let key = normalize_account(account);
        let mut primaries = self.primaries.lock().await;
        if let Some(handle) = primaries.get(&key) {
            return Ok(handle.clone());
        }

        let credential = self.require_credential(&key).await?;
        let api = self.connector.open(Some(&credential.session));
        api.connect().await.map_err(|e| self.map_session_error(&key, e))?;
        let handle = Handle {
            account: key.clone(),
            api,
        };
        primaries.insert(key.clone(), handle.clone());
        drop(primaries);

        self.touch(&key).await;
        debug!("primary session connected for {}", key);
        Ok(handle)
    }

    /// Run `f` with a single-use handle. The connection is closed when `f`
    /// returns, whether it succeeded or not; the primary handle (if any)
    /// is left untouched.
    pub async fn acquire_ephemeral<F, Fut, T, E>(&self, account: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AuthError>,
    {
        let key = normalize_account(account);
        let credential = self.require_credential(&key).await.map_err(E::from)?;
        let api = self.connector.open(Some(&credential.session));
        if let Err(e) = api.connect().await {
            let _ = api.disconnect().await;
            return Err(E::from(self.map_session_error(&key, e)));
        }

        let handle = Handle {
            account: key.clone(),
            api: api.clone(),
        };
        let result = f(handle).await;

        if let Err(e) = api.disconnect().await {
            warn!("failed to close ephemeral session for {}: {}", key, e);
        }
        self.touch(&key).await;
        result
    }

    /// Resolve `reference` through a throwaway session so a primary
    /// connection for the same account is never disturbed.
    #[instrument(skip(self))]
    pub async fn validate_conversation(
        &self,
        account: &str,
        reference: &str,
    ) -> Result<RawConversation, AuthError> {
        self.acquire_ephemeral(account, |handle| async move {
            handle
                .api()
                .resolve_conversation(reference)
                .await
                .map_err(AuthError::from)
        })
        .await
    }

    /// Round-trip status check. Expected failure classes come back as
    /// status values; only an unknown account is an error.
    #[instrument(skip(self))]
    pub async fn check_status(&self, account: &str) -> Result<AccountStatus, AuthError> {
        let key = normalize_account(account);
        let credential = self.require_credential(&key).await?;
        let api = self.connector.open(Some(&credential.session));

        let outcome = match api.connect().await {
            Ok(()) => api.me().await.map(|_| ()),
            Err(e) => Err(e),
        };
        let _ = api.disconnect().await;

        let status = match outcome {
            Ok(()) => AccountStatus::Active,
            Err(ApiError::AuthExpired(_)) => AccountStatus::Expired,
            Err(e) => {
                debug!("status check for {} failed: {}", key, e);
                AccountStatus::Unavailable
            }
        };
        self.record_status(&key, status).await;
        Ok(status)
    }

    /// Flag an account whose session the platform has rejected.
    pub async fn mark_expired(&self, account: &str) {
        let key = normalize_account(account);
        self.record_status(&key, AccountStatus::Expired).await;
        if let Some(handle) = self.primaries.lock().await.remove(&key) {
            let _ = handle.api.disconnect().await;
        }
    }

    /// Close the primary connection for `account`, if open.
    pub async fn release(&self, account: &str) {
        if let Some(handle) = self.primaries.lock().await.remove(&normalize_account(account)) {
            if let Err(e) = handle.api.disconnect().await {
                warn!("failed to close session for {}: {}", handle.account, e);
            }
        }
    }

    /// Log the session out (best effort) and forget the credential.
    #[instrument(skip(self))]
    pub async fn remove_account(&self, account: &str) -> Result<(), AuthError> {
        let key = normalize_account(account);
        let credential = self.require_credential(&key).await?;
        self.release(&key).await;

        let api = self.connector.open(Some(&credential.session));
        let logout = match api.connect().await {
            Ok(()) => api.log_out().await,
            Err(e) => Err(e),
        };
        if let Err(e) = logout {
            warn!("log out for {} failed, removing locally anyway: {}", key, e);
        }
        let _ = api.disconnect().await;

        self.store.lock().await.remove(&key)?;
        info!("account {} removed", key);
        Ok(())
    }

    fn map_session_error(&self, account: &str, err: ApiError) -> AuthError {
        match err {
            ApiError::AuthExpired(_) => AuthError::Expired(account.to_string()),
            other => AuthError::Api(other),
        }
    }

    async fn touch(&self, account: &str) {
        let result = self
            .store
            .lock()
            .await
            .update(account, |c| c.last_used_at = Utc::now());
        if let Err(e) = result {
            warn!("failed to record last use of {}: {}", account, e);
        }
    }

    async fn record_status(&self, account: &str, status: AccountStatus) {
        let result = self.store.lock().await.update(account, |c| {
            c.status = Some(status);
            c.status_checked_at = Some(Utc::now());
        });
        if let Err(e) = result {
            warn!("failed to record status of {}: {}", account, e);
        }
    }
}

fn account_label(grant: &AuthGrant) -> String {
    grant
        .user
        .phone
        .as_deref()
        .map(normalize_account)
        .or_else(|| grant.user.username.clone())
        .unwrap_or_else(|| grant.user.id.to_string())
}
