//! Account additions and removals behind the guarded-action window.

use std::sync::Arc;

use grouplog_auth::{AuthOutcome, AuthSecret, Challenge, Credential, SessionManager};
use tracing::info;

use crate::error::IngestError;
use crate::governor::GuardedActions;

/// Actor used when no operator identity is available.
pub const LOCAL_OPERATOR: &str = "local";

/// Who is driving the current process, for guarded-action attribution.
pub trait OperatorIdentity: Send + Sync {
    fn current_operator_id(&self) -> Option<String>;
}

/// Reads `GROUPLOG_OPERATOR`.
pub struct EnvOperator;

impl OperatorIdentity for EnvOperator {
    fn current_operator_id(&self) -> Option<String> {
        std::env::var("GROUPLOG_OPERATOR")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

pub struct AccountService {
    sessions: Arc<SessionManager>,
    guard: GuardedActions,
    identity: Arc<dyn OperatorIdentity>,
}

impl AccountService {
    pub fn new(
        sessions: Arc<SessionManager>,
        guard: GuardedActions,
        identity: Arc<dyn OperatorIdentity>,
    ) -> Self {
        Self {
            sessions,
            guard,
            identity,
        }
    }

    pub fn operator(&self) -> String {
        self.identity
            .current_operator_id()
            .unwrap_or_else(|| LOCAL_OPERATOR.to_string())
    }

    async fn ensure_allowed(&self, actor: &str) -> Result<(), IngestError> {
        let decision = self.guard.can_perform_guarded_action(actor).await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(IngestError::GuardRefused(
                decision.reason.unwrap_or_else(|| "limit reached".to_string()),
            ))
        }
    }

    /// Start adding an account by one-time code. Refused up front when the
    /// operator's window is full, so no code is sent in vain.
    pub async fn add_account_with_code(&self, phone: &str) -> Result<Challenge, IngestError> {
        self.ensure_allowed(&self.operator()).await?;
        Ok(self.sessions.begin_auth(phone).await?)
    }

    /// Start adding an account through a scannable login token.
    pub async fn add_account_with_token(&self) -> Result<Challenge, IngestError> {
        self.ensure_allowed(&self.operator()).await?;
        Ok(self.sessions.begin_token_auth().await?)
    }

    /// Finish either flow. The guarded action is recorded only once the
    /// credential is stored.
    pub async fn finish_add_account(
        &self,
        challenge: &Challenge,
        secret: AuthSecret,
    ) -> Result<AuthOutcome, IngestError> {
        let outcome = self.sessions.complete_auth(challenge, secret).await?;
        if let AuthOutcome::Authorized(credential) = &outcome {
            let actor = self.operator();
            self.guard
                .record(&actor, "add_account", Some(&credential.account))
                .await?;
            info!(actor, account = %credential.account, "account added");
        }
        Ok(outcome)
    }

    pub async fn remove_account(&self, account: &str) -> Result<(), IngestError> {
        let actor = self.operator();
        self.ensure_allowed(&actor).await?;
        self.sessions.remove_account(account).await?;
        self.guard.record(&actor, "remove_account", Some(account)).await?;
        Ok(())
    }

    pub async fn list_accounts(&self) -> Vec<Credential> {
        self.sessions.list_accounts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grouplog_auth::CredentialStore;
    use grouplog_client::mock::{MockOp, MockPlatform};
    use grouplog_client::RawUser;
    use grouplog_store::Store;

    use crate::config::GuardedActionSettings;

    struct Fixed(&'static str);

    impl OperatorIdentity for Fixed {
        fn current_operator_id(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct Anonymous;

    impl OperatorIdentity for Anonymous {
        fn current_operator_id(&self) -> Option<String> {
            None
        }
    }

    async fn service(
        platform: &MockPlatform,
        dir: &tempfile::TempDir,
        store: &Store,
        identity: Arc<dyn OperatorIdentity>,
    ) -> AccountService {
        let credentials = CredentialStore::load(&dir.path().join("accounts.json")).unwrap();
        let sessions = Arc::new(SessionManager::new(Arc::new(platform.connector()), credentials));
        let guard = GuardedActions::new(
            store.clone(),
            &GuardedActionSettings {
                window_hours: 48,
                max_actions: 1,
            },
        );
        AccountService::new(sessions, guard, identity)
    }

    fn user(id: i64, phone: &str) -> RawUser {
        RawUser {
            id,
            phone: Some(phone.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_is_recorded_and_window_enforced() {
        let platform = MockPlatform::new();
        platform.add_account("+15550100", user(1, "+15550100"), "12345", None);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let accounts = service(&platform, &dir, &store, Arc::new(Fixed("alice"))).await;

        let challenge = accounts.add_account_with_code("+15550100").await.unwrap();
        let outcome = accounts
            .finish_add_account(
                &challenge,
                AuthSecret::Code {
                    code: "12345".to_string(),
                    password: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authorized(_)));
        assert_eq!(accounts.list_accounts().await.len(), 1);

        // The window (1 action) is now full for alice.
        let err = accounts.remove_account("+15550100").await.unwrap_err();
        assert!(matches!(err, IngestError::GuardRefused(_)));
        assert_eq!(accounts.list_accounts().await.len(), 1);

        let sends = platform.count_calls(MockOp::SendCode);
        assert!(accounts.add_account_with_code("+15550100").await.is_err());
        assert_eq!(platform.count_calls(MockOp::SendCode), sends);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_not_recorded() {
        let platform = MockPlatform::new();
        platform.add_account("+15550100", user(1, "+15550100"), "12345", None);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let accounts = service(&platform, &dir, &store, Arc::new(Anonymous)).await;
        assert_eq!(accounts.operator(), LOCAL_OPERATOR);

        let challenge = accounts.add_account_with_code("+15550100").await.unwrap();
        let wrong = accounts
            .finish_add_account(
                &challenge,
                AuthSecret::Code {
                    code: "00000".to_string(),
                    password: None,
                },
            )
            .await;
        assert!(wrong.is_err());

        let since = chrono::Utc::now() - chrono::Duration::hours(1);
        assert!(store
            .guarded_actions_since(LOCAL_OPERATOR, since)
            .await
            .unwrap()
            .is_empty());
    }
}
