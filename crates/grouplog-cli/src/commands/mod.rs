pub mod accounts;
pub mod delete;
pub mod ingest;
pub mod login;
pub mod messages;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use grouplog_auth::{CredentialStore, SessionManager};
use grouplog_client::HttpConnector;
use grouplog_core::{AccountService, EnvOperator, GroupLogPaths, GuardedActions, Settings, Store};

use crate::paths;

/// Everything a command needs, opened from the data directory.
pub struct App {
    pub paths: GroupLogPaths,
    pub settings: Settings,
    pub store: Store,
    pub sessions: Arc<SessionManager>,
}

impl App {
    pub async fn open() -> Result<Self> {
        let paths = paths::resolve();
        std::fs::create_dir_all(&paths.base_dir).with_context(|| {
            format!("Failed to create data directory: {}", paths.base_dir.display())
        })?;
        let settings = Settings::load(&paths.settings_path)?;
        let store = Store::open(&paths.db_path).await?;

        let connector =
            HttpConnector::new(&settings.api_url)?.with_timeout(settings.request_timeout());
        let credentials = CredentialStore::load(&paths.credentials_path)?;
        let sessions = Arc::new(SessionManager::new(Arc::new(connector), credentials));
        tracing::debug!(data_dir = %paths.base_dir.display(), api = %settings.api_url, "opened");

        Ok(Self {
            paths,
            settings,
            store,
            sessions,
        })
    }

    pub fn accounts(&self) -> AccountService {
        AccountService::new(
            self.sessions.clone(),
            GuardedActions::new(self.store.clone(), &self.settings.guarded_actions),
            Arc::new(EnvOperator),
        )
    }
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("expected YYYY-MM-DD or RFC 3339, got '{}'", value))
}
