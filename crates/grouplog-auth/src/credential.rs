use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Health of an account's stored session, derived lazily by a round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Expired,
    Unavailable,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
            AccountStatus::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Display identifier, normally the phone number.
    pub account: String,
    /// Opaque session blob issued by the platform.
    pub session: String,
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Last observed status; `None` until first checked.
    #[serde(default)]
    pub status: Option<AccountStatus>,
    #[serde(default)]
    pub status_checked_at: Option<DateTime<Utc>>,
}

/// Normalise an account reference so `+1 555 0100` and `+15550100` match.
pub fn normalize_account(account: &str) -> String {
    account
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '(' && *c != ')')
        .collect()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    accounts: BTreeMap<String, Credential>,
}

/// Credentials persisted as a JSON document, one entry per account.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    accounts: BTreeMap<String, Credential>,
}

impl CredentialStore {
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let accounts = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read credentials: {}", path.display()))?;
            let file: CredentialFile = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse credentials: {}", path.display()))?;
            file.accounts
        } else {
            BTreeMap::new()
        };

        debug!("loaded {} credential(s) from {}", accounts.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            accounts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, account: &str) -> Option<&Credential> {
        self.accounts.get(&normalize_account(account))
    }

    pub fn list(&self) -> Vec<Credential> {
        self.accounts.values().cloned().collect()
    }

    pub fn upsert(&mut self, credential: Credential) -> Result<()> {
        let key = normalize_account(&credential.account);
        info!("storing credential for {}", key);
        self.accounts.insert(key, credential);
        self.save()
    }

    pub fn remove(&mut self, account: &str) -> Result<Option<Credential>> {
        let removed = self.accounts.remove(&normalize_account(account));
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Apply `f` to a stored credential and persist. No-op for unknown accounts.
    pub fn update<F>(&mut self, account: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Credential),
    {
        if let Some(credential) = self.accounts.get_mut(&normalize_account(account)) {
            f(credential);
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let file = CredentialFile {
            accounts: self.accounts.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write credentials: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace credentials: {}", self.path.display()))?;
        Ok(())
    }
}
