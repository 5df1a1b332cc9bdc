//! Pipeline settings.
//!
//! Settings live in `{data_dir}/settings.toml`. A missing file means
//! defaults; individual values can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::governor::Channel;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8780/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the messaging gateway.
    pub api_url: String,
    pub request_timeout_secs: u64,
    /// Minimum spacing between history calls.
    pub primary_delay_secs: f64,
    /// Minimum spacing between reaction calls.
    pub reaction_delay_secs: f64,
    pub media_delay_secs: f64,
    pub page_size: u32,
    pub transient_retries: u32,
    pub transient_backoff_secs: f64,
    /// Give up on a call after this many provider throttle waits.
    pub max_throttle_waits: u32,
    pub reactions_enabled: bool,
    pub attachments: AttachmentSettings,
    pub guarded_actions: GuardedActionSettings,
    /// Optional wall-clock budget for one ingestion run.
    pub run_budget_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSettings {
    pub enabled: bool,
    pub photos: bool,
    pub videos: bool,
    pub documents: bool,
    pub audio: bool,
    pub voice: bool,
    pub max_size_bytes: u64,
    /// Defaults to `{data_dir}/media`.
    pub download_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardedActionSettings {
    pub window_hours: i64,
    pub max_actions: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: 30,
            primary_delay_secs: 5.0,
            reaction_delay_secs: 0.5,
            media_delay_secs: 0.0,
            page_size: 100,
            transient_retries: 3,
            transient_backoff_secs: 2.0,
            max_throttle_waits: 10,
            reactions_enabled: true,
            attachments: AttachmentSettings::default(),
            guarded_actions: GuardedActionSettings::default(),
            run_budget_secs: None,
        }
    }
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            photos: true,
            videos: true,
            documents: true,
            audio: true,
            voice: true,
            max_size_bytes: 50 * 1024 * 1024,
            download_root: None,
        }
    }
}

impl Default for GuardedActionSettings {
    fn default() -> Self {
        Self {
            window_hours: 48,
            max_actions: 5,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl Settings {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse settings: {}", path.display()))?
        } else {
            Self::default()
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply `GROUPLOG_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GROUPLOG_PRIMARY_DELAY_SECS").and_then(|v| v.parse().ok()) {
            self.primary_delay_secs = v;
        }
        if let Some(v) = lookup("GROUPLOG_REACTION_DELAY_SECS").and_then(|v| v.parse().ok()) {
            self.reaction_delay_secs = v;
        }
        if let Some(v) = lookup("GROUPLOG_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.page_size = v;
        }
        if let Some(v) = lookup("GROUPLOG_API_URL").filter(|v| !v.is_empty()) {
            self.api_url = v;
        }
    }

    pub fn delay(&self, channel: Channel) -> Duration {
        match channel {
            Channel::Primary => secs(self.primary_delay_secs),
            Channel::Reactions => secs(self.reaction_delay_secs),
            Channel::Media => secs(self.media_delay_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn run_budget(&self) -> Option<Duration> {
        self.run_budget_secs.map(Duration::from_secs)
    }

    pub fn media_root(&self, paths: &GroupLogPaths) -> PathBuf {
        self.attachments
            .download_root
            .clone()
            .unwrap_or_else(|| paths.media_dir.clone())
    }
}

/// On-disk locations, all under one data directory.
#[derive(Debug, Clone)]
pub struct GroupLogPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub credentials_path: PathBuf,
    pub settings_path: PathBuf,
    pub media_dir: PathBuf,
}

impl GroupLogPaths {
    /// `GROUPLOG_DATA_DIR`, else `fallback` (normally the platform data dir).
    pub fn from_env(fallback: Option<PathBuf>) -> Self {
        if let Some(dir) = std::env::var_os("GROUPLOG_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        Self::from_base(fallback.unwrap_or_else(|| PathBuf::from(".grouplog")))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        Self {
            db_path: base_dir.join("grouplog.db"),
            credentials_path: base_dir.join("accounts.json"),
            settings_path: base_dir.join("settings.toml"),
            media_dir: base_dir.join("media"),
            base_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.delay(Channel::Primary), Duration::from_secs(5));
        assert_eq!(settings.delay(Channel::Reactions), Duration::from_millis(500));
        assert_eq!(settings.delay(Channel::Media), Duration::ZERO);
        assert_eq!(settings.attachments.max_size_bytes, 52_428_800);
        assert_eq!(settings.guarded_actions.window_hours, 48);
        assert!(settings.reactions_enabled);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings.page_size, Settings::default().page_size);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "reactions_enabled = false\n\n[attachments]\nvideos = false\nmax_size_bytes = 1024\n",
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert!(!settings.reactions_enabled);
        assert!(!settings.attachments.videos);
        assert!(settings.attachments.photos);
        assert_eq!(settings.attachments.max_size_bytes, 1024);
        assert_eq!(settings.transient_retries, 3);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GROUPLOG_PRIMARY_DELAY_SECS", "1.5"),
            ("GROUPLOG_PAGE_SIZE", "not-a-number"),
            ("GROUPLOG_API_URL", "http://gw.test/"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.delay(Channel::Primary), Duration::from_millis(1500));
        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.api_url, "http://gw.test/");
    }

    #[test]
    fn test_paths_from_base() {
        let paths = GroupLogPaths::from_base(PathBuf::from("/data/gl"));
        assert_eq!(paths.db_path, PathBuf::from("/data/gl/grouplog.db"));
        assert_eq!(
            Settings::default().media_root(&paths),
            PathBuf::from("/data/gl/media")
        );
    }
}
