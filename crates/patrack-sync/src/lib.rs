//! Catalog reconciliation: planning, operator handshakes and the background
//! worker that applies remote and local changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use patrack_storage::{HttpClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

mod confirm;
mod messages;
mod planner;
mod worker;

pub use confirm::{
    ConfirmationChannel, Decision, HandshakeError, HandshakeKind, HandshakeRequest,
    HandshakeTicket, PendingHandshake,
};
pub use messages::Message;
pub use planner::plan;
pub use worker::{
    load_registry, save_registry, EventSink, SyncError, SyncEvent, SyncOutcome, SyncWorker,
};

pub const CRATE_NAME: &str = "patrack-sync";

pub const DEFAULT_CATALOG_URL: &str =
    "https://library.upei.ca/test-page-ebooks-perpetual-access-project";
pub const DEFAULT_DATABASE_PATH: &str = "ebook_database.db";
pub const DEFAULT_INSTITUTION: &str = "Univ. of Prince Edward Island";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    English,
    French,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "english" | "en" => Ok(Language::English),
            "french" | "fr" | "français" | "francais" => Ok(Language::French),
            other => Err(format!("unsupported language {other:?}")),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::English => f.write_str("English"),
            Language::French => f.write_str("French"),
        }
    }
}

/// Everything a sync or upload run needs, passed explicitly to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub catalog_url: String,
    pub database_path: PathBuf,
    /// Institution whose access column searches report.
    pub institution: String,
    pub language: Language,
    /// Whether remote catalog tables take part in searches.
    pub allow_remote: bool,
    pub registry_path: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            institution: DEFAULT_INSTITUTION.to_string(),
            language: Language::English,
            allow_remote: true,
            registry_path: None,
            download_dir: None,
            user_agent: format!("patrack/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
            retry: RetryPolicy::default(),
            handshake_timeout_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `PATRACK_*` keys, falling back to defaults for
    /// anything missing or unparseable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            catalog_url: lookup("PATRACK_CATALOG_URL").unwrap_or(defaults.catalog_url),
            database_path: lookup("PATRACK_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            institution: lookup("PATRACK_INSTITUTION").unwrap_or(defaults.institution),
            language: lookup("PATRACK_LANGUAGE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.language),
            allow_remote: lookup("PATRACK_ALLOW_REMOTE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.allow_remote),
            registry_path: lookup("PATRACK_REGISTRY_PATH")
                .map(PathBuf::from)
                .or(defaults.registry_path),
            download_dir: lookup("PATRACK_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .or(defaults.download_dir),
            user_agent: lookup("PATRACK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("PATRACK_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            retry: defaults.retry,
            handshake_timeout_secs: lookup("PATRACK_HANDSHAKE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .or(defaults.handshake_timeout_secs),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing sync config yaml")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: self.retry.clone(),
        }
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrack_storage::{Backoff, NetworkErrorKind};
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_shipped_settings() {
        let config = SyncConfig::default();
        assert_eq!(config.language, Language::English);
        assert!(config.allow_remote);
        assert_eq!(config.institution, "Univ. of Prince Edward Island");
        assert_eq!(config.database_path, PathBuf::from("ebook_database.db"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn env_lookup_overrides_and_falls_back() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PATRACK_LANGUAGE", "fr"),
            ("PATRACK_ALLOW_REMOTE", "0"),
            ("PATRACK_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("PATRACK_HANDSHAKE_TIMEOUT_SECS", "45"),
            ("PATRACK_DATABASE_PATH", "/var/lib/patrack/catalog.db"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.language, Language::French);
        assert!(!config.allow_remote);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.database_path, PathBuf::from("/var/lib/patrack/catalog.db"));
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
    }

    #[test]
    fn yaml_config_fills_missing_keys_with_defaults() {
        let config = SyncConfig::from_yaml_str(
            r#"
language: French
institution: Acadia University
retry:
  max_attempts: 5
  backoff:
    kind: exponential
    base_ms: 200
    max_ms: 5000
  retryable: [connection_refused, http_status, timeout]
"#,
        )
        .expect("yaml config");

        assert_eq!(config.language, Language::French);
        assert_eq!(config.institution, "Acadia University");
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.retry.backoff,
            Backoff::Exponential {
                base_ms: 200,
                max_ms: 5000
            }
        );
        assert!(config.retry.retryable.contains(&NetworkErrorKind::Timeout));
    }

    #[test]
    fn languages_parse_from_common_spellings() {
        assert_eq!("English".parse::<Language>(), Ok(Language::English));
        assert_eq!("Français".parse::<Language>(), Ok(Language::French));
        assert!("klingon".parse::<Language>().is_err());
    }
}
