//! Process configuration, resolved once at startup and injected explicitly.

use std::path::PathBuf;

use mailfleet_storage::CryptoVault;

/// Public HTTPS URL Graph delivers change notifications to. When absent, the
/// push path (subscriptions + webhook fetches) is disabled and only pull
/// checks run.
pub const GRAPH_WEBHOOK_URL_ENV: &str = "GRAPH_WEBHOOK_URL";

pub const DEFAULT_DB_PATH: &str = "data/mailfleet.db";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub webhook_url: Option<String>,
    pub vault: CryptoVault,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(GRAPH_WEBHOOK_URL_ENV)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            webhook_url,
            vault: CryptoVault::from_env(),
        }
    }

    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    /// Whether the Graph push path can be enabled at all.
    pub fn push_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }
}
