//! Mailfleet engine: mailbox synchronization and real-time delivery.
//!
//! Everything the HTTP/WebSocket surface calls lives here — subscription
//! lifecycle, webhook routing, pull checks, platform tagging, blocking
//! verification-code waits and the live fanout — wired around one shared
//! [`Engine`] holding the store, the Graph client and the in-flight set.
//! There are no hidden singletons: build an [`EngineConfig`], open the
//! engine, hand `Arc<Engine>` to the components you need.

pub mod checker;
pub mod classify;
pub mod codewait;
pub mod config;
pub mod error;
pub mod fanout;
pub mod import_export;
mod ingest;
pub mod router;
pub mod subscriptions;

pub use checker::{BatchChecker, BatchStart, CheckReport, InFlight, ProgressFn};
pub use codewait::{extract_code, CodeHit, CodeWaiter};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use fanout::{LiveFanout, MailSummary, NewMailsEvent};
pub use router::{NotificationRouter, WebhookReply};
pub use subscriptions::SubscriptionManager;

use std::sync::Arc;

use mailfleet_adapters::GraphClient;
use mailfleet_storage::Storage;

/// Shared state for all engine components.
pub struct Engine {
    pub store: Storage,
    pub graph: GraphClient,
    pub fanout: LiveFanout,
    pub in_flight: InFlight,
    webhook_url: Option<String>,
}

impl Engine {
    pub fn open(config: &EngineConfig) -> EngineResult<Arc<Self>> {
        let store = Storage::open_or_create(&config.db_path, config.vault.clone())?;
        Ok(Arc::new(Self {
            store,
            graph: GraphClient::new(),
            fanout: LiveFanout::new(),
            in_flight: InFlight::new(),
            webhook_url: config.webhook_url.clone(),
        }))
    }

    /// Engine over a throwaway database, push path nominally configured.
    pub fn open_for_tests() -> EngineResult<Arc<Self>> {
        Self::open_for_tests_with_webhook(Some("https://hooks.example.com/graph".to_string()))
    }

    pub fn open_for_tests_with_webhook(webhook_url: Option<String>) -> EngineResult<Arc<Self>> {
        Ok(Arc::new(Self {
            store: Storage::open_for_tests()?,
            graph: GraphClient::new(),
            fanout: LiveFanout::new(),
            in_flight: InFlight::new(),
            webhook_url,
        }))
    }

    /// The configured notification URL; `None` disables the push path.
    pub fn webhook_url(&self) -> Option<&str> {
        self.webhook_url.as_deref()
    }
}
