//! Push-subscription lifecycle.
//!
//! One active Graph subscription per Outlook mailbox on the inbox resource.
//! Creation runs under a strict rate schedule (Graph throttles subscription
//! churn hard), renewal happens from a background loop ahead of the
//! provider's expiry, and deletion is best-effort on the provider side but
//! always removes the local record.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailfleet_adapters::graph::graph_expiration_string;
use mailfleet_adapters::GraphError;
use mailfleet_storage::{MailboxRow, SubscriptionRow};

use crate::error::{EngineError, EngineResult};
use crate::Engine;

/// Graph caps mail subscriptions at 4230 minutes (~3 days).
pub const MAX_EXPIRATION_MINUTES: i64 = 4230;

/// Subscriptions expiring within this many hours get renewed.
pub const RENEW_BEFORE_HOURS: i64 = 12;

/// The one resource subscribed per mailbox.
pub const INBOX_RESOURCE: &str = "me/mailFolders('Inbox')/messages";

/// Default cadence of the renewal loop.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(3600);

/// Spacing between successive creates during a bulk run.
const CREATE_SPACING: Duration = Duration::from_secs(2);

/// After this many creates, pause for [`BATCH_PAUSE`].
const BATCH_SIZE: usize = 50;

const BATCH_PAUSE: Duration = Duration::from_secs(60);

/// Outcome of one subscription-create attempt.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created { subscription_id: String },
    AlreadySubscribed,
    Throttled { retry_after_secs: u64 },
    Failed(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkCreateReport {
    pub total: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub throttled: usize,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    engine: Arc<Engine>,
    webhook_url: String,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager").finish()
    }
}

impl SubscriptionManager {
    /// Fails when no webhook URL is configured — without one the push path
    /// cannot exist.
    pub fn new(engine: Arc<Engine>) -> EngineResult<Self> {
        let webhook_url = engine
            .webhook_url()
            .ok_or_else(|| {
                EngineError::Validation(
                    "GRAPH_WEBHOOK_URL is not configured; push subscriptions are disabled"
                        .to_string(),
                )
            })?
            .to_string();

        Ok(Self {
            engine,
            webhook_url,
            shutdown: CancellationToken::new(),
        })
    }

    /// Ensure an active subscription exists for this mailbox's inbox.
    pub async fn create_for_mailbox(&self, mailbox: &MailboxRow) -> CreateOutcome {
        match self.engine.store.get_subscription(mailbox.id, INBOX_RESOURCE) {
            Ok(Some(_)) => return CreateOutcome::AlreadySubscribed,
            Ok(None) => {}
            Err(err) => return CreateOutcome::Failed(err.to_string()),
        }

        if mailbox.refresh_token.is_empty() || mailbox.client_id.is_empty() {
            let message = "missing oauth credentials (client_id / refresh_token)";
            let _ = self.engine.store.set_last_error(mailbox.id, message);
            return CreateOutcome::Failed(message.to_string());
        }

        let access_token = match self
            .engine
            .graph
            .refresh_access_token(&mailbox.refresh_token, &mailbox.client_id)
            .await
        {
            Ok(token) => token,
            Err(GraphError::Throttled { retry_after_secs }) => {
                return CreateOutcome::Throttled { retry_after_secs }
            }
            Err(err) => {
                let _ = self.engine.store.set_last_error(mailbox.id, &err.to_string());
                return CreateOutcome::Failed(err.to_string());
            }
        };

        let expiration = expiration_from_now();
        let result = self
            .engine
            .graph
            .create_subscription(
                &access_token,
                &self.webhook_url,
                INBOX_RESOURCE,
                &expiration,
                &client_state_for(mailbox.id),
            )
            .await;

        match result {
            Ok(created) => {
                if let Err(err) = self.engine.store.upsert_subscription(
                    mailbox.id,
                    &created.subscription_id,
                    INBOX_RESOURCE,
                    &created.expiration_time,
                ) {
                    return CreateOutcome::Failed(err.to_string());
                }
                info!(
                    email_id = mailbox.id,
                    subscription_id = created.subscription_id,
                    "subscription created"
                );
                CreateOutcome::Created {
                    subscription_id: created.subscription_id,
                }
            }
            Err(GraphError::Throttled { retry_after_secs }) => {
                warn!(email_id = mailbox.id, retry_after_secs, "subscription create throttled");
                CreateOutcome::Throttled { retry_after_secs }
            }
            Err(err) => {
                let _ = self.engine.store.set_last_error(mailbox.id, &err.to_string());
                warn!(email_id = mailbox.id, error = %err, "subscription create failed");
                CreateOutcome::Failed(err.to_string())
            }
        }
    }

    /// Renew a subscription to a fresh maximum expiration. On any provider
    /// failure the local record is deleted and a recreate is attempted.
    pub async fn renew(&self, mailbox: &MailboxRow, subscription: &SubscriptionRow) -> EngineResult<()> {
        let access_token = self
            .engine
            .graph
            .refresh_access_token(&mailbox.refresh_token, &mailbox.client_id)
            .await?;

        let expiration = expiration_from_now();
        match self
            .engine
            .graph
            .renew_subscription(&access_token, &subscription.subscription_id, &expiration)
            .await
        {
            Ok(()) => {
                self.engine
                    .store
                    .update_subscription_expiration(&subscription.subscription_id, &expiration)?;
                info!(
                    subscription_id = subscription.subscription_id,
                    "subscription renewed"
                );
                Ok(())
            }
            Err(GraphError::Throttled { retry_after_secs }) => {
                Err(EngineError::Throttled { retry_after_secs })
            }
            Err(err) => {
                // The provider no longer honors this subscription; drop the
                // record and start over.
                warn!(
                    subscription_id = subscription.subscription_id,
                    error = %err,
                    "renew failed, recreating"
                );
                self.engine
                    .store
                    .delete_subscription_by_subscription_id(&subscription.subscription_id)?;
                match self.create_for_mailbox(mailbox).await {
                    CreateOutcome::Created { .. } | CreateOutcome::AlreadySubscribed => Ok(()),
                    CreateOutcome::Throttled { retry_after_secs } => {
                        Err(EngineError::Throttled { retry_after_secs })
                    }
                    CreateOutcome::Failed(message) => Err(EngineError::Permanent(message)),
                }
            }
        }
    }

    /// Tear down a mailbox's subscriptions. Provider-side deletion is
    /// best-effort; local records always go.
    pub async fn delete_for_mailbox(&self, mailbox: &MailboxRow) -> EngineResult<usize> {
        let subscriptions = self.engine.store.list_subscriptions_for_email(mailbox.id)?;

        for subscription in &subscriptions {
            let deleted = async {
                let access_token = self
                    .engine
                    .graph
                    .refresh_access_token(&mailbox.refresh_token, &mailbox.client_id)
                    .await?;
                self.engine
                    .graph
                    .delete_subscription(&access_token, &subscription.subscription_id)
                    .await
            }
            .await;

            if let Err(err) = deleted {
                warn!(
                    subscription_id = subscription.subscription_id,
                    error = %err,
                    "provider-side delete failed; removing local record anyway"
                );
            }
        }

        Ok(self.engine.store.delete_subscriptions_by_email_id(mailbox.id)?)
    }

    /// Create subscriptions for every Outlook mailbox, pacing requests to
    /// stay under Graph's subscription-churn limits: 2 s between creates and
    /// a 60 s pause after every 50. A throttled response pauses for the
    /// provider's `Retry-After` and continues with the next mailbox.
    pub async fn bulk_create_for_all_outlook(&self) -> EngineResult<BulkCreateReport> {
        let mailboxes = self.engine.store.list_outlook_mailboxes()?;
        let mut report = BulkCreateReport {
            total: mailboxes.len(),
            ..Default::default()
        };

        info!(total = report.total, "bulk subscription create started");
        let mut attempts = 0usize;

        for mailbox in &mailboxes {
            match self.engine.store.get_subscription(mailbox.id, INBOX_RESOURCE) {
                Ok(Some(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(email_id = mailbox.id, error = %err, "subscription lookup failed");
                    report.failed += 1;
                    continue;
                }
            }

            let pause = pacing_before(attempts);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            match self.create_for_mailbox(mailbox).await {
                CreateOutcome::Created { .. } => report.created += 1,
                CreateOutcome::AlreadySubscribed => report.skipped += 1,
                CreateOutcome::Throttled { retry_after_secs } => {
                    report.throttled += 1;
                    info!(retry_after_secs, "bulk create throttled, pausing");
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                }
                CreateOutcome::Failed(_) => report.failed += 1,
            }
            attempts += 1;
        }

        info!(
            created = report.created,
            failed = report.failed,
            skipped = report.skipped,
            throttled = report.throttled,
            "bulk subscription create finished"
        );
        Ok(report)
    }

    /// Spawn the renewal loop: every `interval`, renew subscriptions that
    /// expire within [`RENEW_BEFORE_HOURS`]. The stop signal is honored
    /// within a second.
    pub fn start_renewal_loop(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "renewal loop started");
            loop {
                manager.check_and_renew().await;
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("renewal loop stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn check_and_renew(&self) {
        let expiring = match self.engine.store.list_expiring_subscriptions(RENEW_BEFORE_HOURS) {
            Ok(expiring) => expiring,
            Err(err) => {
                warn!(error = %err, "expiring-subscription scan failed");
                return;
            }
        };

        for subscription in expiring {
            let mailbox = match self.engine.store.get_mailbox(subscription.email_id, None) {
                Ok(Some(mailbox)) => mailbox,
                Ok(None) => {
                    // Mailbox is gone; the subscription record goes with it.
                    let _ = self
                        .engine
                        .store
                        .delete_subscription_by_subscription_id(&subscription.subscription_id);
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "mailbox lookup failed during renewal");
                    continue;
                }
            };

            match self.renew(&mailbox, &subscription).await {
                Ok(()) => {}
                Err(EngineError::Throttled { retry_after_secs }) => {
                    // Back off entirely; next cycle retries the rest.
                    warn!(retry_after_secs, "renewal throttled, deferring to next cycle");
                    break;
                }
                Err(err) => {
                    warn!(
                        subscription_id = subscription.subscription_id,
                        error = %err,
                        "renewal failed"
                    );
                }
            }
        }
    }
}

/// clientState carried by every subscription, so notifications can be
/// attributed to their mailbox.
pub fn client_state_for(email_id: i64) -> String {
    format!("email_{email_id}")
}

/// Expiration at the provider maximum, in Graph's timestamp shape.
pub fn expiration_from_now() -> String {
    graph_expiration_string(OffsetDateTime::now_utc() + time::Duration::minutes(MAX_EXPIRATION_MINUTES))
}

/// Delay inserted before create attempt number `attempts` (0-based): 2 s
/// between creates, plus a 60 s batch pause after every 50.
fn pacing_before(attempts: usize) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    if attempts % BATCH_SIZE == 0 {
        CREATE_SPACING + BATCH_PAUSE
    } else {
        CREATE_SPACING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailfleet_storage::parse_utc;

    #[test]
    fn client_state_matches_router_expectation() {
        assert_eq!(client_state_for(42), "email_42");
        assert_eq!(crate::router::parse_client_state(&client_state_for(42)), Some(42));
    }

    #[test]
    fn expiration_stays_within_provider_ceiling() {
        let expiration = expiration_from_now();
        let parsed = parse_utc(&expiration).unwrap();
        let ceiling = OffsetDateTime::now_utc() + time::Duration::minutes(MAX_EXPIRATION_MINUTES);
        assert!(parsed <= ceiling);
        assert!(parsed > OffsetDateTime::now_utc() + time::Duration::minutes(MAX_EXPIRATION_MINUTES - 5));
        assert!(expiration.ends_with(".0000000Z"));
    }

    #[test]
    fn pacing_satisfies_rate_discipline() {
        // For N creates with no throttling, total delay must be at least
        // 2·(N−1) + 60·⌊(N−1)/50⌋ seconds.
        let n = 150;
        let total: Duration = (0..n).map(pacing_before).sum();
        let floor = 2 * (n as u64 - 1) + 60 * ((n as u64 - 1) / 50);
        assert!(total >= Duration::from_secs(floor));

        assert_eq!(pacing_before(0), Duration::ZERO);
        assert_eq!(pacing_before(1), Duration::from_secs(2));
        assert_eq!(pacing_before(50), Duration::from_secs(62));
        assert_eq!(pacing_before(51), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn manager_requires_webhook_url() {
        let engine = crate::Engine::open_for_tests_with_webhook(None).unwrap();
        let err = SubscriptionManager::new(engine).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn bulk_create_with_no_outlook_mailboxes_is_empty() {
        let engine = crate::Engine::open_for_tests().unwrap();
        let manager = SubscriptionManager::new(engine).unwrap();
        let report = manager.bulk_create_for_all_outlook().await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn renewal_loop_stops_within_a_second() {
        let engine = crate::Engine::open_for_tests().unwrap();
        let manager = SubscriptionManager::new(engine).unwrap();

        let handle = manager.start_renewal_loop(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop must honor the stop signal promptly")
            .unwrap();
    }
}
