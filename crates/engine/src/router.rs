//! Graph change-notification handling.
//!
//! The webhook endpoint delegates here. Two request shapes exist: the
//! subscription validation handshake (echo the token back as text/plain)
//! and batches of change notifications. Notifications are acknowledged
//! immediately; the actual fetch runs on a worker fed through a bounded
//! queue, so a slow Graph call can never delay the 202. When the queue is
//! full the notification is dropped — the provider re-delivers.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mailfleet_adapters::graph::GRAPH_FOLDER_INBOX;

use crate::error::{EngineError, EngineResult};
use crate::ingest;
use crate::Engine;

/// Pending fetch jobs; beyond this the provider's redelivery is the buffer.
const FETCH_QUEUE_CAPACITY: usize = 256;

/// A push only signals "something arrived" — the newest few messages cover
/// it, and idempotent inserts absorb the overlap.
const PUSH_FETCH_LIMIT: usize = 5;

/// One change notification as Graph posts it.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "changeType")]
    pub change_type: String,
    #[serde(rename = "clientState", default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(rename = "subscriptionId", default)]
    pub subscription_id: Option<String>,
}

/// The webhook body: `{"value": [...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationEnvelope {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

/// What the HTTP layer should answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReply {
    /// 200 text/plain, body exactly the validation token.
    ValidationEcho(String),
    /// 202, empty body.
    Accepted,
}

impl WebhookReply {
    pub fn http_status(&self) -> u16 {
        match self {
            WebhookReply::ValidationEcho(_) => 200,
            WebhookReply::Accepted => 202,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            WebhookReply::ValidationEcho(token) => token,
            WebhookReply::Accepted => "",
        }
    }
}

#[derive(Clone)]
pub struct NotificationRouter {
    engine: Arc<Engine>,
    jobs: mpsc::Sender<i64>,
}

impl NotificationRouter {
    /// Build the router and spawn its fetch worker.
    pub fn start(engine: Arc<Engine>) -> Self {
        let (router, jobs) = Self::with_capacity(engine.clone(), FETCH_QUEUE_CAPACITY);
        tokio::spawn(fetch_worker(engine, jobs));
        router
    }

    /// Build the router without spawning the worker; the caller owns the
    /// receiving end. Used by tests and custom runtimes.
    pub fn with_capacity(engine: Arc<Engine>, capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { engine, jobs: tx }, rx)
    }

    /// Subscription validation handshake: echo the token, nothing else.
    pub fn handle_validation(&self, validation_token: &str) -> WebhookReply {
        info!("subscription validation handshake");
        WebhookReply::ValidationEcho(validation_token.to_string())
    }

    /// Process a notification batch. Always acknowledges; per-notification
    /// problems are logged and dropped, never surfaced to the provider.
    pub fn handle_notifications(&self, envelope: &NotificationEnvelope) -> WebhookReply {
        for notification in &envelope.value {
            let client_state = notification.client_state.as_deref().unwrap_or("");
            let Some(email_id) = parse_client_state(client_state) else {
                warn!(client_state, "notification with invalid clientState");
                continue;
            };

            match self.engine.store.get_mailbox(email_id, None) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(email_id, "notification for unknown mailbox");
                    continue;
                }
                Err(err) => {
                    warn!(email_id, error = %err, "mailbox lookup failed");
                    continue;
                }
            }

            if notification.change_type != "created" {
                debug!(
                    email_id,
                    change_type = notification.change_type,
                    "ignoring non-create notification"
                );
                continue;
            }

            // Debounce: a fetch already running for this mailbox will pick
            // up whatever this notification announced.
            if self.engine.in_flight.is_processing(email_id) {
                debug!(email_id, "fetch already in flight, dropping notification");
                continue;
            }

            if self.jobs.try_send(email_id).is_err() {
                warn!(email_id, "fetch queue full, dropping notification");
            }
        }

        WebhookReply::Accepted
    }
}

/// Owning `email_id` encoded in the subscription's clientState as
/// `email_<integer>`.
pub fn parse_client_state(client_state: &str) -> Option<i64> {
    let digits = client_state.strip_prefix("email_")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

async fn fetch_worker(engine: Arc<Engine>, mut jobs: mpsc::Receiver<i64>) {
    while let Some(email_id) = jobs.recv().await {
        let Some(_cancel) = engine.in_flight.try_begin(email_id) else {
            debug!(email_id, "fetch already in flight, skipping queued job");
            continue;
        };

        let result = fetch_new_mail(&engine, email_id).await;
        engine.in_flight.finish(email_id);

        if let Err(err) = result {
            warn!(email_id, error = %err, "webhook fetch failed");
        }
    }
}

/// The fetch job behind a push: refresh the token, pull the newest INBOX
/// messages (no since filter — idempotence handles duplicates), persist,
/// advance the high-water mark, and broadcast the genuinely new ones.
async fn fetch_new_mail(engine: &Engine, email_id: i64) -> EngineResult<()> {
    let mailbox = engine
        .store
        .get_mailbox(email_id, None)?
        .ok_or_else(|| EngineError::NotFound(format!("mailbox {email_id} not found")))?;

    if mailbox.refresh_token.is_empty() || mailbox.client_id.is_empty() {
        let message = "missing oauth credentials (client_id / refresh_token)";
        engine.store.set_last_error(email_id, message)?;
        return Err(EngineError::AuthFailed(message.to_string()));
    }

    let access_token = match engine
        .graph
        .refresh_access_token(&mailbox.refresh_token, &mailbox.client_id)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            engine.store.set_last_error(email_id, &err.to_string())?;
            return Err(err.into());
        }
    };

    let messages = engine
        .graph
        .list_messages(&access_token, GRAPH_FOLDER_INBOX, PUSH_FETCH_LIMIT, None)
        .await?;

    let outcome = ingest::persist_fetched(engine, &mailbox, &messages)?;
    engine.store.touch_check_time(email_id)?;

    info!(
        email_id,
        fetched = outcome.total,
        saved = outcome.saved,
        "webhook fetch finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailfleet_storage::NewMailbox;

    fn engine_with_mailbox() -> (Arc<Engine>, i64) {
        let engine = Engine::open_for_tests().unwrap();
        let user = engine.store.create_user("tester", "hash").unwrap();
        let email_id = engine
            .store
            .add_mailbox(&NewMailbox::outlook(
                user.id,
                "a@outlook.com".to_string(),
                "pw".to_string(),
                "client".to_string(),
                "refresh".to_string(),
            ))
            .unwrap();
        (engine, email_id)
    }

    fn created_notification(client_state: &str) -> NotificationEnvelope {
        NotificationEnvelope {
            value: vec![ChangeNotification {
                change_type: "created".to_string(),
                client_state: Some(client_state.to_string()),
                resource: Some("me/mailFolders('Inbox')/messages".to_string()),
                subscription_id: Some("sub-1".to_string()),
            }],
        }
    }

    #[test]
    fn client_state_parsing_is_strict() {
        assert_eq!(parse_client_state("email_42"), Some(42));
        assert_eq!(parse_client_state("email_"), None);
        assert_eq!(parse_client_state("email_-3"), None);
        assert_eq!(parse_client_state("email_4x"), None);
        assert_eq!(parse_client_state("mailbox_42"), None);
        assert_eq!(parse_client_state(""), None);
    }

    #[test]
    fn envelope_deserializes_from_graph_payload() {
        let raw = r#"{
          "value": [{
            "subscriptionId": "sub-1",
            "changeType": "created",
            "clientState": "email_7",
            "resource": "Users/x/Messages/y"
          }]
        }"#;
        let envelope: NotificationEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.value.len(), 1);
        assert_eq!(envelope.value[0].change_type, "created");
        assert_eq!(envelope.value[0].client_state.as_deref(), Some("email_7"));
    }

    #[tokio::test]
    async fn validation_handshake_echoes_token() {
        let (engine, _email_id) = engine_with_mailbox();
        let (router, _rx) = NotificationRouter::with_capacity(engine, 4);

        let reply = router.handle_validation("token-123");
        assert_eq!(reply, WebhookReply::ValidationEcho("token-123".to_string()));
        assert_eq!(reply.http_status(), 200);
        assert_eq!(reply.body(), "token-123");
    }

    #[tokio::test]
    async fn created_notification_enqueues_fetch_job() {
        let (engine, email_id) = engine_with_mailbox();
        let (router, mut rx) = NotificationRouter::with_capacity(engine, 4);

        let reply = router.handle_notifications(&created_notification(&format!("email_{email_id}")));
        assert_eq!(reply, WebhookReply::Accepted);
        assert_eq!(reply.http_status(), 202);
        assert_eq!(rx.try_recv().unwrap(), email_id);
    }

    #[tokio::test]
    async fn invalid_or_unknown_notifications_are_discarded() {
        let (engine, _email_id) = engine_with_mailbox();
        let (router, mut rx) = NotificationRouter::with_capacity(engine, 4);

        // Bad clientState.
        assert_eq!(
            router.handle_notifications(&created_notification("not_a_state")),
            WebhookReply::Accepted
        );
        // Mailbox that does not exist.
        assert_eq!(
            router.handle_notifications(&created_notification("email_9999")),
            WebhookReply::Accepted
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_create_changes_are_ignored() {
        let (engine, email_id) = engine_with_mailbox();
        let (router, mut rx) = NotificationRouter::with_capacity(engine, 4);

        let mut envelope = created_notification(&format!("email_{email_id}"));
        envelope.value[0].change_type = "updated".to_string();
        router.handle_notifications(&envelope);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn in_flight_mailbox_drops_duplicate_notification() {
        let (engine, email_id) = engine_with_mailbox();
        let (router, mut rx) = NotificationRouter::with_capacity(engine.clone(), 4);

        let _token = engine.in_flight.try_begin(email_id).unwrap();
        router.handle_notifications(&created_notification(&format!("email_{email_id}")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_rather_than_blocks() {
        let (engine, email_id) = engine_with_mailbox();
        let (router, mut rx) = NotificationRouter::with_capacity(engine, 1);

        let envelope = created_notification(&format!("email_{email_id}"));
        router.handle_notifications(&envelope);
        // Queue holds one job; the second notification must be dropped
        // without delaying the acknowledgement.
        let reply = router.handle_notifications(&envelope);
        assert_eq!(reply, WebhookReply::Accepted);

        assert_eq!(rx.try_recv().unwrap(), email_id);
        assert!(rx.try_recv().is_err());
    }
}
