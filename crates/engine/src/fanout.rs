//! Per-user push channels for new-message events.
//!
//! The WebSocket layer subscribes a channel per connected client; the fetch
//! pipelines publish summaries of newly stored messages. Delivery is
//! best-effort: a client that stopped draining its channel is dropped
//! rather than ever blocking a publisher.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

pub const EVENT_TYPE_NEW_MAILS: &str = "new_mails";

/// Bounded per-client buffer; a client this far behind is considered dead.
const CLIENT_CHANNEL_CAPACITY: usize = 32;

/// Summary of a newly stored message, as broadcast to clients.
#[derive(Debug, Clone, Serialize)]
pub struct MailSummary {
    pub id: i64,
    pub email_id: i64,
    pub recipient_email: String,
    pub subject: String,
    pub sender: String,
    pub received_time: String,
    pub content: String,
    pub has_attachments: bool,
}

/// The one outbound event shape the core produces:
/// `{"type": "new_mails", "data": [...], "count": N}`.
#[derive(Debug, Clone, Serialize)]
pub struct NewMailsEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Vec<MailSummary>,
    pub count: usize,
}

impl NewMailsEvent {
    pub fn new(data: Vec<MailSummary>) -> Self {
        Self {
            event_type: EVENT_TYPE_NEW_MAILS.to_string(),
            count: data.len(),
            data,
        }
    }
}

#[derive(Debug, Default)]
pub struct LiveFanout {
    clients: Mutex<HashMap<i64, Vec<mpsc::Sender<NewMailsEvent>>>>,
    mail_signal: Notify,
}

impl LiveFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client for one user; the receiver is handed to the
    /// WebSocket writer task.
    pub fn subscribe(&self, user_id: i64) -> mpsc::Receiver<NewMailsEvent> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        if let Ok(mut clients) = self.clients.lock() {
            clients.entry(user_id).or_default().push(tx);
        }
        rx
    }

    /// Deliver new-message summaries to every connected client of `user_id`.
    /// Full or closed channels are pruned; returns how many clients got the
    /// event. Also pulses the new-mail signal for blocked code waiters.
    pub fn publish(&self, user_id: i64, mails: Vec<MailSummary>) -> usize {
        let event = NewMailsEvent::new(mails);
        let mut delivered = 0;

        if let Ok(mut clients) = self.clients.lock() {
            if let Some(senders) = clients.get_mut(&user_id) {
                senders.retain(|sender| match sender.try_send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(user_id, "dropping slow fanout client");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                if senders.is_empty() {
                    clients.remove(&user_id);
                }
            }
        }

        self.mail_signal.notify_waiters();
        delivered
    }

    /// Signal pulsed on every publish; code waiters block on it instead of
    /// pure polling.
    pub fn mail_signal(&self) -> &Notify {
        &self.mail_signal
    }

    pub fn connection_count(&self, user_id: i64) -> usize {
        self.clients
            .lock()
            .map(|clients| clients.get(&user_id).map_or(0, |senders| senders.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(subject: &str) -> MailSummary {
        MailSummary {
            id: 1,
            email_id: 1,
            recipient_email: "a@outlook.com".to_string(),
            subject: subject.to_string(),
            sender: "no-reply@site.com".to_string(),
            received_time: "2026-01-05T18:58:09Z".to_string(),
            content: "body".to_string(),
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_client() {
        let fanout = LiveFanout::new();
        let mut rx = fanout.subscribe(1);

        let delivered = fanout.publish(1, vec![summary("hello")]);
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EVENT_TYPE_NEW_MAILS);
        assert_eq!(event.count, 1);
        assert_eq!(event.data[0].subject, "hello");
    }

    #[tokio::test]
    async fn publish_is_scoped_per_user() {
        let fanout = LiveFanout::new();
        let mut other = fanout.subscribe(2);

        fanout.publish(1, vec![summary("not yours")]);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_client_is_dropped_without_blocking() {
        let fanout = LiveFanout::new();
        let _rx = fanout.subscribe(1);

        // Fill the client's buffer past capacity; publish must never block.
        for i in 0..(CLIENT_CHANNEL_CAPACITY + 1) {
            fanout.publish(1, vec![summary(&format!("m{i}"))]);
        }
        assert_eq!(fanout.connection_count(1), 0);

        // Publishing to a user with no clients is a no-op.
        assert_eq!(fanout.publish(1, vec![summary("after")]), 0);
    }

    #[tokio::test]
    async fn per_user_delivery_preserves_publish_order() {
        let fanout = LiveFanout::new();
        let mut rx = fanout.subscribe(7);

        fanout.publish(7, vec![summary("first")]);
        fanout.publish(7, vec![summary("second")]);

        assert_eq!(rx.recv().await.unwrap().data[0].subject, "first");
        assert_eq!(rx.recv().await.unwrap().data[0].subject, "second");
    }

    #[test]
    fn event_serializes_with_type_field() {
        let event = NewMailsEvent::new(vec![summary("s")]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "new_mails");
        assert_eq!(json["count"], 1);
        assert_eq!(json["data"][0]["subject"], "s");
    }
}
