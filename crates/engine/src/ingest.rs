//! Shared persist path for fetched messages.
//!
//! Both the push (webhook) and pull (batch check) pipelines end here: store
//! each message idempotently, classify the genuinely new ones, and fan the
//! new ones out to connected clients and blocked code waiters.

use tracing::warn;

use mailfleet_adapters::FetchedMessage;
use mailfleet_storage::{MailboxRow, NewMailRecord};

use crate::classify;
use crate::error::EngineResult;
use crate::fanout::MailSummary;
use crate::Engine;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOutcome {
    pub total: usize,
    pub saved: usize,
}

/// Persist a batch of fetched messages for one mailbox. Duplicates become
/// no-ops; only rows actually inserted are classified and broadcast.
pub fn persist_fetched(
    engine: &Engine,
    mailbox: &MailboxRow,
    messages: &[FetchedMessage],
) -> EngineResult<IngestOutcome> {
    let mut new_summaries = Vec::new();

    for message in messages {
        let (inserted, mail_id) = engine.store.add_mail_record(&NewMailRecord {
            email_id: mailbox.id,
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            received_time: message.received_time.clone(),
            folder: message.folder.clone(),
            has_attachments: message.has_attachments,
        })?;

        if !inserted {
            continue;
        }

        if let Err(err) = classify::classify_message(
            &engine.store,
            mailbox.user_id,
            mailbox.id,
            &message.sender,
            &message.subject,
            &message.content,
        ) {
            warn!(email_id = mailbox.id, error = %err, "platform classification failed");
        }

        new_summaries.push(MailSummary {
            id: mail_id,
            email_id: mailbox.id,
            recipient_email: mailbox.address.clone(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            received_time: message.received_time.clone(),
            content: message.content.clone(),
            has_attachments: message.has_attachments,
        });
    }

    let saved = new_summaries.len();
    if saved > 0 {
        if mailbox.realtime_enabled {
            engine.fanout.publish(mailbox.user_id, new_summaries);
        } else {
            // No live clients wanted, but code waiters still need the nudge.
            engine.fanout.mail_signal().notify_waiters();
        }
    }

    Ok(IngestOutcome {
        total: messages.len(),
        saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailfleet_storage::{NewMailbox, FOLDER_INBOX};

    fn fetched(subject: &str) -> FetchedMessage {
        FetchedMessage {
            subject: subject.to_string(),
            sender: "no-reply@site.com".to_string(),
            recipient: None,
            content: format!("{subject} body"),
            received_time: "2026-01-05T18:58:09Z".to_string(),
            folder: FOLDER_INBOX.to_string(),
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn duplicates_are_not_rebroadcast() {
        let engine = Engine::open_for_tests().unwrap();
        let user = engine.store.create_user("tester", "hash").unwrap();
        let email_id = engine
            .store
            .add_mailbox(&NewMailbox::outlook(
                user.id,
                "a@outlook.com".to_string(),
                "pw".to_string(),
                "c".to_string(),
                "r".to_string(),
            ))
            .unwrap();
        let mailbox = engine.store.get_mailbox(email_id, None).unwrap().unwrap();
        let mut rx = engine.fanout.subscribe(user.id);

        let batch = vec![fetched("one"), fetched("two")];
        let first = persist_fetched(&engine, &mailbox, &batch).unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.saved, 2);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.count, 2);
        assert_eq!(event.data[0].recipient_email, "a@outlook.com");

        // Re-delivery of the same batch stores nothing and stays silent.
        let second = persist_fetched(&engine, &mailbox, &batch).unwrap();
        assert_eq!(second.saved, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.store.mail_count(email_id).unwrap(), 2);
    }
}
