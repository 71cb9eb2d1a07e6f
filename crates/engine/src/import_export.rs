//! Bulk credential import/export and .eml ingestion.
//!
//! The exchange format is one mailbox per line, fields joined by `----`:
//! `email----password----client_id----refresh_token` for Outlook, or
//! `email----password----<kind>` for IMAP kinds. Blank lines are skipped;
//! anything malformed is reported with its 1-based line number and a
//! reason instead of aborting the batch.

use serde::Serialize;
use tracing::info;

use mailfleet_adapters::parse_eml;
use mailfleet_storage::{
    NewAttachment, NewMailRecord, NewMailbox, Storage, StorageError, KIND_GMAIL, KIND_IMAP,
    KIND_QQ,
};

use crate::error::{EngineError, EngineResult};

const FIELD_SEPARATOR: &str = "----";

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub total: usize,
    pub imported: usize,
    pub failures: Vec<ImportFailure>,
}

/// Import mailboxes for one user from the line format. Four fields make an
/// Outlook mailbox, three an IMAP mailbox whose last field names the kind.
pub fn import_credentials(store: &Storage, user_id: i64, data: &str) -> ImportReport {
    let mut report = ImportReport::default();

    for (index, raw_line) in data.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        report.total += 1;
        let line_no = index + 1;

        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        let new_mailbox = match fields.as_slice() {
            [address, password, client_id, refresh_token] => NewMailbox::outlook(
                user_id,
                address.to_string(),
                password.to_string(),
                client_id.to_string(),
                refresh_token.to_string(),
            ),
            [address, password, kind] => {
                if ![KIND_IMAP, KIND_GMAIL, KIND_QQ].contains(kind) {
                    report.failures.push(ImportFailure {
                        line: line_no,
                        content: line.to_string(),
                        reason: format!("unsupported mailbox kind '{kind}'"),
                    });
                    continue;
                }
                NewMailbox::imap(
                    user_id,
                    address.to_string(),
                    password.to_string(),
                    kind.to_string(),
                )
            }
            _ => {
                report.failures.push(ImportFailure {
                    line: line_no,
                    content: line.to_string(),
                    reason: "expected 3 or 4 fields separated by ----".to_string(),
                });
                continue;
            }
        };

        if new_mailbox.address.is_empty() || new_mailbox.password.is_empty() {
            report.failures.push(ImportFailure {
                line: line_no,
                content: line.to_string(),
                reason: "blank field".to_string(),
            });
            continue;
        }
        if new_mailbox.kind == mailfleet_storage::KIND_OUTLOOK
            && (new_mailbox.client_id.is_empty() || new_mailbox.refresh_token.is_empty())
        {
            report.failures.push(ImportFailure {
                line: line_no,
                content: line.to_string(),
                reason: "blank field".to_string(),
            });
            continue;
        }

        match store.add_mailbox(&new_mailbox) {
            Ok(_) => report.imported += 1,
            Err(StorageError::MailboxExists { .. }) => report.failures.push(ImportFailure {
                line: line_no,
                content: line.to_string(),
                reason: "mailbox already exists".to_string(),
            }),
            Err(err) => report.failures.push(ImportFailure {
                line: line_no,
                content: line.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    info!(
        total = report.total,
        imported = report.imported,
        failed = report.failures.len(),
        "credential import finished"
    );
    report
}

/// Export mailboxes in the import format, with plaintext credentials (the
/// store decrypts on read). Admins pass `None` to export everything.
pub fn export_credentials(store: &Storage, user_id: Option<i64>) -> EngineResult<String> {
    let mailboxes = store.list_mailboxes(user_id)?;

    let lines: Vec<String> = mailboxes
        .iter()
        .map(|mailbox| {
            if mailbox.kind == mailfleet_storage::KIND_OUTLOOK {
                format!(
                    "{}----{}----{}----{}",
                    mailbox.address, mailbox.password, mailbox.client_id, mailbox.refresh_token
                )
            } else {
                format!(
                    "{}----{}----{}",
                    mailbox.address, mailbox.password, mailbox.kind
                )
            }
        })
        .collect();

    Ok(lines.join("\n"))
}

/// Ingest an uploaded message file (.eml shape) into a mailbox, storing its
/// attachments alongside. Returns the stored mail id.
pub fn import_eml(store: &Storage, email_id: i64, raw: &[u8]) -> EngineResult<i64> {
    let (message, attachments) =
        parse_eml(raw).ok_or_else(|| EngineError::Validation("could not parse message file".to_string()))?;

    let (inserted, mail_id) = store.add_mail_record(&NewMailRecord {
        email_id,
        subject: message.subject,
        sender: message.sender,
        recipient: message.recipient,
        content: message.content,
        received_time: message.received_time,
        folder: message.folder,
        has_attachments: !attachments.is_empty(),
    })?;

    if inserted {
        for attachment in attachments {
            store.add_attachment(&NewAttachment {
                mail_id,
                filename: attachment.filename,
                content_type: attachment.content_type,
                content: attachment.content,
            })?;
        }
    }

    Ok(mail_id)
}
