//! SQLite storage layer for Mailfleet.
//!
//! This crate owns schema creation/migrations and all database access. It is
//! the single owner of persistent state: mailboxes, fetched messages,
//! attachments, platform tags/rules/corrections, push subscriptions and
//! system configuration. Credential columns are encrypted through the
//! [`vault`] before they hit disk and decrypted on the way out, so callers
//! only ever see plaintext.

pub mod vault;

pub use vault::{is_encrypted, CryptoVault};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SCHEMA_VERSION: i64 = 1;

const PRAGMA_JOURNAL_MODE_WAL: &str = "WAL";
const PRAGMA_SYNCHRONOUS_NORMAL: &str = "NORMAL";
const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const SCHEMA_META_KEY_SCHEMA_VERSION: &str = "schema_version";

/// Outlook mailbox, fetched through Microsoft Graph (or IMAP as fallback).
pub const KIND_OUTLOOK: &str = "outlook";
/// Generic IMAP mailbox with a caller-supplied server.
pub const KIND_IMAP: &str = "imap";
/// Gmail mailbox (IMAP, fixed server).
pub const KIND_GMAIL: &str = "gmail";
/// QQ mailbox (IMAP, fixed server).
pub const KIND_QQ: &str = "qq";

pub const FOLDER_INBOX: &str = "INBOX";
pub const FOLDER_JUNK: &str = "JUNK";
/// Folder assigned to messages ingested from uploaded .eml files.
pub const FOLDER_IMPORTED: &str = "IMPORTED";

/// System config key: whether self-registration is open.
pub const CONFIG_ALLOW_REGISTER: &str = "allow_register";
/// System config key: whether Outlook mailboxes use Graph instead of IMAP.
pub const CONFIG_USE_GRAPH_API: &str = "use_graph_api";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mailbox '{address}' already exists")]
    MailboxExists { address: String },

    #[error("username '{username}' already exists")]
    UsernameExists { username: String },

    #[error("unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
    vault: CryptoVault,
}

impl Storage {
    pub fn open_or_create(db_path: impl AsRef<Path>, vault: CryptoVault) -> StorageResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        create_parent_dir_if_needed(&db_path)?;

        let storage = Self { db_path, vault };
        let mut conn = storage.open_connection()?;
        migrate(&mut conn)?;
        Ok(storage)
    }

    pub fn open_for_tests() -> StorageResult<Self> {
        // Note: `:memory:` would create a *separate* database per connection,
        // but this storage abstraction opens new connections per operation.
        // For predictable tests, we use a temp file-backed SQLite DB instead.
        let db_path = test_db_path();
        Self::open_or_create(db_path, CryptoVault::derive_from_secret("storage-tests"))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn vault(&self) -> &CryptoVault {
        &self.vault
    }

    pub fn schema_version(&self) -> StorageResult<i64> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = ?1")?;
        let value: Option<String> = stmt
            .query_row([SCHEMA_META_KEY_SCHEMA_VERSION], |row| row.get(0))
            .optional()?;

        let Some(value) = value else {
            return Ok(0);
        };

        Ok(value.parse::<i64>().unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user. The first user ever registered becomes the admin.
    pub fn create_user(&self, username: &str, password_hash: &str) -> StorageResult<UserRow> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .prepare("SELECT id FROM users WHERE username = ?1")?
            .query_row([username], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(StorageError::UsernameExists {
                username: username.to_string(),
            });
        }

        let user_count: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let is_admin = user_count == 0;

        tx.execute(
            "INSERT INTO users (username, password_hash, is_admin, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![username, password_hash, bool_to_int(is_admin), now_utc_string()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(UserRow {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            is_admin,
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> StorageResult<Option<UserRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, is_admin FROM users WHERE username = ?1",
        )?;
        let row = stmt
            .query_row([username], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password_hash: row.get(2)?,
                    is_admin: int_to_bool(row.get(3)?),
                })
            })
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Mailboxes
    // -----------------------------------------------------------------------

    /// Add a mailbox. Credentials are encrypted before the row is written;
    /// gmail/qq kinds get their fixed IMAP endpoints.
    pub fn add_mailbox(&self, input: &NewMailbox) -> StorageResult<i64> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .prepare("SELECT id FROM emails WHERE user_id = ?1 AND address = ?2 COLLATE NOCASE")?
            .query_row(params![input.user_id, input.address], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(StorageError::MailboxExists {
                address: input.address.clone(),
            });
        }

        let (server, port) = imap_endpoint_for(&input.kind, input.server.as_deref(), input.port);

        tx.execute(
            r#"
      INSERT INTO emails (
        user_id, address, kind,
        password, client_id, refresh_token,
        server, port, use_ssl,
        last_check_time, last_error, realtime_enabled, created_at
      ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, 1, ?10)
      "#,
            params![
                input.user_id,
                input.address,
                input.kind,
                self.vault.ensure_encrypted(&input.password),
                self.vault.ensure_encrypted(&input.client_id),
                self.vault.ensure_encrypted(&input.refresh_token),
                server,
                port.map(|p| p as i64),
                bool_to_int(input.use_ssl),
                now_utc_string()
            ],
        )?;

        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Update credentials and connection settings. `None` fields are left
    /// unchanged; credential fields are encrypted when plaintext.
    pub fn update_mailbox(&self, email_id: i64, update: &MailboxUpdate) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let mut set_clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(password) = &update.password {
            set_clauses.push("password = ?");
            values.push(Box::new(self.vault.ensure_encrypted(password)));
        }
        if let Some(client_id) = &update.client_id {
            set_clauses.push("client_id = ?");
            values.push(Box::new(self.vault.ensure_encrypted(client_id)));
        }
        if let Some(refresh_token) = &update.refresh_token {
            set_clauses.push("refresh_token = ?");
            values.push(Box::new(self.vault.ensure_encrypted(refresh_token)));
        }
        if let Some(server) = &update.server {
            set_clauses.push("server = ?");
            values.push(Box::new(server.clone()));
        }
        if let Some(port) = update.port {
            set_clauses.push("port = ?");
            values.push(Box::new(port as i64));
        }
        if let Some(use_ssl) = update.use_ssl {
            set_clauses.push("use_ssl = ?");
            values.push(Box::new(bool_to_int(use_ssl)));
        }

        if set_clauses.is_empty() {
            return Ok(false);
        }

        let sql = format!("UPDATE emails SET {} WHERE id = ?", set_clauses.join(", "));
        values.push(Box::new(email_id));
        let value_refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|v| v.as_ref()).collect();
        let changed = conn.execute(&sql, value_refs.as_slice())?;
        Ok(changed > 0)
    }

    /// Delete a mailbox. Messages, attachments, platform tags and
    /// subscriptions go with it (FK cascade).
    pub fn delete_mailbox(&self, email_id: i64) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let deleted = conn.execute("DELETE FROM emails WHERE id = ?1", params![email_id])?;
        Ok(deleted > 0)
    }

    pub fn batch_delete_mailboxes(&self, email_ids: &[i64]) -> StorageResult<usize> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for email_id in email_ids {
            deleted += tx.execute("DELETE FROM emails WHERE id = ?1", params![email_id])?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// List mailboxes, optionally scoped to one user (admins pass `None`).
    pub fn list_mailboxes(&self, user_id: Option<i64>) -> StorageResult<Vec<MailboxRow>> {
        let conn = self.open_connection()?;
        let sql = format!(
            "SELECT {MAILBOX_COLUMNS} FROM emails WHERE (?1 IS NULL OR user_id = ?1) ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], mailbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|m| self.decrypt_mailbox(m)).collect())
    }

    /// Fetch one mailbox. When `scope` is `Some(user_id)`, rows owned by
    /// other users are invisible.
    pub fn get_mailbox(
        &self,
        email_id: i64,
        scope: Option<i64>,
    ) -> StorageResult<Option<MailboxRow>> {
        let conn = self.open_connection()?;
        let sql = format!(
            "SELECT {MAILBOX_COLUMNS} FROM emails WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
        );
        let mut stmt = conn.prepare(&sql)?;
        let row = stmt
            .query_row(params![email_id, scope], mailbox_from_row)
            .optional()?;
        Ok(row.map(|m| self.decrypt_mailbox(m)))
    }

    pub fn find_mailbox_by_address(
        &self,
        scope: Option<i64>,
        address: &str,
    ) -> StorageResult<Option<MailboxRow>> {
        let conn = self.open_connection()?;
        let sql = format!(
            "SELECT {MAILBOX_COLUMNS} FROM emails \
             WHERE address = ?1 COLLATE NOCASE AND (?2 IS NULL OR user_id = ?2)"
        );
        let mut stmt = conn.prepare(&sql)?;
        let row = stmt
            .query_row(params![address, scope], mailbox_from_row)
            .optional()?;
        Ok(row.map(|m| self.decrypt_mailbox(m)))
    }

    pub fn list_outlook_mailboxes(&self) -> StorageResult<Vec<MailboxRow>> {
        let conn = self.open_connection()?;
        let sql =
            format!("SELECT {MAILBOX_COLUMNS} FROM emails WHERE kind = ?1 ORDER BY id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([KIND_OUTLOOK], mailbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|m| self.decrypt_mailbox(m)).collect())
    }

    /// Advance the mailbox's high-water mark to now. The mark never moves
    /// backwards, even if the system clock does.
    pub fn touch_check_time(&self, email_id: i64) -> StorageResult<()> {
        let conn = self.open_connection()?;
        let now = now_utc_string();
        conn.execute(
            "UPDATE emails SET last_check_time = ?1 \
             WHERE id = ?2 AND (last_check_time IS NULL OR last_check_time < ?1)",
            params![now, email_id],
        )?;
        Ok(())
    }

    pub fn set_last_error(&self, email_id: i64, message: &str) -> StorageResult<()> {
        let conn = self.open_connection()?;
        // Short diagnostic string only; full errors belong in the log.
        let message: String = message.chars().take(200).collect();
        conn.execute(
            "UPDATE emails SET last_error = ?1 WHERE id = ?2",
            params![message, email_id],
        )?;
        Ok(())
    }

    pub fn clear_last_error(&self, email_id: i64) -> StorageResult<()> {
        let conn = self.open_connection()?;
        conn.execute(
            "UPDATE emails SET last_error = NULL WHERE id = ?1",
            params![email_id],
        )?;
        Ok(())
    }

    pub fn set_realtime(&self, email_id: i64, enabled: bool) -> StorageResult<()> {
        let conn = self.open_connection()?;
        conn.execute(
            "UPDATE emails SET realtime_enabled = ?1 WHERE id = ?2",
            params![bool_to_int(enabled), email_id],
        )?;
        Ok(())
    }

    /// Number of stored messages for a mailbox; zero means first sync.
    pub fn mail_count(&self, email_id: i64) -> StorageResult<u64> {
        let conn = self.open_connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mail_records WHERE email_id = ?1",
            params![email_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    // -----------------------------------------------------------------------
    // Mail records
    // -----------------------------------------------------------------------

    /// Idempotent message insert keyed by (email_id, sender, subject,
    /// received_time). The probe and the insert run in one transaction, so
    /// two concurrent deliveries of the same logical message produce exactly
    /// one row. Returns `(inserted, mail_id)`.
    pub fn add_mail_record(&self, input: &NewMailRecord) -> StorageResult<(bool, i64)> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;

        let received_time = normalize_stored_time(&input.received_time);

        tx.execute(
            r#"
      INSERT OR IGNORE INTO mail_records (
        email_id, subject, sender, recipient, content,
        received_time, folder, has_attachments, created_at
      ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
      "#,
            params![
                input.email_id,
                input.subject,
                input.sender,
                input.recipient,
                input.content,
                received_time,
                input.folder,
                bool_to_int(input.has_attachments),
                now_utc_string()
            ],
        )?;

        let inserted = tx.changes() > 0;
        let mail_id: i64 = tx.query_row(
            "SELECT id FROM mail_records \
             WHERE email_id = ?1 AND sender = ?2 AND subject = ?3 AND received_time = ?4",
            params![input.email_id, input.sender, input.subject, received_time],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok((inserted, mail_id))
    }

    pub fn list_mail_records(&self, email_id: i64) -> StorageResult<Vec<MailRecordRow>> {
        let conn = self.open_connection()?;
        let sql = format!(
            "SELECT {MAIL_RECORD_COLUMNS} FROM mail_records \
             WHERE email_id = ?1 ORDER BY received_time DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![email_id], mail_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Messages for one mailbox received at or after `cutoff`, newest first.
    pub fn list_mail_records_since(
        &self,
        email_id: i64,
        cutoff: &str,
    ) -> StorageResult<Vec<MailRecordRow>> {
        let conn = self.open_connection()?;
        let sql = format!(
            "SELECT {MAIL_RECORD_COLUMNS} FROM mail_records \
             WHERE email_id = ?1 AND received_time >= ?2 \
             ORDER BY received_time DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![email_id, cutoff], mail_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The user's messages received within the last `window_minutes`, newest
    /// first, capped at `limit`. Falls back to the `limit` most recent
    /// messages when nothing qualifies.
    pub fn latest_for_user(
        &self,
        user_id: i64,
        limit: usize,
        window_minutes: i64,
    ) -> StorageResult<Vec<MailRecordRow>> {
        let conn = self.open_connection()?;
        let cutoff =
            format_utc(OffsetDateTime::now_utc() - time::Duration::minutes(window_minutes));

        let sql = format!(
            "SELECT {MAIL_RECORD_COLUMNS_QUALIFIED} FROM mail_records m \
             JOIN emails e ON e.id = m.email_id \
             WHERE e.user_id = ?1 AND m.received_time >= ?2 \
             ORDER BY m.received_time DESC, m.id DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, cutoff, limit as i64], mail_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        if !rows.is_empty() {
            return Ok(rows);
        }

        let sql = format!(
            "SELECT {MAIL_RECORD_COLUMNS_QUALIFIED} FROM mail_records m \
             JOIN emails e ON e.id = m.email_id \
             WHERE e.user_id = ?1 \
             ORDER BY m.received_time DESC, m.id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], mail_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Case-insensitive substring search across the selected columns of the
    /// given mailboxes.
    pub fn search_mail_records(
        &self,
        email_ids: &[i64],
        query: &str,
        fields: &SearchFields,
    ) -> StorageResult<Vec<MailRecordRow>> {
        if email_ids.is_empty() || query.is_empty() {
            return Ok(Vec::new());
        }

        let mut column_clauses = Vec::new();
        if fields.in_subject {
            column_clauses.push("LOWER(subject) LIKE ?1");
        }
        if fields.in_sender {
            column_clauses.push("LOWER(sender) LIKE ?1");
        }
        if fields.in_recipient {
            column_clauses.push("LOWER(COALESCE(recipient, '')) LIKE ?1");
        }
        if fields.in_content {
            column_clauses.push("LOWER(content) LIKE ?1");
        }
        if column_clauses.is_empty() {
            return Ok(Vec::new());
        }

        let id_placeholders = (0..email_ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {MAIL_RECORD_COLUMNS} FROM mail_records \
             WHERE email_id IN ({id_placeholders}) AND ({}) \
             ORDER BY received_time DESC, id DESC",
            column_clauses.join(" OR ")
        );

        let needle = format!("%{}%", query.to_lowercase());
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(needle)];
        for email_id in email_ids {
            values.push(Box::new(*email_id));
        }
        let value_refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|v| v.as_ref()).collect();

        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(value_refs.as_slice(), mail_record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    pub fn add_attachment(&self, input: &NewAttachment) -> StorageResult<i64> {
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO attachments (mail_id, filename, content_type, size, content) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                input.mail_id,
                input.filename,
                input.content_type,
                input.content.len() as i64,
                input.content
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attachment metadata for one message (the blob itself stays on disk
    /// until [`Storage::get_attachment`] is called).
    pub fn list_attachments(&self, mail_id: i64) -> StorageResult<Vec<AttachmentMetaRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, mail_id, filename, content_type, size FROM attachments \
             WHERE mail_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![mail_id], |row| {
                Ok(AttachmentMetaRow {
                    id: row.get(0)?,
                    mail_id: row.get(1)?,
                    filename: row.get(2)?,
                    content_type: row.get(3)?,
                    size: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_attachment(&self, attachment_id: i64) -> StorageResult<Option<AttachmentRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, mail_id, filename, content_type, size, content FROM attachments \
             WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![attachment_id], |row| {
                Ok(AttachmentRow {
                    id: row.get(0)?,
                    mail_id: row.get(1)?,
                    filename: row.get(2)?,
                    content_type: row.get(3)?,
                    size: row.get::<_, i64>(4)?.max(0) as u64,
                    content: row.get(5)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Platform tags, rules, corrections
    // -----------------------------------------------------------------------

    /// Tag a mailbox with a platform name. Names are deduplicated
    /// case-insensitively; returns whether a new tag was written.
    pub fn add_platform_tag(&self, email_id: i64, platform_name: &str) -> StorageResult<bool> {
        let platform_name = platform_name.trim();
        if platform_name.is_empty() {
            return Ok(false);
        }

        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .prepare(
                "SELECT id FROM email_platforms \
                 WHERE email_id = ?1 AND platform_name = ?2 COLLATE NOCASE",
            )?
            .query_row(params![email_id, platform_name], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO email_platforms (email_id, platform_name, created_at) \
             VALUES (?1, ?2, ?3)",
            params![email_id, platform_name, now_utc_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn list_platform_tags(&self, email_id: i64) -> StorageResult<Vec<String>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT platform_name FROM email_platforms WHERE email_id = ?1 \
             ORDER BY platform_name ASC",
        )?;
        let rows = stmt
            .query_map(params![email_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_platform_tag(&self, email_id: i64, platform_name: &str) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let deleted = conn.execute(
            "DELETE FROM email_platforms \
             WHERE email_id = ?1 AND platform_name = ?2 COLLATE NOCASE",
            params![email_id, platform_name],
        )?;
        Ok(deleted > 0)
    }

    pub fn add_platform_rule(&self, input: &NewPlatformRule) -> StorageResult<i64> {
        let conn = self.open_connection()?;
        conn.execute(
            r#"
      INSERT INTO platform_rules (
        user_id, platform_name, sender_pattern, subject_pattern, content_pattern, is_enabled
      ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
      "#,
            params![
                input.user_id,
                input.platform_name,
                input.sender_pattern,
                input.subject_pattern,
                input.content_pattern,
                bool_to_int(input.is_enabled)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_platform_rules(&self, user_id: i64) -> StorageResult<Vec<PlatformRuleRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, platform_name, sender_pattern, subject_pattern, \
             content_pattern, is_enabled \
             FROM platform_rules WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], platform_rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_platform_rule_enabled(&self, rule_id: i64, enabled: bool) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let changed = conn.execute(
            "UPDATE platform_rules SET is_enabled = ?1 WHERE id = ?2",
            params![bool_to_int(enabled), rule_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_platform_rule(&self, rule_id: i64) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let deleted =
            conn.execute("DELETE FROM platform_rules WHERE id = ?1", params![rule_id])?;
        Ok(deleted > 0)
    }

    /// Evaluate the user's enabled rules against one message. A rule matches
    /// when every pattern it supplies matches; rules with no pattern at all,
    /// or with an invalid regex, never match.
    pub fn match_rules(
        &self,
        user_id: i64,
        sender: &str,
        subject: &str,
        content: &str,
    ) -> StorageResult<Vec<String>> {
        let rules = self.list_platform_rules(user_id)?;
        let mut matched = Vec::new();

        for rule in rules.into_iter().filter(|r| r.is_enabled) {
            if rule_matches(&rule, sender, subject, content) {
                matched.push(rule.platform_name);
            }
        }

        Ok(matched)
    }

    pub fn upsert_platform_correction(
        &self,
        user_id: i64,
        sender_domain: &str,
        corrected_name: &str,
    ) -> StorageResult<()> {
        let conn = self.open_connection()?;
        conn.execute(
            r#"
      INSERT INTO platform_corrections (user_id, sender_domain, corrected_name)
      VALUES (?1, ?2, ?3)
      ON CONFLICT(user_id, sender_domain) DO UPDATE SET corrected_name = excluded.corrected_name
      "#,
            params![user_id, sender_domain.to_lowercase(), corrected_name],
        )?;
        Ok(())
    }

    pub fn get_platform_correction(
        &self,
        user_id: i64,
        sender_domain: &str,
    ) -> StorageResult<Option<String>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT corrected_name FROM platform_corrections \
             WHERE user_id = ?1 AND sender_domain = ?2",
        )?;
        let row = stmt
            .query_row(params![user_id, sender_domain.to_lowercase()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(row)
    }

    pub fn list_platform_corrections(
        &self,
        user_id: i64,
    ) -> StorageResult<Vec<PlatformCorrectionRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, sender_domain, corrected_name FROM platform_corrections \
             WHERE user_id = ?1 ORDER BY sender_domain ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(PlatformCorrectionRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    sender_domain: row.get(2)?,
                    corrected_name: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_platform_correction(
        &self,
        user_id: i64,
        sender_domain: &str,
    ) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let deleted = conn.execute(
            "DELETE FROM platform_corrections WHERE user_id = ?1 AND sender_domain = ?2",
            params![user_id, sender_domain.to_lowercase()],
        )?;
        Ok(deleted > 0)
    }

    /// One random mailbox of the user not yet tagged with `platform`, plus
    /// how many such mailboxes remain in total.
    pub fn random_unregistered(
        &self,
        user_id: i64,
        platform: &str,
    ) -> StorageResult<(Option<MailboxRow>, u64)> {
        let conn = self.open_connection()?;

        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails e WHERE e.user_id = ?1 AND NOT EXISTS (\
               SELECT 1 FROM email_platforms p \
               WHERE p.email_id = e.id AND p.platform_name = ?2 COLLATE NOCASE)",
            params![user_id, platform],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {MAILBOX_COLUMNS} FROM emails e WHERE e.user_id = ?1 AND NOT EXISTS (\
               SELECT 1 FROM email_platforms p \
               WHERE p.email_id = e.id AND p.platform_name = ?2 COLLATE NOCASE) \
             ORDER BY RANDOM() LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let row = stmt
            .query_row(params![user_id, platform], mailbox_from_row)
            .optional()?;

        Ok((
            row.map(|m| self.decrypt_mailbox(m)),
            remaining.max(0) as u64,
        ))
    }

    pub fn list_registered(&self, user_id: i64, platform: &str) -> StorageResult<Vec<MailboxRow>> {
        self.list_by_platform_membership(user_id, platform, true)
    }

    pub fn list_unregistered(
        &self,
        user_id: i64,
        platform: &str,
    ) -> StorageResult<Vec<MailboxRow>> {
        self.list_by_platform_membership(user_id, platform, false)
    }

    fn list_by_platform_membership(
        &self,
        user_id: i64,
        platform: &str,
        registered: bool,
    ) -> StorageResult<Vec<MailboxRow>> {
        let conn = self.open_connection()?;
        let membership = if registered { "EXISTS" } else { "NOT EXISTS" };
        let sql = format!(
            "SELECT {MAILBOX_COLUMNS} FROM emails e WHERE e.user_id = ?1 AND {membership} (\
               SELECT 1 FROM email_platforms p \
               WHERE p.email_id = e.id AND p.platform_name = ?2 COLLATE NOCASE) \
             ORDER BY e.id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, platform], mailbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|m| self.decrypt_mailbox(m)).collect())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Record a provider-side subscription. At most one row exists per
    /// (mailbox, resource); re-creating replaces the previous record.
    pub fn upsert_subscription(
        &self,
        email_id: i64,
        subscription_id: &str,
        resource: &str,
        expiration_time: &str,
    ) -> StorageResult<()> {
        let conn = self.open_connection()?;
        conn.execute(
            r#"
      INSERT INTO subscriptions (email_id, subscription_id, resource, expiration_time, created_at)
      VALUES (?1, ?2, ?3, ?4, ?5)
      ON CONFLICT(email_id, resource) DO UPDATE SET
        subscription_id = excluded.subscription_id,
        expiration_time = excluded.expiration_time
      "#,
            params![
                email_id,
                subscription_id,
                resource,
                normalize_stored_time(expiration_time),
                now_utc_string()
            ],
        )?;
        Ok(())
    }

    pub fn get_subscription(
        &self,
        email_id: i64,
        resource: &str,
    ) -> StorageResult<Option<SubscriptionRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, email_id, subscription_id, resource, expiration_time FROM subscriptions \
             WHERE email_id = ?1 AND resource = ?2",
        )?;
        let row = stmt
            .query_row(params![email_id, resource], subscription_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_subscriptions_for_email(
        &self,
        email_id: i64,
    ) -> StorageResult<Vec<SubscriptionRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, email_id, subscription_id, resource, expiration_time FROM subscriptions \
             WHERE email_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![email_id], subscription_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_subscriptions(&self) -> StorageResult<Vec<SubscriptionRow>> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, email_id, subscription_id, resource, expiration_time FROM subscriptions \
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], subscription_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Subscriptions expiring within the next `hours`.
    pub fn list_expiring_subscriptions(&self, hours: i64) -> StorageResult<Vec<SubscriptionRow>> {
        let conn = self.open_connection()?;
        let horizon = format_utc(OffsetDateTime::now_utc() + time::Duration::hours(hours));
        let mut stmt = conn.prepare(
            "SELECT id, email_id, subscription_id, resource, expiration_time FROM subscriptions \
             WHERE expiration_time <= ?1 ORDER BY expiration_time ASC",
        )?;
        let rows = stmt
            .query_map(params![horizon], subscription_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_subscription_expiration(
        &self,
        subscription_id: &str,
        new_time: &str,
    ) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let changed = conn.execute(
            "UPDATE subscriptions SET expiration_time = ?1 WHERE subscription_id = ?2",
            params![normalize_stored_time(new_time), subscription_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_subscription_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE subscription_id = ?1",
            params![subscription_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn delete_subscriptions_by_email_id(&self, email_id: i64) -> StorageResult<usize> {
        let conn = self.open_connection()?;
        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE email_id = ?1",
            params![email_id],
        )?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // System config
    // -----------------------------------------------------------------------

    pub fn get_config_bool(&self, key: &str, default: bool) -> StorageResult<bool> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare("SELECT value FROM system_config WHERE key = ?1")?;
        let value: Option<String> = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(match value.as_deref() {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        })
    }

    pub fn set_config_bool(&self, key: &str, value: bool) -> StorageResult<()> {
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO system_config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, if value { "true" } else { "false" }],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Credential migration
    // -----------------------------------------------------------------------

    /// Encrypt any legacy plaintext credential columns in place. Returns
    /// `(encrypted, skipped)` mailbox counts. Safe to run repeatedly.
    pub fn migrate_encrypt_credentials(&self) -> StorageResult<(usize, usize)> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;

        let rows: Vec<(i64, String, String, String)> = {
            let mut stmt =
                tx.prepare("SELECT id, password, client_id, refresh_token FROM emails")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut encrypted = 0;
        let mut skipped = 0;

        for (email_id, password, client_id, refresh_token) in rows {
            let mut set_clauses: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if !password.is_empty() && !is_encrypted(&password) {
                set_clauses.push("password = ?");
                values.push(Box::new(self.vault.encrypt(&password)));
            }
            if !client_id.is_empty() && !is_encrypted(&client_id) {
                set_clauses.push("client_id = ?");
                values.push(Box::new(self.vault.encrypt(&client_id)));
            }
            if !refresh_token.is_empty() && !is_encrypted(&refresh_token) {
                set_clauses.push("refresh_token = ?");
                values.push(Box::new(self.vault.encrypt(&refresh_token)));
            }

            if set_clauses.is_empty() {
                skipped += 1;
                continue;
            }

            let sql = format!("UPDATE emails SET {} WHERE id = ?", set_clauses.join(", "));
            values.push(Box::new(email_id));
            let value_refs: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            tx.execute(&sql, value_refs.as_slice())?;
            encrypted += 1;
        }

        tx.commit()?;
        Ok((encrypted, skipped))
    }

    /// Raw (still-encrypted) credential columns, for audits and tests.
    pub fn raw_credentials(
        &self,
        email_id: i64,
    ) -> StorageResult<Option<(String, String, String)>> {
        let conn = self.open_connection()?;
        let mut stmt =
            conn.prepare("SELECT password, client_id, refresh_token FROM emails WHERE id = ?1")?;
        let row = stmt
            .query_row(params![email_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        Ok(row)
    }

    fn decrypt_mailbox(&self, mut mailbox: MailboxRow) -> MailboxRow {
        mailbox.password = self.vault.decrypt(&mailbox.password);
        mailbox.client_id = self.vault.decrypt(&mailbox.client_id);
        mailbox.refresh_token = self.vault.decrypt(&mailbox.refresh_token);
        mailbox
    }

    fn open_connection(&self) -> StorageResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(&self.db_path, flags)?;
        apply_connection_pragmas(&conn)?;
        conn.busy_timeout(DB_BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

// ---------------------------------------------------------------------------
// Row & input types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
}

/// A credentialed mailbox. Credential fields hold plaintext once the row has
/// passed through [`Storage`]; the custom `Debug` impl redacts them.
#[derive(Clone)]
pub struct MailboxRow {
    pub id: i64,
    pub user_id: i64,
    pub address: String,
    pub kind: String,
    pub password: String,
    pub client_id: String,
    pub refresh_token: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub use_ssl: bool,
    pub last_check_time: Option<String>,
    pub last_error: Option<String>,
    pub realtime_enabled: bool,
    pub created_at: String,
}

impl std::fmt::Debug for MailboxRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxRow")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("password", &"[REDACTED]")
            .field("client_id", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("last_check_time", &self.last_check_time)
            .field("last_error", &self.last_error)
            .field("realtime_enabled", &self.realtime_enabled)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewMailbox {
    pub user_id: i64,
    pub address: String,
    pub kind: String,
    pub password: String,
    pub client_id: String,
    pub refresh_token: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub use_ssl: bool,
}

impl NewMailbox {
    pub fn outlook(
        user_id: i64,
        address: String,
        password: String,
        client_id: String,
        refresh_token: String,
    ) -> Self {
        Self {
            user_id,
            address,
            kind: KIND_OUTLOOK.to_string(),
            password,
            client_id,
            refresh_token,
            server: None,
            port: None,
            use_ssl: true,
        }
    }

    pub fn imap(user_id: i64, address: String, password: String, kind: String) -> Self {
        Self {
            user_id,
            address,
            kind,
            password,
            client_id: String::new(),
            refresh_token: String::new(),
            server: None,
            port: None,
            use_ssl: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MailboxUpdate {
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub refresh_token: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub use_ssl: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewMailRecord {
    pub email_id: i64,
    pub subject: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub received_time: String,
    pub folder: String,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MailRecordRow {
    pub id: i64,
    pub email_id: i64,
    pub subject: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub received_time: String,
    pub folder: String,
    pub has_attachments: bool,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub mail_id: i64,
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AttachmentMetaRow {
    pub id: i64,
    pub mail_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub id: i64,
    pub mail_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewPlatformRule {
    pub user_id: i64,
    pub platform_name: String,
    pub sender_pattern: Option<String>,
    pub subject_pattern: Option<String>,
    pub content_pattern: Option<String>,
    pub is_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PlatformRuleRow {
    pub id: i64,
    pub user_id: i64,
    pub platform_name: String,
    pub sender_pattern: Option<String>,
    pub subject_pattern: Option<String>,
    pub content_pattern: Option<String>,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlatformCorrectionRow {
    pub id: i64,
    pub user_id: i64,
    pub sender_domain: String,
    pub corrected_name: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub id: i64,
    pub email_id: i64,
    pub subscription_id: String,
    pub resource: String,
    pub expiration_time: String,
}

/// Which columns a substring search inspects.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFields {
    pub in_subject: bool,
    pub in_sender: bool,
    pub in_recipient: bool,
    pub in_content: bool,
}

impl SearchFields {
    pub fn all() -> Self {
        Self {
            in_subject: true,
            in_sender: true,
            in_recipient: true,
            in_content: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const MAILBOX_COLUMNS: &str = "id, user_id, address, kind, password, client_id, refresh_token, \
     server, port, use_ssl, last_check_time, last_error, realtime_enabled, created_at";

const MAIL_RECORD_COLUMNS: &str =
    "id, email_id, subject, sender, recipient, content, received_time, folder, has_attachments";

const MAIL_RECORD_COLUMNS_QUALIFIED: &str = "m.id, m.email_id, m.subject, m.sender, m.recipient, \
     m.content, m.received_time, m.folder, m.has_attachments";

fn mailbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxRow> {
    Ok(MailboxRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        address: row.get(2)?,
        kind: row.get(3)?,
        password: row.get(4)?,
        client_id: row.get(5)?,
        refresh_token: row.get(6)?,
        server: row.get(7)?,
        port: row
            .get::<_, Option<i64>>(8)?
            .and_then(|p| u16::try_from(p.max(0)).ok()),
        use_ssl: int_to_bool(row.get(9)?),
        last_check_time: row.get(10)?,
        last_error: row.get(11)?,
        realtime_enabled: int_to_bool(row.get(12)?),
        created_at: row.get(13)?,
    })
}

fn mail_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailRecordRow> {
    Ok(MailRecordRow {
        id: row.get(0)?,
        email_id: row.get(1)?,
        subject: row.get(2)?,
        sender: row.get(3)?,
        recipient: row.get(4)?,
        content: row.get(5)?,
        received_time: row.get(6)?,
        folder: row.get(7)?,
        has_attachments: int_to_bool(row.get(8)?),
    })
}

fn platform_rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformRuleRow> {
    Ok(PlatformRuleRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        platform_name: row.get(2)?,
        sender_pattern: row.get(3)?,
        subject_pattern: row.get(4)?,
        content_pattern: row.get(5)?,
        is_enabled: int_to_bool(row.get(6)?),
    })
}

fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: row.get(0)?,
        email_id: row.get(1)?,
        subscription_id: row.get(2)?,
        resource: row.get(3)?,
        expiration_time: row.get(4)?,
    })
}

fn rule_matches(rule: &PlatformRuleRow, sender: &str, subject: &str, content: &str) -> bool {
    let pairs = [
        (&rule.sender_pattern, sender),
        (&rule.subject_pattern, subject),
        (&rule.content_pattern, content),
    ];

    let mut any_pattern = false;
    for (pattern, haystack) in pairs {
        let Some(pattern) = pattern.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };
        any_pattern = true;
        match regex::Regex::new(pattern) {
            Ok(re) if re.is_match(haystack) => {}
            _ => return false,
        }
    }

    any_pattern
}

fn imap_endpoint_for(
    kind: &str,
    server: Option<&str>,
    port: Option<u16>,
) -> (Option<String>, Option<u16>) {
    match kind {
        KIND_GMAIL => (Some("imap.gmail.com".to_string()), Some(993)),
        KIND_QQ => (Some("imap.qq.com".to_string()), Some(993)),
        KIND_IMAP => (
            Some(server.unwrap_or("imap.gmail.com").to_string()),
            Some(port.unwrap_or(993)),
        ),
        _ => (None, None),
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn create_parent_dir_if_needed(db_path: &Path) -> StorageResult<()> {
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)?;
    Ok(())
}

fn test_db_path() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("mailfleet_test_{pid}_{nanos}_{counter}.sqlite3"))
}

fn apply_connection_pragmas(conn: &Connection) -> StorageResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", PRAGMA_JOURNAL_MODE_WAL)?;
    conn.pragma_update(None, "synchronous", PRAGMA_SYNCHRONOUS_NORMAL)?;
    Ok(())
}

fn migrate(conn: &mut Connection) -> StorageResult<()> {
    let tx = conn.transaction()?;
    create_schema_meta_table(&tx)?;
    let existing_version = get_schema_version(&tx)?;

    let Some(existing_version) = existing_version else {
        create_schema_v1(&tx)?;
        set_schema_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;
        return Ok(());
    };

    if existing_version > SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: existing_version,
            supported: SCHEMA_VERSION,
        });
    }

    tx.commit()?;
    Ok(())
}

fn create_schema_meta_table(tx: &Transaction<'_>) -> StorageResult<()> {
    tx.execute_batch(
        r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL
    );
    "#,
    )?;
    Ok(())
}

fn get_schema_version(tx: &Transaction<'_>) -> StorageResult<Option<i64>> {
    let mut stmt = tx.prepare("SELECT value FROM schema_meta WHERE key = ?1")?;
    let mut rows = stmt.query([SCHEMA_META_KEY_SCHEMA_VERSION])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let value: String = row.get(0)?;
    let parsed: i64 = value.parse().unwrap_or(0);
    Ok(Some(parsed))
}

fn set_schema_version(tx: &Transaction<'_>, version: i64) -> StorageResult<()> {
    tx.execute(
        r#"
    INSERT INTO schema_meta (key, value) VALUES (?1, ?2)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value
    "#,
        params![SCHEMA_META_KEY_SCHEMA_VERSION, version.to_string()],
    )?;
    Ok(())
}

fn create_schema_v1(tx: &Transaction<'_>) -> StorageResult<()> {
    tx.execute_batch(
        r#"
    CREATE TABLE IF NOT EXISTS users (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      username TEXT NOT NULL UNIQUE,
      password_hash TEXT NOT NULL,
      is_admin INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS emails (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      user_id INTEGER NOT NULL,
      address TEXT NOT NULL,
      kind TEXT NOT NULL DEFAULT 'outlook',
      password TEXT NOT NULL DEFAULT '',
      client_id TEXT NOT NULL DEFAULT '',
      refresh_token TEXT NOT NULL DEFAULT '',
      server TEXT,
      port INTEGER,
      use_ssl INTEGER NOT NULL DEFAULT 1,
      last_check_time TEXT,
      last_error TEXT,
      realtime_enabled INTEGER NOT NULL DEFAULT 1,
      created_at TEXT NOT NULL,
      UNIQUE(user_id, address),
      FOREIGN KEY(user_id) REFERENCES users(id)
    );

    CREATE TABLE IF NOT EXISTS mail_records (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      email_id INTEGER NOT NULL,
      subject TEXT NOT NULL,
      sender TEXT NOT NULL,
      recipient TEXT,
      content TEXT NOT NULL,
      received_time TEXT NOT NULL,
      folder TEXT NOT NULL DEFAULT 'INBOX',
      has_attachments INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL,
      UNIQUE(email_id, sender, subject, received_time),
      FOREIGN KEY(email_id) REFERENCES emails(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_mail_records_email_received
      ON mail_records(email_id, received_time DESC);

    CREATE TABLE IF NOT EXISTS attachments (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      mail_id INTEGER NOT NULL,
      filename TEXT NOT NULL,
      content_type TEXT NOT NULL,
      size INTEGER NOT NULL,
      content BLOB NOT NULL,
      FOREIGN KEY(mail_id) REFERENCES mail_records(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS email_platforms (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      email_id INTEGER NOT NULL,
      platform_name TEXT NOT NULL,
      created_at TEXT NOT NULL,
      FOREIGN KEY(email_id) REFERENCES emails(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_email_platforms_email
      ON email_platforms(email_id);

    CREATE TABLE IF NOT EXISTS platform_rules (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      user_id INTEGER NOT NULL,
      platform_name TEXT NOT NULL,
      sender_pattern TEXT,
      subject_pattern TEXT,
      content_pattern TEXT,
      is_enabled INTEGER NOT NULL DEFAULT 1,
      FOREIGN KEY(user_id) REFERENCES users(id)
    );

    CREATE TABLE IF NOT EXISTS platform_corrections (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      user_id INTEGER NOT NULL,
      sender_domain TEXT NOT NULL,
      corrected_name TEXT NOT NULL,
      UNIQUE(user_id, sender_domain),
      FOREIGN KEY(user_id) REFERENCES users(id)
    );

    CREATE TABLE IF NOT EXISTS subscriptions (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      email_id INTEGER NOT NULL,
      subscription_id TEXT NOT NULL,
      resource TEXT NOT NULL,
      expiration_time TEXT NOT NULL,
      created_at TEXT NOT NULL,
      UNIQUE(email_id, resource),
      FOREIGN KEY(email_id) REFERENCES emails(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS system_config (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL
    );
    "#,
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Format a timestamp as `YYYY-MM-DDTHH:MM:SSZ`. All stored timestamps go
/// through this, so lexicographic comparison in SQL matches chronological
/// order.
pub fn format_utc(timestamp: OffsetDateTime) -> String {
    timestamp
        .to_offset(time::UtcOffset::UTC)
        .replace_nanosecond(0)
        .unwrap_or(timestamp)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_utc_string() -> String {
    format_utc(OffsetDateTime::now_utc())
}

/// Parse a stored or caller-supplied timestamp. Accepts RFC 3339 as well as
/// the naive `YYYY-MM-DD HH:MM:SS` shape older deployments wrote; naive
/// strings are treated as UTC.
pub fn parse_utc(value: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(parsed);
    }
    parse_naive_utc(value)
}

fn parse_naive_utc(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    let (date_part, time_part) = value.split_once([' ', 'T'])?;

    let mut date_fields = date_part.split('-');
    let year: i32 = date_fields.next()?.parse().ok()?;
    let month: u8 = date_fields.next()?.parse().ok()?;
    let day: u8 = date_fields.next()?.parse().ok()?;

    let time_part = time_part.trim_end_matches('Z');
    let mut time_fields = time_part.split(':');
    let hour: u8 = time_fields.next()?.parse().ok()?;
    let minute: u8 = time_fields.next()?.parse().ok()?;
    let second: u8 = time_fields
        .next()
        .map(|s| s.split('.').next().unwrap_or("0"))
        .unwrap_or("0")
        .parse()
        .ok()?;

    let date =
        time::Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()?;
    let time_value = time::Time::from_hms(hour, minute, second).ok()?;
    Some(time::PrimitiveDateTime::new(date, time_value).assume_utc())
}

/// Normalize a timestamp for storage; unparseable input is kept verbatim so
/// bad provider data does not fail the insert.
fn normalize_stored_time(value: &str) -> String {
    match parse_utc(value) {
        Some(parsed) => format_utc(parsed),
        None => value.to_string(),
    }
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

fn int_to_bool(value: i64) -> bool {
    value != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_user() -> (Storage, i64) {
        let storage = Storage::open_for_tests().unwrap();
        let user = storage.create_user("tester", "hash").unwrap();
        (storage, user.id)
    }

    fn outlook_mailbox(storage: &Storage, user_id: i64, address: &str) -> i64 {
        storage
            .add_mailbox(&NewMailbox::outlook(
                user_id,
                address.to_string(),
                "pw".to_string(),
                "client".to_string(),
                "refresh".to_string(),
            ))
            .unwrap()
    }

    fn record(email_id: i64, subject: &str, sender: &str, received: &str) -> NewMailRecord {
        NewMailRecord {
            email_id,
            subject: subject.to_string(),
            sender: sender.to_string(),
            recipient: None,
            content: format!("body of {subject}"),
            received_time: received.to_string(),
            folder: FOLDER_INBOX.to_string(),
            has_attachments: false,
        }
    }

    #[test]
    fn open_creates_schema() {
        let storage = Storage::open_for_tests().unwrap();
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn first_user_is_admin() {
        let storage = Storage::open_for_tests().unwrap();
        let first = storage.create_user("alice", "h1").unwrap();
        let second = storage.create_user("bob", "h2").unwrap();
        assert!(first.is_admin);
        assert!(!second.is_admin);

        let err = storage.create_user("alice", "h3").unwrap_err();
        assert!(matches!(err, StorageError::UsernameExists { .. }));
    }

    #[test]
    fn mailbox_roundtrip_decrypts_credentials() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        let mailbox = storage.get_mailbox(email_id, None).unwrap().unwrap();
        assert_eq!(mailbox.password, "pw");
        assert_eq!(mailbox.client_id, "client");
        assert_eq!(mailbox.refresh_token, "refresh");
        assert_eq!(mailbox.kind, KIND_OUTLOOK);
    }

    #[test]
    fn credentials_are_ciphertext_at_rest() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        let (password, client_id, refresh_token) =
            storage.raw_credentials(email_id).unwrap().unwrap();
        assert!(is_encrypted(&password));
        assert!(is_encrypted(&client_id));
        assert!(is_encrypted(&refresh_token));
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let (storage, user_id) = storage_with_user();
        outlook_mailbox(&storage, user_id, "a@outlook.com");
        let err = storage
            .add_mailbox(&NewMailbox::outlook(
                user_id,
                "A@Outlook.com".to_string(),
                "pw".to_string(),
                "client".to_string(),
                "refresh".to_string(),
            ))
            .unwrap_err();
        assert!(matches!(err, StorageError::MailboxExists { .. }));
    }

    #[test]
    fn gmail_kind_gets_fixed_endpoint() {
        let (storage, user_id) = storage_with_user();
        let email_id = storage
            .add_mailbox(&NewMailbox::imap(
                user_id,
                "a@gmail.com".to_string(),
                "pw".to_string(),
                KIND_GMAIL.to_string(),
            ))
            .unwrap();

        let mailbox = storage.get_mailbox(email_id, None).unwrap().unwrap();
        assert_eq!(mailbox.server.as_deref(), Some("imap.gmail.com"));
        assert_eq!(mailbox.port, Some(993));
    }

    #[test]
    fn scoped_get_hides_other_users_mailboxes() {
        let storage = Storage::open_for_tests().unwrap();
        let alice = storage.create_user("alice", "h").unwrap();
        let bob = storage.create_user("bob", "h").unwrap();
        let email_id = outlook_mailbox(&storage, alice.id, "a@outlook.com");

        assert!(storage
            .get_mailbox(email_id, Some(alice.id))
            .unwrap()
            .is_some());
        assert!(storage
            .get_mailbox(email_id, Some(bob.id))
            .unwrap()
            .is_none());
        assert!(storage.get_mailbox(email_id, None).unwrap().is_some());
    }

    #[test]
    fn add_mail_record_is_idempotent() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        let input = record(
            email_id,
            "Your code is 482917",
            "no-reply@site.com",
            "2026-01-05T18:58:09Z",
        );
        let (inserted_1, id_1) = storage.add_mail_record(&input).unwrap();
        let (inserted_2, id_2) = storage.add_mail_record(&input).unwrap();

        assert!(inserted_1);
        assert!(!inserted_2);
        assert_eq!(id_1, id_2);
        assert_eq!(storage.mail_count(email_id).unwrap(), 1);
    }

    #[test]
    fn add_mail_record_normalizes_naive_time_to_utc() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        storage
            .add_mail_record(&record(email_id, "s", "x@y.com", "2026-01-05 18:58:09"))
            .unwrap();
        let records = storage.list_mail_records(email_id).unwrap();
        assert_eq!(records[0].received_time, "2026-01-05T18:58:09Z");
    }

    #[test]
    fn mail_records_are_newest_first() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        storage
            .add_mail_record(&record(email_id, "old", "x@y.com", "2026-01-01T00:00:00Z"))
            .unwrap();
        storage
            .add_mail_record(&record(email_id, "new", "x@y.com", "2026-01-02T00:00:00Z"))
            .unwrap();

        let records = storage.list_mail_records(email_id).unwrap();
        assert_eq!(records[0].subject, "new");
        assert_eq!(records[1].subject, "old");
    }

    #[test]
    fn touch_check_time_is_monotone() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        storage.touch_check_time(email_id).unwrap();
        let first = storage
            .get_mailbox(email_id, None)
            .unwrap()
            .unwrap()
            .last_check_time
            .unwrap();

        // Force a mark far in the future, then touch again: it must not move back.
        let conn = storage.open_connection().unwrap();
        conn.execute(
            "UPDATE emails SET last_check_time = ?1 WHERE id = ?2",
            params!["2999-01-01T00:00:00Z", email_id],
        )
        .unwrap();
        storage.touch_check_time(email_id).unwrap();

        let after = storage
            .get_mailbox(email_id, None)
            .unwrap()
            .unwrap()
            .last_check_time
            .unwrap();
        assert_eq!(after, "2999-01-01T00:00:00Z");
        assert!(after > first);
    }

    #[test]
    fn delete_mailbox_cascades() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        let (_, mail_id) = storage
            .add_mail_record(&record(email_id, "s", "x@y.com", "2026-01-01T00:00:00Z"))
            .unwrap();
        let attachment_id = storage
            .add_attachment(&NewAttachment {
                mail_id,
                filename: "a.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                content: vec![1, 2, 3],
            })
            .unwrap();
        storage.add_platform_tag(email_id, "Acme").unwrap();
        storage
            .upsert_subscription(email_id, "sub-1", "res", "2026-01-02T00:00:00Z")
            .unwrap();

        assert!(storage.delete_mailbox(email_id).unwrap());
        assert_eq!(storage.mail_count(email_id).unwrap(), 0);
        assert!(storage.get_attachment(attachment_id).unwrap().is_none());
        assert!(storage.list_subscriptions().unwrap().is_empty());
        assert!(storage.list_platform_tags(email_id).unwrap().is_empty());
    }

    #[test]
    fn latest_for_user_falls_back_outside_window() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        storage
            .add_mail_record(&record(
                email_id,
                "ancient",
                "x@y.com",
                "2020-01-01T00:00:00Z",
            ))
            .unwrap();

        let fallback = storage.latest_for_user(user_id, 10, 5).unwrap();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].subject, "ancient");

        let fresh_time = format_utc(OffsetDateTime::now_utc());
        storage
            .add_mail_record(&record(email_id, "fresh", "x@y.com", &fresh_time))
            .unwrap();
        let in_window = storage.latest_for_user(user_id, 10, 5).unwrap();
        assert_eq!(in_window.len(), 1);
        assert_eq!(in_window[0].subject, "fresh");
    }

    #[test]
    fn search_is_case_insensitive_and_column_scoped() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        storage
            .add_mail_record(&record(
                email_id,
                "Welcome Aboard",
                "Greeter <hi@acme.io>",
                "2026-01-01T00:00:00Z",
            ))
            .unwrap();

        let hits = storage
            .search_mail_records(
                &[email_id],
                "welcome",
                &SearchFields {
                    in_subject: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = storage
            .search_mail_records(
                &[email_id],
                "welcome",
                &SearchFields {
                    in_sender: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn platform_tags_dedup_case_insensitively() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        assert!(storage.add_platform_tag(email_id, "GitHub").unwrap());
        assert!(!storage.add_platform_tag(email_id, "github").unwrap());
        assert!(!storage.add_platform_tag(email_id, "  ").unwrap());
        assert_eq!(
            storage.list_platform_tags(email_id).unwrap(),
            vec!["GitHub"]
        );
    }

    #[test]
    fn match_rules_requires_all_supplied_patterns() {
        let (storage, user_id) = storage_with_user();

        storage
            .add_platform_rule(&NewPlatformRule {
                user_id,
                platform_name: "Acme".to_string(),
                sender_pattern: Some("@acme\\.com".to_string()),
                subject_pattern: Some("(?i)welcome".to_string()),
                content_pattern: None,
                is_enabled: true,
            })
            .unwrap();

        let hit = storage
            .match_rules(user_id, "bot@acme.com", "Welcome to Acme", "…")
            .unwrap();
        assert_eq!(hit, vec!["Acme"]);

        let miss = storage
            .match_rules(user_id, "bot@acme.com", "Invoice", "…")
            .unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn disabled_and_empty_rules_never_match() {
        let (storage, user_id) = storage_with_user();

        storage
            .add_platform_rule(&NewPlatformRule {
                user_id,
                platform_name: "NoPatterns".to_string(),
                sender_pattern: None,
                subject_pattern: None,
                content_pattern: None,
                is_enabled: true,
            })
            .unwrap();
        let rule_id = storage
            .add_platform_rule(&NewPlatformRule {
                user_id,
                platform_name: "Disabled".to_string(),
                sender_pattern: Some(".*".to_string()),
                subject_pattern: None,
                content_pattern: None,
                is_enabled: false,
            })
            .unwrap();

        let matched = storage.match_rules(user_id, "a@b.com", "s", "c").unwrap();
        assert!(matched.is_empty());

        storage.set_platform_rule_enabled(rule_id, true).unwrap();
        let matched = storage.match_rules(user_id, "a@b.com", "s", "c").unwrap();
        assert_eq!(matched, vec!["Disabled"]);
    }

    #[test]
    fn corrections_upsert_and_lookup_lowercase_domains() {
        let (storage, user_id) = storage_with_user();

        storage
            .upsert_platform_correction(user_id, "Example.COM", "Acme")
            .unwrap();
        storage
            .upsert_platform_correction(user_id, "example.com", "AcmeCorp")
            .unwrap();

        assert_eq!(
            storage
                .get_platform_correction(user_id, "EXAMPLE.com")
                .unwrap()
                .as_deref(),
            Some("AcmeCorp")
        );
        assert_eq!(storage.list_platform_corrections(user_id).unwrap().len(), 1);
    }

    #[test]
    fn random_unregistered_reports_remaining() {
        let (storage, user_id) = storage_with_user();
        let a = outlook_mailbox(&storage, user_id, "a@outlook.com");
        let _b = outlook_mailbox(&storage, user_id, "b@outlook.com");

        storage.add_platform_tag(a, "Acme").unwrap();

        let (candidate, remaining) = storage.random_unregistered(user_id, "acme").unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(candidate.unwrap().address, "b@outlook.com");

        assert_eq!(storage.list_registered(user_id, "Acme").unwrap().len(), 1);
        assert_eq!(storage.list_unregistered(user_id, "Acme").unwrap().len(), 1);
    }

    #[test]
    fn subscription_upsert_keeps_one_row_per_resource() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        storage
            .upsert_subscription(email_id, "sub-1", "inbox", "2026-01-01T00:00:00Z")
            .unwrap();
        storage
            .upsert_subscription(email_id, "sub-2", "inbox", "2026-02-01T00:00:00Z")
            .unwrap();

        let subs = storage.list_subscriptions_for_email(email_id).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscription_id, "sub-2");
        assert_eq!(subs[0].expiration_time, "2026-02-01T00:00:00Z");
    }

    #[test]
    fn expiring_subscriptions_filter_by_horizon() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        let soon = format_utc(OffsetDateTime::now_utc() + time::Duration::hours(2));
        let later = format_utc(OffsetDateTime::now_utc() + time::Duration::hours(48));
        storage
            .upsert_subscription(email_id, "soon", "inbox", &soon)
            .unwrap();
        storage
            .upsert_subscription(email_id, "later", "junk", &later)
            .unwrap();

        let expiring = storage.list_expiring_subscriptions(12).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].subscription_id, "soon");
    }

    #[test]
    fn config_bool_roundtrip_with_default() {
        let storage = Storage::open_for_tests().unwrap();
        assert!(storage.get_config_bool(CONFIG_USE_GRAPH_API, true).unwrap());
        storage.set_config_bool(CONFIG_USE_GRAPH_API, false).unwrap();
        assert!(!storage.get_config_bool(CONFIG_USE_GRAPH_API, true).unwrap());
    }

    #[test]
    fn migrate_encrypt_credentials_rewrites_legacy_plaintext() {
        let (storage, user_id) = storage_with_user();
        let email_id = outlook_mailbox(&storage, user_id, "a@outlook.com");

        // Simulate a legacy row written before encryption existed.
        let conn = storage.open_connection().unwrap();
        conn.execute(
            "UPDATE emails SET password = 'plain-pw', refresh_token = 'plain-rt' WHERE id = ?1",
            params![email_id],
        )
        .unwrap();

        let (encrypted, skipped) = storage.migrate_encrypt_credentials().unwrap();
        assert_eq!(encrypted, 1);
        assert_eq!(skipped, 0);

        let (password, client_id, refresh_token) =
            storage.raw_credentials(email_id).unwrap().unwrap();
        assert!(is_encrypted(&password));
        assert!(is_encrypted(&client_id));
        assert!(is_encrypted(&refresh_token));

        let mailbox = storage.get_mailbox(email_id, None).unwrap().unwrap();
        assert_eq!(mailbox.password, "plain-pw");
        assert_eq!(mailbox.refresh_token, "plain-rt");

        let (_, skipped_again) = storage.migrate_encrypt_credentials().unwrap();
        assert_eq!(skipped_again, 1);
    }

    #[test]
    fn parse_utc_accepts_both_shapes() {
        let a = parse_utc("2026-01-05T18:58:09Z").unwrap();
        let b = parse_utc("2026-01-05 18:58:09").unwrap();
        assert_eq!(a, b);
        assert!(parse_utc("not a time").is_none());
        assert_eq!(format_utc(a), "2026-01-05T18:58:09Z");
    }
}
