//! Pull-mode check scheduler.
//!
//! `check_one` runs a single mailbox under a wall-clock budget; `check_many`
//! fans a batch out to background tasks and returns immediately. A shared
//! in-flight set gives every mailbox mutual exclusion across both entry
//! points and the webhook fetch path, and carries the cooperative stop flag.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailfleet_adapters::graph::{GRAPH_FOLDER_INBOX, GRAPH_FOLDER_JUNK};
use mailfleet_adapters::imap;
use mailfleet_adapters::{FetchedMessage, ImapConnectionSettings};
use mailfleet_storage::{parse_utc, MailboxRow, CONFIG_USE_GRAPH_API, KIND_OUTLOOK};

use crate::error::{EngineError, EngineResult};
use crate::ingest;
use crate::Engine;

/// Wall-clock budget for one mailbox check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// Messages pulled per folder on a manual check.
const PULL_LIMIT: usize = 100;

/// Progress callback: `(percent, status)`. Must not block; panics inside it
/// are swallowed.
pub type ProgressFn = Box<dyn Fn(u8, &str) + Send + Sync>;

/// Batch progress callback: `(email_id, percent, status)`.
pub type BatchProgressFn = Arc<dyn Fn(i64, u8, &str) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub total: usize,
    pub saved: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStart {
    pub started: Vec<i64>,
    pub skipped: Vec<i64>,
}

/// The set of mailboxes currently being fetched, with their stop flags.
/// An entry exists from dispatch until the job finishes, success or not.
#[derive(Debug, Default)]
pub struct InFlight {
    inner: Mutex<HashMap<i64, CancellationToken>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a mailbox for fetching. Returns `None` when a fetch is already
    /// running for it.
    pub fn try_begin(&self, email_id: i64) -> Option<CancellationToken> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        if inner.contains_key(&email_id) {
            return None;
        }
        let token = CancellationToken::new();
        inner.insert(email_id, token.clone());
        Some(token)
    }

    pub fn finish(&self, email_id: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(&email_id);
        }
    }

    pub fn is_processing(&self, email_id: i64) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.contains_key(&email_id))
            .unwrap_or(false)
    }

    /// Best-effort cancel: flips the job's stop flag, observed between
    /// folders and pages. Returns whether a job was in flight.
    pub fn cancel(&self, email_id: i64) -> bool {
        if let Ok(inner) = self.inner.lock() {
            if let Some(token) = inner.get(&email_id) {
                token.cancel();
                return true;
            }
        }
        false
    }
}

#[derive(Clone)]
pub struct BatchChecker {
    engine: Arc<Engine>,
}

impl BatchChecker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Check one mailbox and wait for the result, bounded by the five-minute
    /// budget. Concurrent requests for the same mailbox get `Conflict`.
    pub async fn check_one(
        &self,
        email_id: i64,
        scope: Option<i64>,
        progress: Option<ProgressFn>,
    ) -> EngineResult<CheckReport> {
        let mailbox = self
            .engine
            .store
            .get_mailbox(email_id, scope)?
            .ok_or_else(|| EngineError::NotFound(format!("mailbox {email_id} not found")))?;

        let cancel = self.engine.in_flight.try_begin(email_id).ok_or_else(|| {
            EngineError::Conflict(format!("mailbox {email_id} is already being checked"))
        })?;

        let outcome = tokio::time::timeout(
            CHECK_TIMEOUT,
            run_check(&self.engine, &mailbox, progress.as_ref(), &cancel),
        )
        .await;
        self.engine.in_flight.finish(email_id);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(EngineError::Timeout(format!(
                    "checking mailbox {email_id} exceeded {}s",
                    CHECK_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Dispatch a batch of mailboxes to background tasks and return
    /// immediately. Mailboxes already in flight are reported as skipped.
    pub fn check_many(&self, email_ids: &[i64], progress: Option<BatchProgressFn>) -> BatchStart {
        let mut start = BatchStart::default();

        for &email_id in email_ids {
            let mailbox = match self.engine.store.get_mailbox(email_id, None) {
                Ok(Some(mailbox)) => mailbox,
                _ => {
                    start.skipped.push(email_id);
                    continue;
                }
            };

            let Some(cancel) = self.engine.in_flight.try_begin(email_id) else {
                start.skipped.push(email_id);
                continue;
            };
            start.started.push(email_id);

            let engine = self.engine.clone();
            let per_mailbox: Option<ProgressFn> = progress.clone().map(|cb| {
                Box::new(move |percent: u8, status: &str| cb(email_id, percent, status))
                    as ProgressFn
            });

            tokio::spawn(async move {
                let result = run_check(&engine, &mailbox, per_mailbox.as_ref(), &cancel).await;
                engine.in_flight.finish(email_id);
                match result {
                    Ok(report) => info!(email_id, saved = report.saved, "batch check finished"),
                    Err(err) => warn!(email_id, error = %err, "batch check failed"),
                }
            });
        }

        info!(
            started = start.started.len(),
            skipped = start.skipped.len(),
            "batch check dispatched"
        );
        start
    }

    pub fn is_processing(&self, email_id: i64) -> bool {
        self.engine.in_flight.is_processing(email_id)
    }

    pub fn stop(&self, email_id: i64) -> bool {
        self.engine.in_flight.cancel(email_id)
    }
}

// ---------------------------------------------------------------------------
// The check itself
// ---------------------------------------------------------------------------

pub(crate) async fn run_check(
    engine: &Engine,
    mailbox: &MailboxRow,
    progress: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> EngineResult<CheckReport> {
    emit(progress, 0, "starting check");

    // A mailbox with no stored mail pulls the provider's default window;
    // otherwise the high-water mark bounds the fetch.
    let first_sync = engine.store.mail_count(mailbox.id)? == 0;
    let since = decide_since(first_sync, mailbox.last_check_time.as_deref());

    let use_graph = mailbox.kind == KIND_OUTLOOK
        && engine.store.get_config_bool(CONFIG_USE_GRAPH_API, true)?;

    let (fetched, partial_error) = if use_graph {
        fetch_via_graph(engine, mailbox, since, progress, cancel).await?
    } else {
        fetch_via_imap(mailbox, since, progress, cancel).await?
    };

    emit(progress, 90, "saving messages");
    let outcome = ingest::persist_fetched(engine, mailbox, &fetched)?;

    if let Some(err) = partial_error {
        // Partial results are already persisted; the failure still counts.
        if !matches!(err, EngineError::Throttled { .. }) {
            engine.store.set_last_error(mailbox.id, &err.to_string())?;
        }
        return Err(err);
    }

    engine.store.touch_check_time(mailbox.id)?;
    engine.store.clear_last_error(mailbox.id)?;

    let message = if outcome.total == 0 {
        "no new messages".to_string()
    } else {
        format!("processed {} messages, {} new", outcome.total, outcome.saved)
    };
    emit(progress, 100, &message);
    info!(
        email_id = mailbox.id,
        total = outcome.total,
        saved = outcome.saved,
        "check finished"
    );

    Ok(CheckReport {
        total: outcome.total,
        saved: outcome.saved,
        message,
    })
}

async fn fetch_via_graph(
    engine: &Engine,
    mailbox: &MailboxRow,
    since: Option<&str>,
    progress: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> EngineResult<(Vec<FetchedMessage>, Option<EngineError>)> {
    if mailbox.refresh_token.is_empty() || mailbox.client_id.is_empty() {
        let message = "missing oauth credentials (client_id / refresh_token)";
        engine.store.set_last_error(mailbox.id, message)?;
        return Err(EngineError::AuthFailed(message.to_string()));
    }

    let access_token = match engine
        .graph
        .refresh_access_token(&mailbox.refresh_token, &mailbox.client_id)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            engine.store.set_last_error(mailbox.id, &err.to_string())?;
            return Err(err.into());
        }
    };
    emit(progress, 10, "access token refreshed");

    let mut fetched = Vec::new();
    let mut partial_error = None;

    for (folder, percent) in [(GRAPH_FOLDER_INBOX, 40u8), (GRAPH_FOLDER_JUNK, 70u8)] {
        if cancel.is_cancelled() {
            break;
        }
        match engine
            .graph
            .list_messages(&access_token, folder, PULL_LIMIT, since)
            .await
        {
            Ok(messages) => fetched.extend(messages),
            Err(err) => {
                warn!(email_id = mailbox.id, folder, error = %err, "folder fetch failed");
                partial_error = Some(err.into());
            }
        }
        emit(progress, percent, &format!("fetched {folder}"));
    }

    Ok((fetched, partial_error))
}

async fn fetch_via_imap(
    mailbox: &MailboxRow,
    since: Option<&str>,
    progress: Option<&ProgressFn>,
    cancel: &CancellationToken,
) -> EngineResult<(Vec<FetchedMessage>, Option<EngineError>)> {
    let settings = imap_settings(mailbox)?;
    emit(progress, 10, "connecting to imap server");

    let since = since.and_then(parse_utc);
    let outcome = imap::fetch_messages(&settings, since, cancel).await;
    emit(progress, 70, "folders fetched");

    let partial_error = outcome.error.map(EngineError::Transient);
    Ok((outcome.messages, partial_error))
}

fn imap_settings(mailbox: &MailboxRow) -> EngineResult<ImapConnectionSettings> {
    let host = mailbox.server.clone().ok_or_else(|| {
        EngineError::Validation(format!(
            "mailbox {} has no imap server configured",
            mailbox.address
        ))
    })?;

    Ok(ImapConnectionSettings {
        host,
        port: mailbox.port.unwrap_or(993),
        use_ssl: mailbox.use_ssl,
        username: mailbox.address.clone(),
        password: mailbox.password.clone(),
    })
}

fn decide_since<'a>(first_sync: bool, last_check_time: Option<&'a str>) -> Option<&'a str> {
    if first_sync {
        None
    } else {
        last_check_time
    }
}

fn emit(progress: Option<&ProgressFn>, percent: u8, status: &str) {
    if let Some(cb) = progress {
        let _ = catch_unwind(AssertUnwindSafe(|| cb(percent, status)));
    }
}
