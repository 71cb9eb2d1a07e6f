//! Blocking verification-code queries.
//!
//! `wait_for_code` answers "wait up to N seconds for a code on this
//! mailbox": it scans messages already in the store, then blocks on the
//! fanout's new-mail signal (with a bounded poll as fallback) until a code
//! arrives or the deadline passes.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};

use mailfleet_storage::format_utc;

use crate::error::{EngineError, EngineResult};
use crate::Engine;

/// Only messages this recent qualify on the initial scan.
const RECENT_WINDOW_SECS: i64 = 30;

/// Fallback poll cadence while waiting for new mail.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Clock-skew allowance when matching messages that arrived mid-wait.
const WAIT_SKEW_SECS: i64 = 10;

/// Keywords that qualify a message when the caller supplies none.
const DEFAULT_CODE_KEYWORDS: &[&str] = &[
    "验证码",
    "verification",
    "code",
    "verify",
    "确认码",
    "OTP",
    "pin",
];

/// Code-extraction patterns in descending priority: localized and English
/// phrasings first, a bare 4–8 digit token as the last resort.
static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"验证码[：:\s]*(\d{4,8})",
        r"code[：:\s]+is[：:\s]+(\d{4,8})",
        r"code[：:\s]*(\d{4,8})",
        r"verification[：:\s]+code[：:\s]+is[：:\s]+(\d{4,8})",
        r"verification[：:\s]*(\d{4,8})",
        r"(\d{4,8})\s*(?:是您的|为您的|is your)",
        r"\b(\d{4,8})\b",
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("static code pattern")
    })
    .collect()
});

/// A successfully extracted verification code.
#[derive(Debug, Clone, Serialize)]
pub struct CodeHit {
    pub email: String,
    pub code: String,
    pub subject: String,
    pub sender: String,
    pub received_time: String,
}

/// Extract a verification code from one message, honoring the keyword gate.
///
/// With an explicit keyword, the message must contain it (case-insensitive,
/// subject or content); without one, any default code keyword qualifies.
/// Only pure-digit codes of 4–8 characters are ever returned.
pub fn extract_code(subject: &str, content: &str, keyword: Option<&str>) -> Option<String> {
    let subject_lower = subject.to_lowercase();
    let content_lower = content.to_lowercase();

    match keyword.map(str::trim).filter(|k| !k.is_empty()) {
        Some(keyword) => {
            let keyword = keyword.to_lowercase();
            if !subject_lower.contains(&keyword) && !content_lower.contains(&keyword) {
                return None;
            }
        }
        None => {
            let has_keyword = DEFAULT_CODE_KEYWORDS.iter().any(|kw| {
                let kw = kw.to_lowercase();
                subject_lower.contains(&kw) || content_lower.contains(&kw)
            });
            if !has_keyword {
                return None;
            }
        }
    }

    let haystack = format!("{subject} {content}");
    for pattern in CODE_PATTERNS.iter() {
        let Some(captures) = pattern.captures(&haystack) else {
            continue;
        };
        let Some(code) = captures.get(1) else {
            continue;
        };
        let code = code.as_str();
        if (4..=8).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit()) {
            return Some(code.to_string());
        }
    }

    None
}

#[derive(Clone)]
pub struct CodeWaiter {
    engine: Arc<Engine>,
}

impl CodeWaiter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Block until a verification code shows up on `email_address`, or the
    /// timeout passes. `scope` restricts the lookup to one user's mailboxes
    /// (admins pass `None`).
    pub async fn wait_for_code(
        &self,
        scope: Option<i64>,
        email_address: &str,
        keyword: Option<&str>,
        timeout_secs: u64,
    ) -> EngineResult<CodeHit> {
        let mailbox = self
            .engine
            .store
            .find_mailbox_by_address(scope, email_address)?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "mailbox {email_address} does not exist or is not yours"
                ))
            })?;

        let start = OffsetDateTime::now_utc();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        // Messages from the last few seconds may already hold the code.
        let recent_cutoff = format_utc(start - time::Duration::seconds(RECENT_WINDOW_SECS));
        if let Some(hit) = self.scan(mailbox.id, email_address, &recent_cutoff, keyword)? {
            info!(email = email_address, "verification code found in stored mail");
            return Ok(hit);
        }

        debug!(
            email = email_address,
            timeout_secs, "waiting for verification code"
        );
        let wait_cutoff = format_utc(start - time::Duration::seconds(WAIT_SKEW_SECS));

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }

            // Woken by the fanout when new mail lands; the bounded sleep
            // covers deliveries that bypass the signal.
            let sleep_for = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = self.engine.fanout.mail_signal().notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if let Some(hit) = self.scan(mailbox.id, email_address, &wait_cutoff, keyword)? {
                info!(email = email_address, "verification code arrived during wait");
                return Ok(hit);
            }
        }

        // A missed code surfaces as not-found, unlike a check that overran
        // its budget.
        Err(EngineError::NotFound(format!(
            "no verification code arrived within {timeout_secs}s for {email_address}"
        )))
    }

    fn scan(
        &self,
        email_id: i64,
        email_address: &str,
        cutoff: &str,
        keyword: Option<&str>,
    ) -> EngineResult<Option<CodeHit>> {
        for record in self.engine.store.list_mail_records_since(email_id, cutoff)? {
            if let Some(code) = extract_code(&record.subject, &record.content, keyword) {
                return Ok(Some(CodeHit {
                    email: email_address.to_string(),
                    code,
                    subject: record.subject,
                    sender: record.sender,
                    received_time: record.received_time,
                }));
            }
        }
        Ok(None)
    }
}
