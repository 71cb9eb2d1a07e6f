//! Platform tagging.
//!
//! Every newly stored message runs through a three-stage pipeline to decide
//! which platform registrations a mailbox carries: user corrections win
//! outright, then user regex rules, then a built-in heuristic that spots
//! registration/verification mail and names the platform after the sender
//! domain.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use mailfleet_storage::{Storage, StorageResult};

/// Phrasings that mark a message as registration/verification traffic.
static REGISTRATION_HINT: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"welcome|verif|confirm|activat|sign[\s-]?up|regist|账号|注册|欢迎|激活|验证")
        .case_insensitive(true)
        .build()
        .expect("static registration pattern")
});

/// Second-level labels that are part of the public suffix, not the brand
/// ("example.co.uk" should yield "Example", not "Co").
const GENERIC_SECOND_LEVELS: &[&str] = &["co", "com", "net", "org", "gov", "edu", "ac"];

#[derive(Debug, Clone, Default)]
pub struct RescanReport {
    pub messages_scanned: usize,
    pub tags_emitted: usize,
}

/// Classify one message and tag the mailbox. Returns the emitted platform
/// names (possibly already present on the mailbox; tags deduplicate).
pub fn classify_message(
    store: &Storage,
    user_id: i64,
    email_id: i64,
    sender: &str,
    subject: &str,
    content: &str,
) -> StorageResult<Vec<String>> {
    let domain = extract_sender_domain(sender);

    // A correction pins the platform for this sender domain; nothing else runs.
    if let Some(domain) = &domain {
        if let Some(corrected) = store.get_platform_correction(user_id, domain)? {
            store.add_platform_tag(email_id, &corrected)?;
            return Ok(vec![corrected]);
        }
    }

    let matched = store.match_rules(user_id, sender, subject, content)?;
    if !matched.is_empty() {
        for name in &matched {
            store.add_platform_tag(email_id, name)?;
        }
        return Ok(matched);
    }

    if REGISTRATION_HINT.is_match(subject) || REGISTRATION_HINT.is_match(content) {
        if let Some(name) = domain.as_deref().and_then(infer_platform_from_domain) {
            store.add_platform_tag(email_id, &name)?;
            return Ok(vec![name]);
        }
    }

    Ok(Vec::new())
}

/// Re-run the pipeline over every stored message of the user.
pub fn rescan_user(store: &Storage, user_id: i64) -> StorageResult<RescanReport> {
    let mut report = RescanReport::default();

    for mailbox in store.list_mailboxes(Some(user_id))? {
        for record in store.list_mail_records(mailbox.id)? {
            report.messages_scanned += 1;
            let emitted = classify_message(
                store,
                user_id,
                mailbox.id,
                &record.sender,
                &record.subject,
                &record.content,
            )?;
            report.tags_emitted += emitted.len();
        }
    }

    debug!(
        user_id,
        messages = report.messages_scanned,
        tags = report.tags_emitted,
        "platform rescan finished"
    );
    Ok(report)
}

/// Domain of a sender like `Name <bot@mail.example.com>`: the part after the
/// last `@`, up to `>` or whitespace, lowercased.
pub fn extract_sender_domain(sender: &str) -> Option<String> {
    let after_at = sender.rsplit_once('@')?.1;
    let domain: String = after_at
        .chars()
        .take_while(|c| *c != '>' && !c.is_whitespace())
        .collect();
    let domain = domain.trim_matches('.').to_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Brand label of a domain, capitalized: `mail.example.com` → `Example`,
/// `foo.co.uk` → `Foo`.
pub fn infer_platform_from_domain(domain: &str) -> Option<String> {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }

    let mut index = labels.len() - 2;
    if index > 0 && GENERIC_SECOND_LEVELS.contains(&labels[index]) {
        index -= 1;
    }

    let label = labels[index];
    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().collect::<String>() + chars.as_str())
}
