//! Pull-mode IMAP fetcher.
//!
//! Connects over TLS, walks INBOX plus a junk folder when the server has
//! one, and normalizes everything through mail-parser into
//! [`FetchedMessage`]. A connection or folder error does not discard what
//! was already fetched; partial results come back together with the error
//! so the caller can persist them and record the failure.

use futures_util::TryStreamExt;
use mail_parser::MimeHeaders;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use async_imap::types::Fetch;

use mailfleet_storage::{format_utc, now_utc_string, FOLDER_IMPORTED, FOLDER_INBOX, FOLDER_JUNK};

use crate::FetchedMessage;

/// Junk folder names tried after INBOX; servers disagree on the name and
/// absence is not an error.
const JUNK_FOLDER_CANDIDATES: &[&str] = &["Junk", "Spam", "Junk Email", "Junk E-mail"];

const FETCH_QUERY: &str = "(UID INTERNALDATE BODY.PEEK[])";

/// IMAP connection settings for password-based login.
///
/// Custom `Debug` impl redacts `password`.
#[derive(Clone)]
pub struct ImapConnectionSettings {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ImapConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("unsupported security mode (TLS is required)")]
    UnsupportedSecurityMode,

    #[error("tcp connect failed: {0}")]
    TcpConnect(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("imap protocol error: {0}")]
    Imap(String),

    #[error("login failed: {0}")]
    Login(String),
}

pub type ImapResult<T> = Result<T, ImapError>;

type TokioCompatTcpStream = Compat<TcpStream>;
type TlsStream = async_native_tls::TlsStream<TokioCompatTcpStream>;
pub type TlsSession = async_imap::Session<TlsStream>;

/// What a pull attempt produced. `messages` may be non-empty even when
/// `error` is set: everything fetched before the failure is kept.
#[derive(Debug, Default)]
pub struct ImapFetchOutcome {
    pub messages: Vec<FetchedMessage>,
    pub error: Option<String>,
}

/// An attachment extracted from an uploaded message file.
#[derive(Debug, Clone)]
pub struct EmlAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub content: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Establish a TLS connection and read the IMAP greeting.
async fn establish_tls_connection(
    host: &str,
    port: u16,
) -> ImapResult<async_imap::Client<TlsStream>> {
    let tcp_stream = TcpStream::connect((host, port))
        .await
        .map_err(|err| ImapError::TcpConnect(err.to_string()))?;
    let tcp_stream = tcp_stream.compat();

    let tls_connector = async_native_tls::TlsConnector::new();
    let tls_stream = tls_connector
        .connect(host, tcp_stream)
        .await
        .map_err(|err| ImapError::Tls(err.to_string()))?;

    let mut client = async_imap::Client::new(tls_stream);
    let _greeting = client
        .read_response()
        .await
        .map_err(|err| ImapError::Imap(err.to_string()))?
        .ok_or_else(|| {
            ImapError::Imap("unexpected end of stream; expected greeting".to_string())
        })?;

    Ok(client)
}

pub async fn connect_and_login(settings: &ImapConnectionSettings) -> ImapResult<TlsSession> {
    if !settings.use_ssl {
        return Err(ImapError::UnsupportedSecurityMode);
    }

    let client = establish_tls_connection(&settings.host, settings.port).await?;

    let session = client
        .login(settings.username.as_str(), settings.password.as_str())
        .await
        .map_err(|(err, _client)| ImapError::Login(err.to_string()))?;

    Ok(session)
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Pull new messages from INBOX and (when present) a junk folder.
///
/// `since` bounds the result to messages received strictly after that time.
/// The cancellation token is observed at folder boundaries; an in-flight
/// folder fetch is not interrupted.
pub async fn fetch_messages(
    settings: &ImapConnectionSettings,
    since: Option<OffsetDateTime>,
    cancel: &CancellationToken,
) -> ImapFetchOutcome {
    let mut outcome = ImapFetchOutcome::default();

    let mut session = match connect_and_login(settings).await {
        Ok(session) => session,
        Err(err) => {
            outcome.error = Some(err.to_string());
            return outcome;
        }
    };

    match fetch_folder(&mut session, "INBOX", FOLDER_INBOX, since).await {
        Ok(messages) => outcome.messages.extend(messages),
        Err(err) => outcome.error = Some(format!("INBOX: {err}")),
    }

    if outcome.error.is_none() && !cancel.is_cancelled() {
        for candidate in JUNK_FOLDER_CANDIDATES {
            if cancel.is_cancelled() {
                break;
            }
            match fetch_folder(&mut session, candidate, FOLDER_JUNK, since).await {
                Ok(messages) => {
                    outcome.messages.extend(messages);
                    break;
                }
                Err(ImapError::Imap(err)) if is_missing_folder_error(&err) => {
                    debug!(folder = candidate, "junk folder not present");
                }
                Err(err) => {
                    outcome.error = Some(format!("{candidate}: {err}"));
                    break;
                }
            }
        }
    }

    let _ = session.logout().await;
    outcome
}

async fn fetch_folder(
    session: &mut TlsSession,
    imap_name: &str,
    folder_label: &str,
    since: Option<OffsetDateTime>,
) -> ImapResult<Vec<FetchedMessage>> {
    let mailbox = session
        .select(imap_name)
        .await
        .map_err(|err| ImapError::Imap(err.to_string()))?;

    if mailbox.exists == 0 {
        return Ok(Vec::new());
    }

    let query = match since {
        // SEARCH SINCE has day granularity; exact filtering happens below.
        Some(since) => format!("SINCE {}", imap_since_date(since)),
        None => "ALL".to_string(),
    };
    let mut uids = uid_search(session, &query).await?;
    uids.sort_unstable();

    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let uid_set = uids
        .iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let fetches: Vec<Fetch> = {
        let stream = session
            .uid_fetch(uid_set.as_str(), FETCH_QUERY)
            .await
            .map_err(|err| ImapError::Imap(err.to_string()))?;
        stream
            .try_collect()
            .await
            .map_err(|err| ImapError::Imap(err.to_string()))?
    };

    let mut messages = Vec::new();
    for fetch in &fetches {
        let Some(body) = fetch.body() else {
            warn!(folder = imap_name, uid = fetch.uid, "FETCH without body");
            continue;
        };

        let internal_date = fetch
            .internal_date()
            .and_then(|dt| OffsetDateTime::from_unix_timestamp(dt.timestamp()).ok());
        let Some(message) = normalize_message(body, internal_date, folder_label) else {
            warn!(folder = imap_name, uid = fetch.uid, "unparseable message");
            continue;
        };

        // Exact high-water-mark filter on top of the day-granular SEARCH.
        if let Some(since) = since {
            if let Some(received) = mailfleet_storage::parse_utc(&message.received_time) {
                if received <= since {
                    continue;
                }
            }
        }

        messages.push(message);
    }

    debug!(folder = imap_name, count = messages.len(), "folder fetched");
    Ok(messages)
}

/// Allowed IMAP search criteria, to keep arbitrary strings out of the
/// command stream.
const ALLOWED_SEARCH_COMMANDS: &[&str] = &["ALL", "SEEN", "UNSEEN", "NEW", "OLD", "RECENT"];

async fn uid_search(session: &mut TlsSession, query: &str) -> ImapResult<Vec<u32>> {
    let query_upper = query.trim().to_uppercase();
    let allowed = ALLOWED_SEARCH_COMMANDS.contains(&query_upper.as_str())
        || is_since_query(&query_upper);
    if !allowed {
        return Err(ImapError::Imap(format!(
            "rejected unsafe IMAP search query: {}",
            query.chars().take(50).collect::<String>()
        )));
    }

    let uids = session
        .uid_search(query)
        .await
        .map_err(|err| ImapError::Imap(err.to_string()))?
        .into_iter()
        .collect::<Vec<_>>();
    Ok(uids)
}

fn is_since_query(query_upper: &str) -> bool {
    let Some(rest) = query_upper.strip_prefix("SINCE ") else {
        return false;
    };
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `SINCE` date in IMAP's `dd-Mon-yyyy` shape.
fn imap_since_date(at: OffsetDateTime) -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "{:02}-{}-{}",
        at.day(),
        MONTHS[at.month() as usize - 1],
        at.year()
    )
}

fn is_missing_folder_error(err: &str) -> bool {
    let lowered = err.to_lowercase();
    lowered.contains("no such")
        || lowered.contains("nonexistent")
        || lowered.contains("doesn't exist")
        || lowered.contains("does not exist")
        || lowered.contains("unknown mailbox")
        || lowered.contains("select failed")
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn normalize_message(
    raw: &[u8],
    fallback_received: Option<OffsetDateTime>,
    folder_label: &str,
) -> Option<FetchedMessage> {
    let parsed = mail_parser::MessageParser::default().parse(raw)?;
    Some(message_fields(&parsed, fallback_received, folder_label))
}

fn message_fields(
    parsed: &mail_parser::Message<'_>,
    fallback_received: Option<OffsetDateTime>,
    folder_label: &str,
) -> FetchedMessage {
    let subject = parsed
        .subject()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "(no subject)".to_string());

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(format_addr)
        .unwrap_or_else(|| "(unknown sender)".to_string());

    let recipient = parsed.to().and_then(|addr| addr.first()).and_then(format_addr);

    let content = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| parsed.body_html(0).map(|t| t.to_string()))
        .unwrap_or_default();

    let received = parsed
        .date()
        .and_then(|d| OffsetDateTime::from_unix_timestamp(d.to_timestamp()).ok())
        .or(fallback_received)
        .map(format_utc)
        .unwrap_or_else(now_utc_string);

    let has_attachments = parsed.attachments().next().is_some();

    FetchedMessage {
        subject,
        sender,
        recipient,
        content,
        received_time: received,
        folder: folder_label.to_string(),
        has_attachments,
    }
}

fn format_addr(addr: &mail_parser::Addr<'_>) -> Option<String> {
    let address = addr.address.as_deref()?;
    let name = addr.name.as_deref();

    match name {
        Some(name) if !name.trim().is_empty() => Some(format!("{name} <{address}>")),
        _ => Some(address.to_string()),
    }
}

/// Parse an uploaded .eml file into a message (folder `IMPORTED`) plus its
/// attachments.
pub fn parse_eml(raw: &[u8]) -> Option<(FetchedMessage, Vec<EmlAttachment>)> {
    let parsed = mail_parser::MessageParser::default().parse(raw)?;
    let message = message_fields(&parsed, None, FOLDER_IMPORTED);

    let attachments = parsed
        .attachments()
        .map(|part| {
            let content = part.contents().to_vec();
            EmlAttachment {
                filename: part
                    .attachment_name()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unnamed".to_string()),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: content.len() as u64,
                content,
            }
        })
        .collect();

    Some((message, attachments))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_EML: &[u8] = b"From: Site <no-reply@site.com>\r\n\
To: a@outlook.com\r\n\
Subject: Your code is 482917\r\n\
Date: Mon, 5 Jan 2026 18:58:09 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Your verification code is 482917\r\n";

    #[test]
    fn parse_eml_normalizes_fields() {
        let (message, attachments) = parse_eml(SAMPLE_EML).unwrap();
        assert_eq!(message.subject, "Your code is 482917");
        assert_eq!(message.sender, "Site <no-reply@site.com>");
        assert_eq!(message.recipient.as_deref(), Some("a@outlook.com"));
        assert_eq!(message.folder, FOLDER_IMPORTED);
        assert_eq!(message.received_time, "2026-01-05T18:58:09Z");
        assert!(message.content.contains("482917"));
        assert!(!message.has_attachments);
        assert!(attachments.is_empty());
    }

    #[test]
    fn parse_eml_rejects_garbage()  {
        assert!(parse_eml(b"").is_none());
    }

    #[test]
    fn since_date_uses_imap_shape() {
        let at = mailfleet_storage::parse_utc("2026-01-05T18:58:09Z").unwrap();
        assert_eq!(imap_since_date(at), "05-Jan-2026");
    }

    #[test]
    fn since_query_validation() {
        assert!(is_since_query("SINCE 05-JAN-2026"));
        assert!(!is_since_query("SINCE "));
        assert!(!is_since_query("SINCE 05-Jan-2026; DELETE"));
        assert!(!is_since_query("ALL"));
    }

    #[test]
    fn missing_folder_detection() {
        assert!(is_missing_folder_error("NO [NONEXISTENT] Unknown Mailbox"));
        assert!(is_missing_folder_error("no such mailbox"));
        assert!(!is_missing_folder_error("connection reset by peer"));
    }

    #[test]
    fn normalize_falls_back_to_internal_date() {
        let raw = b"From: x@y.com\r\nSubject: s\r\n\r\nbody\r\n";
        let fallback = mailfleet_storage::parse_utc("2026-02-01T00:00:00Z");
        let message = normalize_message(raw, fallback, FOLDER_INBOX).unwrap();
        assert_eq!(message.received_time, "2026-02-01T00:00:00Z");
    }

    #[test]
    fn settings_debug_redacts_password() {
        let settings = ImapConnectionSettings {
            host: "imap.gmail.com".to_string(),
            port: 993,
            use_ssl: true,
            username: "a@gmail.com".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
