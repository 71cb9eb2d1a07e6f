//! Microsoft Graph client.
//!
//! This module handles:
//! - OAuth2 token refresh against the common tenant endpoint
//! - Message listing with `$filter`/`$orderby`/`$select` projections
//! - Message detail and attachment retrieval
//! - Push subscription create / renew / delete
//!
//! Every call classifies HTTP failures into [`GraphError`] so callers can
//! tell a dead refresh token from a throttled request from a provider
//! outage.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use mailfleet_storage::{format_utc, now_utc_string, parse_utc, FOLDER_INBOX, FOLDER_JUNK};

use crate::FetchedMessage;

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Scopes requested on token refresh.
const TOKEN_SCOPE: &str = "https://graph.microsoft.com/Mail.ReadWrite \
     https://graph.microsoft.com/Mail.Send \
     https://graph.microsoft.com/User.Read offline_access";

/// Graph well-known folder id for the inbox.
pub const GRAPH_FOLDER_INBOX: &str = "inbox";
/// Graph well-known folder id for junk mail.
pub const GRAPH_FOLDER_JUNK: &str = "junkemail";

const MESSAGE_PROJECTION: &str = "id,subject,from,receivedDateTime,body,hasAttachments,bodyPreview";
const DETAIL_PROJECTION: &str =
    "id,subject,from,toRecipients,ccRecipients,receivedDateTime,body,hasAttachments";

/// Applied when a 429 arrives without a usable `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("throttled; retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response body: {0}")]
    Decode(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Outcome of a successful subscription create.
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub subscription_id: String,
    pub expiration_time: String,
}

/// An attachment pulled through Graph, with its bytes decoded.
#[derive(Debug, Clone)]
pub struct GraphAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphClient {
    http: reqwest::Client,
}

impl GraphClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
        client_id: &str,
    ) -> GraphResult<String> {
        let params = [
            ("client_id", client_id),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", TOKEN_SCOPE),
        ];

        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        if !status.is_success() {
            // Token endpoint failures are authentication problems unless the
            // provider itself is down or throttling.
            return Err(match classify_status(status, retry_after, &body) {
                err @ (GraphError::Throttled { .. } | GraphError::Transient(_)) => err,
                _ => GraphError::AuthFailed(truncate_error(&body)),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(GraphError::AuthFailed(
                "token response carried no access_token".to_string(),
            ));
        }
        Ok(parsed.access_token)
    }

    /// List messages in a well-known folder, newest first. `since` bounds the
    /// result to messages received at or after that time; it accepts RFC 3339
    /// or the naive `YYYY-MM-DD HH:MM:SS` shape (treated as UTC).
    pub async fn list_messages(
        &self,
        access_token: &str,
        folder: &str,
        limit: usize,
        since: Option<&str>,
    ) -> GraphResult<Vec<FetchedMessage>> {
        let url = format!("{GRAPH_API_BASE}/me/mailFolders/{folder}/messages");

        let mut query: Vec<(&str, String)> = vec![
            ("$top", limit.to_string()),
            ("$orderby", "receivedDateTime desc".to_string()),
            ("$select", MESSAGE_PROJECTION.to_string()),
        ];
        if let Some(since) = since {
            match received_time_filter(since) {
                Some(filter) => query.push(("$filter", filter)),
                None => warn!(since, "unparseable since value; fetching unfiltered"),
            }
        }

        debug!(%url, folder, "listing messages");
        let body = self.get_json(&url, access_token, &query).await?;
        let parsed: MessageListResponse =
            serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))?;

        let folder_label = store_folder_label(folder);
        Ok(parsed
            .value
            .into_iter()
            .map(|msg| wire_message_to_fetched(msg, &folder_label))
            .collect())
    }

    /// Fetch a single message with recipient details.
    pub async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> GraphResult<FetchedMessage> {
        let url = format!("{GRAPH_API_BASE}/me/messages/{message_id}");
        let query = [("$select", DETAIL_PROJECTION.to_string())];

        let body = self.get_json(&url, access_token, &query).await?;
        let parsed: WireMessage =
            serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))?;
        Ok(wire_message_to_fetched(parsed, FOLDER_INBOX))
    }

    /// List a message's attachments with their bytes decoded from base64.
    /// Reference attachments (no `contentBytes`) are skipped.
    pub async fn list_attachments(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> GraphResult<Vec<GraphAttachment>> {
        let url = format!("{GRAPH_API_BASE}/me/messages/{message_id}/attachments");
        let body = self.get_json(&url, access_token, &[] as &[(&str, String)]).await?;
        let parsed: AttachmentListResponse =
            serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))?;

        Ok(parsed
            .value
            .into_iter()
            .filter_map(|item| {
                let content = BASE64.decode(item.content_bytes?).ok()?;
                Some(GraphAttachment {
                    filename: item.name.unwrap_or_else(|| "unnamed".to_string()),
                    content_type: item
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: content.len() as u64,
                    content,
                })
            })
            .collect())
    }

    /// Create a change-notification subscription for `resource`.
    pub async fn create_subscription(
        &self,
        access_token: &str,
        notification_url: &str,
        resource: &str,
        expires_at: &str,
        client_state: &str,
    ) -> GraphResult<CreatedSubscription> {
        let url = format!("{GRAPH_API_BASE}/subscriptions");
        let payload = serde_json::json!({
            "changeType": "created",
            "notificationUrl": notification_url,
            "resource": resource,
            "expirationDateTime": expires_at,
            "clientState": client_state,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &body));
        }

        let parsed: SubscriptionResponse =
            serde_json::from_str(&body).map_err(|e| GraphError::Decode(e.to_string()))?;
        Ok(CreatedSubscription {
            subscription_id: parsed.id,
            expiration_time: parsed
                .expiration_date_time
                .unwrap_or_else(|| expires_at.to_string()),
        })
    }

    /// Extend an existing subscription's expiration.
    pub async fn renew_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
        expires_at: &str,
    ) -> GraphResult<()> {
        let url = format!("{GRAPH_API_BASE}/subscriptions/{subscription_id}");
        let payload = serde_json::json!({ "expirationDateTime": expires_at });

        let resp = self
            .http
            .patch(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        if status.is_success() {
            return Ok(());
        }
        let body = resp
            .text()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;
        Err(classify_status(status, retry_after, &body))
    }

    /// Delete a subscription at the provider. 404 is surfaced as
    /// [`GraphError::NotFound`] so callers can treat it as already gone.
    pub async fn delete_subscription(
        &self,
        access_token: &str,
        subscription_id: &str,
    ) -> GraphResult<()> {
        let url = format!("{GRAPH_API_BASE}/subscriptions/{subscription_id}");

        let resp = self
            .http
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        if status.is_success() {
            return Ok(());
        }
        let body = resp
            .text()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;
        Err(classify_status(status, retry_after, &body))
    }

    async fn get_json<Q: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        access_token: &str,
        query: &Q,
    ) -> GraphResult<String> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| GraphError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &body));
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Request / response shaping
// ---------------------------------------------------------------------------

/// Build the `$filter` expression for a `since` bound. Returns `None` when
/// the value cannot be parsed as a timestamp.
pub fn received_time_filter(since: &str) -> Option<String> {
    let parsed = parse_utc(since)?;
    Some(format!("receivedDateTime ge {}", format_utc(parsed)))
}

/// Graph subscription expiration format (`.0000000Z` suffix).
pub fn graph_expiration_string(at: OffsetDateTime) -> String {
    let base = format_utc(at);
    format!("{}.0000000Z", base.trim_end_matches('Z'))
}

fn store_folder_label(graph_folder: &str) -> String {
    match graph_folder {
        GRAPH_FOLDER_INBOX => FOLDER_INBOX.to_string(),
        GRAPH_FOLDER_JUNK => FOLDER_JUNK.to_string(),
        other => other.to_uppercase(),
    }
}

fn wire_message_to_fetched(msg: WireMessage, folder_label: &str) -> FetchedMessage {
    let sender = msg
        .from
        .as_ref()
        .and_then(format_wire_address)
        .unwrap_or_else(|| "(unknown sender)".to_string());
    let recipient = msg.to_recipients.first().and_then(format_wire_address);

    let received_time = msg
        .received_date_time
        .as_deref()
        .and_then(parse_utc)
        .map(format_utc)
        .unwrap_or_else(now_utc_string);

    let content = msg
        .body
        .and_then(|b| b.content)
        .filter(|c| !c.is_empty())
        .or(msg.body_preview)
        .unwrap_or_default();

    FetchedMessage {
        subject: msg.subject.unwrap_or_else(|| "(no subject)".to_string()),
        sender,
        recipient,
        content,
        received_time,
        folder: folder_label.to_string(),
        has_attachments: msg.has_attachments,
    }
}

fn format_wire_address(recipient: &WireRecipient) -> Option<String> {
    let email = recipient.email_address.as_ref()?;
    let address = email.address.as_deref()?;
    match email.name.as_deref() {
        Some(name) if !name.trim().is_empty() => Some(format!("{name} <{address}>")),
        _ => Some(address.to_string()),
    }
}

fn classify_status(
    status: reqwest::StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> GraphError {
    match status.as_u16() {
        401 | 403 => GraphError::AuthFailed(truncate_error(body)),
        404 => GraphError::NotFound(truncate_error(body)),
        429 => GraphError::Throttled {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        500..=599 => GraphError::Transient(format!("HTTP {status}: {}", truncate_error(body))),
        _ => GraphError::Permanent(format!("HTTP {status}: {}", truncate_error(body))),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn truncate_error(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

// ---------------------------------------------------------------------------
// Wire-format types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    value: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    subject: Option<String>,
    from: Option<WireRecipient>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
    body: Option<WireItemBody>,
    #[serde(rename = "hasAttachments", default)]
    has_attachments: bool,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<WireRecipient>,
}

#[derive(Debug, Deserialize)]
struct WireRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<WireEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct WireEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireItemBody {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    #[serde(rename = "expirationDateTime")]
    expiration_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentListResponse {
    #[serde(default)]
    value: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    name: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "contentBytes")]
    content_bytes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_time_filter_normalizes_both_shapes() {
        assert_eq!(
            received_time_filter("2026-01-05T18:58:09Z").as_deref(),
            Some("receivedDateTime ge 2026-01-05T18:58:09Z")
        );
        assert_eq!(
            received_time_filter("2026-01-05 18:58:09").as_deref(),
            Some("receivedDateTime ge 2026-01-05T18:58:09Z")
        );
        assert_eq!(received_time_filter("garbage"), None);
    }

    #[test]
    fn expiration_string_uses_graph_suffix() {
        let at = parse_utc("2026-01-08T12:30:00Z").unwrap();
        assert_eq!(graph_expiration_string(at), "2026-01-08T12:30:00.0000000Z");
    }

    #[test]
    fn classify_status_maps_error_kinds() {
        use reqwest::StatusCode;

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            GraphError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            GraphError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(30), ""),
            GraphError::Throttled { retry_after_secs: 30 }
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            GraphError::Throttled {
                retry_after_secs: DEFAULT_RETRY_AFTER_SECS
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            GraphError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, ""),
            GraphError::Permanent(_)
        ));
    }

    #[test]
    fn wire_message_maps_to_fetched_shape() {
        let raw = r#"{
          "value": [{
            "id": "AAMk1",
            "subject": "Your code is 482917",
            "from": {"emailAddress": {"name": "Site", "address": "no-reply@site.com"}},
            "receivedDateTime": "2026-01-05T18:58:09Z",
            "body": {"contentType": "text", "content": "Your code is 482917"},
            "hasAttachments": false,
            "bodyPreview": "Your code is 482917"
          }]
        }"#;

        let parsed: MessageListResponse = serde_json::from_str(raw).unwrap();
        let fetched = wire_message_to_fetched(
            parsed.value.into_iter().next().unwrap(),
            FOLDER_INBOX,
        );

        assert_eq!(fetched.subject, "Your code is 482917");
        assert_eq!(fetched.sender, "Site <no-reply@site.com>");
        assert_eq!(fetched.received_time, "2026-01-05T18:58:09Z");
        assert_eq!(fetched.folder, FOLDER_INBOX);
        assert!(!fetched.has_attachments);
    }

    #[test]
    fn empty_body_falls_back_to_preview() {
        let raw = r#"{"subject": "s", "body": {"content": ""}, "bodyPreview": "preview text"}"#;
        let parsed: WireMessage = serde_json::from_str(raw).unwrap();
        let fetched = wire_message_to_fetched(parsed, FOLDER_INBOX);
        assert_eq!(fetched.content, "preview text");
        assert_eq!(fetched.sender, "(unknown sender)");
    }

    #[test]
    fn folder_labels_map_to_store_names() {
        assert_eq!(store_folder_label(GRAPH_FOLDER_INBOX), FOLDER_INBOX);
        assert_eq!(store_folder_label(GRAPH_FOLDER_JUNK), FOLDER_JUNK);
        assert_eq!(store_folder_label("archive"), "ARCHIVE");
    }

    #[test]
    fn debug_redacts_access_token() {
        let token = TokenResponse {
            access_token: "EwBAns...secret".to_string(),
        };
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
