//! Provider adapters for Mailfleet.
//!
//! Network-facing code lives here: the Microsoft Graph client (OAuth token
//! refresh, message listing, subscription CRUD) and the IMAP fetcher. Both
//! normalize provider messages to the same [`FetchedMessage`] shape so the
//! engine can persist them without caring where they came from.

pub mod graph;
pub mod imap;

pub use graph::{CreatedSubscription, GraphClient, GraphError, GraphResult};
pub use imap::{parse_eml, EmlAttachment, ImapConnectionSettings, ImapError, ImapFetchOutcome,
    ImapResult};

/// A provider message normalized to the store's shape. `received_time` is an
/// RFC 3339 UTC string ready for storage.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub subject: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub received_time: String,
    pub folder: String,
    pub has_attachments: bool,
}
