//! Remote mailbox service
//!
//! The transfer engine never speaks IMAP directly. It drives two sessions
//! through the [`MailboxService`] trait and opens them with a
//! [`MailboxConnector`].
//!
//! # Implementations
//! - [`imap`]: IMAP over implicit TLS, backed by `async-imap`
//! - [`memory`]: in-process mail server used by the test-suite

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::BoxStream;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod events;
pub mod imap;
pub mod memory;
pub mod tls;

pub use events::EventRelay;
pub use imap::{ImapConnector, ImapService};
pub use memory::{MemoryConnector, MemoryServer, MemoryService};

/// Name of the mailbox every IMAP account has
pub const INBOX: &str = "INBOX";

/// Flag that cannot be set by a client on APPEND
const RECENT_FLAG: &str = "\\Recent";

/// Errors reported by a remote mailbox service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The connection is unusable (dial failure, I/O error, connection lost)
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("mailbox not found: {0}")]
    NotFound(String),

    /// The server refused a single command; the connection is still usable
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Whether the error leaves the connection broken
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }
}

/// Host and port of an IMAP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of selecting a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Number of messages in the mailbox at selection time
    pub message_count: u32,
}

/// Mailbox change reported asynchronously by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The mailbox now holds this many messages (IMAP `EXISTS`)
    MailboxGrew(u32),
    /// One message was removed (IMAP `EXPUNGE`)
    MessageExpunged,
}

/// Stream of change events for one session
pub type ChangeEvents = BoxStream<'static, ChangeEvent>;

/// Stream of records produced by [`MailboxService::fetch_range`]
pub type MessageStream<'a> = BoxStream<'a, Result<MessageRecord, RemoteError>>;

/// One message retrieved from the source mailbox
///
/// Held only long enough to be appended to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Sequence number in the source mailbox
    pub sequence: u32,
    /// Flags in IMAP notation (`\Seen`, `$Forwarded`, ...)
    pub flags: Vec<String>,
    /// Server-side arrival time
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// RFC822.SIZE as reported by the server
    pub size: Option<u32>,
    /// Envelope subject, for progress logging
    pub subject: Option<String>,
    /// Full RFC822 message
    pub body: Vec<u8>,
}

impl MessageRecord {
    /// Flags that may be passed to APPEND (`\Recent` is server-managed)
    pub fn appendable_flags(&self) -> impl Iterator<Item = &str> {
        self.flags
            .iter()
            .map(String::as_str)
            .filter(|flag| !flag.eq_ignore_ascii_case(RECENT_FLAG))
    }
}

/// An authenticated session against one mail server
#[async_trait]
pub trait MailboxService: Send {
    /// Select a mailbox, read-only when `read_only` is set
    ///
    /// A mailbox that does not exist is reported as [`RemoteError::NotFound`].
    async fn select_mailbox(&mut self, name: &str, read_only: bool) -> Result<MailboxInfo, RemoteError>;

    /// Leave the selected mailbox without expunging it
    async fn close_mailbox(&mut self) -> Result<(), RemoteError>;

    /// Create a mailbox
    async fn create_mailbox(&mut self, name: &str) -> Result<(), RemoteError>;

    /// Fetch messages `start..=end` of the selected mailbox
    ///
    /// Records are produced lazily in ascending sequence order. The stream is
    /// finite and cannot be restarted.
    async fn fetch_range(&mut self, start: u32, end: u32) -> Result<MessageStream<'_>, RemoteError>;

    /// Append a message with its flags and internal date to `mailbox`
    async fn append_message(&mut self, mailbox: &str, message: &MessageRecord) -> Result<(), RemoteError>;

    /// Add the `\Deleted` flag to the given messages of the selected mailbox
    async fn mark_deleted(&mut self, sequence_numbers: &[u32]) -> Result<(), RemoteError>;

    /// Permanently remove messages flagged `\Deleted`
    async fn expunge_deleted(&mut self) -> Result<(), RemoteError>;

    /// Wait for server activity on the selected mailbox
    ///
    /// Returns `Ok(())` when the server reports activity, when the wait
    /// should be re-issued, or promptly after `cancel` fires.
    async fn idle(&mut self, cancel: CancellationToken) -> Result<(), RemoteError>;

    /// Take the change-event stream of this session
    ///
    /// Events arrive in the order the server sent them. Only the first call
    /// yields events; later calls get an empty stream.
    fn change_events(&mut self) -> ChangeEvents;

    /// Log out; errors are ignored
    async fn logout(&mut self);
}

/// Opens sessions of a [`MailboxService`]
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connected, not yet authenticated
    type Connection: Send;
    type Service: MailboxService;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, RemoteError>;

    async fn login(
        &self,
        connection: Self::Connection,
        username: &str,
        password: &str,
    ) -> Result<Self::Service, RemoteError>;
}
