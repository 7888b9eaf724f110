//! IMAP implementation of the remote mailbox service
//!
//! Built on `async-imap` running on tokio, over implicit TLS.
//!
//! # Change events
//! The server reports `EXISTS`/`EXPUNGE` in three places:
//! - unsolicited responses, queued by the library during any command
//! - the response that ends an IDLE
//! - the responses to our own `EXPUNGE`
//!
//! The library queue is drained around every command and all three go
//! through the session's [`EventRelay`] in the order they were read.

use crate::remote::tls::TlsConfig;
use crate::remote::{
    ChangeEvent, ChangeEvents, Endpoint, EventRelay, MailboxConnector, MailboxInfo,
    MailboxService, MessageRecord, MessageStream, RemoteError,
};
use async_imap::error::Error as ImapError;
use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::{Fetch, Flag, UnsolicitedResponse};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::{future, StreamExt, TryStreamExt};
use rustls::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ImapStream = TlsStream<TcpStream>;

/// Data items requested for every transferred message
pub const FETCH_ITEMS: &str = "(FLAGS INTERNALDATE RFC822.SIZE ENVELOPE BODY.PEEK[])";

/// IMAP date-time as used by APPEND
const INTERNAL_DATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// Opens TLS connections to IMAP servers
pub struct ImapConnector {
    tls: TlsConfig,
    idle_refresh: Duration,
}

impl ImapConnector {
    /// Create a connector
    ///
    /// # Arguments
    /// * `tls` - TLS client configuration
    /// * `idle_refresh` - IDLE is re-issued after this long without activity
    pub fn new(tls: TlsConfig, idle_refresh: Duration) -> Self {
        Self { tls, idle_refresh }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    type Connection = Client<ImapStream>;
    type Service = ImapService;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, RemoteError> {
        debug!("Connecting to {}", endpoint);

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| RemoteError::Connection(format!("TCP connect to {} failed: {}", endpoint, e)))?;

        let server_name = ServerName::try_from(endpoint.host.as_str()).map_err(|e| {
            RemoteError::Connection(format!("invalid server name '{}': {}", endpoint.host, e))
        })?;

        let stream = self
            .tls
            .connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| {
                RemoteError::Connection(format!("TLS handshake with {} failed: {}", endpoint.host, e))
            })?;

        debug!("TLS established with {}", endpoint);
        Ok(Client::new(stream))
    }

    async fn login(
        &self,
        connection: Self::Connection,
        username: &str,
        password: &str,
    ) -> Result<Self::Service, RemoteError> {
        let session = connection
            .login(username, password)
            .await
            .map_err(|(e, _client)| match e {
                ImapError::No(msg) | ImapError::Bad(msg) => RemoteError::Auth(msg),
                other => remote_error(other),
            })?;

        info!("Logged in as {}", username);
        Ok(ImapService::new(session, self.idle_refresh))
    }
}

/// Authenticated IMAP session
pub struct ImapService {
    /// `None` only while IDLE owns the session, or after IDLE broke it
    session: Option<Session<ImapStream>>,
    idle_refresh: Duration,
    events: EventRelay,
}

impl ImapService {
    fn new(session: Session<ImapStream>, idle_refresh: Duration) -> Self {
        Self {
            session: Some(session),
            idle_refresh,
            events: EventRelay::new(),
        }
    }

    fn session(&mut self) -> Result<&mut Session<ImapStream>, RemoteError> {
        self.session
            .as_mut()
            .ok_or_else(|| RemoteError::Connection("session was lost during IDLE".to_string()))
    }

    /// Move the responses the library queued so far onto the event relay
    ///
    /// The library blocks once its unsolicited queue is full, so every
    /// command ends with a drain.
    fn drain_unsolicited(&self) {
        if let Some(session) = &self.session {
            let unsolicited = &session.unsolicited_responses;
            relay_unsolicited(&self.events, std::iter::from_fn(|| unsolicited.try_recv().ok()));
        }
    }
}

#[async_trait]
impl MailboxService for ImapService {
    async fn select_mailbox(&mut self, name: &str, read_only: bool) -> Result<MailboxInfo, RemoteError> {
        self.drain_unsolicited();
        let session = self.session()?;
        let result = if read_only {
            session.examine(name).await
        } else {
            session.select(name).await
        };
        self.drain_unsolicited();

        match result {
            Ok(mailbox) => {
                debug!(mailbox = %name, exists = mailbox.exists, read_only, "Mailbox selected");
                Ok(MailboxInfo {
                    message_count: mailbox.exists,
                })
            }
            Err(ImapError::No(msg)) => Err(select_refusal(name, &msg)),
            Err(e) => Err(remote_error(e)),
        }
    }

    async fn close_mailbox(&mut self) -> Result<(), RemoteError> {
        self.drain_unsolicited();
        let result = self.session()?.close().await.map_err(remote_error);
        self.drain_unsolicited();
        result
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<(), RemoteError> {
        self.drain_unsolicited();
        let result = self.session()?.create(name).await.map_err(remote_error);
        self.drain_unsolicited();
        result?;

        info!(mailbox = %name, "Mailbox created");
        Ok(())
    }

    async fn fetch_range(&mut self, start: u32, end: u32) -> Result<MessageStream<'_>, RemoteError> {
        self.drain_unsolicited();

        let set = format!("{}:{}", start, end);
        let fetches = self
            .session()?
            .fetch(set, FETCH_ITEMS)
            .await
            .map_err(remote_error)?;

        // Responses queued while the records stream are picked up by the
        // next command
        let records = fetches
            .map_err(remote_error)
            .try_filter_map(move |fetch| future::ready(Ok(message_record(&fetch, start, end))));

        Ok(records.boxed())
    }

    async fn append_message(&mut self, mailbox: &str, message: &MessageRecord) -> Result<(), RemoteError> {
        let flags = format!("({})", message.appendable_flags().collect::<Vec<_>>().join(" "));
        let date = message
            .internal_date
            .map(|date| format!("\"{}\"", date.format(INTERNAL_DATE_FORMAT)));

        self.drain_unsolicited();
        let result = self
            .session()?
            .append(mailbox, Some(flags.as_str()), date.as_deref(), &message.body)
            .await
            .map_err(remote_error);
        self.drain_unsolicited();
        result
    }

    async fn mark_deleted(&mut self, sequence_numbers: &[u32]) -> Result<(), RemoteError> {
        if sequence_numbers.is_empty() {
            return Ok(());
        }

        let set = sequence_set(sequence_numbers);
        debug!(set = %set, "Flagging messages as deleted");

        self.drain_unsolicited();
        let result = async {
            self.session()?
                .store(set, "+FLAGS.SILENT (\\Deleted)")
                .await
                .map_err(remote_error)?
                .try_collect::<Vec<_>>()
                .await
                .map_err(remote_error)
        }
        .await;
        self.drain_unsolicited();

        result.map(|_| ())
    }

    async fn expunge_deleted(&mut self) -> Result<(), RemoteError> {
        self.drain_unsolicited();

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| RemoteError::Connection("session was lost during IDLE".to_string()))?;
        let unsolicited = session.unsolicited_responses.clone();
        let expunged = session.expunge().await.map_err(remote_error)?;
        futures::pin_mut!(expunged);

        while let Some(sequence) = expunged.next().await {
            let sequence = sequence.map_err(remote_error)?;
            // Whatever the library queued was sent before this EXPUNGE
            relay_unsolicited(&self.events, std::iter::from_fn(|| unsolicited.try_recv().ok()));
            debug!(sequence, "Message expunged");
            self.events.forward(ChangeEvent::MessageExpunged);
        }

        relay_unsolicited(&self.events, std::iter::from_fn(|| unsolicited.try_recv().ok()));
        Ok(())
    }

    async fn idle(&mut self, cancel: CancellationToken) -> Result<(), RemoteError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| RemoteError::Connection("session was lost during IDLE".to_string()))?;
        let unsolicited = session.unsolicited_responses.clone();

        let mut handle = session.idle();
        handle.init().await.map_err(remote_error)?;
        relay_unsolicited(&self.events, std::iter::from_fn(|| unsolicited.try_recv().ok()));
        debug!("IDLE started");

        let response = {
            let (wait, stop) = handle.wait_with_timeout(self.idle_refresh);
            tokio::pin!(wait);

            tokio::select! {
                response = &mut wait => response,
                _ = cancel.cancelled() => {
                    // Dropping the stop source interrupts the wait
                    drop(stop);
                    (&mut wait).await
                }
            }
        };
        let response = response.map_err(remote_error)?;

        // Forwarded before DONE: anything read while finishing IDLE came later
        match &response {
            IdleResponse::NewData(data) => {
                debug!("IDLE: server reported activity");
                match idle_event(data.parsed()) {
                    Some(event) => self.events.forward(event),
                    None => debug!("IDLE: ignoring {:?}", data.parsed()),
                }
            }
            IdleResponse::Timeout => debug!("IDLE refresh interval elapsed"),
            IdleResponse::ManualInterrupt => debug!("IDLE cancelled"),
        }

        self.session = Some(handle.done().await.map_err(remote_error)?);
        self.drain_unsolicited();
        Ok(())
    }

    fn change_events(&mut self) -> ChangeEvents {
        self.events.subscribe()
    }

    async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                debug!("Logout failed: {}", e);
            }
        }
    }
}

/// Forward queued unsolicited responses, oldest first
fn relay_unsolicited(events: &EventRelay, responses: impl Iterator<Item = UnsolicitedResponse>) {
    events.forward_all(responses.filter_map(change_event));
}

/// Classify a NO answer to SELECT/EXAMINE
///
/// Only an uncoded answer or `[NONEXISTENT]` means the mailbox is missing.
fn select_refusal(name: &str, text: &str) -> RemoteError {
    let text = text.trim();
    let code = text
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(code, _)| code.split_whitespace().next().unwrap_or(""));

    match code {
        Some(code) if !code.eq_ignore_ascii_case("NONEXISTENT") => {
            RemoteError::Rejected(format!("{}: {}", name, text))
        }
        _ => RemoteError::NotFound(format!("{}: {}", name, text)),
    }
}

fn remote_error(err: ImapError) -> RemoteError {
    match err {
        ImapError::Io(e) => RemoteError::Connection(e.to_string()),
        ImapError::ConnectionLost => RemoteError::Connection("connection lost".to_string()),
        ImapError::No(msg) | ImapError::Bad(msg) => RemoteError::Rejected(msg),
        other => RemoteError::Protocol(other.to_string()),
    }
}

fn change_event(response: UnsolicitedResponse) -> Option<ChangeEvent> {
    match response {
        UnsolicitedResponse::Exists(count) => Some(ChangeEvent::MailboxGrew(count)),
        UnsolicitedResponse::Expunge(_) => Some(ChangeEvent::MessageExpunged),
        other => {
            debug!("Ignoring unsolicited response {:?}", other);
            None
        }
    }
}

fn idle_event(response: &Response<'_>) -> Option<ChangeEvent> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(count)) => Some(ChangeEvent::MailboxGrew(*count)),
        Response::Expunge(_) => Some(ChangeEvent::MessageExpunged),
        _ => None,
    }
}

/// Convert a FETCH response into a record
///
/// Flag-only FETCH responses the server pushes for other messages are dropped.
fn message_record(fetch: &Fetch, start: u32, end: u32) -> Option<MessageRecord> {
    if fetch.message < start || fetch.message > end {
        debug!(sequence = fetch.message, "Ignoring FETCH response outside the requested range");
        return None;
    }

    let body = match fetch.body() {
        Some(body) => body.to_vec(),
        None => {
            warn!(sequence = fetch.message, "FETCH response carries no message body");
            return None;
        }
    };

    Some(MessageRecord {
        sequence: fetch.message,
        flags: fetch.flags().filter_map(flag_name).collect(),
        internal_date: fetch.internal_date(),
        size: fetch.size,
        subject: fetch
            .envelope()
            .and_then(|envelope| envelope.subject.as_deref())
            .map(|subject| String::from_utf8_lossy(subject).into_owned()),
        body,
    })
}

fn flag_name(flag: Flag<'_>) -> Option<String> {
    match flag {
        Flag::Seen => Some("\\Seen".to_string()),
        Flag::Answered => Some("\\Answered".to_string()),
        Flag::Flagged => Some("\\Flagged".to_string()),
        Flag::Deleted => Some("\\Deleted".to_string()),
        Flag::Draft => Some("\\Draft".to_string()),
        Flag::Recent => Some("\\Recent".to_string()),
        // Only meaningful in PERMANENTFLAGS
        Flag::MayCreate => None,
        Flag::Custom(name) => Some(name.into_owned()),
    }
}

/// Render sequence numbers as an IMAP sequence set, collapsing runs
fn sequence_set(sequence_numbers: &[u32]) -> String {
    let mut sorted = sequence_numbers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(first) = iter.next() {
        let mut last = first;
        while iter.peek() == Some(&(last + 1)) {
            last += 1;
            iter.next();
        }
        if first == last {
            parts.push(first.to_string());
        } else {
            parts.push(format!("{}:{}", first, last));
        }
    }

    parts.join(",")
}
