//! In-memory mail server
//!
//! Implements [`MailboxService`] without a network so the transfer engine can
//! be exercised end to end. Several sessions may be logged in to one
//! [`MemoryServer`] at a time; each session receives the `EXISTS`/`EXPUNGE`
//! style events for the mailbox it has selected, the way an IMAP server
//! pushes untagged responses.
//!
//! By default those events reach the session's [`EventRelay`] as soon as
//! they happen. With [`MemoryServer::defer_unsolicited`] they wait in a
//! per-session queue that is only read at the session's next command, like
//! the unsolicited-response queue of an IMAP client library; a bounded queue
//! that overflows stalls the session.
//!
//! Faults are armed on the server and fire on the next matching command.

use super::{
    ChangeEvent, ChangeEvents, Endpoint, EventRelay, MailboxConnector, MailboxInfo,
    MailboxService, MessageRecord, MessageStream, RemoteError,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DELETED_FLAG: &str = "\\Deleted";

/// A message as stored by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub body: Vec<u8>,
}

impl StoredMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            flags: Vec::new(),
            internal_date: None,
            body: body.into(),
        }
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|flag| flag.to_string()).collect();
        self
    }

    pub fn with_internal_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.internal_date = Some(date);
        self
    }

    fn is_deleted(&self) -> bool {
        self.flags.iter().any(|flag| flag == DELETED_FLAG)
    }
}

/// Counters exposed to tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connects: u32,
    pub logins: u32,
    pub logouts: u32,
    pub append_attempts: u32,
    pub idles_started: u32,
    pub idles_cancelled: u32,
    pub expunged: u32,
}

#[derive(Default)]
struct Faults {
    failing_connects: u32,
    failing_logins: u32,
    failing_selects: u32,
    failing_stores: u32,
    /// Append attempt (1-based, server lifetime) that breaks the connection
    broken_append: Option<u32>,
    rejected_marker: Option<Vec<u8>>,
    quiet_idle: bool,
    deferred_unsolicited: bool,
    unsolicited_capacity: Option<usize>,
    /// Delivered to the expunged mailbox right after the next EXPUNGE
    delivery_on_expunge: Option<Vec<u8>>,
}

struct SessionEntry {
    selected: Option<String>,
    relay: EventRelay,
    unsolicited: VecDeque<ChangeEvent>,
    stalled: bool,
}

#[derive(Default)]
struct ServerState {
    mailboxes: HashMap<String, Vec<StoredMessage>>,
    sessions: HashMap<u64, SessionEntry>,
    next_session: u64,
    faults: Faults,
    stats: ServerStats,
}

impl ServerState {
    /// Push an event to every session that has `mailbox` selected
    fn broadcast(&mut self, mailbox: &str, event: ChangeEvent) {
        let deferred = self.faults.deferred_unsolicited;
        let capacity = self.faults.unsolicited_capacity;

        for session in self.sessions.values_mut() {
            if session.selected.as_deref() != Some(mailbox) {
                continue;
            }
            if !deferred {
                session.relay.forward(event);
            } else if capacity.map_or(false, |capacity| session.unsolicited.len() >= capacity) {
                session.stalled = true;
            } else {
                session.unsolicited.push_back(event);
            }
        }
    }

    fn push_message(&mut self, mailbox: &str, message: StoredMessage) {
        let messages = self.mailboxes.entry(mailbox.to_string()).or_default();
        messages.push(message);
        let total = messages.len() as u32;
        self.broadcast(mailbox, ChangeEvent::MailboxGrew(total));
    }

    /// Hand the queued unsolicited events of `session` to its relay
    fn read_unsolicited(&mut self, session: u64) -> Result<(), RemoteError> {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if entry.stalled {
            return Err(RemoteError::Connection(
                "session stalled on a full unsolicited response queue".to_string(),
            ));
        }

        let SessionEntry {
            relay, unsolicited, ..
        } = entry;
        relay.forward_all(unsolicited.drain(..));
        Ok(())
    }

    fn selected(&self, session: u64) -> Result<String, RemoteError> {
        self.sessions
            .get(&session)
            .and_then(|entry| entry.selected.clone())
            .ok_or_else(|| RemoteError::Protocol("no mailbox selected".to_string()))
    }
}

/// Shared handle on an in-memory server
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    activity: Arc<Notify>,
}

impl MemoryServer {
    /// Server with an empty `INBOX`
    pub fn new() -> Self {
        let server = Self::default();
        server.create_mailbox(super::INBOX);
        server
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_mailbox(&self, name: &str) {
        self.state().mailboxes.entry(name.to_string()).or_default();
    }

    pub fn has_mailbox(&self, name: &str) -> bool {
        self.state().mailboxes.contains_key(name)
    }

    /// Deliver a message from outside, as an MTA would
    pub fn deliver(&self, mailbox: &str, body: impl Into<Vec<u8>>) {
        self.deliver_message(mailbox, StoredMessage::new(body));
    }

    pub fn deliver_message(&self, mailbox: &str, message: StoredMessage) {
        self.state().push_message(mailbox, message);
        self.activity.notify_waiters();
    }

    /// Messages currently in `mailbox`, in sequence order
    pub fn messages(&self, mailbox: &str) -> Vec<StoredMessage> {
        self.state().mailboxes.get(mailbox).cloned().unwrap_or_default()
    }

    /// Message bodies of `mailbox` as strings
    pub fn bodies(&self, mailbox: &str) -> Vec<String> {
        self.messages(mailbox)
            .into_iter()
            .map(|message| String::from_utf8_lossy(&message.body).into_owned())
            .collect()
    }

    pub fn count(&self, mailbox: &str) -> usize {
        self.state().mailboxes.get(mailbox).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> ServerStats {
        self.state().stats.clone()
    }

    /// Sessions currently logged in
    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// Sessions that have `mailbox` selected
    pub fn sessions_selecting(&self, mailbox: &str) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|session| session.selected.as_deref() == Some(mailbox))
            .count()
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_connects(&self, count: u32) {
        self.state().faults.failing_connects = count;
    }

    /// Make the next `count` logins fail
    pub fn fail_logins(&self, count: u32) {
        self.state().faults.failing_logins = count;
    }

    /// Make the next `count` SELECT/EXAMINE commands fail with a protocol error
    pub fn fail_selects(&self, count: u32) {
        self.state().faults.failing_selects = count;
    }

    /// Make the next `count` STORE commands be rejected
    pub fn fail_stores(&self, count: u32) {
        self.state().faults.failing_stores = count;
    }

    /// Drop the connection on the `attempt`-th APPEND the server receives
    pub fn break_connection_on_append(&self, attempt: u32) {
        self.state().faults.broken_append = Some(attempt);
    }

    /// Reject every APPEND whose message contains `marker`
    pub fn reject_messages_containing(&self, marker: impl Into<Vec<u8>>) {
        self.state().faults.rejected_marker = Some(marker.into());
    }

    /// IDLE returns only when cancelled, never on activity
    pub fn set_quiet_idle(&self, quiet: bool) {
        self.state().faults.quiet_idle = quiet;
    }

    /// Queue events per session until that session's next command
    pub fn defer_unsolicited(&self, deferred: bool) {
        self.state().faults.deferred_unsolicited = deferred;
    }

    /// Defer events and stall any session with more than `capacity` queued
    pub fn limit_unsolicited_backlog(&self, capacity: usize) {
        let mut state = self.state();
        state.faults.deferred_unsolicited = true;
        state.faults.unsolicited_capacity = Some(capacity);
    }

    /// Deliver `body` to the mailbox the next EXPUNGE runs on, right after
    /// its messages were removed
    pub fn deliver_on_next_expunge(&self, body: impl Into<Vec<u8>>) {
        self.state().faults.delivery_on_expunge = Some(body.into());
    }
}

/// Connects to [`MemoryServer`]s by host name
#[derive(Clone, Default)]
pub struct MemoryConnector {
    servers: HashMap<String, MemoryServer>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route connections for `host` to `server`
    pub fn with_server(mut self, host: impl Into<String>, server: MemoryServer) -> Self {
        self.servers.insert(host.into(), server);
        self
    }
}

/// Connected, unauthenticated handle
pub struct MemoryConnection {
    server: MemoryServer,
}

#[async_trait]
impl MailboxConnector for MemoryConnector {
    type Connection = MemoryConnection;
    type Service = MemoryService;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MemoryConnection, RemoteError> {
        let server = self
            .servers
            .get(&endpoint.host)
            .cloned()
            .ok_or_else(|| RemoteError::Connection(format!("no route to host {}", endpoint)))?;

        {
            let mut state = server.state();
            state.stats.connects += 1;
            if state.faults.failing_connects > 0 {
                state.faults.failing_connects -= 1;
                return Err(RemoteError::Connection("connection refused".to_string()));
            }
        }

        Ok(MemoryConnection { server })
    }

    async fn login(
        &self,
        connection: MemoryConnection,
        username: &str,
        _password: &str,
    ) -> Result<MemoryService, RemoteError> {
        let server = connection.server;

        let id = {
            let mut state = server.state();
            if state.faults.failing_logins > 0 {
                state.faults.failing_logins -= 1;
                return Err(RemoteError::Auth(format!("invalid credentials for {}", username)));
            }
            state.stats.logins += 1;
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(
                id,
                SessionEntry {
                    selected: None,
                    relay: EventRelay::new(),
                    unsolicited: VecDeque::new(),
                    stalled: false,
                },
            );
            id
        };

        debug!(session = id, "memory session opened for {}", username);
        Ok(MemoryService {
            server,
            id,
            read_only: true,
            logged_out: false,
        })
    }
}

/// One logged-in session on a [`MemoryServer`]
pub struct MemoryService {
    server: MemoryServer,
    id: u64,
    read_only: bool,
    logged_out: bool,
}

impl MemoryService {
    /// Start a command: lock the server and read queued unsolicited events
    fn begin(&self) -> Result<MutexGuard<'_, ServerState>, RemoteError> {
        if self.logged_out {
            return Err(RemoteError::Connection("session is logged out".to_string()));
        }
        let mut state = self.server.state();
        state.read_unsolicited(self.id)?;
        Ok(state)
    }
}

#[async_trait]
impl MailboxService for MemoryService {
    async fn select_mailbox(&mut self, name: &str, read_only: bool) -> Result<MailboxInfo, RemoteError> {
        let mut state = self.begin()?;

        if state.faults.failing_selects > 0 {
            state.faults.failing_selects -= 1;
            return Err(RemoteError::Protocol("server unavailable".to_string()));
        }

        let message_count = state
            .mailboxes
            .get(name)
            .map(|messages| messages.len() as u32)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;

        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.selected = Some(name.to_string());
        }
        drop(state);
        self.read_only = read_only;

        Ok(MailboxInfo { message_count })
    }

    async fn close_mailbox(&mut self) -> Result<(), RemoteError> {
        let mut state = self.begin()?;
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.selected = None;
            session.unsolicited.clear();
        }
        drop(state);
        self.read_only = true;
        Ok(())
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<(), RemoteError> {
        let mut state = self.begin()?;
        if state.mailboxes.contains_key(name) {
            return Err(RemoteError::Rejected(format!("mailbox {} already exists", name)));
        }
        state.mailboxes.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn fetch_range(&mut self, start: u32, end: u32) -> Result<MessageStream<'_>, RemoteError> {
        let state = self.begin()?;
        let mailbox = state.selected(self.id)?;
        let messages = state.mailboxes.get(&mailbox).cloned().unwrap_or_default();
        drop(state);

        let records: Vec<Result<MessageRecord, RemoteError>> = (start.max(1)..=end)
            .filter_map(|sequence| {
                let message = messages.get(sequence as usize - 1)?;
                Some(Ok(MessageRecord {
                    sequence,
                    flags: message.flags.clone(),
                    internal_date: message.internal_date,
                    size: Some(message.body.len() as u32),
                    subject: None,
                    body: message.body.clone(),
                }))
            })
            .collect();

        Ok(stream::iter(records).boxed())
    }

    async fn append_message(&mut self, mailbox: &str, message: &MessageRecord) -> Result<(), RemoteError> {
        {
            let mut state = self.begin()?;
            state.stats.append_attempts += 1;

            if state.faults.broken_append == Some(state.stats.append_attempts) {
                state.faults.broken_append = None;
                return Err(RemoteError::Connection("connection reset by peer".to_string()));
            }

            if let Some(marker) = &state.faults.rejected_marker {
                if contains(&message.body, marker) {
                    return Err(RemoteError::Rejected("message refused by server".to_string()));
                }
            }

            if !state.mailboxes.contains_key(mailbox) {
                return Err(RemoteError::Rejected(format!("[TRYCREATE] no mailbox {}", mailbox)));
            }

            let stored = StoredMessage {
                flags: message.appendable_flags().map(str::to_string).collect(),
                internal_date: message.internal_date,
                body: message.body.clone(),
            };
            state.push_message(mailbox, stored);
            state.read_unsolicited(self.id)?;
        }

        self.server.activity.notify_waiters();
        Ok(())
    }

    async fn mark_deleted(&mut self, sequence_numbers: &[u32]) -> Result<(), RemoteError> {
        let mut state = self.begin()?;

        if state.faults.failing_stores > 0 {
            state.faults.failing_stores -= 1;
            return Err(RemoteError::Rejected("STORE failed".to_string()));
        }
        if self.read_only {
            return Err(RemoteError::Rejected("mailbox is read-only".to_string()));
        }

        let mailbox = state.selected(self.id)?;
        if let Some(messages) = state.mailboxes.get_mut(&mailbox) {
            for &sequence in sequence_numbers {
                let Some(message) = sequence.checked_sub(1).and_then(|i| messages.get_mut(i as usize)) else {
                    continue;
                };
                if !message.is_deleted() {
                    message.flags.push(DELETED_FLAG.to_string());
                }
            }
        }
        Ok(())
    }

    async fn expunge_deleted(&mut self) -> Result<(), RemoteError> {
        {
            let mut state = self.begin()?;
            if self.read_only {
                return Err(RemoteError::Rejected("mailbox is read-only".to_string()));
            }

            let mailbox = state.selected(self.id)?;
            let removed = match state.mailboxes.get_mut(&mailbox) {
                Some(messages) => {
                    let before = messages.len();
                    messages.retain(|message| !message.is_deleted());
                    before - messages.len()
                }
                None => 0,
            };

            state.stats.expunged += removed as u32;
            for _ in 0..removed {
                state.broadcast(&mailbox, ChangeEvent::MessageExpunged);
            }

            if let Some(body) = state.faults.delivery_on_expunge.take() {
                state.push_message(&mailbox, StoredMessage::new(body));
            }
            state.read_unsolicited(self.id)?;
        }

        self.server.activity.notify_waiters();
        Ok(())
    }

    async fn idle(&mut self, cancel: CancellationToken) -> Result<(), RemoteError> {
        let quiet = {
            let mut state = self.begin()?;
            state.stats.idles_started += 1;
            state.faults.quiet_idle
        };

        let activity = self.server.activity.clone();
        let cancelled = if quiet {
            cancel.cancelled().await;
            true
        } else {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = activity.notified() => false,
            }
        };

        let mut state = self.server.state();
        if cancelled {
            state.stats.idles_cancelled += 1;
        }
        state.read_unsolicited(self.id)
    }

    fn change_events(&mut self) -> ChangeEvents {
        match self.server.state().sessions.get_mut(&self.id) {
            Some(session) => session.relay.subscribe(),
            None => stream::empty().boxed(),
        }
    }

    async fn logout(&mut self) {
        if self.logged_out {
            return;
        }
        self.logged_out = true;

        let mut state = self.server.state();
        state.stats.logouts += 1;
        state.sessions.remove(&self.id);
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}
