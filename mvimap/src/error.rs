use std::fmt;
use thiserror::Error;

use crate::remote::RemoteError;

/// Which of the two sessions an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("src"),
            Side::Destination => f.write_str("dst"),
        }
    }
}

/// Errors that end a sync session.
///
/// Each variant names the stage that faulted so the supervisor log tells
/// an operator where the run broke down.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("dialing {0}: {1}")]
    Dial(Side, #[source] RemoteError),

    #[error("login to {0}: {1}")]
    Login(Side, #[source] RemoteError),

    #[error("selecting {0} mailbox: {1}")]
    Select(Side, #[source] RemoteError),

    #[error("creating dst mailbox: {0}")]
    CreateMailbox(#[source] RemoteError),

    #[error("fetching src messages: {0}")]
    Fetch(#[source] RemoteError),

    #[error("appending message to dst: {0}")]
    Append(#[source] RemoteError),

    #[error("deleting src messages: {0}")]
    Delete(#[source] RemoteError),

    #[error("idling on src: {0}")]
    Idle(#[source] RemoteError),

    #[error("notification listener failed: {0}")]
    Listener(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
