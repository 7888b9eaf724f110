//! Session pair
//!
//! The two authenticated connections of one run. Opened at the start of a
//! supervisor iteration and always torn down at its end.

use crate::config::{AccountConfig, Config};
use crate::error::{Result, Side, SyncError};
use crate::remote::{MailboxConnector, MailboxInfo, MailboxService, RemoteError};
use tracing::{debug, info};

pub struct SessionPair<M> {
    pub source: M,
    pub destination: M,
    pub source_mailbox: String,
    pub destination_mailbox: String,
}

impl<M: MailboxService> SessionPair<M> {
    /// Log in to both servers and make sure the destination mailbox exists
    ///
    /// The destination is opened first. If anything fails after a session
    /// was established, that session is logged out before returning.
    pub async fn open<C>(connector: &C, config: &Config) -> Result<Self>
    where
        C: MailboxConnector<Service = M>,
    {
        let destination_mailbox = config.destination_mailbox().to_string();
        let mut destination = login(connector, &config.destination, Side::Destination).await?;

        if let Err(e) = prepare_destination(&mut destination, &destination_mailbox).await {
            destination.logout().await;
            return Err(e);
        }

        let source = match login(connector, &config.source, Side::Source).await {
            Ok(source) => source,
            Err(e) => {
                destination.logout().await;
                return Err(e);
            }
        };

        Ok(Self {
            source,
            destination,
            source_mailbox: config.source_mailbox().to_string(),
            destination_mailbox,
        })
    }

    /// Select the source mailbox and capture its size
    ///
    /// The selection is writable only when messages will be deleted.
    pub async fn select_source(&mut self, copy: bool) -> Result<MailboxInfo> {
        let snapshot = self
            .source
            .select_mailbox(&self.source_mailbox, copy)
            .await
            .map_err(|e| SyncError::Select(Side::Source, e))?;

        info!(
            mailbox = %self.source_mailbox,
            messages = snapshot.message_count,
            "Source mailbox selected"
        );
        Ok(snapshot)
    }

    /// Log out of both servers
    pub async fn teardown(mut self) {
        self.source.logout().await;
        self.destination.logout().await;
        debug!("Sessions closed");
    }
}

async fn login<C: MailboxConnector>(
    connector: &C,
    account: &AccountConfig,
    side: Side,
) -> Result<C::Service> {
    let endpoint = account.endpoint()?;
    let connection = connector
        .connect(&endpoint)
        .await
        .map_err(|e| SyncError::Dial(side, e))?;

    let service = connector
        .login(connection, &account.username, &account.password)
        .await
        .map_err(|e| SyncError::Login(side, e))?;

    debug!("Logged in to {} ({})", side, endpoint);
    Ok(service)
}

/// Check the destination mailbox exists, creating it when it does not
///
/// The mailbox is examined and closed again: appends never need it selected,
/// and a selected mailbox would keep queueing `EXISTS` for every append.
async fn prepare_destination<M: MailboxService>(destination: &mut M, mailbox: &str) -> Result<()> {
    match destination.select_mailbox(mailbox, true).await {
        Ok(info) => {
            debug!(mailbox = %mailbox, messages = info.message_count, "Destination mailbox exists");
            destination
                .close_mailbox()
                .await
                .map_err(|e| SyncError::Select(Side::Destination, e))
        }
        Err(RemoteError::NotFound(reason)) => {
            info!("Destination mailbox {} does not exist ({}), creating it", mailbox, reason);
            destination
                .create_mailbox(mailbox)
                .await
                .map_err(SyncError::CreateMailbox)
        }
        Err(e) => Err(SyncError::Select(Side::Destination, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;
    use crate::remote::{MemoryConnector, MemoryServer};

    fn connector_and_config() -> (MemoryServer, MemoryServer, MemoryConnector, Config) {
        let source = MemoryServer::new();
        let destination = MemoryServer::new();
        let connector = MemoryConnector::new()
            .with_server("src.test", source.clone())
            .with_server("dst.test", destination.clone());
        let config = Config {
            source: AccountConfig::new("src.test", "alice", "pw1"),
            destination: AccountConfig::new("dst.test", "alice", "pw2"),
            transfer: Default::default(),
            tls: TlsSettings::default(),
        };
        (source, destination, connector, config)
    }

    #[tokio::test]
    async fn test_destination_mailbox_left_unselected() {
        let (_source, destination, connector, config) = connector_and_config();

        let pair = SessionPair::open(&connector, &config).await.unwrap();
        assert_eq!(destination.open_sessions(), 1);
        assert_eq!(destination.sessions_selecting("INBOX"), 0);

        pair.teardown().await;
    }

    #[tokio::test]
    async fn test_missing_destination_mailbox_is_created() {
        let (_source, destination, connector, mut config) = connector_and_config();
        config.destination.mailbox = Some("Imported".to_string());

        let pair = SessionPair::open(&connector, &config).await.unwrap();
        assert!(destination.has_mailbox("Imported"));
        assert_eq!(pair.destination_mailbox, "Imported");

        pair.teardown().await;
        assert_eq!(destination.open_sessions(), 0);
    }
}
