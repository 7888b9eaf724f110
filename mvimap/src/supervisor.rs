//! Retry supervisor
//!
//! Runs sync sessions back to back. A session that fails is logged, torn
//! down, and retried after a fixed delay; there is no retry limit. In once
//! mode the first successful session ends the run.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::remote::{MailboxConnector, MailboxService};
use crate::session::SessionPair;
use crate::transfer::{MailboxTracker, NotificationListener, TransferPipeline};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Where the supervisor is in its cycle
#[derive(Debug)]
pub enum SupervisorState {
    /// A session is (about to be) running
    Running { attempt: u64 },
    /// The last session failed; waiting out the retry delay
    Retrying { attempt: u64, error: SyncError },
}

pub struct Supervisor<C> {
    connector: C,
    config: Config,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl<C: MailboxConnector> Supervisor<C> {
    pub fn new(connector: C, config: Config) -> Self {
        let retry_delay = config.transfer.retry_delay();
        Self {
            connector,
            config,
            retry_delay,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the delay between a failed session and the next attempt
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Use `shutdown` to stop the supervisor from outside
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run sessions until a once-mode session succeeds or shutdown is requested
    pub async fn run(&self) -> Result<()> {
        let mut state = SupervisorState::Running { attempt: 1 };

        loop {
            state = match state {
                SupervisorState::Running { attempt } => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }

                    info!(attempt, "Starting sync session");
                    match self.run_session().await {
                        Ok(()) => {
                            info!("Sync session finished");
                            return Ok(());
                        }
                        Err(error) => SupervisorState::Retrying { attempt, error },
                    }
                }
                SupervisorState::Retrying { attempt, error } => {
                    error!(attempt, "{} (retrying in {:?})", error, self.retry_delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    SupervisorState::Running { attempt: attempt + 1 }
                }
            };
        }
    }

    /// One full session: connect, transfer, tear down
    ///
    /// Both servers are logged out on every path once they were logged in.
    pub async fn run_session(&self) -> Result<()> {
        let mut pair = SessionPair::open(&self.connector, &self.config).await?;
        let result = self.transfer(&mut pair).await;
        pair.teardown().await;
        result
    }

    async fn transfer(&self, pair: &mut SessionPair<C::Service>) -> Result<()> {
        let snapshot = pair.select_source(self.config.transfer.copy).await?;
        let tracker = MailboxTracker::new(snapshot.message_count);
        let listener = NotificationListener::new(tracker.clone(), pair.source.change_events()).spawn();

        let result = TransferPipeline::new(pair, tracker, &self.config.transfer, self.shutdown.clone())
            .run()
            .await;

        let stopped = listener.shutdown().await;
        result.and(stopped)
    }
}
