//! Transfer pipeline
//!
//! Drains the pending range of the source mailbox into the destination, then
//! (in watch mode) waits for the next change. A wait ends on whichever comes
//! first: server activity seen by IDLE, a tracker update from the
//! notification listener, or shutdown. An IDLE that lost the race is
//! cancelled and awaited so the source session is usable again before the
//! next batch.

use crate::config::TransferConfig;
use crate::error::{Result, SyncError};
use crate::remote::MailboxService;
use crate::session::SessionPair;
use crate::transfer::tracker::{CursorWatch, MailboxTracker};
use futures::StreamExt;
use std::ops::RangeInclusive;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub appended: u32,
    pub skipped: u32,
    pub deleted: u32,
}

/// Why a wait for new messages ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wakeup {
    ServerActivity,
    TrackerChanged,
    Shutdown,
}

pub struct TransferPipeline<'a, M> {
    session: &'a mut SessionPair<M>,
    tracker: MailboxTracker,
    watch: CursorWatch,
    once: bool,
    copy: bool,
    shutdown: CancellationToken,
}

impl<'a, M: MailboxService> TransferPipeline<'a, M> {
    pub fn new(
        session: &'a mut SessionPair<M>,
        tracker: MailboxTracker,
        transfer: &TransferConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let watch = tracker.subscribe();
        Self {
            session,
            tracker,
            watch,
            once: transfer.once,
            copy: transfer.copy,
            shutdown,
        }
    }

    /// Transfer until done (once mode), shutdown, or a fatal error
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            if let Some(range) = self.watch.snapshot().pending_range() {
                let report = self.transfer_batch(range).await?;
                if report.skipped > 0 {
                    warn!("{} message(s) could not be appended and were left in src", report.skipped);
                }
            }

            if self.once {
                return Ok(());
            }

            // Changes made while the batch ran are handled before waiting
            if self.watch.snapshot().pending_range().is_some() {
                continue;
            }

            match self.wait_for_activity().await? {
                Wakeup::Shutdown => {
                    info!("Shutdown requested, leaving watch loop");
                    return Ok(());
                }
                wakeup => debug!(?wakeup, "woke up"),
            }
        }
    }

    /// Copy `range` to the destination, then delete it from the source
    /// unless in copy mode
    ///
    /// Messages the destination refuses are skipped and stay in the source.
    /// A broken destination connection aborts the batch.
    async fn transfer_batch(&mut self, range: RangeInclusive<u32>) -> Result<BatchReport> {
        let (start, end) = (*range.start(), *range.end());
        debug!("processing src messages {} to {}", start, end);

        let copy = self.copy;
        let mut report = BatchReport::default();
        let mut transferred = Vec::new();

        {
            let SessionPair {
                source,
                destination,
                destination_mailbox,
                ..
            } = &mut *self.session;

            let mut records = source.fetch_range(start, end).await.map_err(SyncError::Fetch)?;

            while let Some(record) = records.next().await {
                let record = record.map_err(SyncError::Fetch)?;
                debug!(
                    size = ?record.size,
                    subject = record.subject.as_deref().unwrap_or(""),
                    "appending message {} to dst",
                    record.sequence
                );

                match destination.append_message(destination_mailbox, &record).await {
                    Ok(()) => {
                        report.appended += 1;
                        if !copy {
                            transferred.push(record.sequence);
                        }
                    }
                    Err(e) if e.is_connection_failure() => return Err(SyncError::Append(e)),
                    Err(e) => {
                        warn!("skipping src message {}: {}", record.sequence, e);
                        report.skipped += 1;
                    }
                }
            }
        }

        self.tracker.advance_processed(end);

        if !transferred.is_empty() {
            let source = &mut self.session.source;
            source.mark_deleted(&transferred).await.map_err(SyncError::Delete)?;
            source.expunge_deleted().await.map_err(SyncError::Delete)?;
            report.deleted = transferred.len() as u32;
        }

        debug!(
            appended = report.appended,
            skipped = report.skipped,
            deleted = report.deleted,
            "processed src messages, src now has {} messages",
            self.tracker.read().observed
        );
        Ok(report)
    }

    /// Wait until the source may hold new messages
    ///
    /// An IDLE that did not win is cancelled and run to completion.
    async fn wait_for_activity(&mut self) -> Result<Wakeup> {
        let cancel = CancellationToken::new();
        let idle = self.session.source.idle(cancel.clone());
        tokio::pin!(idle);

        let wakeup = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wakeup::Shutdown,
            _ = self.watch.wait_for_change() => Wakeup::TrackerChanged,
            result = &mut idle => {
                result.map_err(SyncError::Idle)?;
                return Ok(Wakeup::ServerActivity);
            }
        };

        cancel.cancel();
        idle.await.map_err(SyncError::Idle)?;
        Ok(wakeup)
    }
}
