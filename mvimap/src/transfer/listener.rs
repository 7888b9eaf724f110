//! Notification listener
//!
//! Background task folding the source session's change events into the
//! [`MailboxTracker`]. Events are applied one at a time, in the order the
//! server sent them.

use crate::error::{Result, SyncError};
use crate::remote::{ChangeEvent, ChangeEvents};
use crate::transfer::tracker::MailboxTracker;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct NotificationListener {
    tracker: MailboxTracker,
    events: ChangeEvents,
}

impl NotificationListener {
    pub fn new(tracker: MailboxTracker, events: ChangeEvents) -> Self {
        Self { tracker, events }
    }

    /// Run the listener on its own task
    pub fn spawn(self) -> ListenerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        ListenerHandle { cancel, task }
    }

    /// Apply events until cancelled or the event stream ends
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.events.next() => match event {
                    Some(event) => self.apply(event),
                    None => {
                        debug!("Change event stream ended");
                        break;
                    }
                },
            }
        }
    }

    fn apply(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::MailboxGrew(total) => {
                self.tracker.set_observed(total);
                debug!("adding messages: src now has {} messages", total);
            }
            ChangeEvent::MessageExpunged => {
                self.tracker.decrement_both();
                debug!(
                    "removing message: src now has {} messages",
                    self.tracker.read().observed
                );
            }
        }
    }
}

/// Owner's handle on a running listener
pub struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop the listener and wait for its task to finish
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| SyncError::Listener(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::tracker::TransferCursor;
    use futures::channel::mpsc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_events_update_tracker_in_order() {
        let tracker = MailboxTracker::new(2);
        tracker.advance_processed(2);
        let mut watch = tracker.subscribe();
        watch.snapshot();

        let (tx, rx) = mpsc::unbounded();
        let handle = NotificationListener::new(tracker.clone(), rx.boxed()).spawn();

        tx.unbounded_send(ChangeEvent::MailboxGrew(4)).unwrap();
        tx.unbounded_send(ChangeEvent::MessageExpunged).unwrap();

        timeout(Duration::from_secs(2), async {
            while tracker.read().observed != 3 {
                watch.wait_for_change().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            tracker.read(),
            TransferCursor {
                processed: 1,
                observed: 3
            }
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_stream_open() {
        let tracker = MailboxTracker::new(0);
        let (_tx, rx) = mpsc::unbounded::<ChangeEvent>();
        let handle = NotificationListener::new(tracker, rx.boxed()).spawn();

        timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_listener_stops_when_stream_ends() {
        let tracker = MailboxTracker::new(0);
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(ChangeEvent::MailboxGrew(1)).unwrap();
        drop(tx);

        let cancel = CancellationToken::new();
        timeout(
            Duration::from_secs(2),
            NotificationListener::new(tracker.clone(), rx.boxed()).run(cancel),
        )
        .await
        .unwrap();

        assert_eq!(tracker.read().observed, 1);
    }
}
