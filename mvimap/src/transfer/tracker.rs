//! Mailbox state tracker
//!
//! Holds the transfer cursor shared by the notification listener (writer)
//! and the transfer pipeline (reader). The cursor lives in a
//! `tokio::sync::watch` channel: every update happens under the channel's
//! lock and bumps its version, and a [`CursorWatch`] remembers the version of
//! its last snapshot. A change that lands between a snapshot and the
//! following [`CursorWatch::wait_for_change`] therefore wakes the waiter
//! immediately instead of being lost.

use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::watch;

/// Engine progress through the source mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCursor {
    /// Highest sequence number already handled
    pub processed: u32,
    /// Latest message count reported by the server
    pub observed: u32,
}

impl TransferCursor {
    /// Sequence numbers still to transfer, if any
    pub fn pending_range(&self) -> Option<RangeInclusive<u32>> {
        if self.observed > self.processed {
            Some(self.processed + 1..=self.observed)
        } else {
            None
        }
    }
}

/// Single-writer state shared between listener and pipeline
#[derive(Debug, Clone)]
pub struct MailboxTracker {
    state: Arc<watch::Sender<TransferCursor>>,
}

impl MailboxTracker {
    /// Start tracking a mailbox that holds `observed` messages
    pub fn new(observed: u32) -> Self {
        let (state, _) = watch::channel(TransferCursor {
            processed: 0,
            observed,
        });
        Self {
            state: Arc::new(state),
        }
    }

    /// Current cursor
    pub fn read(&self) -> TransferCursor {
        *self.state.borrow()
    }

    /// Record the message count reported by the server
    pub fn set_observed(&self, observed: u32) {
        self.state.send_modify(|cursor| cursor.observed = observed);
    }

    /// Account for one expunged message
    ///
    /// Assumes the expunged message was one this engine already processed,
    /// which holds as long as nothing else deletes from the source mailbox
    /// during a run.
    pub fn decrement_both(&self) {
        self.state.send_modify(|cursor| {
            cursor.processed = cursor.processed.saturating_sub(1);
            cursor.observed = cursor.observed.saturating_sub(1);
        });
    }

    /// Mark every message up to `processed` as handled
    ///
    /// Never moves the cursor backwards.
    pub fn advance_processed(&self, processed: u32) {
        self.state
            .send_modify(|cursor| cursor.processed = cursor.processed.max(processed));
    }

    /// Reader handle with its own change tracking
    pub fn subscribe(&self) -> CursorWatch {
        CursorWatch {
            rx: self.state.subscribe(),
        }
    }
}

/// Reader side of a [`MailboxTracker`]
#[derive(Debug)]
pub struct CursorWatch {
    rx: watch::Receiver<TransferCursor>,
}

impl CursorWatch {
    /// Read the cursor and mark it as seen
    pub fn snapshot(&mut self) -> TransferCursor {
        *self.rx.borrow_and_update()
    }

    /// Wait until the cursor changes after the last snapshot
    pub async fn wait_for_change(&mut self) {
        if self.rx.changed().await.is_err() {
            // Tracker dropped: the cursor can never change again
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_initial_cursor() {
        let tracker = MailboxTracker::new(5);
        let cursor = tracker.read();
        assert_eq!(cursor.processed, 0);
        assert_eq!(cursor.observed, 5);
        assert_eq!(cursor.pending_range(), Some(1..=5));
    }

    #[test]
    fn test_empty_pending_range() {
        let cursor = TransferCursor {
            processed: 4,
            observed: 4,
        };
        assert_eq!(cursor.pending_range(), None);

        let cursor = TransferCursor {
            processed: 4,
            observed: 3,
        };
        assert_eq!(cursor.pending_range(), None);
    }

    #[test]
    fn test_setters() {
        let tracker = MailboxTracker::new(3);
        tracker.advance_processed(3);
        tracker.set_observed(5);
        assert_eq!(tracker.read().pending_range(), Some(4..=5));

        tracker.decrement_both();
        assert_eq!(
            tracker.read(),
            TransferCursor {
                processed: 2,
                observed: 4
            }
        );
    }

    #[test]
    fn test_processed_never_moves_backwards() {
        let tracker = MailboxTracker::new(10);
        tracker.advance_processed(7);
        tracker.advance_processed(4);
        assert_eq!(tracker.read().processed, 7);
    }

    #[test]
    fn test_decrement_saturates_at_zero() {
        let tracker = MailboxTracker::new(0);
        tracker.decrement_both();
        assert_eq!(tracker.read(), TransferCursor::default());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_change() {
        let tracker = MailboxTracker::new(0);
        let mut watch = tracker.subscribe();
        watch.snapshot();

        let writer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_observed(2);
        });

        timeout(Duration::from_secs(2), watch.wait_for_change())
            .await
            .unwrap();
        assert_eq!(watch.snapshot().observed, 2);
    }

    #[tokio::test]
    async fn test_change_before_wait_is_not_lost() {
        let tracker = MailboxTracker::new(0);
        let mut watch = tracker.subscribe();
        watch.snapshot();

        // Lands between the snapshot and the wait
        tracker.set_observed(1);

        timeout(Duration::from_millis(100), watch.wait_for_change())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_marks_change_seen() {
        let tracker = MailboxTracker::new(0);
        let mut watch = tracker.subscribe();
        tracker.set_observed(1);
        watch.snapshot();

        let waited = timeout(Duration::from_millis(50), watch.wait_for_change()).await;
        assert!(waited.is_err());
    }
}
