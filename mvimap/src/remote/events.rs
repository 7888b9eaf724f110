//! Ordered change-event queue of one session
//!
//! A session learns about `EXISTS`/`EXPUNGE` in several ways: unsolicited
//! responses queued by the client library, the responses to its own
//! `EXPUNGE`, and the data that ends an IDLE. All of them are pushed through
//! one [`EventRelay`] at the point the session reads them, so the listener
//! applies them in the order the server sent them.

use super::{ChangeEvent, ChangeEvents};
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};

pub struct EventRelay {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    rx: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
}

impl EventRelay {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self { tx, rx: Some(rx) }
    }

    pub fn forward(&self, event: ChangeEvent) {
        // The receiver is gone once the listener stopped; nothing to report then
        let _ = self.tx.unbounded_send(event);
    }

    /// Forward events in iteration order, consuming the iterator fully
    pub fn forward_all(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.forward(event);
        }
    }

    /// Take the receiving end; later calls get an empty stream
    pub fn subscribe(&mut self) -> ChangeEvents {
        match self.rx.take() {
            Some(rx) => rx.boxed(),
            None => stream::empty().boxed(),
        }
    }
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{MailboxTracker, NotificationListener, TransferCursor};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_events_keep_forwarding_order() {
        let mut relay = EventRelay::new();
        relay.forward(ChangeEvent::MessageExpunged);
        relay.forward_all([ChangeEvent::MailboxGrew(4), ChangeEvent::MessageExpunged]);
        relay.forward(ChangeEvent::MailboxGrew(7));

        let events: Vec<_> = relay.subscribe().take(4).collect().await;
        assert_eq!(
            events,
            vec![
                ChangeEvent::MessageExpunged,
                ChangeEvent::MailboxGrew(4),
                ChangeEvent::MessageExpunged,
                ChangeEvent::MailboxGrew(7),
            ]
        );

        assert_eq!(relay.subscribe().next().await, None);
    }

    #[tokio::test]
    async fn test_arrival_after_own_expunge_is_kept() {
        // Three processed messages get expunged, then one new message arrives
        let tracker = MailboxTracker::new(3);
        tracker.advance_processed(3);

        let mut relay = EventRelay::new();
        let handle = NotificationListener::new(tracker.clone(), relay.subscribe()).spawn();

        relay.forward_all([ChangeEvent::MessageExpunged; 3]);
        relay.forward(ChangeEvent::MailboxGrew(1));

        let mut watch = tracker.subscribe();
        timeout(Duration::from_secs(2), async {
            while watch.snapshot().pending_range().is_none() {
                watch.wait_for_change().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            tracker.read(),
            TransferCursor {
                processed: 0,
                observed: 1
            }
        );
        handle.shutdown().await.unwrap();
    }
}
