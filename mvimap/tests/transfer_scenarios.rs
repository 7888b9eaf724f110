//! End-to-end transfer tests against the in-memory mail server

use mvimap::config::{AccountConfig, Config, TlsSettings, TransferConfig};
use mvimap::remote::memory::StoredMessage;
use mvimap::remote::{MemoryConnector, MemoryServer};
use mvimap::{Side, Supervisor, SyncError};
use std::time::Duration;
use tokio::time::{sleep, timeout};

struct Harness {
    source: MemoryServer,
    destination: MemoryServer,
    config: Config,
}

impl Harness {
    fn new(once: bool, copy: bool) -> Self {
        Self {
            source: MemoryServer::new(),
            destination: MemoryServer::new(),
            config: Config {
                source: AccountConfig::new("src.test", "alice", "pw1"),
                destination: AccountConfig::new("dst.test:1993", "alice", "pw2"),
                transfer: TransferConfig {
                    once,
                    copy,
                    ..TransferConfig::default()
                },
                tls: TlsSettings::default(),
            },
        }
    }

    fn supervisor(&self) -> Supervisor<MemoryConnector> {
        let connector = MemoryConnector::new()
            .with_server("src.test", self.source.clone())
            .with_server("dst.test", self.destination.clone());
        Supervisor::new(connector, self.config.clone()).with_retry_delay(Duration::from_millis(20))
    }

    fn fill_source(&self, count: usize) {
        for i in 1..=count {
            self.source.deliver("INBOX", format!("Subject: message {}\r\n\r\nbody {}", i, i));
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_copy_once_leaves_source_untouched() {
    let harness = Harness::new(true, true);
    harness.fill_source(5);

    harness.supervisor().run().await.unwrap();

    assert_eq!(harness.destination.count("INBOX"), 5);
    assert_eq!(harness.source.count("INBOX"), 5);
    assert_eq!(
        harness.destination.bodies("INBOX"),
        harness.source.bodies("INBOX")
    );
}

#[tokio::test]
async fn test_move_once_creates_destination_mailbox() {
    let mut harness = Harness::new(true, false);
    harness.config.destination.mailbox = Some("Imported".to_string());
    harness.fill_source(3);
    assert!(!harness.destination.has_mailbox("Imported"));

    harness.supervisor().run().await.unwrap();

    assert!(harness.destination.has_mailbox("Imported"));
    assert_eq!(harness.destination.count("Imported"), 3);
    assert_eq!(harness.source.count("INBOX"), 0);
}

#[tokio::test]
async fn test_flags_and_internal_date_are_preserved() {
    let harness = Harness::new(true, false);
    let date = chrono::DateTime::parse_from_rfc3339("2021-03-04T05:06:07+02:00").unwrap();
    harness.source.deliver_message(
        "INBOX",
        StoredMessage::new("flagged")
            .with_flags(&["\\Seen", "\\Recent", "$Label1"])
            .with_internal_date(date),
    );

    harness.supervisor().run().await.unwrap();

    let copied = harness.destination.messages("INBOX");
    assert_eq!(copied.len(), 1);
    assert_eq!(copied[0].flags, vec!["\\Seen".to_string(), "$Label1".to_string()]);
    assert_eq!(copied[0].internal_date, Some(date));
}

#[tokio::test]
async fn test_copy_mode_does_not_deduplicate() {
    let harness = Harness::new(true, true);
    harness.fill_source(2);

    harness.supervisor().run().await.unwrap();
    harness.supervisor().run().await.unwrap();

    assert_eq!(harness.destination.count("INBOX"), 4);
    assert_eq!(harness.source.count("INBOX"), 2);
}

#[tokio::test]
async fn test_move_keeps_rejected_messages() {
    let harness = Harness::new(true, false);
    harness.fill_source(2);
    harness.source.deliver("INBOX", "REJECT-ME");
    harness.fill_source(1);
    harness.destination.reject_messages_containing("REJECT-ME");

    harness.supervisor().run().await.unwrap();

    assert_eq!(harness.source.bodies("INBOX"), vec!["REJECT-ME"]);
    assert_eq!(harness.destination.count("INBOX"), 3);
}

#[tokio::test]
async fn test_watch_mode_transfers_new_arrivals() {
    let harness = Harness::new(false, false);
    harness.fill_source(1);

    let supervisor = harness.supervisor();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    let (source, destination) = (harness.source.clone(), harness.destination.clone());
    wait_until(|| destination.count("INBOX") == 1 && source.count("INBOX") == 0).await;
    wait_until(|| source.stats().idles_started >= 1).await;

    harness.source.deliver("INBOX", "second");
    harness.source.deliver("INBOX", "third");

    wait_until(|| destination.count("INBOX") == 3 && source.count("INBOX") == 0).await;
    let bodies = harness.destination.bodies("INBOX");
    assert_eq!(&bodies[1..], ["second", "third"]);

    // Back to idling after the wakeup
    wait_until(|| source.stats().idles_started >= 2).await;

    shutdown.cancel();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(harness.source.stats().logouts, 1);
    assert_eq!(harness.destination.stats().logouts, 1);
    assert_eq!(harness.source.open_sessions(), 0);
}

#[tokio::test]
async fn test_watch_mode_with_quiet_idle_uses_notifications() {
    let harness = Harness::new(false, true);
    harness.source.set_quiet_idle(true);

    let supervisor = harness.supervisor();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    let source = harness.source.clone();
    wait_until(|| source.stats().idles_started >= 1).await;

    harness.source.deliver("INBOX", "first");
    harness.source.deliver("INBOX", "second");

    let destination = harness.destination.clone();
    wait_until(|| destination.count("INBOX") == 2).await;
    assert!(harness.source.stats().idles_cancelled >= 1);

    shutdown.cancel();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(harness.source.count("INBOX"), 2);
}

#[tokio::test]
async fn test_broken_destination_restarts_session() {
    let harness = Harness::new(true, true);
    harness.fill_source(5);
    harness.destination.break_connection_on_append(2);

    harness.supervisor().run().await.unwrap();

    let bodies = harness.destination.bodies("INBOX");
    assert_eq!(bodies.len(), 6);
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(&bodies[1..], harness.source.bodies("INBOX").as_slice());

    let (src, dst) = (harness.source.stats(), harness.destination.stats());
    assert_eq!((src.logins, src.logouts), (2, 2));
    assert_eq!((dst.logins, dst.logouts), (2, 2));
}

#[tokio::test]
async fn test_session_error_names_failing_stage() {
    let harness = Harness::new(true, true);
    harness.fill_source(1);
    harness.destination.break_connection_on_append(1);

    let err = harness.supervisor().run_session().await.unwrap_err();
    assert!(matches!(err, SyncError::Append(_)));
    assert!(err.to_string().starts_with("appending message to dst"));

    harness.destination.fail_selects(1);
    let err = harness.supervisor().run_session().await.unwrap_err();
    assert!(matches!(err, SyncError::Select(Side::Destination, _)));

    harness.source.fail_connects(1);
    let err = harness.supervisor().run_session().await.unwrap_err();
    assert!(matches!(err, SyncError::Dial(Side::Source, _)));
}

#[tokio::test]
async fn test_login_failures_are_retried() {
    let harness = Harness::new(true, false);
    harness.fill_source(2);
    harness.source.fail_logins(2);

    harness.supervisor().run().await.unwrap();

    assert_eq!(harness.source.stats().logins, 1);
    assert_eq!(harness.destination.stats().logins, 3);
    assert_eq!(harness.destination.stats().logouts, 3);
    assert_eq!(harness.destination.count("INBOX"), 2);
}

#[tokio::test]
async fn test_destination_with_bounded_response_queue_accepts_long_batch() {
    let harness = Harness::new(true, false);
    harness.fill_source(20);
    harness.destination.limit_unsolicited_backlog(5);

    timeout(Duration::from_secs(5), harness.supervisor().run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(harness.destination.count("INBOX"), 20);
    assert_eq!(harness.source.count("INBOX"), 0);
    assert_eq!(harness.destination.stats().connects, 1);
}

#[tokio::test]
async fn test_watch_mode_picks_up_arrival_during_expunge() {
    let harness = Harness::new(false, false);
    harness.fill_source(3);
    harness.source.defer_unsolicited(true);
    harness.source.set_quiet_idle(true);
    harness.source.deliver_on_next_expunge("late");

    let supervisor = harness.supervisor();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(async move { supervisor.run().await });

    let (source, destination) = (harness.source.clone(), harness.destination.clone());
    wait_until(|| destination.count("INBOX") == 4 && source.count("INBOX") == 0).await;
    assert_eq!(harness.destination.bodies("INBOX")[3], "late");

    shutdown.cancel();
    timeout(Duration::from_secs(2), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
