//! mvimap: move (or copy) messages from one IMAP mailbox to another
//!
//! mvimap logs in to a source and a destination server, transfers every
//! message of the source mailbox to the destination, and deletes the
//! originals unless running in copy mode. Without `--once` it then keeps
//! watching the source (IMAP IDLE plus untagged `EXISTS`/`EXPUNGE`
//! notifications) and moves new mail as it arrives.
//!
//! # Features
//!
//! - **Watch mode**: IDLE-driven, no polling
//! - **At-least-once delivery**: a source message is only deleted after the
//!   destination accepted it
//! - **Self-healing**: any session failure is logged and retried after a
//!   fixed delay
//! - **Flags and dates**: flags (except `\Recent`) and internal dates are
//!   carried over
//!
//! # Example
//!
//! ```no_run
//! use mvimap::config::{AccountConfig, Config, TlsSettings, TransferConfig};
//! use mvimap::remote::tls::TlsConfig;
//! use mvimap::remote::ImapConnector;
//! use mvimap::Supervisor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         source: AccountConfig::new("imap.old.example", "me", "secret"),
//!         destination: AccountConfig::new("imap.new.example", "me", "secret"),
//!         transfer: TransferConfig::default(),
//!         tls: TlsSettings::default(),
//!     };
//!
//!     let tls = TlsConfig::from_settings(&config.tls)?;
//!     let connector = ImapConnector::new(tls, config.transfer.idle_refresh());
//!     Supervisor::new(connector, config).run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Command line and file configuration
//! - [`error`]: Error types, one variant per failing stage
//! - [`remote`]: Mailbox service abstraction, IMAP and in-memory backends
//! - [`session`]: Source/destination session pair
//! - [`transfer`]: Cursor tracking, change listener and transfer pipeline
//! - [`supervisor`]: Retry loop around sessions

pub mod config;
pub mod error;
pub mod remote;
pub mod session;
pub mod supervisor;
pub mod transfer;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, Side, SyncError};
pub use supervisor::Supervisor;
