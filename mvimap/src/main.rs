//! mvimap command line
//!
//! ```bash
//! # Move everything from one INBOX to another, then keep watching
//! mvimap imap.old.example me@old.example secret imap.new.example:993 me@new.example secret
//!
//! # Copy a single folder once
//! mvimap --once --copy --frombox Archive --tobox Old/Archive \
//!     imap.old.example me secret imap.new.example me secret
//!
//! # Accounts from a file
//! mvimap --config mvimap.toml
//! ```

use anyhow::Context;
use clap::Parser;
use mvimap::config::{AccountConfig, Config, TlsSettings, TransferConfig};
use mvimap::remote::tls::TlsConfig;
use mvimap::remote::ImapConnector;
use mvimap::Supervisor;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser, Debug)]
#[command(name = "mvimap", version)]
#[command(about = "Move (or copy) messages from one IMAP mailbox to another", long_about = None)]
struct Cli {
    /// Source server, `host` or `host:port` (port defaults to 993)
    #[arg(required_unless_present = "config", conflicts_with = "config")]
    from_server: Option<String>,
    /// Source username
    #[arg(required_unless_present = "config")]
    from_user: Option<String>,
    /// Source password
    #[arg(required_unless_present = "config")]
    from_pw: Option<String>,
    /// Destination server, `host` or `host:port`
    #[arg(required_unless_present = "config")]
    to_server: Option<String>,
    /// Destination username
    #[arg(required_unless_present = "config")]
    to_user: Option<String>,
    /// Destination password
    #[arg(required_unless_present = "config")]
    to_pw: Option<String>,

    /// Transfer what is there now and exit instead of watching
    #[arg(long)]
    once: bool,

    /// Keep messages in the source mailbox
    #[arg(long)]
    copy: bool,

    /// Print progress
    #[arg(short, long)]
    verbose: bool,

    /// Source mailbox [default: INBOX]
    #[arg(long, value_name = "MAILBOX")]
    frombox: Option<String>,

    /// Destination mailbox [default: same as --frombox]
    #[arg(long, value_name = "MAILBOX")]
    tobox: Option<String>,

    /// Read accounts and settings from a TOML file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds to wait before reconnecting after a failure
    #[arg(long, value_name = "SECS")]
    retry_delay: Option<u64>,

    /// Seconds after which an IDLE command is re-issued
    #[arg(long, value_name = "SECS")]
    idle_refresh: Option<u64>,

    /// Do not verify server certificates
    #[arg(long)]
    insecure: bool,

    /// Extra CA certificates (PEM) to trust
    #[arg(long, value_name = "FILE")]
    ca_file: Option<PathBuf>,
}

impl Cli {
    fn accounts(&self) -> Option<(AccountConfig, AccountConfig)> {
        Some((
            AccountConfig::new(self.from_server.clone()?, self.from_user.clone()?, self.from_pw.clone()?),
            AccountConfig::new(self.to_server.clone()?, self.to_user.clone()?, self.to_pw.clone()?),
        ))
    }
}

/// Merge the command line over the optional config file
fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let (source, destination) = cli
                .accounts()
                .context("source and destination accounts are required")?;
            Config {
                source,
                destination,
                transfer: TransferConfig::default(),
                tls: TlsSettings::default(),
            }
        }
    };

    config.transfer.once |= cli.once;
    config.transfer.copy |= cli.copy;
    if let Some(mailbox) = &cli.frombox {
        config.source.mailbox = Some(mailbox.clone());
    }
    if let Some(mailbox) = &cli.tobox {
        config.destination.mailbox = Some(mailbox.clone());
    }
    if let Some(secs) = cli.retry_delay {
        config.transfer.retry_delay_secs = secs;
    }
    if let Some(secs) = cli.idle_refresh {
        config.transfer.idle_refresh_secs = secs;
    }
    config.tls.insecure |= cli.insecure;
    if let Some(ca_file) = &cli.ca_file {
        config.tls.ca_file = Some(ca_file.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Progress (info and below) goes to stdout, warnings and errors to stderr
fn is_progress(level: &Level) -> bool {
    *level > Level::WARN
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_filter = if cli.verbose { "mvimap=debug" } else { "mvimap=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(filter_fn(|metadata| is_progress(metadata.level()))),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(LevelFilter::WARN),
        )
        .init();

    let config = build_config(&cli)?;
    info!(
        "Transferring {} -> {} ({} mode{})",
        config.source_mailbox(),
        config.destination_mailbox(),
        if config.transfer.copy { "copy" } else { "move" },
        if config.transfer.once { ", once" } else { "" }
    );

    let tls = TlsConfig::from_settings(&config.tls)?;
    let connector = ImapConnector::new(tls, config.transfer.idle_refresh());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("Cannot listen for interrupts: {}", e),
        }
    });

    Supervisor::new(connector, config)
        .with_shutdown(shutdown)
        .run()
        .await?;

    Ok(())
}
