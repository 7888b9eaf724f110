//! Configuration for mvimap
//!
//! Settings come from the command line or from a TOML file:
//!
//! ```toml
//! [source]
//! server = "imap.old-provider.example"
//! username = "me@old-provider.example"
//! password = "secret"
//! mailbox = "INBOX"
//!
//! [destination]
//! server = "mail.example.com:1993"
//! username = "me@example.com"
//! password = "secret"
//! mailbox = "Imported"
//!
//! [transfer]
//! copy = true
//! retry_delay_secs = 60
//!
//! [tls]
//! ca_file = "/etc/ssl/private-ca.pem"
//! ```

use crate::error::{Result, SyncError};
use crate::remote::{Endpoint, INBOX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port used when a server address carries none (implicit TLS)
pub const DEFAULT_PORT: u16 = 993;

/// Sleep between a failed session and the next attempt
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Servers drop IDLE after 30 minutes; re-issue it before that
pub const DEFAULT_IDLE_REFRESH_SECS: u64 = 29 * 60;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Account messages are taken from
    pub source: AccountConfig,
    /// Account messages are delivered to
    pub destination: AccountConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub tls: TlsSettings,
}

/// One IMAP account
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// `host` or `host:port`
    pub server: String,
    pub username: String,
    pub password: String,
    /// Mailbox name; see [`Config::source_mailbox`] and
    /// [`Config::destination_mailbox`] for the defaults
    #[serde(default)]
    pub mailbox: Option<String>,
}

/// How messages are transferred
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Run a single pass instead of watching the source
    #[serde(default)]
    pub once: bool,
    /// Keep messages in the source mailbox
    #[serde(default)]
    pub copy: bool,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_idle_refresh")]
    pub idle_refresh_secs: u64,
}

/// TLS trust settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsSettings {
    /// Accept any server certificate
    #[serde(default)]
    pub insecure: bool,
    /// Extra trust anchors (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

fn default_idle_refresh() -> u64 {
    DEFAULT_IDLE_REFRESH_SECS
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            once: false,
            copy: false,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            idle_refresh_secs: DEFAULT_IDLE_REFRESH_SECS,
        }
    }
}

impl TransferConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn idle_refresh(&self) -> Duration {
        Duration::from_secs(self.idle_refresh_secs)
    }
}

impl AccountConfig {
    pub fn new(server: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
            mailbox: None,
        }
    }

    /// Resolve the server address
    pub fn endpoint(&self) -> Result<Endpoint> {
        parse_endpoint(&self.server)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::Config(format!("Failed to read config file {:?}: {}", path.as_ref(), e))
        })?;

        toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Source mailbox, `INBOX` unless configured
    pub fn source_mailbox(&self) -> &str {
        self.source.mailbox.as_deref().unwrap_or(INBOX)
    }

    /// Destination mailbox, the source mailbox name unless configured
    pub fn destination_mailbox(&self) -> &str {
        self.destination
            .mailbox
            .as_deref()
            .unwrap_or_else(|| self.source_mailbox())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (side, account) in [("source", &self.source), ("destination", &self.destination)] {
            account.endpoint()?;

            if account.username.is_empty() {
                return Err(SyncError::Config(format!("No {} username configured", side)));
            }
            if account.mailbox.as_deref() == Some("") {
                return Err(SyncError::Config(format!("Empty {} mailbox name", side)));
            }
        }

        if self.transfer.retry_delay_secs == 0 {
            return Err(SyncError::Config("retry_delay_secs must be positive".to_string()));
        }
        if self.transfer.idle_refresh_secs == 0 {
            return Err(SyncError::Config("idle_refresh_secs must be positive".to_string()));
        }

        Ok(())
    }
}

/// Parse `host`, `host:port` or `[v6addr]:port`
pub fn parse_endpoint(server: &str) -> Result<Endpoint> {
    let server = server.trim();
    if server.is_empty() {
        return Err(SyncError::Config("Empty server address".to_string()));
    }

    let (host, port) = if let Some(rest) = server.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| SyncError::Config(format!("Unterminated IPv6 address '{}'", server)))?;
        let port = match after.strip_prefix(':') {
            Some(port) => parse_port(server, port)?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return Err(SyncError::Config(format!("Invalid server address '{}'", server))),
        };
        (host, port)
    } else {
        match server.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(server, port)?),
            None => (server, DEFAULT_PORT),
        }
    };

    if host.is_empty() {
        return Err(SyncError::Config(format!("Missing host in '{}'", server)));
    }

    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}

fn parse_port(server: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| SyncError::Config(format!("Invalid port in '{}'", server)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_config() -> Config {
        Config {
            source: AccountConfig::new("imap.old.example", "alice", "pw1"),
            destination: AccountConfig::new("imap.new.example:1993", "alice", "pw2"),
            transfer: TransferConfig::default(),
            tls: TlsSettings::default(),
        }
    }

    #[test]
    fn test_endpoint_default_port() {
        let endpoint = parse_endpoint("imap.example.com").unwrap();
        assert_eq!(endpoint.host, "imap.example.com");
        assert_eq!(endpoint.port, 993);
    }

    #[test]
    fn test_endpoint_explicit_port() {
        let endpoint = parse_endpoint("imap.example.com:1993").unwrap();
        assert_eq!(endpoint.host, "imap.example.com");
        assert_eq!(endpoint.port, 1993);
    }

    #[test]
    fn test_endpoint_ipv6() {
        let endpoint = parse_endpoint("[::1]:2993").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 2993);

        let endpoint = parse_endpoint("[::1]").unwrap();
        assert_eq!(endpoint.port, 993);
    }

    #[test]
    fn test_endpoint_invalid() {
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint("imap.example.com:imaps").is_err());
        assert!(parse_endpoint("imap.example.com:0").is_err());
        assert!(parse_endpoint(":993").is_err());
        assert!(parse_endpoint("[::1").is_err());
    }

    #[test]
    fn test_mailbox_defaults() {
        let mut config = sample_config();
        assert_eq!(config.source_mailbox(), "INBOX");
        assert_eq!(config.destination_mailbox(), "INBOX");

        config.source.mailbox = Some("Archive".to_string());
        assert_eq!(config.destination_mailbox(), "Archive");

        config.destination.mailbox = Some("Imported".to_string());
        assert_eq!(config.source_mailbox(), "Archive");
        assert_eq!(config.destination_mailbox(), "Imported");
    }

    #[test]
    fn test_default_transfer_settings() {
        let transfer = TransferConfig::default();
        assert!(!transfer.once);
        assert!(!transfer.copy);
        assert_eq!(transfer.retry_delay(), Duration::from_secs(60));
        assert_eq!(transfer.idle_refresh(), Duration::from_secs(1740));
    }

    #[test]
    fn test_validate() {
        assert!(sample_config().validate().is_ok());

        let mut config = sample_config();
        config.destination.username.clear();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.transfer.retry_delay_secs = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.source.mailbox = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[source]
server = "imap.old.example"
username = "alice"
password = "pw1"
mailbox = "Archive"

[destination]
server = "imap.new.example:1993"
username = "alice@new.example"
password = "pw2"

[transfer]
copy = true
retry_delay_secs = 5
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.transfer.copy);
        assert!(!config.transfer.once);
        assert_eq!(config.transfer.retry_delay_secs, 5);
        assert_eq!(config.transfer.idle_refresh_secs, DEFAULT_IDLE_REFRESH_SECS);
        assert_eq!(config.destination_mailbox(), "Archive");
        assert_eq!(config.destination.endpoint().unwrap().port, 1993);
        assert!(!config.tls.insecure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::from_file("/nonexistent/mvimap.toml");
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
