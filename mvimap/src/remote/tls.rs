//! TLS for IMAP client connections
//!
//! Connections use implicit TLS (port 993 by default).
//!
//! # Trust
//! - Mozilla root store (webpki-roots)
//! - Optional extra anchors from a PEM file (`--ca-file`)
//! - `--insecure` accepts any certificate

use crate::config::TlsSettings;
use crate::error::{Result, SyncError};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// TLS configuration shared by every connection of a run
#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Build the client configuration described by `settings`
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        if settings.insecure {
            if settings.ca_file.is_some() {
                warn!("--ca-file is ignored when certificate verification is disabled");
            }
            return Ok(Self::insecure());
        }

        let mut root_store = RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        if let Some(ca_file) = &settings.ca_file {
            let added = load_ca_file(&mut root_store, ca_file)?;
            info!("Loaded {} extra trust anchor(s) from {:?}", added, ca_file);
        }

        // rustls 0.21 API
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }

    /// Configuration that skips certificate verification
    ///
    /// **WARNING**: the server identity is not checked.
    pub fn insecure() -> Self {
        warn!("TLS certificate verification is disabled");

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();

        Self {
            client_config: Arc::new(config),
        }
    }

    /// Get the rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Create a connector that upgrades a TcpStream to TLS
    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.client_config.clone())
    }
}

/// Add every certificate of a PEM file to `root_store`
fn load_ca_file(root_store: &mut RootCertStore, path: &Path) -> Result<usize> {
    let file = File::open(path)
        .map_err(|e| SyncError::Tls(format!("Failed to open CA file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let ders = certs(&mut reader)
        .map_err(|e| SyncError::Tls(format!("Failed to read certificates: {}", e)))?;

    if ders.is_empty() {
        return Err(SyncError::Tls(format!("No certificates found in {:?}", path)));
    }

    for der in &ders {
        root_store
            .add(&Certificate(der.clone()))
            .map_err(|e| SyncError::Tls(format!("Invalid CA certificate: {}", e)))?;
    }

    debug!("Loaded {} certificate(s)", ders.len());
    Ok(ders.len())
}

struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
