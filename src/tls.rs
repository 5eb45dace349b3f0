//! Listener TLS assembly.
//!
//! The listener terminates TLS when `tls` is configured. A CA bundle turns
//! on client-certificate verification unless `no_client_cert` opts back
//! out, which keeps mTLS deployments and plain-TLS deployments on the same
//! configuration surface.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::{ConfigError, TlsConfig};

fn tls_err(reason: impl Into<String>) -> ConfigError {
    ConfigError::Tls {
        reason: reason.into(),
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_err(format!("opening {path}: {e}")))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| tls_err(format!("reading certificates from {path}: {e}")))?;
    if certs.is_empty() {
        return Err(tls_err(format!("{path} contains no certificates")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_err(format!("opening {path}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_err(format!("reading private key from {path}: {e}")))?
        .ok_or_else(|| tls_err(format!("{path} contains no private key")))
}

/// Build the TLS acceptor for the listening socket.
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_key(&config.key_file)?;

    let builder = ServerConfig::builder();
    let server_config = match &config.ca_file {
        Some(ca_file) if !config.no_client_cert => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_err(format!("adding CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| tls_err(format!("building client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        _ => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| tls_err(format!("assembling server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_cert_file_fails() {
        let config = TlsConfig {
            cert_file: "/nonexistent/server.pem".to_string(),
            key_file: "/nonexistent/server-key.pem".to_string(),
            ca_file: None,
            no_client_cert: false,
        };
        assert!(matches!(build_acceptor(&config), Err(ConfigError::Tls { .. })));
    }

    #[test]
    fn test_garbage_cert_file_fails() {
        let mut cert = NamedTempFile::new().unwrap();
        write!(cert, "not a pem file").unwrap();
        let mut key = NamedTempFile::new().unwrap();
        write!(key, "also not a pem file").unwrap();

        let config = TlsConfig {
            cert_file: cert.path().to_str().unwrap().to_string(),
            key_file: key.path().to_str().unwrap().to_string(),
            ca_file: None,
            no_client_cert: false,
        };
        assert!(matches!(build_acceptor(&config), Err(ConfigError::Tls { .. })));
    }
}
