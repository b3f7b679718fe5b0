//! TLS context: certificate loading and per-connection session setup.
//!
//! A certificate directory holds the two files Let's Encrypt produces,
//! `fullchain.pem` and `privkey.pem`.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("no certificates in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),
    #[error("rejected certificate/key pair: {0}")]
    BadKeyPair(#[from] rustls::Error),
}

/// Server-side TLS configuration, shared by all connections.
#[derive(Clone, Debug)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Load `fullchain.pem` and `privkey.pem` from `dir` and build a server
    /// configuration with no client authentication.
    pub fn from_cert_dir(dir: &Path) -> Result<Self, TlsError> {
        let cert_path = dir.join("fullchain.pem");
        let key_path = dir.join("privkey.pem");

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(&cert_path)?)
            .collect::<Result<_, _>>()
            .map_err(|source| TlsError::Read {
                path: cert_path.clone(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(cert_path));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(&key_path)?)
            .map_err(|source| TlsError::Read {
                path: key_path.clone(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.clone()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn new_session(&self) -> Result<ServerConnection, rustls::Error> {
        ServerConnection::new(self.config.clone())
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_reports_the_path() {
        let err = TlsContext::from_cert_dir(Path::new("/nonexistent/certs")).unwrap_err();
        match err {
            TlsError::Read { path, .. } => {
                assert!(path.ends_with("fullchain.pem"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_cert_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fullchain.pem"), "").unwrap();
        std::fs::write(dir.path().join("privkey.pem"), "").unwrap();

        assert!(matches!(
            TlsContext::from_cert_dir(dir.path()),
            Err(TlsError::NoCertificates(_))
        ));
    }
}
