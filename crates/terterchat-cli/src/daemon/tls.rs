//! Client TLS configuration for the secure channel.
//!
//! The handshake is pinned: TLS 1.2 and 1.3 only, one AEAD suite per version,
//! server certificate checked against a single trusted root, and a client
//! certificate always presented.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use crate::daemon::paths;

/// Locations of the PEM files used for the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsFiles {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca: dir.join(paths::CA_FILE_NAME),
            cert: dir.join(paths::CERT_FILE_NAME),
            key: dir.join(paths::KEY_FILE_NAME),
        }
    }
}

impl Default for TlsFiles {
    fn default() -> Self {
        Self::in_dir(&paths::get_cert_dir())
    }
}

/// Crypto provider restricted to the suites the server accepts.
fn pinned_provider() -> CryptoProvider {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![
        ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ];
    provider
}

/// Build the client configuration from the files on disk.
pub fn client_config(files: &TlsFiles) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&files.ca)? {
        roots
            .add(cert)
            .with_context(|| format!("Invalid CA certificate in {:?}", files.ca))?;
    }

    let chain = load_certs(&files.cert)?;
    let key = load_key(&files.key)?;

    let config = ClientConfig::builder_with_provider(Arc::new(pinned_provider()))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .context("Pinned TLS versions not supported by provider")?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .context("Client certificate and key do not match")?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse PEM certificates in {:?}", path))?;

    if certs.is_empty() {
        bail!("No certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}
