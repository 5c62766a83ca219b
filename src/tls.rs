//! TLS server configuration: load PEM certificate and key, build the acceptor
//! shared by StartTLS and the ldaps:// listener.

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(cert_file: &str, key_file: &str) -> Result<Arc<rustls::ServerConfig>> {
    let cert_pem = fs::read(cert_file).with_context(|| format!("Open cert file: {}", cert_file))?;
    let key_pem = fs::read(key_file).with_context(|| format!("Open key file: {}", key_file))?;
    load_server_config_from_pem(&cert_pem, &key_pem)
        .with_context(|| format!("Load TLS material from {} and {}", cert_file, key_file))
}

/// Build ServerConfig from PEM bytes.
pub fn load_server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<rustls::ServerConfig>> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_private_key(key_pem)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = certs(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates in PEM data");
    }
    Ok(certs)
}

// PKCS#8 first, then PKCS#1 RSA.
fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key in PEM data"))
}

/// Check that cert and key files exist.
pub fn validate_tls_files(cert_file: &str, key_file: &str) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    Ok(())
}

/// Acceptor for an enabled `tls` section.
pub fn acceptor_from_config(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let (cert_file, key_file) = match (tls.cert_file.as_deref(), tls.key_file.as_deref()) {
        (Some(cert), Some(key)) => (cert, key),
        _ => anyhow::bail!("TLS requires tls.cert_file and tls.key_file"),
    };
    validate_tls_files(cert_file, key_file)?;
    let server_config = load_server_config_from_files(cert_file, key_file)?;
    Ok(TlsAcceptor::from(server_config))
}
