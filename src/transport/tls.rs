//! # TLS Termination
//!
//! Server-side TLS for accepted connections.
//!
//! The chat protocol runs its own session encryption above the transport;
//! TLS here is the optional outer layer for untrusted networks. The
//! configured minimum protocol version is enforced when the rustls config
//! is built, so connections below it never complete the transport
//! handshake.
//!
//! ## Responsibilities
//! - Load certificate chain and private key from PEM files
//! - Build a rustls server config restricted to the configured versions
//! - Generate a self-signed certificate for development/testing

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;

use rustls::version::{TLS12, TLS13};
use rustls::{Certificate, PrivateKey, SupportedProtocolVersion};
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::config::TlsConfig;
use crate::error::{ChatError, Result};

/// Build the rustls server configuration from the TLS section.
pub fn load_server_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    let cert_path = tls
        .cert
        .as_ref()
        .ok_or_else(|| ChatError::ConfigInvalid("tls.cert is required".into()))?;
    let key_path = tls
        .key
        .as_ref()
        .ok_or_else(|| ChatError::ConfigInvalid("tls.key is required".into()))?;

    // Load certificate chain
    let cert_file = File::open(cert_path)
        .map_err(|e| ChatError::ConfigInvalid(format!("failed to open cert file: {e}")))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| ChatError::ConfigInvalid("failed to parse certificate".into()))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(ChatError::ConfigInvalid("no certificates found".into()));
    }

    // Load private key
    let key_file = File::open(key_path)
        .map_err(|e| ChatError::ConfigInvalid(format!("failed to open key file: {e}")))?;
    let mut key_reader = BufReader::new(key_file);
    let keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|_| ChatError::ConfigInvalid("failed to parse private key".into()))?;
    let private_key = keys
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ChatError::ConfigInvalid("no private keys found".into()))?;

    let versions = protocol_versions(&tls.min_version)?;

    let config = rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(versions)
        .map_err(|e| ChatError::ConfigInvalid(format!("TLS version selection failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| ChatError::ConfigInvalid(format!("TLS configuration failed: {e}")))?;

    Ok(config)
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];
static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];

/// Map the configured minimum version onto rustls version slices.
fn protocol_versions(min_version: &str) -> Result<&'static [&'static SupportedProtocolVersion]> {
    match min_version {
        "1.3" => Ok(TLS13_ONLY),
        "1.2" => Ok(TLS12_AND_UP),
        other => Err(ChatError::ConfigInvalid(format!(
            "unsupported tls.min_version '{other}'"
        ))),
    }
}

/// Generate a self-signed certificate for development/testing purposes.
pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<()> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| io::Error::other(format!("certificate generation error: {e}")))?;

    let mut cert_file = File::create(&cert_path)?;
    cert_file.write_all(cert.cert.pem().as_bytes())?;

    let mut key_file = File::create(&key_path)?;
    key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

    Ok(())
}
