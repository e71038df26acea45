//! rustls client configuration for production broker connections.
//!
//! [`TlsSettings`] carries the policy in OpenSSL notation: a minimum protocol
//! version and a cipher list such as `ECDHE+AESGCM:!ECDSA`. The list is read
//! the OpenSSL way: `:`-separated entries, `+` joins conditions that must all
//! hold, a leading `!` removes matching suites for good. Protocol versions are
//! the ones at or above the minimum that keep at least one suite.

use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use thiserror::Error;
use tracing::{debug, warn};

use edas_core::ErrorKind;

use crate::config::TlsSettings;

#[derive(Debug, Error)]
pub enum TlsPolicyError {
    #[error("unsupported minimum TLS version `{0}`")]
    UnsupportedVersion(String),

    #[error("unknown cipher condition `{0}`")]
    UnknownCipher(String),

    #[error("cipher policy `{0}` leaves no usable suite")]
    NoSuites(String),

    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsPolicyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Error
    }
}

/// Client config honouring `settings`, trusting the platform roots.
pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig, TlsPolicyError> {
    client_config_with_roots(settings, native_roots())
}

pub fn client_config_with_roots(
    settings: &TlsSettings,
    roots: RootCertStore,
) -> Result<ClientConfig, TlsPolicyError> {
    let (suites, versions) = negotiable(settings)?;
    debug!(
        suites = ?suites.iter().map(|s| s.suite()).collect::<Vec<_>>(),
        versions = ?versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        "tls policy applied"
    );

    let provider = CryptoProvider {
        cipher_suites: suites,
        ..ring::default_provider()
    };
    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Suites and protocol versions the client may offer under `settings`.
fn negotiable(
    settings: &TlsSettings,
) -> Result<(Vec<SupportedCipherSuite>, Vec<&'static SupportedProtocolVersion>), TlsPolicyError> {
    let min = min_version(settings.min_version)?;
    let suites = select_suites(settings.ciphers, ring::default_provider().cipher_suites)?;

    let versions: Vec<&'static SupportedProtocolVersion> = [&rustls::version::TLS12, &rustls::version::TLS13]
        .into_iter()
        .filter(|version| u16::from(version.version) >= min)
        .filter(|version| suites.iter().any(|suite| suite.version().version == version.version))
        .collect();
    if versions.is_empty() {
        return Err(TlsPolicyError::NoSuites(settings.ciphers.to_string()));
    }
    Ok((suites, versions))
}

fn native_roots() -> RootCertStore {
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!(error = %err, "failed to load a platform certificate");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, ignored, "platform trust roots loaded");
    roots
}

/// Wire value of the minimum version (`0x0303` for TLS 1.2).
fn min_version(raw: &str) -> Result<u16, TlsPolicyError> {
    match raw.trim() {
        "1.2" => Ok(u16::from(rustls::ProtocolVersion::TLSv1_2)),
        "1.3" => Ok(u16::from(rustls::ProtocolVersion::TLSv1_3)),
        other => Err(TlsPolicyError::UnsupportedVersion(other.to_string())),
    }
}

fn select_suites(
    policy: &str,
    available: Vec<SupportedCipherSuite>,
) -> Result<Vec<SupportedCipherSuite>, TlsPolicyError> {
    let mut allowed: Vec<SupportedCipherSuite> = Vec::new();
    let mut banned: Vec<SupportedCipherSuite> = Vec::new();

    for entry in policy.split(':').map(str::trim).filter(|e| !e.is_empty()) {
        let (negated, conditions) = match entry.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, entry),
        };
        let conditions = conditions.split('+').collect::<Vec<_>>();
        for suite in &available {
            let mut matched = true;
            for condition in &conditions {
                matched &= suite_matches(*suite, condition)?;
            }
            if !matched {
                continue;
            }
            let target = if negated { &mut banned } else { &mut allowed };
            if !target.contains(suite) {
                target.push(*suite);
            }
        }
    }

    allowed.retain(|suite| !banned.contains(suite));
    if allowed.is_empty() {
        return Err(TlsPolicyError::NoSuites(policy.to_string()));
    }
    Ok(allowed)
}

fn suite_matches(suite: SupportedCipherSuite, condition: &str) -> Result<bool, TlsPolicyError> {
    // IANA names, e.g. TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256.
    let name = format!("{:?}", suite.suite());
    let matched = match condition {
        "ECDHE" | "EECDH" => name.starts_with("TLS_ECDHE_"),
        "ECDSA" | "aECDSA" => name.contains("_ECDSA_"),
        "RSA" | "aRSA" => name.contains("_RSA_"),
        "AESGCM" => name.contains("_AES_") && name.contains("_GCM_"),
        "AES128" => name.contains("_AES_128_"),
        "AES256" => name.contains("_AES_256_"),
        "CHACHA20" => name.contains("_CHACHA20_"),
        other => return Err(TlsPolicyError::UnknownCipher(other.to_string())),
    };
    Ok(matched)
}
