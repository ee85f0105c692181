//! Self-signed CA and leaf certificate generation.
//!
//! `krelay` never terminates TLS for upstream traffic, but the TLS error
//! path (§4.4) needs *something* to present during the handshake before it
//! can write the HTTP-shaped diagnostic body. We generate one process-local
//! CA at start-up and mint short-lived leaf certificates for whatever SNI
//! the client asked for, entirely offline.

use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
    #[error("invalid SNI name for certificate: {0}")]
    InvalidName(String),
}

/// A certificate and the private key matching it, ready to hand to
/// `rustls::ServerConfig::with_single_cert`.
pub struct IssuedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// A process-local certificate authority used only to sign leaf certs for
/// the TLS error page. Never persisted; regenerated every process start.
pub struct LocalCa {
    cert: rcgen::Certificate,
    key_pair: KeyPair,
}

impl LocalCa {
    pub fn generate() -> Result<Self, SelfSignedError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "krelay local CA");
        dn.push(DnType::OrganizationName, "krelay");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, Duration::from_secs(365 * 24 * 60 * 60))?;

        let key_pair =
            KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

        Ok(Self { cert, key_pair })
    }

    /// Mints a short-lived leaf certificate for `hostname`, signed by this
    /// CA.
    pub fn issue_leaf(&self, hostname: &str) -> Result<IssuedCertificate, SelfSignedError> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| SelfSignedError::InvalidName(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, Duration::from_secs(24 * 60 * 60))?;
        if let Ok(ia5) = rcgen::Ia5String::try_from(hostname.to_string()) {
            params.subject_alt_names = vec![SanType::DnsName(ia5)];
        }

        let leaf_key =
            KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.cert, &self.key_pair)
            .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

        let key_der = leaf_key.serialize_der();
        Ok(IssuedCertificate {
            cert_der: CertificateDer::from(leaf_cert.der().to_vec()),
            key_der: PrivateKeyDer::try_from(key_der)
                .map_err(|e| SelfSignedError::KeyGenerationFailed(format!("{e:?}")))?,
        })
    }
}

fn set_validity(
    params: &mut CertificateParams,
    ttl: Duration,
) -> Result<(), SelfSignedError> {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    let not_after = now + ttl;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_issues_leaf_for_hostname() {
        let ca = LocalCa::generate().unwrap();
        let leaf = ca.issue_leaf("argocd.local").unwrap();
        assert!(!leaf.cert_der.is_empty());
    }

    #[test]
    fn leaf_certs_can_build_a_rustls_server_config() {
        let ca = LocalCa::generate().unwrap();
        let leaf = ca.issue_leaf("echo.local").unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.cert_der], leaf.key_der);
        assert!(config.is_ok());
    }

    #[test]
    fn distinct_hostnames_yield_distinct_certs() {
        let ca = LocalCa::generate().unwrap();
        let a = ca.issue_leaf("a.local").unwrap();
        let b = ca.issue_leaf("b.local").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }
}
