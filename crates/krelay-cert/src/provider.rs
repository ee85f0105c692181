//! `ErrorCertProvider`: LRU-cached leaf certificates for the TLS error page
//! (spec §4.4). One process-local CA is generated once (`LocalCa::generate`,
//! lazily on first use) and reused to sign every leaf.
//!
//! The cache has a fixed capacity of 1000 entries and no TTL: an open
//! question in the spec (§9) that we resolve here as eviction-by-recency
//! only (see `DESIGN.md`).

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::self_signed::{IssuedCertificate, LocalCa, SelfSignedError};

const DEFAULT_CAPACITY: usize = 1000;

/// Clonable snapshot of an issued certificate; `rustls::pki_types` DER types
/// are cheap `Arc`-free byte buffers so cloning just copies the `Vec`.
#[derive(Clone)]
pub struct CachedCertificate {
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    pub key_der_bytes: Vec<u8>,
    pub key_kind: PrivateKeyKind,
}

#[derive(Clone, Copy)]
pub enum PrivateKeyKind {
    Pkcs8,
}

impl CachedCertificate {
    pub fn private_key(&self) -> rustls::pki_types::PrivateKeyDer<'static> {
        match self.key_kind {
            PrivateKeyKind::Pkcs8 => rustls::pki_types::PrivateKeyDer::Pkcs8(
                rustls::pki_types::PrivatePkcs8KeyDer::from(self.key_der_bytes.clone()),
            ),
        }
    }
}

pub struct ErrorCertProvider {
    ca: Mutex<Option<LocalCa>>,
    cache: Mutex<LruCache<String, CachedCertificate>>,
}

impl ErrorCertProvider {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            ca: Mutex::new(None),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns a leaf certificate for `hostname`, minting and caching a new
    /// one on a cache miss.
    pub fn certificate_for(&self, hostname: &str) -> Result<CachedCertificate, SelfSignedError> {
        if let Some(cached) = self.cache.lock().unwrap().get(hostname) {
            return Ok(cached.clone());
        }

        let issued = self.issue(hostname)?;
        let cached = CachedCertificate {
            cert_der: issued.cert_der,
            key_der_bytes: match issued.key_der {
                rustls::pki_types::PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der().to_vec(),
                other => other.secret_der().to_vec(),
            },
            key_kind: PrivateKeyKind::Pkcs8,
        };

        self.cache
            .lock()
            .unwrap()
            .put(hostname.to_string(), cached.clone());
        Ok(cached)
    }

    fn issue(&self, hostname: &str) -> Result<IssuedCertificate, SelfSignedError> {
        let mut guard = self.ca.lock().unwrap();
        if guard.is_none() {
            *guard = Some(LocalCa::generate()?);
        }
        guard.as_ref().unwrap().issue_leaf(hostname)
    }
}

impl Default for ErrorCertProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_repeat_lookups_for_the_same_hostname() {
        let provider = ErrorCertProvider::new();
        let first = provider.certificate_for("app.local").unwrap();
        let second = provider.certificate_for("app.local").unwrap();
        assert_eq!(first.cert_der, second.cert_der);
    }

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let provider = ErrorCertProvider::with_capacity(2);
        provider.certificate_for("a.local").unwrap();
        provider.certificate_for("b.local").unwrap();
        provider.certificate_for("c.local").unwrap();

        // "a.local" should have been evicted; re-requesting mints a new
        // (different) cert rather than erroring.
        let a_again = provider.certificate_for("a.local").unwrap();
        assert!(!a_again.cert_der.is_empty());
    }

    #[test]
    fn distinct_hostnames_get_distinct_certs() {
        let provider = ErrorCertProvider::new();
        let a = provider.certificate_for("a.local").unwrap();
        let b = provider.certificate_for("b.local").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }
}
