//! Certificate Authority Module
//!
//! Holds the root certificate and private key of the service and issues leaf
//! certificates on request.
//!
//! # Issuance
//! ```text
//! issue(name)
//!   ├── generate RSA key pair       (parallel across callers)
//!   └── lock signing mutex
//!         └── build + sign leaf     (serialized)
//! ```
//!
//! Every call produces a fresh key pair and serial number; nothing is cached per name.

use crate::certificate::{Certificate, PendingCertificate, MAX_KEY_SIZE, MIN_KEY_SIZE};
use crate::error::{CertificateManagerError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

pub struct CertificateAuthority {
    root: Certificate,
    key_size: u32,
    validity_days: u32,
    signing_lock: Mutex<()>,
    issued_total: AtomicU64,
}

impl CertificateAuthority {
    /// # Arguments
    /// * `root` - Self-signed root certificate holding its private key
    /// * `key_size` - RSA key size in bits for issued certificates
    /// * `validity_days` - Lifetime of issued certificates
    pub fn new(root: Certificate, key_size: u32, validity_days: u32) -> Result<Self> {
        if !root.has_private_key() {
            return Err(CertificateManagerError::Configuration(format!(
                "Root certificate '{}' has no private key",
                root.subject_name()
            )));
        }
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&key_size) {
            return Err(CertificateManagerError::Configuration(format!(
                "Issued key size {} is outside {}..={}",
                key_size, MIN_KEY_SIZE, MAX_KEY_SIZE
            )));
        }
        if validity_days == 0 {
            return Err(CertificateManagerError::Configuration(
                "Issued certificate validity must be at least one day".to_string(),
            ));
        }
        Ok(Self {
            root,
            key_size,
            validity_days,
            signing_lock: Mutex::new(()),
            issued_total: AtomicU64::new(0),
        })
    }

    /// Load the root key pair from disk, or create and persist one when neither file
    /// exists yet.
    ///
    /// The same `key_size` and `valid_days` apply to the root when it is created and
    /// to every certificate issued afterwards.
    ///
    /// # Errors
    /// * `Configuration` if exactly one of the two files exists, or the existing
    ///   files do not form a matching pair
    pub fn load_or_create(
        private_key_path: impl AsRef<Path>,
        certificate_path: impl AsRef<Path>,
        key_size: u32,
        name: &str,
        valid_days: u32,
    ) -> Result<Self> {
        let private_key_path = private_key_path.as_ref();
        let certificate_path = certificate_path.as_ref();

        let root = match (private_key_path.exists(), certificate_path.exists()) {
            (false, false) => {
                info!(name, key_size, valid_days, "creating CA certificate");
                let root = Certificate::create_self_signed(key_size, name, valid_days)?;
                root.save_to_file(private_key_path, certificate_path)?;
                info!(
                    certificate = %certificate_path.display(),
                    "created CA certificate"
                );
                root
            }
            (true, true) => {
                let root = Certificate::load_from_file(private_key_path, certificate_path)?;
                info!(
                    subject = root.subject_name(),
                    certificate = %certificate_path.display(),
                    "found CA certificate"
                );
                root
            }
            (key_exists, _) => {
                let (present, missing) = if key_exists {
                    (private_key_path, certificate_path)
                } else {
                    (certificate_path, private_key_path)
                };
                return Err(CertificateManagerError::Configuration(format!(
                    "Found {} but {} is missing; the private key and certificate must both \
                     exist or both be absent",
                    present.display(),
                    missing.display()
                )));
            }
        };

        if !root.is_self_signed()? {
            return Err(CertificateManagerError::Configuration(format!(
                "CA certificate '{}' is not self-signed",
                root.subject_name()
            )));
        }
        Self::new(root, key_size, valid_days)
    }

    /// Generate a key pair for `name` and sign a certificate for it with the root.
    ///
    /// Safe to call from many threads at once. Only the signing step is serialized.
    pub fn issue(&self, name: &str) -> Result<Certificate> {
        let pending = PendingCertificate::generate(self.key_size, name, self.validity_days)?;

        let certificate = {
            let _guard = self.signing_lock.lock().map_err(|_| {
                CertificateManagerError::Signing("Signing lock poisoned".to_string())
            })?;
            pending.sign_with(&self.root)?
        };

        let issued_total = self.issued_total.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            name,
            serial = %certificate.serial_number_hex().unwrap_or_default(),
            issued_total,
            "issued certificate"
        );
        Ok(certificate)
    }

    /// The root certificate. Callers must not send its private key anywhere; use
    /// [`Certificate::certificate_pem`] for the public part.
    pub fn root_certificate(&self) -> &Certificate {
        &self.root
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn validity_days(&self) -> u32 {
        self.validity_days
    }

    /// Number of certificates issued since this authority was created.
    pub fn issued_total(&self) -> u64 {
        self.issued_total.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root", &self.root.subject_name())
            .field("key_size", &self.key_size)
            .field("validity_days", &self.validity_days)
            .field("issued_total", &self.issued_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn authority() -> CertificateAuthority {
        let root = Certificate::create_self_signed(2048, "Authority Test Root", 30).unwrap();
        CertificateAuthority::new(root, 2048, 7).unwrap()
    }

    #[test]
    fn test_root_without_key_rejected() {
        let root = Certificate::create_self_signed(2048, "Keyless Root", 1).unwrap();
        let public_only = Certificate::from_x509(root.x509().clone());
        assert!(matches!(
            CertificateAuthority::new(public_only, 2048, 1),
            Err(CertificateManagerError::Configuration(_))
        ));
        assert!(CertificateAuthority::new(root.clone(), 512, 1).is_err());
        assert!(CertificateAuthority::new(root, 2048, 0).is_err());
    }

    #[test]
    fn test_issue_chains_to_root() {
        let ca = authority();
        let leaf = ca.issue("svc-a").unwrap();

        assert_eq!(leaf.subject_name(), "svc-a");
        assert_eq!(leaf.issuer_name(), "Authority Test Root");
        assert!(leaf.has_private_key());
        assert!(leaf.verify_signed_by(ca.root_certificate()).unwrap());
        assert_eq!(ca.issued_total(), 1);
    }

    #[test]
    fn test_issue_is_not_memoized() {
        let ca = authority();
        let first = ca.issue("svc-a").unwrap();
        let second = ca.issue("svc-a").unwrap();

        assert_ne!(first.public_key_der().unwrap(), second.public_key_der().unwrap());
        assert_ne!(first.signature_bytes(), second.signature_bytes());
        assert_eq!(ca.issued_total(), 2);
    }

    #[test]
    fn test_issue_rejects_empty_name() {
        let ca = authority();
        assert!(matches!(ca.issue(""), Err(CertificateManagerError::Signing(_))));
        assert_eq!(ca.issued_total(), 0);
    }

    #[test]
    fn test_concurrent_issuance() {
        let ca = Arc::new(authority());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ca = Arc::clone(&ca);
                thread::spawn(move || ca.issue(&format!("worker-{}", i)).unwrap())
            })
            .collect();

        let mut serials = HashSet::new();
        for handle in handles {
            let leaf = handle.join().unwrap();
            assert!(leaf.verify_signed_by(ca.root_certificate()).unwrap());
            serials.insert(leaf.serial_number_hex().unwrap());
        }
        assert_eq!(serials.len(), 8);
        assert_eq!(ca.issued_total(), 8);
    }

    #[test]
    fn test_load_or_create_creates_then_loads() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.pem");

        let created =
            CertificateAuthority::load_or_create(&key_path, &cert_path, 2048, "Bootstrap Root", 30)
                .unwrap();
        assert!(key_path.exists() && cert_path.exists());

        let loaded =
            CertificateAuthority::load_or_create(&key_path, &cert_path, 2048, "Ignored", 30)
                .unwrap();
        assert_eq!(loaded.root_certificate().subject_name(), "Bootstrap Root");
        assert_eq!(
            loaded.root_certificate().fingerprint_sha256().unwrap(),
            created.root_certificate().fingerprint_sha256().unwrap()
        );
    }

    #[test]
    fn test_load_or_create_rejects_half_present_pair() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.pem");
        std::fs::write(&cert_path, b"placeholder").unwrap();

        let result =
            CertificateAuthority::load_or_create(&key_path, &cert_path, 2048, "Half Root", 30);
        assert!(matches!(result, Err(CertificateManagerError::Configuration(_))));
        assert!(!key_path.exists());
    }

    #[test]
    fn test_load_or_create_rejects_leaf_as_root() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.pem");
        let leaf = authority().issue("not-a-root").unwrap();
        leaf.save_to_file(&key_path, &cert_path).unwrap();

        let result = CertificateAuthority::load_or_create(&key_path, &cert_path, 2048, "x", 30);
        assert!(matches!(result, Err(CertificateManagerError::Configuration(_))));
    }
}
