//! X.509 Certificate Module
//!
//! A [`Certificate`] bundles a signed X.509v3 certificate with its private key when
//! the holder owns one. Two kinds are produced here:
//!
//! ```text
//! Root CA (self-signed, CA=true, pathlen=0)
//!   └── Leaf identity (signed by Root, CA=false, serverAuth + clientAuth)
//! ```
//!
//! # Certificate Properties
//! - **Key Type**: RSA, size chosen by the caller (1024..=16384 bits)
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Serial Number**: Random 128-bit number
//! - **Subject**: `CN=<name>`; leaves also carry the name as a DNS or IP
//!   Subject Alternative Name so they can be used directly as TLS identities
//!
//! # Files
//! Certificates are stored as PEM. The private key is written in PKCS#8 PEM with
//! owner-only permissions. Both files are staged next to their targets and moved
//! into place only after both have been written.
//!
//! # Example
//! ```rust,no_run
//! use certificate_manager::certificate::Certificate;
//! # fn example() -> certificate_manager::error::Result<()> {
//! let root = Certificate::create_self_signed(4096, "Example Root CA", 3650)?;
//! let leaf = Certificate::create_signed(&root, "svc-a.internal", 365)?;
//! assert!(leaf.verify_signed_by(&root)?);
//! leaf.save_to_file("svc-a.key", "svc-a.pem")?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CertificateManagerError, Result};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509NameRef, X509};
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use tempfile::NamedTempFile;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const ROOT_CA_PATH_LENGTH: u32 = 0;
const SERIAL_NUMBER_BITS: i32 = 128;

pub const MIN_KEY_SIZE: u32 = 1024;
pub const MAX_KEY_SIZE: u32 = 16384;

/// A signed X.509 certificate, optionally paired with its private key.
#[derive(Clone)]
pub struct Certificate {
    certificate: X509,
    private_key: Option<PKey<Private>>,
    subject_name: String,
    issuer_name: String,
}

impl Certificate {
    /// Generate a new RSA key pair and a self-signed CA certificate for `name`.
    ///
    /// # Errors
    /// * `KeyGeneration` if `key_size` is outside `MIN_KEY_SIZE..=MAX_KEY_SIZE` or
    ///   the RSA primitive fails
    /// * `Signing` if the name is empty or certificate construction fails
    pub fn create_self_signed(key_size: u32, name: &str, valid_days: u32) -> Result<Self> {
        PendingCertificate::generate(key_size, name, valid_days)?.sign_self()
    }

    /// Generate a fresh key pair for `name` and sign it with `issuer`'s private key.
    ///
    /// The new key has the same size as the issuer's key.
    ///
    /// # Errors
    /// * `Signing` if `issuer` has no private key, or signing fails
    /// * `KeyGeneration` if the key pair cannot be generated
    pub fn create_signed(issuer: &Certificate, name: &str, valid_days: u32) -> Result<Self> {
        let issuer_key = issuer.signing_key()?;
        PendingCertificate::generate(issuer_key.bits(), name, valid_days)?.sign_with(issuer)
    }

    /// Wrap a certificate received from a peer. It carries no private key.
    pub fn from_x509(certificate: X509) -> Self {
        let subject_name = common_name(certificate.subject_name());
        let issuer_name = common_name(certificate.issuer_name());
        Self {
            certificate,
            private_key: None,
            subject_name,
            issuer_name,
        }
    }

    /// Decode PEM material received over the wire.
    ///
    /// When a private key is supplied it must match the certificate's public key.
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: Option<&[u8]>) -> Result<Self> {
        Self::parse_pem(certificate_pem, private_key_pem).map_err(CertificateManagerError::Protocol)
    }

    fn parse_pem(
        certificate_pem: &[u8],
        private_key_pem: Option<&[u8]>,
    ) -> std::result::Result<Self, String> {
        let certificate = X509::from_pem(certificate_pem)
            .map_err(|e| format!("Failed to parse certificate PEM: {}", e))?;
        let private_key = match private_key_pem {
            Some(pem) => {
                let key = PKey::private_key_from_pem(pem)
                    .map_err(|e| format!("Failed to parse private key PEM: {}", e))?;
                let public_key = certificate
                    .public_key()
                    .map_err(|e| format!("Failed to read certificate public key: {}", e))?;
                if !public_key.public_eq(&key) {
                    return Err("Private key does not match certificate public key".to_string());
                }
                Some(key)
            }
            None => None,
        };
        let mut parsed = Self::from_x509(certificate);
        parsed.private_key = private_key;
        Ok(parsed)
    }

    /// Write the private key and certificate as PEM files.
    ///
    /// Both files are fully written to temporary files in their target directories
    /// before either is moved into place.
    pub fn save_to_file(
        &self,
        private_key_path: impl AsRef<Path>,
        certificate_path: impl AsRef<Path>,
    ) -> Result<()> {
        let private_key_path = private_key_path.as_ref();
        let certificate_path = certificate_path.as_ref();
        let key_pem = self.private_key_pem()?.ok_or_else(|| {
            CertificateManagerError::Configuration(format!(
                "Certificate '{}' has no private key to save",
                self.subject_name
            ))
        })?;
        let certificate_pem = self.certificate_pem()?;

        let staged_key = stage_file(private_key_path, &key_pem)?;
        let staged_certificate = stage_file(certificate_path, &certificate_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged_certificate.path(), fs::Permissions::from_mode(0o644))?;
        }

        staged_key.persist(private_key_path).map_err(|e| e.error)?;
        if let Err(e) = staged_certificate.persist(certificate_path) {
            tracing::error!(
                private_key_path = %private_key_path.display(),
                certificate_path = %certificate_path.display(),
                error = %e.error,
                "private key written but certificate could not be moved into place"
            );
            return Err(e.error.into());
        }
        Ok(())
    }

    /// Write only the public certificate as a PEM file.
    pub fn save_certificate_to_file(&self, certificate_path: impl AsRef<Path>) -> Result<()> {
        let certificate_path = certificate_path.as_ref();
        let staged = stage_file(certificate_path, &self.certificate_pem()?)?;
        staged.persist(certificate_path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read a private key file and a certificate file written by [`save_to_file`].
    ///
    /// [`save_to_file`]: Certificate::save_to_file
    pub fn load_from_file(
        private_key_path: impl AsRef<Path>,
        certificate_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let key_pem = fs::read(private_key_path.as_ref())?;
        let certificate_pem = fs::read(certificate_path.as_ref())?;
        Self::parse_pem(&certificate_pem, Some(&key_pem)).map_err(|e| {
            CertificateManagerError::Configuration(format!(
                "{} ({} / {})",
                e,
                private_key_path.as_ref().display(),
                certificate_path.as_ref().display()
            ))
        })
    }

    /// Read a public certificate file, such as a fetched root certificate.
    pub fn load_certificate_file(certificate_path: impl AsRef<Path>) -> Result<Self> {
        let certificate_pem = fs::read(certificate_path.as_ref())?;
        Self::parse_pem(&certificate_pem, None).map_err(|e| {
            CertificateManagerError::Configuration(format!(
                "{} ({})",
                e,
                certificate_path.as_ref().display()
            ))
        })
    }

    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    pub fn valid_from(&self) -> &Asn1TimeRef {
        self.certificate.not_before()
    }

    pub fn valid_until(&self) -> &Asn1TimeRef {
        self.certificate.not_after()
    }

    pub fn serial_number_hex(&self) -> Result<String> {
        let serial = self
            .certificate
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
            .map_err(|e| CertificateManagerError::protocol("Failed to read serial number", e))?;
        Ok(serial)
    }

    pub fn x509(&self) -> &X509 {
        &self.certificate
    }

    pub fn public_key(&self) -> Result<PKey<Public>> {
        self.certificate
            .public_key()
            .map_err(|e| CertificateManagerError::protocol("Failed to read public key", e))
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.public_key()?
            .public_key_to_der()
            .map_err(|e| CertificateManagerError::protocol("Failed to encode public key", e))
    }

    /// The signature bytes of the signed certificate.
    pub fn signature_bytes(&self) -> &[u8] {
        self.certificate.signature().as_slice()
    }

    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        self.certificate
            .to_pem()
            .map_err(|e| CertificateManagerError::protocol("Failed to encode certificate PEM", e))
    }

    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        self.certificate
            .to_der()
            .map_err(|e| CertificateManagerError::protocol("Failed to encode certificate DER", e))
    }

    pub fn private_key(&self) -> Option<&PKey<Private>> {
        self.private_key.as_ref()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// PKCS#8 PEM encoding of the private key, if this certificate holds one.
    pub fn private_key_pem(&self) -> Result<Option<Vec<u8>>> {
        self.private_key
            .as_ref()
            .map(|key| {
                key.private_key_to_pem_pkcs8().map_err(|e| {
                    CertificateManagerError::protocol("Failed to encode private key PEM", e)
                })
            })
            .transpose()
    }

    /// SHA-256 digest of the DER certificate.
    pub fn fingerprint_sha256(&self) -> Result<Vec<u8>> {
        self.certificate
            .digest(MessageDigest::sha256())
            .map(|digest| digest.to_vec())
            .map_err(|e| CertificateManagerError::protocol("Failed to digest certificate", e))
    }

    /// True when issuer equals subject and the signature verifies with the
    /// certificate's own public key.
    pub fn is_self_signed(&self) -> Result<bool> {
        self.verify_signed_by(self)
    }

    /// True when this certificate names `issuer` as its issuer and its signature
    /// verifies against `issuer`'s public key.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<bool> {
        let issuer_subject = name_der(issuer.certificate.subject_name())?;
        let own_issuer = name_der(self.certificate.issuer_name())?;
        if issuer_subject != own_issuer {
            return Ok(false);
        }
        let issuer_key = issuer.public_key()?;
        self.certificate
            .verify(&issuer_key)
            .map_err(|e| CertificateManagerError::protocol("Failed to verify signature", e))
    }

    fn signing_key(&self) -> Result<&PKey<Private>> {
        self.private_key.as_ref().ok_or_else(|| {
            CertificateManagerError::Signing(format!(
                "Issuer '{}' holds no private key",
                self.subject_name
            ))
        })
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject_name", &self.subject_name)
            .field("issuer_name", &self.issuer_name)
            .field("valid_from", &self.certificate.not_before().to_string())
            .field("valid_until", &self.certificate.not_after().to_string())
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// A key pair generated for `name` that has not been signed yet.
///
/// Key generation dominates the cost of issuance, so it is kept separate from the
/// signing step, which callers may serialize.
pub(crate) struct PendingCertificate {
    name: String,
    valid_days: u32,
    private_key: PKey<Private>,
}

impl PendingCertificate {
    pub(crate) fn generate(key_size: u32, name: &str, valid_days: u32) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(CertificateManagerError::Signing(
                "Certificate name must not be empty".to_string(),
            ));
        }
        if valid_days == 0 {
            return Err(CertificateManagerError::Signing(
                "Certificate validity must be at least one day".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            valid_days,
            private_key: generate_private_key(key_size)?,
        })
    }

    pub(crate) fn sign_self(self) -> Result<Certificate> {
        let subject = build_name(&self.name)?;
        let mut builder = self.base_builder(&subject, &subject)?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca().pathlen(ROOT_CA_PATH_LENGTH);
        let bc = bc
            .build()
            .map_err(|e| CertificateManagerError::signing("Failed to build BasicConstraints", e))?;
        builder
            .append_extension(bc)
            .map_err(|e| CertificateManagerError::signing("Failed to add BasicConstraints", e))?;

        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()
            .map_err(|e| CertificateManagerError::signing("Failed to build KeyUsage", e))?;
        builder
            .append_extension(ku)
            .map_err(|e| CertificateManagerError::signing("Failed to add KeyUsage", e))?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| {
                CertificateManagerError::signing("Failed to build SubjectKeyIdentifier", e)
            })?;
        builder.append_extension(ski).map_err(|e| {
            CertificateManagerError::signing("Failed to add SubjectKeyIdentifier", e)
        })?;

        builder
            .sign(&self.private_key, MessageDigest::sha256())
            .map_err(|e| CertificateManagerError::signing("Failed to sign certificate", e))?;

        let mut certificate = Certificate::from_x509(builder.build());
        certificate.private_key = Some(self.private_key);
        Ok(certificate)
    }

    pub(crate) fn sign_with(self, issuer: &Certificate) -> Result<Certificate> {
        let signing_key = issuer.signing_key()?;
        let subject = build_name(&self.name)?;
        let mut builder = self.base_builder(&subject, issuer.certificate.subject_name())?;

        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(|e| CertificateManagerError::signing("Failed to build BasicConstraints", e))?;
        builder
            .append_extension(bc)
            .map_err(|e| CertificateManagerError::signing("Failed to add BasicConstraints", e))?;

        let ku = KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()
            .map_err(|e| CertificateManagerError::signing("Failed to build KeyUsage", e))?;
        builder
            .append_extension(ku)
            .map_err(|e| CertificateManagerError::signing("Failed to add KeyUsage", e))?;

        // Issued identities act as both TLS server and TLS client.
        let eku = ExtendedKeyUsage::new()
            .server_auth()
            .client_auth()
            .build()
            .map_err(|e| CertificateManagerError::signing("Failed to build ExtendedKeyUsage", e))?;
        builder
            .append_extension(eku)
            .map_err(|e| CertificateManagerError::signing("Failed to add ExtendedKeyUsage", e))?;

        let mut san = SubjectAlternativeName::new();
        if self.name.parse::<IpAddr>().is_ok() {
            san.ip(&self.name);
        } else {
            san.dns(&self.name);
        }
        let san = san
            .build(&builder.x509v3_context(Some(&issuer.certificate), None))
            .map_err(|e| {
                CertificateManagerError::signing("Failed to build SubjectAlternativeName", e)
            })?;
        builder.append_extension(san).map_err(|e| {
            CertificateManagerError::signing("Failed to add SubjectAlternativeName", e)
        })?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&issuer.certificate), None))
            .map_err(|e| {
                CertificateManagerError::signing("Failed to build SubjectKeyIdentifier", e)
            })?;
        builder.append_extension(ski).map_err(|e| {
            CertificateManagerError::signing("Failed to add SubjectKeyIdentifier", e)
        })?;

        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&issuer.certificate), None))
            .map_err(|e| {
                CertificateManagerError::signing("Failed to build AuthorityKeyIdentifier", e)
            })?;
        builder.append_extension(aki).map_err(|e| {
            CertificateManagerError::signing("Failed to add AuthorityKeyIdentifier", e)
        })?;

        builder
            .sign(signing_key, MessageDigest::sha256())
            .map_err(|e| CertificateManagerError::signing("Failed to sign certificate", e))?;

        let mut certificate = Certificate::from_x509(builder.build());
        certificate.private_key = Some(self.private_key);
        Ok(certificate)
    }

    fn base_builder(
        &self,
        subject: &X509NameRef,
        issuer: &X509NameRef,
    ) -> Result<openssl::x509::X509Builder> {
        let mut builder = X509::builder()
            .map_err(|e| CertificateManagerError::signing("Failed to create X509 builder", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| CertificateManagerError::signing("Failed to set version", e))?;

        let mut serial = BigNum::new()
            .map_err(|e| CertificateManagerError::signing("Failed to allocate serial", e))?;
        serial
            .rand(SERIAL_NUMBER_BITS, MsbOption::MAYBE_ZERO, false)
            .map_err(|e| CertificateManagerError::signing("Failed to generate serial", e))?;
        let asn1_serial = serial
            .to_asn1_integer()
            .map_err(|e| CertificateManagerError::signing("Failed to encode serial", e))?;
        builder
            .set_serial_number(&asn1_serial)
            .map_err(|e| CertificateManagerError::signing("Failed to set serial number", e))?;

        builder
            .set_subject_name(subject)
            .map_err(|e| CertificateManagerError::signing("Failed to set subject", e))?;
        builder
            .set_issuer_name(issuer)
            .map_err(|e| CertificateManagerError::signing("Failed to set issuer", e))?;

        let not_before = Asn1Time::days_from_now(0)
            .map_err(|e| CertificateManagerError::signing("Failed to create not_before", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| CertificateManagerError::signing("Failed to set not_before", e))?;
        let not_after = Asn1Time::days_from_now(self.valid_days)
            .map_err(|e| CertificateManagerError::signing("Failed to create not_after", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| CertificateManagerError::signing("Failed to set not_after", e))?;

        builder
            .set_pubkey(&self.private_key)
            .map_err(|e| CertificateManagerError::signing("Failed to set public key", e))?;
        Ok(builder)
    }
}

pub(crate) fn generate_private_key(key_size: u32) -> Result<PKey<Private>> {
    if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&key_size) {
        return Err(CertificateManagerError::KeyGeneration(format!(
            "Unsupported RSA key size {} (expected {}..={} bits)",
            key_size, MIN_KEY_SIZE, MAX_KEY_SIZE
        )));
    }
    let rsa = Rsa::generate(key_size)
        .map_err(|e| CertificateManagerError::key_generation("Failed to generate RSA keypair", e))?;
    PKey::from_rsa(rsa)
        .map_err(|e| CertificateManagerError::key_generation("Failed to create private key", e))
}

fn build_name(common_name: &str) -> Result<X509Name> {
    let mut name_builder = X509Name::builder()
        .map_err(|e| CertificateManagerError::signing("Failed to create name builder", e))?;
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .map_err(|e| CertificateManagerError::signing("Failed to set CN", e))?;
    Ok(name_builder.build())
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| match entry.data().as_utf8() {
            Ok(utf8) => utf8.to_string(),
            Err(_) => String::from_utf8_lossy(entry.data().as_slice()).into_owned(),
        })
        .unwrap_or_default()
}

fn name_der(name: &X509NameRef) -> Result<Vec<u8>> {
    name.to_der()
        .map_err(|e| CertificateManagerError::protocol("Failed to encode distinguished name", e))
}

fn stage_file(target: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let directory = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory)?;
    let mut staged = NamedTempFile::new_in(directory)?;
    staged.write_all(contents)?;
    staged.as_file().sync_all()?;
    Ok(staged)
}
