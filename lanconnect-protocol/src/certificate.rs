//! Device Certificates
//!
//! Every device owns one long-lived self-signed certificate. It is presented
//! in every TLS handshake and pinned by peers on first pairing.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: Device id
//! - **Validity**: 10 years

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate validity period (10 years)
const CERT_VALIDITY_DAYS: u32 = 10 * 365;

/// Organization name in certificate
const CERT_ORG: &str = "KDE";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Kde connect";

/// Device certificate and private key
#[derive(Clone)]
pub struct CertificateInfo {
    /// Device id (certificate CN)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of the certificate
    pub fingerprint: String,
}

impl std::fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// ```
    /// use lanconnect_protocol::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// assert_eq!(cert_info.device_id, "test_device_id");
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;
        builder.sign(&pkey, MessageDigest::sha256())?;

        let cert = builder.build();
        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Calculate SHA256 fingerprint of a certificate
    ///
    /// Returns fingerprint in format: XX:XX:XX:...:XX
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let hash = Sha256::digest(cert_der);

        hash.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Parsed X509 certificate
    pub fn x509(&self) -> Result<X509> {
        X509::from_der(&self.certificate).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to parse certificate: {}", e))
        })
    }

    /// Parsed private key
    pub fn pkey(&self) -> Result<PKey<Private>> {
        PKey::private_key_from_der(&self.private_key).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to parse private key: {}", e))
        })
    }

    /// Save certificate and private key to PEM files
    ///
    /// The key file is created with mode 0600.
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let (cert_pem, key_pem) = self.to_pem()?;
        fs::write(cert_path, cert_pem)?;
        write_private(key_path, &key_pem)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let info = Self::from_pem(&fs::read(cert_path)?, &fs::read(key_path)?)?;
        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            info.device_id, info.fingerprint
        );
        Ok(info)
    }

    /// Build from a PEM certificate and a PEM private key
    ///
    /// The device id is taken from the certificate's Common Name.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(cert_pem)?;
        let certificate = cert.to_der()?;
        let private_key = PKey::private_key_from_pem(key_pem)?.private_key_to_der()?;

        Ok(Self {
            device_id: common_name(&cert)?,
            fingerprint: Self::calculate_fingerprint(&certificate),
            certificate,
            private_key,
        })
    }

    /// PEM certificate and PKCS#8 PEM private key
    pub fn to_pem(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((
            self.x509()?.to_pem()?,
            self.pkey()?.private_key_to_pem_pkcs8()?,
        ))
    }
}

/// Encode a DER certificate as a PEM `CERTIFICATE` block
pub fn der_to_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

/// Decode the first PEM `CERTIFICATE` block into DER
pub fn pem_to_der(data: &[u8]) -> Result<Vec<u8>> {
    let block = pem::parse(data).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Invalid PEM certificate: {}", e))
    })?;

    if block.tag() != "CERTIFICATE" {
        return Err(ProtocolError::CertificateValidation(format!(
            "Unexpected PEM block: {}",
            block.tag()
        )));
    }

    Ok(block.into_contents())
}

/// Common Name of a certificate subject
pub fn common_name(cert: &X509) -> Result<String> {
    cert.subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .map(|entry| entry.data().as_utf8().map(|cn| cn.to_string()))
        .transpose()?
        .ok_or_else(|| {
            ProtocolError::CertificateValidation(
                "Certificate does not contain Common Name".to_string(),
            )
        })
}

/// Write `contents` to a file only the owner can read
///
/// The file never exists with wider permissions, not even briefly.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_certificate() {
        let cert = CertificateInfo::generate("test_device").unwrap();

        assert_eq!(cert.device_id, "test_device");
        assert!(!cert.certificate.is_empty());
        assert!(!cert.private_key.is_empty());
        assert_eq!(cert.fingerprint.split(':').count(), 32);
        assert_eq!(common_name(&cert.x509().unwrap()).unwrap(), "test_device");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = CertificateInfo::calculate_fingerprint(b"abc");
        let b = CertificateInfo::calculate_fingerprint(b"abc");
        assert_eq!(a, b);
        assert!(a.starts_with("BA:78:16:BF"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("certs/device.crt");
        let key_path = temp_dir.path().join("certs/device.key");

        let cert = CertificateInfo::generate("saved_device").unwrap();
        cert.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.device_id, "saved_device");
        assert_eq!(loaded.certificate, cert.certificate);
        assert_eq!(loaded.fingerprint, cert.fingerprint);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_key_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("device.crt");
        let key_path = temp_dir.path().join("device.key");
        fs::write(&key_path, b"stale key material that is longer than a pem").unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();

        let cert = CertificateInfo::generate("rotated_device").unwrap();
        cert.save_to_files(&cert_path, &key_path).unwrap();

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.private_key, cert.private_key);
    }

    #[test]
    fn test_pem_conversion() {
        let cert = CertificateInfo::generate("pem_device").unwrap();
        let pem = der_to_pem(&cert.certificate);

        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(pem_to_der(pem.as_bytes()).unwrap(), cert.certificate);
    }

    #[test]
    fn test_pem_rejects_other_blocks() {
        let key = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3]));
        assert!(pem_to_der(key.as_bytes()).is_err());
        assert!(pem_to_der(b"garbage").is_err());
    }
}
