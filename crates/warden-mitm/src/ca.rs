//! Root CA lifecycle and per-host leaf certificate minting.
//!
//! Grounded on `oisp-redirector::windows_main::tls_mitm::CertificateAuthority`:
//! load-or-create on disk, double-checked cache keyed by hostname. Generalized
//! here to single-flight coalescing of concurrent mints for the same host via
//! a per-host `tokio::sync::OnceCell`, and to an RSA-2048 root (rcgen cannot
//! generate RSA keys itself, so the key material comes from the `rsa` crate
//! and is handed to rcgen as a PEM — see DESIGN.md).

use crate::error::CaError;
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::{debug, info};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 825;
const LEAF_BACKDATE_MINUTES: i64 = 5;
const CA_KEY_BITS: usize = 2048;

pub struct LeafCertificate {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub expires_at: OffsetDateTime,
}

type MintSlot = Arc<OnceCell<Result<Arc<LeafCertificate>, String>>>;

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_keypair: KeyPair,
    ca_cert_pem: String,
    leaves: Mutex<HashMap<String, MintSlot>>,
}

impl CertificateAuthority {
    /// Load the CA from `cert_path`/`key_path` if both exist, otherwise
    /// generate a fresh one and persist it there.
    pub fn load_or_generate(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, CaError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        if cert_path.exists() && key_path.exists() {
            info!(path = %cert_path.display(), "loading existing CA");
            Self::load(cert_path, key_path)
        } else {
            info!(path = %cert_path.display(), "generating new CA");
            Self::generate(cert_path, key_path)
        }
    }

    fn generate(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        if let Some(parent) = cert_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let rsa_key = RsaPrivateKey::new(&mut OsRng, CA_KEY_BITS)
            .map_err(|e| CaError::CryptoFailure(e.to_string()))?;
        let key_pem = rsa_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| CaError::CryptoFailure(e.to_string()))?;
        let ca_keypair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaError::CryptoFailure(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Warden Proxy CA");
        dn.push(DnType::OrganizationName, "Warden Proxy");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = params
            .self_signed(&ca_keypair)
            .map_err(|e| CaError::CryptoFailure(e.to_string()))?;
        let ca_cert_pem = ca_cert.pem();

        std::fs::write(cert_path, ca_cert_pem.as_bytes())?;
        std::fs::write(key_path, key_pem.as_bytes())?;
        set_permissions(cert_path, 0o644)?;
        set_permissions(key_path, 0o600)?;

        info!(path = %cert_path.display(), "wrote new CA certificate");

        Ok(Self {
            ca_cert,
            ca_keypair,
            ca_cert_pem,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let ca_cert_pem = std::fs::read_to_string(cert_path)?;
        let ca_key_pem = std::fs::read_to_string(key_path)?;

        let ca_keypair =
            KeyPair::from_pem(&ca_key_pem).map_err(|e| CaError::CryptoFailure(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| CaError::CryptoFailure(e.to_string()))?;
        let ca_cert = params
            .self_signed(&ca_keypair)
            .map_err(|e| CaError::CryptoFailure(e.to_string()))?;

        Ok(Self {
            ca_cert,
            ca_keypair,
            ca_cert_pem,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Mint (or return the cached) leaf certificate for `host`. Concurrent
    /// callers for the same host share one signing operation.
    pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let slot = {
            let mut leaves = self.leaves.lock().unwrap();
            leaves
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot
            .get_or_init(|| async { self.mint(host).map_err(|e| e.to_string()) })
            .await;

        match result {
            Ok(leaf) => Ok(leaf.clone()),
            Err(msg) => Err(CaError::CryptoFailure(msg.clone())),
        }
    }

    fn mint(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        debug!(host, "minting leaf certificate");

        let leaf_keypair = KeyPair::generate().map_err(|e| CaError::CryptoFailure(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            host.to_string()
                .try_into()
                .map_err(|_| CaError::CryptoFailure(format!("invalid SAN hostname: {host}")))?,
        )];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(LEAF_BACKDATE_MINUTES);
        let expires_at = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.not_after = expires_at;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        // rcgen assigns a random serial number when none is set explicitly.

        let leaf_cert = params
            .signed_by(&leaf_keypair, &self.ca_cert, &self.ca_keypair)
            .map_err(|e| CaError::CryptoFailure(e.to_string()))?;

        Ok(Arc::new(LeafCertificate {
            cert_der: leaf_cert.der().to_vec(),
            key_der: leaf_keypair.serialize_der(),
            expires_at,
        }))
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ca_with_expected_permissions_and_pem_markers() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let ca = CertificateAuthority::load_or_generate(&cert_path, &key_path).unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(cert_path.exists());
        assert!(key_path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let cert_mode = std::fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
            let key_mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
            assert_eq!(cert_mode, 0o644);
            assert_eq!(key_mode, 0o600);
        }
    }

    #[test]
    fn reloading_an_existing_ca_reproduces_the_same_pem() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let first = CertificateAuthority::load_or_generate(&cert_path, &key_path).unwrap();
        let second = CertificateAuthority::load_or_generate(&cert_path, &key_path).unwrap();
        assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
    }

    #[tokio::test]
    async fn leaf_for_caches_and_coalesces_concurrent_mints() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(
            CertificateAuthority::load_or_generate(dir.path().join("ca.crt"), dir.path().join("ca.key"))
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ca = ca.clone();
            tasks.push(tokio::spawn(async move { ca.leaf_for("example.com").await.unwrap() }));
        }
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let first = &results[0].cert_der;
        for leaf in &results {
            assert_eq!(&leaf.cert_der, first);
        }
    }
}
