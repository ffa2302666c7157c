//! Local certificate authority for TLS interception.
//!
//! The root key and certificate are persisted once under restrictive
//! permissions and reused across restarts; leaf certificates are minted
//! per intercepted host with the host as subject-alt-name.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

/// Leaf certificates are backdated an hour against clock skew and live for
/// 90 days (within the one-hour-to-one-year validity envelope).
const LEAF_BACKDATE: Duration = Duration::hours(1);
const LEAF_LIFETIME: Duration = Duration::days(90);

#[derive(Debug, Error)]
pub enum CaError {
    #[error("CA storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate generation error: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// A minted leaf certificate plus its private key, ready for a TLS server.
#[derive(Debug)]
pub struct MintedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

impl MintedCert {
    /// Build a rustls server config presenting this certificate.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, CaError> {
        ensure_crypto_provider();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], self.key_der.clone_key())?;
        Ok(Arc::new(config))
    }
}

/// Pin the process-wide rustls provider to ring. Other dependencies may link
/// a second provider, which would make the config builder ambiguous.
fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// The root CA: persisted key material plus the issuing certificate.
pub struct CertAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
}

impl CertAuthority {
    /// Load the CA from `dir`, generating and persisting a fresh root on
    /// first run. The key file is written with mode 0600.
    pub fn load_or_create(dir: &Path) -> Result<Self, CaError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        std::fs::create_dir_all(dir)?;
        restrict_permissions(dir, 0o700)?;

        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "Stronghold Root CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Stronghold");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = OffsetDateTime::now_utc() - LEAF_BACKDATE;
        params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);

        let ca_cert = params.self_signed(&ca_key)?;
        let ca_cert_pem = ca_cert.pem();

        std::fs::write(&cert_path, &ca_cert_pem)?;
        std::fs::write(&key_path, ca_key.serialize_pem())?;
        restrict_permissions(&key_path, 0o600)?;

        tracing::info!(path = %dir.display(), "generated new root CA");

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
        })
    }

    fn load(cert_path: &PathBuf, key_path: &PathBuf) -> Result<Self, CaError> {
        let ca_cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;

        let ca_key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)?;
        // Re-derive the issuing certificate from persisted params and key.
        // Leaves chain through the subject DN and key, both of which match
        // the ca.pem agents have installed.
        let ca_cert = params.self_signed(&ca_key)?;

        tracing::debug!(path = %cert_path.display(), "loaded root CA");

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
        })
    }

    /// The PEM of the root certificate, for distribution to agents.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Mint a leaf certificate for `host`, signed by the root.
    pub fn mint_leaf(&self, host: &str) -> Result<MintedCert, CaError> {
        let leaf_key = KeyPair::generate()?;

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc() - LEAF_BACKDATE;
        params.not_after = OffsetDateTime::now_utc() + LEAF_LIFETIME;

        let cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        Ok(MintedCert {
            cert_der: cert.der().clone(),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stronghold-ca-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_create_and_reload_ca() {
        let dir = temp_dir("reload");
        let ca = CertAuthority::load_or_create(&dir).unwrap();
        let pem = ca.ca_cert_pem().to_string();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        // Second load must reuse the persisted root, not mint a new one.
        let reloaded = CertAuthority::load_or_create(&dir).unwrap();
        assert_eq!(reloaded.ca_cert_pem(), pem);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_mint_leaf() {
        let dir = temp_dir("leaf");
        let ca = CertAuthority::load_or_create(&dir).unwrap();

        let leaf = ca.mint_leaf("example.com").unwrap();
        assert!(!leaf.cert_der.is_empty());
        leaf.server_config().unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = temp_dir("perms");
        let _ca = CertAuthority::load_or_create(&dir).unwrap();

        let mode = std::fs::metadata(dir.join(CA_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
