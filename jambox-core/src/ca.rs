use crate::error::JamboxError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;

const CA_COMMON_NAME: &str = "Jambox CA";
const CA_ORGANIZATION: &str = "Jambox Local Development Proxy";

/// Root CA used to mint per-host certificates for intercepted TLS.
///
/// Persisted as `ca.pem`/`ca.key` (plus a `ca.crt` copy for OS trust stores)
/// so clients only have to trust it once.
pub struct CertificateAuthority {
    ca_cert: Certificate,
}

impl CertificateAuthority {
    /// Load the CA from `ca_dir`, generating and saving one if absent.
    pub fn new(ca_dir: &Path) -> Result<Self> {
        let ca_cert_path = ca_dir.join("ca.pem");
        let ca_key_path = ca_dir.join("ca.key");

        if ca_cert_path.exists() && ca_key_path.exists() {
            let key_pem = fs::read_to_string(&ca_key_path)?;
            Self::from_key_pem(&key_pem)
        } else {
            fs::create_dir_all(ca_dir)?;
            let ca = Self::generate()?;
            ca.save(&ca_cert_path, &ca_key_path)?;
            info!("Generated new root CA at {}", ca_cert_path.display());
            Ok(ca)
        }
    }

    /// Rebuild the CA around an existing private key.
    ///
    /// rcgen cannot sign with a parsed certificate, so the CA is re-issued
    /// with the same subject and key; leaf signatures still chain to the
    /// certificate on disk.
    pub fn from_key_pem(key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| JamboxError::Certificate(format!("Failed to parse CA key: {}", e)))?;

        let mut params = ca_params();
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params)
            .map_err(|e| JamboxError::Certificate(format!("Failed to recreate CA cert: {}", e)))?;
        Ok(Self { ca_cert: cert })
    }

    fn generate() -> Result<Self> {
        let mut params = ca_params();

        // Valid for 10 years
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| JamboxError::Certificate(format!("Failed to generate CA key: {}", e)))?;
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params)
            .map_err(|e| JamboxError::Certificate(format!("Failed to generate CA cert: {}", e)))?;
        Ok(Self { ca_cert: cert })
    }

    fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        let cert_pem = self.cert_pem()?;
        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, self.key_pem())?;
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;
        Ok(())
    }

    pub fn cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| JamboxError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    pub fn key_pem(&self) -> String {
        let mut key_pem = self.ca_cert.serialize_private_key_pem();
        if !key_pem.ends_with('\n') {
            key_pem.push('\n');
        }
        key_pem
    }

    /// DER certificate, as hudsucker's `RcgenAuthority` expects.
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        self.ca_cert
            .serialize_der()
            .map_err(|e| JamboxError::Certificate(format!("Failed to serialize CA cert DER: {}", e)))
    }

    pub fn key_der(&self) -> Vec<u8> {
        self.ca_cert.serialize_private_key_der()
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}
