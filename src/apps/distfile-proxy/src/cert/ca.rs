use super::{CertError, CertResult, CertificateIssuer};
use rcgen::{
    CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::{CertifiedKey, SigningKey};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Lifetime of every minted leaf certificate.
pub const LEAF_VALIDITY: time::Duration = time::Duration::hours(24);

/// Root certificate and RSA key used to sign leaf certificates on demand.
///
/// Leaves reuse the root's key pair instead of generating their own, so a
/// leaf costs one RSA signature and no key generation. Nothing is cached:
/// every call to [`CertificateAuthority::issue`] signs a new certificate.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    // Same key material as the issuer's, used as the leaf's public key.
    leaf_key: KeyPair,
    signing_key: Arc<dyn SigningKey>,
    root_der: CertificateDer<'static>,
    rng: SystemRandom,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_der_len", &self.root_der.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Parses a PEM root certificate and a PEM RSA private key (PKCS#1 or
    /// PKCS#8).
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> CertResult<Self> {
        let root_der = rustls_pemfile::certs(&mut &*cert_pem)
            .next()
            .ok_or_else(|| CertError::InvalidCertificate("no certificate found in PEM".into()))?
            .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;

        let key_der = rustls_pemfile::private_key(&mut &*key_pem)
            .map_err(|e| CertError::InvalidKey(e.to_string()))?
            .ok_or_else(|| CertError::InvalidKey("no private key found in PEM".into()))?;
        if !matches!(key_der, PrivateKeyDer::Pkcs1(_) | PrivateKeyDer::Pkcs8(_)) {
            return Err(CertError::InvalidKey("expected an RSA private key".into()));
        }

        let issuer_key = rsa_key_pair(&key_der)?;
        let leaf_key = rsa_key_pair(&key_der)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| CertError::InvalidKey(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_der(&root_der, issuer_key)
            .map_err(|e| CertError::InvalidCertificate(e.to_string()))?;

        Ok(Self {
            issuer,
            leaf_key,
            signing_key,
            root_der,
            rng: SystemRandom::new(),
        })
    }

    /// Reads the root certificate and key from disk. Either file being
    /// missing or unparsable is an error.
    pub async fn from_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> CertResult<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;
        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!("Loaded root certificate from {:?}", cert_path);
        Ok(ca)
    }

    pub fn root_certificate_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Signs a leaf certificate for `server_name`, valid for [`LEAF_VALIDITY`]
    /// starting now.
    pub fn generate_leaf(&self, server_name: &str) -> CertResult<CertificateDer<'static>> {
        if server_name.is_empty() {
            return Err(CertError::MissingSni);
        }

        let mut serial = [0u8; 16];
        self.rng.fill(&mut serial).map_err(|_| {
            CertError::CertificateGenerationFailed(
                "failed to generate certificate serial number".into(),
            )
        })?;

        let mut params = CertificateParams::new(vec![server_name.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let not_before = time::OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + LEAF_VALIDITY;

        let cert = params.signed_by(&self.leaf_key, &self.issuer)?;
        Ok(cert.der().clone())
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn issue(&self, server_name: &str) -> CertResult<Arc<CertifiedKey>> {
        let leaf = self.generate_leaf(server_name)?;
        debug!("Generated certificate for {}", server_name);
        Ok(Arc::new(CertifiedKey::new(
            vec![leaf],
            self.signing_key.clone(),
        )))
    }
}

/// rcgen's ring backend only reads RSA keys as PKCS#8, so a PKCS#1
/// `RSA PRIVATE KEY` is wrapped first.
fn rsa_key_pair(key_der: &PrivateKeyDer<'_>) -> CertResult<KeyPair> {
    let result = match key_der {
        PrivateKeyDer::Pkcs1(pkcs1) => {
            let pkcs8 = PrivateKeyDer::Pkcs8(pkcs1_to_pkcs8(pkcs1.secret_pkcs1_der()));
            KeyPair::from_der_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        }
        other => KeyPair::from_der_and_sign_algo(other, &rcgen::PKCS_RSA_SHA256),
    };
    result.map_err(|e| CertError::InvalidKey(e.to_string()))
}

/// DER `AlgorithmIdentifier` for rsaEncryption (1.2.840.113549.1.1.1) with
/// NULL parameters.
const RSA_ENCRYPTION_ALGORITHM: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Wraps an RSAPrivateKey in a version 0 PrivateKeyInfo (RFC 5208).
fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> PrivatePkcs8KeyDer<'static> {
    let mut body = vec![0x02, 0x01, 0x00];
    body.extend_from_slice(RSA_ENCRYPTION_ALGORITHM);
    body.push(0x04);
    push_der_length(&mut body, pkcs1.len());
    body.extend_from_slice(pkcs1);

    let mut der = vec![0x30];
    push_der_length(&mut der, body.len());
    der.extend_from_slice(&body);
    PrivatePkcs8KeyDer::from(der)
}

fn push_der_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}
