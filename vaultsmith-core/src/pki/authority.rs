//! Root certificate authority and PKCS#12 packaging

use super::certificate::{
    ensure_certificate_content, BasicConstraints, CertificateProperties, KeyUsageFlags, SubjectName,
};
use super::private_key::{ensure_private_key_content, DEFAULT_KEY_SIZE, DEFAULT_PUBLIC_EXPONENT};
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::types::Secret;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Ref, X509};
use std::fmt;

/// CA certificate together with its signing key
#[derive(Clone)]
pub struct CertificateAuthority {
    certificate: X509,
    key: PKey<Private>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.certificate.subject_name())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load an operator-supplied CA; the key must belong to the certificate
    pub fn from_pem(
        certificate_pem: &str,
        key_pem: &Secret,
        passphrase: Option<&Secret>,
    ) -> VaultsmithResult<Self> {
        let certificate = X509::from_pem(certificate_pem.as_bytes()).map_err(|e| {
            VaultsmithError::configuration("root_ca_cert_pem", format!("not a PEM certificate: {}", e))
        })?;
        let pass = passphrase.map(|p| p.expose().as_bytes()).unwrap_or(b"");
        let key = PKey::private_key_from_pem_passphrase(key_pem.expose().as_bytes(), pass).map_err(|e| {
            VaultsmithError::configuration("root_ca_key_pem", format!("cannot load private key: {}", e))
        })?;

        let public = certificate
            .public_key()
            .map_err(|e| VaultsmithError::crypto("read CA public key", e))?;
        if !public.public_eq(&key) {
            return Err(VaultsmithError::configuration(
                "root_ca_key_pem",
                "private key does not match the root CA certificate",
            ));
        }

        Ok(Self { certificate, key })
    }

    /// Self-signed authority with a fresh key
    pub fn generate(common_name: &str, days: u32) -> VaultsmithResult<Self> {
        let key = ensure_private_key_content(None, None, DEFAULT_KEY_SIZE, DEFAULT_PUBLIC_EXPONENT)?.key;
        let properties = CertificateProperties {
            name: Some(SubjectName::common_name(common_name)),
            subject_key_identifier: true,
            key_usage: Some(KeyUsageFlags::authority()),
            key_usage_critical: true,
            basic_constraints: Some(BasicConstraints {
                ca: true,
                path_length: None,
            }),
            basic_constraints_critical: true,
            not_valid_after_days: days,
            ..Default::default()
        };
        let certificate = ensure_certificate_content(&key, &properties, None, None)?.certificate;
        Ok(Self { certificate, key })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub fn certificate_pem(&self) -> VaultsmithResult<String> {
        let pem = self
            .certificate
            .to_pem()
            .map_err(|e| VaultsmithError::crypto("encode CA certificate", e))?;
        String::from_utf8(pem).map_err(|e| VaultsmithError::internal(format!("PEM is not UTF-8: {}", e)))
    }

    /// Unix timestamp of the CA's notAfter
    pub fn not_after_timestamp(&self) -> VaultsmithResult<i64> {
        let der = self
            .certificate
            .to_der()
            .map_err(|e| VaultsmithError::crypto("encode CA certificate", e))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| VaultsmithError::certificate_parse(e.to_string()))?;
        Ok(parsed.validity().not_after.timestamp())
    }

    /// Serial as Vault reports it in issuer listings, without separators
    pub fn serial_hex(&self) -> VaultsmithResult<String> {
        let serial = self
            .certificate
            .serial_number()
            .to_bn()
            .map_err(|e| VaultsmithError::crypto("read CA serial", e))?;
        let hex = serial
            .to_hex_str()
            .map_err(|e| VaultsmithError::crypto("format CA serial", e))?;
        Ok(hex.to_uppercase())
    }

    /// Unencrypted key followed by the certificate, as the PKI config/ca endpoint expects
    pub fn pem_bundle(&self) -> VaultsmithResult<Secret> {
        let key_pem = super::private_key::traditional_pem(&self.key, None)?;
        Ok(Secret::new(format!("{}{}", key_pem, self.certificate_pem()?)))
    }
}

/// Package a client key and certificate, with the CA, as PKCS#12 DER
pub fn pkcs12_bundle(
    friendly_name: &str,
    key: &PKeyRef<Private>,
    certificate: &X509Ref,
    ca: &CertificateAuthority,
    passphrase: &Secret,
) -> VaultsmithResult<Vec<u8>> {
    let mut chain = Stack::new().map_err(|e| VaultsmithError::crypto("allocate CA stack", e))?;
    chain
        .push(ca.certificate().clone())
        .map_err(|e| VaultsmithError::crypto("push CA certificate", e))?;

    let pkcs12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(key)
        .cert(certificate)
        .ca(chain)
        .build2(passphrase.expose())
        .map_err(|e| VaultsmithError::crypto("build PKCS#12 bundle", e))?;
    pkcs12
        .to_der()
        .map_err(|e| VaultsmithError::crypto("encode PKCS#12 bundle", e))
}
