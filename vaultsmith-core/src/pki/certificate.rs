//! Certificate reconciliation
//!
//! [`ensure_certificate`] takes a declarative [`CertificateProperties`] and
//! an optional existing certificate. The expected certificate is built
//! up front; the existing one is kept only when its subject, issuer, public
//! key, tracked extensions (value and criticality) and validity window all
//! match. Otherwise the expected certificate is signed with SHA-256, either
//! by the supplied CA or by the subject key itself.

use super::authority::CertificateAuthority;
use crate::error::{VaultsmithError, VaultsmithResult};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints as BasicConstraintsExtension,
    ExtendedKeyUsage as ExtendedKeyUsageExtension, KeyUsage as KeyUsageExtension,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509NameRef, X509Ref, X509};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::X509Extension;
use x509_parser::oid_registry::{
    Oid, OID_X509_EXT_AUTHORITY_KEY_IDENTIFIER, OID_X509_EXT_BASIC_CONSTRAINTS,
    OID_X509_EXT_EXTENDED_KEY_USAGE, OID_X509_EXT_KEY_USAGE, OID_X509_EXT_SUBJECT_ALT_NAME,
    OID_X509_EXT_SUBJECT_KEY_IDENTIFIER,
};

const SECONDS_PER_DAY: i64 = 86_400;

/// Subject attributes that can appear in a certificate name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameAttribute {
    CommonName,
    Country,
    StateOrProvince,
    Locality,
    Organization,
    OrganizationalUnit,
    EmailAddress,
}

impl NameAttribute {
    fn nid(self) -> Nid {
        match self {
            NameAttribute::CommonName => Nid::COMMONNAME,
            NameAttribute::Country => Nid::COUNTRYNAME,
            NameAttribute::StateOrProvince => Nid::STATEORPROVINCENAME,
            NameAttribute::Locality => Nid::LOCALITYNAME,
            NameAttribute::Organization => Nid::ORGANIZATIONNAME,
            NameAttribute::OrganizationalUnit => Nid::ORGANIZATIONALUNITNAME,
            NameAttribute::EmailAddress => Nid::PKCS9_EMAILADDRESS,
        }
    }
}

/// Ordered list of subject attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectName(pub Vec<(NameAttribute, String)>);

impl SubjectName {
    pub fn common_name(value: impl Into<String>) -> Self {
        SubjectName(vec![(NameAttribute::CommonName, value.into())])
    }

    pub fn with(mut self, attribute: NameAttribute, value: impl Into<String>) -> Self {
        self.0.push((attribute, value.into()));
        self
    }

    fn build(&self) -> VaultsmithResult<X509Name> {
        let mut builder =
            X509Name::builder().map_err(|e| VaultsmithError::crypto("create subject name", e))?;
        for (attribute, value) in &self.0 {
            builder.append_entry_by_nid(attribute.nid(), value).map_err(|_| {
                VaultsmithError::configuration(
                    "certificate.name",
                    format!("invalid value '{}' for {:?}", value, attribute),
                )
            })?;
        }
        Ok(builder.build())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyUsageFlags {
    pub digital_signature: bool,
    pub content_commitment: bool,
    pub key_encipherment: bool,
    pub data_encipherment: bool,
    pub key_agreement: bool,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
    pub encipher_only: bool,
    pub decipher_only: bool,
}

impl KeyUsageFlags {
    /// Usage bits for mutual-TLS client certificates
    pub fn client() -> Self {
        Self {
            digital_signature: true,
            content_commitment: true,
            key_encipherment: true,
            ..Default::default()
        }
    }

    /// Usage bits for a certificate authority
    pub fn authority() -> Self {
        Self {
            digital_signature: true,
            key_cert_sign: true,
            crl_sign: true,
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    /// Dotted OID
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicConstraints {
    pub ca: bool,
    pub path_length: Option<u32>,
}

/// Declarative description of the certificate a caller wants
#[derive(Debug, Clone)]
pub struct CertificateProperties {
    /// Write the full chain here when generated; read existing content from here
    pub path: Option<PathBuf>,
    /// Existing certificate PEM
    pub content: Option<String>,
    /// Subject; defaults to the CA's subject when a CA is given
    pub name: Option<SubjectName>,
    pub authority_key_identifier: bool,
    pub authority_key_identifier_critical: bool,
    pub subject_key_identifier: bool,
    pub subject_key_identifier_critical: bool,
    pub key_usage: Option<KeyUsageFlags>,
    pub key_usage_critical: bool,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub extended_key_usage_critical: bool,
    pub basic_constraints: Option<BasicConstraints>,
    pub basic_constraints_critical: bool,
    /// Entries prefixed with `DNS:`, `URI:`, `IP:` or `EMAIL:`
    pub subject_alt_names: Vec<String>,
    pub subject_alt_names_critical: bool,
    pub not_valid_after_days: u32,
}

impl Default for CertificateProperties {
    fn default() -> Self {
        Self {
            path: None,
            content: None,
            name: None,
            authority_key_identifier: false,
            authority_key_identifier_critical: false,
            subject_key_identifier: false,
            subject_key_identifier_critical: false,
            key_usage: None,
            key_usage_critical: false,
            extended_key_usage: Vec::new(),
            extended_key_usage_critical: false,
            basic_constraints: None,
            basic_constraints_critical: false,
            subject_alt_names: Vec::new(),
            subject_alt_names_critical: false,
            not_valid_after_days: 30,
        }
    }
}

impl CertificateProperties {
    /// Mutual-TLS client certificate signed by a CA
    pub fn client_auth(common_name: impl Into<String>, subject_alt_names: Vec<String>, days: u32) -> Self {
        Self {
            name: Some(SubjectName::common_name(common_name)),
            key_usage: Some(KeyUsageFlags::client()),
            key_usage_critical: true,
            extended_key_usage: vec![ExtendedKeyUsage::ClientAuth],
            extended_key_usage_critical: true,
            basic_constraints: Some(BasicConstraints {
                ca: false,
                path_length: None,
            }),
            subject_alt_names,
            not_valid_after_days: days,
            ..Default::default()
        }
    }
}

/// A certificate that was either reused or freshly signed
#[derive(Debug, Clone)]
pub struct GeneratedCertificate {
    pub certificate: X509,
    pub pem: String,
    /// Leaf followed by the issuer, when CA-signed
    pub full_chain_pem: String,
    pub generated: bool,
    /// Why a new certificate was signed
    pub reason: Option<String>,
}

enum SanEntry {
    Dns(String),
    Uri(String),
    Ip(String),
    Email(String),
}

fn parse_san(entry: &str) -> VaultsmithResult<SanEntry> {
    let unsupported = || {
        VaultsmithError::configuration(
            "certificate.subject_alt_names",
            format!(
                "Unknown subject_alternative_name type: {}. Supported types are: DNS, URI, IP, EMAIL",
                entry
            ),
        )
    };
    let (kind, value) = entry.split_once(':').ok_or_else(unsupported)?;
    match kind {
        "DNS" => Ok(SanEntry::Dns(value.to_string())),
        "URI" => Ok(SanEntry::Uri(value.to_string())),
        "EMAIL" => Ok(SanEntry::Email(value.to_string())),
        "IP" => value
            .parse::<IpAddr>()
            .map(|ip| SanEntry::Ip(ip.to_string()))
            .map_err(|_| {
                VaultsmithError::configuration(
                    "certificate.subject_alt_names",
                    format!("'{}' is not a valid IP address", value),
                )
            }),
        _ => Err(unsupported()),
    }
}

fn require_base(flag: bool, base: bool, critical_name: &str, base_name: &str) -> VaultsmithResult<()> {
    if flag && !base {
        return Err(VaultsmithError::configuration(
            "certificate",
            format!("{} cannot be set without {}", critical_name, base_name),
        ));
    }
    Ok(())
}

fn validate_properties(
    properties: &CertificateProperties,
    ca: Option<&CertificateAuthority>,
) -> VaultsmithResult<Vec<SanEntry>> {
    if properties.name.is_none() && ca.is_none() {
        return Err(VaultsmithError::configuration(
            "certificate.name",
            "name is required when no certificate authority is given",
        ));
    }
    if properties.authority_key_identifier && ca.is_none() {
        return Err(VaultsmithError::configuration(
            "certificate.authority_key_identifier",
            "authority_key_identifier requires a certificate authority",
        ));
    }
    require_base(
        properties.authority_key_identifier_critical,
        properties.authority_key_identifier,
        "authority_key_identifier_critical",
        "authority_key_identifier",
    )?;
    require_base(
        properties.subject_key_identifier_critical,
        properties.subject_key_identifier,
        "subject_key_identifier_critical",
        "subject_key_identifier",
    )?;
    require_base(
        properties.key_usage_critical,
        properties.key_usage.is_some(),
        "key_usage_critical",
        "key_usage",
    )?;
    require_base(
        properties.extended_key_usage_critical,
        !properties.extended_key_usage.is_empty(),
        "extended_key_usage_critical",
        "extended_key_usage",
    )?;
    require_base(
        properties.basic_constraints_critical,
        properties.basic_constraints.is_some(),
        "basic_constraints_critical",
        "basic_constraints",
    )?;
    require_base(
        properties.subject_alt_names_critical,
        !properties.subject_alt_names.is_empty(),
        "subject_alternative_name_critical",
        "subject_alternative_name",
    )?;
    if properties.key_usage.as_ref().is_some_and(KeyUsageFlags::is_empty) {
        return Err(VaultsmithError::configuration(
            "certificate.key_usage",
            "key_usage must enable at least one usage",
        ));
    }
    if properties.not_valid_after_days == 0 {
        return Err(VaultsmithError::configuration(
            "certificate.not_valid_after_days",
            "not_valid_after must be at least one day",
        ));
    }
    properties
        .subject_alt_names
        .iter()
        .map(|entry| parse_san(entry))
        .collect()
}

fn ssl(operation: &'static str) -> impl FnOnce(openssl::error::ErrorStack) -> VaultsmithError {
    move |e| VaultsmithError::crypto(operation, e)
}

/// Build and sign the certificate the properties describe
fn build_expected(
    private_key: &PKeyRef<Private>,
    properties: &CertificateProperties,
    sans: &[SanEntry],
    ca: Option<&CertificateAuthority>,
) -> VaultsmithResult<X509> {
    let mut builder = X509::builder().map_err(ssl("create certificate builder"))?;
    builder.set_version(2).map_err(ssl("set version"))?;

    let mut serial = BigNum::new().map_err(ssl("allocate serial"))?;
    serial
        .rand(159, MsbOption::MAYBE_ZERO, false)
        .map_err(ssl("generate serial"))?;
    let serial = serial.to_asn1_integer().map_err(ssl("encode serial"))?;
    builder.set_serial_number(&serial).map_err(ssl("set serial"))?;

    let own_name;
    let subject: &X509NameRef = match (&properties.name, ca) {
        (Some(name), _) => {
            own_name = name.build()?;
            &own_name
        }
        (None, Some(ca)) => ca.certificate().subject_name(),
        (None, None) => {
            return Err(VaultsmithError::configuration(
                "certificate.name",
                "name is required when no certificate authority is given",
            ))
        }
    };
    builder.set_subject_name(subject).map_err(ssl("set subject"))?;
    let issuer: &X509NameRef = match ca {
        Some(ca) => ca.certificate().subject_name(),
        None => subject,
    };
    builder.set_issuer_name(issuer).map_err(ssl("set issuer"))?;
    builder.set_pubkey(private_key).map_err(ssl("set public key"))?;

    let not_before = Asn1Time::days_from_now(0).map_err(ssl("compute not_before"))?;
    let not_after = Asn1Time::days_from_now(properties.not_valid_after_days)
        .map_err(ssl("compute not_after"))?;
    builder.set_not_before(&not_before).map_err(ssl("set not_before"))?;
    builder.set_not_after(&not_after).map_err(ssl("set not_after"))?;

    let issuer_cert: Option<&X509Ref> = ca.map(|ca| &**ca.certificate());

    if let Some(constraints) = &properties.basic_constraints {
        let mut extension = BasicConstraintsExtension::new();
        if properties.basic_constraints_critical {
            extension.critical();
        }
        if constraints.ca {
            extension.ca();
        }
        if let Some(path_length) = constraints.path_length {
            extension.pathlen(path_length);
        }
        let extension = extension.build().map_err(ssl("build basic constraints"))?;
        builder.append_extension(extension).map_err(ssl("add basic constraints"))?;
    }

    if let Some(flags) = &properties.key_usage {
        let mut extension = KeyUsageExtension::new();
        if properties.key_usage_critical {
            extension.critical();
        }
        if flags.digital_signature {
            extension.digital_signature();
        }
        if flags.content_commitment {
            extension.non_repudiation();
        }
        if flags.key_encipherment {
            extension.key_encipherment();
        }
        if flags.data_encipherment {
            extension.data_encipherment();
        }
        if flags.key_agreement {
            extension.key_agreement();
        }
        if flags.key_cert_sign {
            extension.key_cert_sign();
        }
        if flags.crl_sign {
            extension.crl_sign();
        }
        if flags.encipher_only {
            extension.encipher_only();
        }
        if flags.decipher_only {
            extension.decipher_only();
        }
        let extension = extension.build().map_err(ssl("build key usage"))?;
        builder.append_extension(extension).map_err(ssl("add key usage"))?;
    }

    if !properties.extended_key_usage.is_empty() {
        let mut extension = ExtendedKeyUsageExtension::new();
        if properties.extended_key_usage_critical {
            extension.critical();
        }
        for usage in &properties.extended_key_usage {
            match usage {
                ExtendedKeyUsage::ServerAuth => extension.server_auth(),
                ExtendedKeyUsage::ClientAuth => extension.client_auth(),
                ExtendedKeyUsage::CodeSigning => extension.code_signing(),
                ExtendedKeyUsage::EmailProtection => extension.email_protection(),
                ExtendedKeyUsage::TimeStamping => extension.time_stamping(),
                ExtendedKeyUsage::OcspSigning => extension.other("OCSPSigning"),
                ExtendedKeyUsage::Other(oid) => extension.other(oid),
            };
        }
        let extension = extension.build().map_err(|_| {
            VaultsmithError::configuration(
                "certificate.extended_key_usage",
                format!("unsupported extended key usage in {:?}", properties.extended_key_usage),
            )
        })?;
        builder
            .append_extension(extension)
            .map_err(ssl("add extended key usage"))?;
    }

    if properties.subject_key_identifier {
        let mut extension = SubjectKeyIdentifier::new();
        if properties.subject_key_identifier_critical {
            extension.critical();
        }
        let extension = extension
            .build(&builder.x509v3_context(issuer_cert, None))
            .map_err(ssl("build subject key identifier"))?;
        builder
            .append_extension(extension)
            .map_err(ssl("add subject key identifier"))?;
    }

    if properties.authority_key_identifier {
        let mut extension = AuthorityKeyIdentifier::new();
        extension.keyid(false);
        if properties.authority_key_identifier_critical {
            extension.critical();
        }
        let extension = extension
            .build(&builder.x509v3_context(issuer_cert, None))
            .map_err(ssl("build authority key identifier"))?;
        builder
            .append_extension(extension)
            .map_err(ssl("add authority key identifier"))?;
    }

    if !sans.is_empty() {
        let mut extension = SubjectAlternativeName::new();
        if properties.subject_alt_names_critical {
            extension.critical();
        }
        for entry in sans {
            match entry {
                SanEntry::Dns(value) => extension.dns(value),
                SanEntry::Uri(value) => extension.uri(value),
                SanEntry::Ip(value) => extension.ip(value),
                SanEntry::Email(value) => extension.email(value),
            };
        }
        let extension = extension
            .build(&builder.x509v3_context(issuer_cert, None))
            .map_err(|_| {
                VaultsmithError::configuration(
                    "certificate.subject_alt_names",
                    format!("invalid subject alternative names {:?}", properties.subject_alt_names),
                )
            })?;
        builder
            .append_extension(extension)
            .map_err(ssl("add subject alternative name"))?;
    }

    let signing_key: &PKeyRef<Private> = match ca {
        Some(ca) => ca.private_key(),
        None => private_key,
    };
    builder
        .sign(signing_key, MessageDigest::sha256())
        .map_err(ssl("sign certificate"))?;

    Ok(builder.build())
}

fn parse_der(der: &[u8]) -> VaultsmithResult<X509Certificate<'_>> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, certificate)| certificate)
        .map_err(|e| VaultsmithError::certificate_parse(e.to_string()))
}

fn tracked_extensions() -> Vec<(&'static str, Oid<'static>)> {
    vec![
        ("authority key identifier", OID_X509_EXT_AUTHORITY_KEY_IDENTIFIER),
        ("subject key identifier", OID_X509_EXT_SUBJECT_KEY_IDENTIFIER),
        ("key usage", OID_X509_EXT_KEY_USAGE),
        ("extended key usage", OID_X509_EXT_EXTENDED_KEY_USAGE),
        ("basic constraints", OID_X509_EXT_BASIC_CONSTRAINTS),
        ("subject alternative name", OID_X509_EXT_SUBJECT_ALT_NAME),
    ]
}

fn find_extension<'a, 'b>(
    certificate: &'b X509Certificate<'a>,
    oid: &Oid<'static>,
) -> Option<&'b X509Extension<'a>> {
    certificate.extensions().iter().find(|extension| extension.oid == *oid)
}

fn describe_extension(extension: Option<&X509Extension<'_>>) -> String {
    match extension {
        Some(extension) => format!("{:?}", extension.parsed_extension()),
        None => "absent".to_string(),
    }
}

/// First difference between the existing and expected certificates
fn mismatch_reason(
    existing: &X509,
    expected: &X509,
    ca: Option<&CertificateAuthority>,
    now: i64,
) -> VaultsmithResult<Option<String>> {
    let existing_der = existing
        .to_der()
        .map_err(ssl("encode existing certificate"))?;
    let expected_der = expected
        .to_der()
        .map_err(ssl("encode expected certificate"))?;
    let current = parse_der(&existing_der)?;
    let wanted = parse_der(&expected_der)?;

    if current.subject().as_raw() != wanted.subject().as_raw() {
        return Ok(Some(format!(
            "subject does not match: current '{}' expected '{}'",
            current.subject(),
            wanted.subject()
        )));
    }
    if current.issuer().as_raw() != wanted.issuer().as_raw() {
        return Ok(Some(format!(
            "issuer does not match: current '{}' expected '{}'",
            current.issuer(),
            wanted.issuer()
        )));
    }
    if let Some(ca) = ca {
        let issuer_key = ca
            .certificate()
            .public_key()
            .map_err(ssl("read CA public key"))?;
        if !existing.verify(&issuer_key).unwrap_or(false) {
            return Ok(Some("certificate is not signed by the issuer".to_string()));
        }
    }
    if current.public_key().raw != wanted.public_key().raw {
        return Ok(Some(
            "public key does not match the private key".to_string(),
        ));
    }

    for (label, oid) in tracked_extensions() {
        let current_extension = find_extension(&current, &oid);
        let wanted_extension = find_extension(&wanted, &oid);
        match (current_extension, wanted_extension) {
            (None, None) => continue,
            (Some(c), Some(w)) if c.value == w.value => {
                if c.critical != w.critical {
                    return Ok(Some(format!(
                        "{} criticality does not match: current {} expected {}",
                        label, c.critical, w.critical
                    )));
                }
            }
            (c, w) => {
                return Ok(Some(format!(
                    "{} does not match: current {} expected {}",
                    label,
                    describe_extension(c),
                    describe_extension(w)
                )))
            }
        }
    }

    let validity = current.validity();
    if validity.not_after.timestamp() < now {
        return Ok(Some("certificate is expired".to_string()));
    }
    if validity.not_before.timestamp() > now {
        return Ok(Some("certificate is not valid yet".to_string()));
    }
    if let Some(ca) = ca {
        if validity.not_after.timestamp() > ca.not_after_timestamp()? {
            return Ok(Some(
                "certificate validity extends beyond its issuer's validity".to_string(),
            ));
        }
    }

    Ok(None)
}

fn pem_string(certificate: &X509) -> VaultsmithResult<String> {
    let pem = certificate
        .to_pem()
        .map_err(ssl("encode certificate"))?;
    String::from_utf8(pem).map_err(|e| VaultsmithError::internal(format!("PEM is not UTF-8: {}", e)))
}

/// Reconcile in-memory certificate content against `properties`
pub fn ensure_certificate_content(
    private_key: &PKeyRef<Private>,
    properties: &CertificateProperties,
    existing: Option<&str>,
    ca: Option<&CertificateAuthority>,
) -> VaultsmithResult<GeneratedCertificate> {
    let sans = validate_properties(properties, ca)?;
    let now = chrono::Utc::now().timestamp();

    if let Some(ca) = ca {
        let expected_not_after = now + i64::from(properties.not_valid_after_days) * SECONDS_PER_DAY;
        if ca.not_after_timestamp()? < expected_not_after {
            return Err(VaultsmithError::configuration(
                "certificate.not_valid_after_days",
                format!(
                    "certificate authority expires before the requested {} day validity",
                    properties.not_valid_after_days
                ),
            ));
        }
    }

    let expected = build_expected(private_key, properties, &sans, ca)?;

    // Only the leaf is kept: an existing file may hold the full chain
    let (certificate, reason) = match existing.filter(|content| !content.trim().is_empty()) {
        None => (expected, Some("certificate_content is empty".to_string())),
        Some(content) => match X509::from_pem(content.as_bytes()) {
            Err(e) => (expected, Some(format!("certificate_content is invalid: {}", e))),
            Ok(current) => match mismatch_reason(&current, &expected, ca, now)? {
                Some(reason) => (expected, Some(reason)),
                None => (current, None),
            },
        },
    };

    let generated = reason.is_some();
    let pem = pem_string(&certificate)?;
    let full_chain_pem = match ca {
        Some(ca) => format!("{}{}", pem, ca.certificate_pem()?),
        None => pem.clone(),
    };

    if let Some(reason) = &reason {
        debug!("Signing new certificate: {}", reason);
    }

    Ok(GeneratedCertificate {
        certificate,
        pem,
        full_chain_pem,
        generated,
        reason,
    })
}

/// Reconcile a certificate per `properties`, reading and writing `properties.path`
pub async fn ensure_certificate(
    private_key: &PKeyRef<Private>,
    properties: &CertificateProperties,
    ca: Option<&CertificateAuthority>,
) -> VaultsmithResult<GeneratedCertificate> {
    let existing = match (&properties.path, &properties.content) {
        (Some(_), Some(_)) => {
            return Err(VaultsmithError::configuration(
                "certificate",
                "certificate_path and certificate_content are mutually exclusive",
            ))
        }
        (Some(path), None) => {
            if path.is_dir() {
                return Err(VaultsmithError::configuration(
                    "certificate",
                    format!("certificate_path {} is a directory", path.display()),
                ));
            }
            match tokio::fs::read_to_string(path).await {
                Ok(content) => Some(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(VaultsmithError::io(format!("read {}", path.display()), e)),
            }
        }
        (None, content) => content.clone(),
    };

    let result = ensure_certificate_content(private_key, properties, existing.as_deref(), ca)?;

    if result.generated {
        info!(
            "Issued certificate for {:?}: {}",
            properties.name,
            result.reason.as_deref().unwrap_or("unknown reason")
        );
        if let Some(path) = &properties.path {
            super::write_public_file(path, result.full_chain_pem.as_bytes()).await?;
        }
    }

    Ok(result)
}
