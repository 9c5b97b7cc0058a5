// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Self-signed loopback certificate generation.

use crate::error::{Error, Result};
use pkcs8::ObjectIdentifier;
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa, KeyPair, SerialNumber,
    SignatureAlgorithm, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use x509_parser::parse_x509_certificate;

/// Maximum certificate validity period (10 years).
pub const MAX_CERT_DAYS: u32 = 3650;

/// Modulus size for the listener identity.
pub const RSA_KEY_BITS: usize = 2048;

/// Algorithm used for both signing passes unless the caller asks otherwise.
pub static DEFAULT_SIGNING_ALGORITHM: &SignatureAlgorithm = &PKCS_RSA_SHA256;

const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];

// GeneralName context tags (implicit, primitive).
const TAG_DNS_NAME: u8 = 0x82;
const TAG_URI: u8 = 0x86;
const TAG_IP_ADDRESS: u8 = 0x87;
const TAG_REGISTERED_ID: u8 = 0x88;
const TAG_SEQUENCE: u8 = 0x30;

/// BasicConstraints: cA omitted (FALSE), pathLenConstraint 0.
const BASIC_CONSTRAINTS_END_ENTITY: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x00];

/// ExtKeyUsageSyntax holding only id-kp-serverAuth (1.3.6.1.5.5.7.3.1).
const EKU_SERVER_AUTH_ONLY: &[u8] = &[
    0x30, 0x0a, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x01,
];

/// Validate that the validity period is within allowed bounds.
///
/// # Errors
/// Returns an error if `days` is 0 or exceeds [`MAX_CERT_DAYS`].
pub fn validate_days(days: u32) -> Result<()> {
    if days == 0 {
        return Err(Error::InvalidDays("days cannot be 0".into()));
    }
    if days > MAX_CERT_DAYS {
        return Err(Error::InvalidDays(format!(
            "days cannot exceed {} (10 years)",
            MAX_CERT_DAYS
        )));
    }
    Ok(())
}

/// Private key material in PKCS#8 form.
///
/// The same key backs both signing passes; each pass binds it to a
/// signature algorithm through [`KeyMaterial::signing_key`].
pub struct KeyMaterial {
    pkcs8: PrivatePkcs8KeyDer<'static>,
}

impl KeyMaterial {
    /// Generate a fresh RSA key pair of the given size.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        let mut rng = rsa::rand_core::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| Error::KeyGen(format!("RSA-{} generation failed: {}", bits, e)))?;
        let document = private_key
            .to_pkcs8_der()
            .map_err(|e| Error::KeyGen(format!("PKCS#8 encoding failed: {}", e)))?;
        Ok(Self::from_pkcs8_der(document.as_bytes().to_vec()))
    }

    pub fn from_pkcs8_der(der: Vec<u8>) -> Self {
        Self {
            pkcs8: PrivatePkcs8KeyDer::from(der),
        }
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        self.pkcs8.secret_pkcs8_der()
    }

    pub fn signing_key(&self, algorithm: &'static SignatureAlgorithm) -> Result<KeyPair> {
        Ok(KeyPair::from_pkcs8_der_and_sign_algo(&self.pkcs8, algorithm)?)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(**redacted**)")
    }
}

/// One Subject Alternative Name entry, in `type:value` order of appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
    Uri(String),
    /// `other:<dotted-oid>`, encoded as a registeredID.
    RegisteredId(ObjectIdentifier),
}

impl SanEntry {
    pub fn parse(item: &str) -> Result<Self> {
        let (kind, value) = item
            .split_once(':')
            .ok_or_else(|| Error::malformed(item, "expected 'type:value'"))?;
        let value = value.trim();

        match kind.trim().to_ascii_lowercase().as_str() {
            "dns" => Ok(SanEntry::Dns(ia5_value(item, value)?)),
            "ip" => value
                .parse::<IpAddr>()
                .map(SanEntry::Ip)
                .map_err(|_| Error::malformed(item, "invalid IP address")),
            "uri" => Ok(SanEntry::Uri(ia5_value(item, value)?)),
            "other" => ObjectIdentifier::new(value)
                .map(SanEntry::RegisteredId)
                .map_err(|e| Error::malformed(item, format!("invalid OID: {}", e))),
            other => Err(Error::malformed(
                item,
                format!("unknown SAN type '{}' (expected dns, ip, uri or other)", other),
            )),
        }
    }

    /// DER encoding of this entry as a GeneralName.
    fn to_der(&self) -> Vec<u8> {
        match self {
            SanEntry::Dns(name) => der_tlv(TAG_DNS_NAME, name.as_bytes()),
            SanEntry::Uri(uri) => der_tlv(TAG_URI, uri.as_bytes()),
            SanEntry::Ip(IpAddr::V4(ip)) => der_tlv(TAG_IP_ADDRESS, &ip.octets()),
            SanEntry::Ip(IpAddr::V6(ip)) => der_tlv(TAG_IP_ADDRESS, &ip.octets()),
            SanEntry::RegisteredId(oid) => der_tlv(TAG_REGISTERED_ID, oid.as_bytes()),
        }
    }
}

/// DNS names and URIs are IA5Strings: non-blank printable ASCII.
fn ia5_value(item: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::malformed(item, "empty value"));
    }
    if !value.is_ascii() || value.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control())
    {
        return Err(Error::malformed(
            item,
            "value must be printable ASCII without whitespace",
        ));
    }
    Ok(value.to_string())
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// Non-critical SubjectAltName extension holding `entries` in order.
fn subject_alt_name_extension(entries: &[SanEntry]) -> CustomExtension {
    let names: Vec<u8> = entries.iter().flat_map(SanEntry::to_der).collect();
    CustomExtension::from_oid_content(OID_SUBJECT_ALT_NAME, der_tlv(TAG_SEQUENCE, &names))
}

/// Rendered the way OpenSSL prints SANs, e.g. `DNS:localhost`, `IP:127.0.0.1`.
impl fmt::Display for SanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanEntry::Dns(name) => write!(f, "DNS:{}", name),
            SanEntry::Ip(ip) => write!(f, "IP:{}", ip),
            SanEntry::Uri(uri) => write!(f, "URI:{}", uri),
            SanEntry::RegisteredId(oid) => write!(f, "RID:{}", oid),
        }
    }
}

/// Parse a comma-separated SAN list such as `dns:localhost,ip:127.0.0.1`.
pub fn parse_subject_alt_names(san: &str) -> Result<Vec<SanEntry>> {
    if san.trim().is_empty() {
        return Ok(Vec::new());
    }
    san.split(',').map(|item| SanEntry::parse(item.trim())).collect()
}

/// Parse an X.500-style name such as `CN=localhost, OU=remote-tls, O=remote-tls`.
pub fn parse_distinguished_name(dn: &str) -> Result<DistinguishedName> {
    let mut name = DistinguishedName::new();
    for rdn in dn.split(',') {
        let (key, value) = rdn
            .split_once('=')
            .ok_or_else(|| Error::malformed(dn, format!("RDN '{}' lacks '='", rdn.trim())))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::malformed(dn, format!("RDN '{}' is empty", rdn.trim())));
        }
        let dn_type = match key.trim().to_ascii_uppercase().as_str() {
            "CN" => DnType::CommonName,
            "OU" => DnType::OrganizationalUnitName,
            "O" => DnType::OrganizationName,
            "L" => DnType::LocalityName,
            "ST" => DnType::StateOrProvinceName,
            "C" => DnType::CountryName,
            other => {
                return Err(Error::malformed(
                    dn,
                    format!("unsupported attribute '{}'", other),
                ))
            }
        };
        name.push(dn_type, value);
    }
    Ok(name)
}

/// A finished self-signed certificate.
#[derive(Clone)]
pub struct SelfSignedCert {
    der: CertificateDer<'static>,
    pem: String,
}

impl SelfSignedCert {
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", der.clone()));
        Self {
            der: CertificateDer::from(der),
            pem,
        }
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Colon-separated upper-case SHA-256 fingerprint.
    pub fn fingerprint_sha256(&self) -> String {
        let digest = Sha256::digest(self.der.as_ref());
        digest
            .iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn info(&self) -> Result<crate::x509::CertInfo> {
        crate::x509::parse_cert_der(self.der.as_ref())
    }
}

impl fmt::Debug for SelfSignedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfSignedCert")
            .field("sha256", &self.fingerprint_sha256())
            .finish()
    }
}

/// Build and sign a self-signed server certificate.
///
/// `subject_alt_names` uses the `type:value[,type:value...]` syntax understood
/// by [`parse_subject_alt_names`]; `None` omits the extension.
///
/// The certificate is signed twice: the first pass only exists to learn which
/// algorithm identifier the signer records, the second pass signs with the key
/// bound to exactly that identifier so the TBS and outer algorithms agree.
pub fn generate_certificate(
    distinguished_name: &str,
    key: &KeyMaterial,
    validity_days: u32,
    algorithm: &'static SignatureAlgorithm,
    subject_alt_names: Option<&str>,
) -> Result<SelfSignedCert> {
    validate_days(validity_days)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = parse_distinguished_name(distinguished_name)?;

    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(validity_days as i64);
    params.serial_number = Some(random_serial());

    // Both extensions are emitted by hand: rcgen would mark the EKU non-critical
    // and cannot express a pathLenConstraint on a non-CA certificate.
    params.is_ca = IsCa::NoCa;
    let mut basic_constraints = CustomExtension::from_oid_content(
        OID_BASIC_CONSTRAINTS,
        BASIC_CONSTRAINTS_END_ENTITY.to_vec(),
    );
    basic_constraints.set_criticality(true);
    let mut eku =
        CustomExtension::from_oid_content(OID_EXT_KEY_USAGE, EKU_SERVER_AUTH_ONLY.to_vec());
    eku.set_criticality(true);
    params.custom_extensions = vec![basic_constraints, eku];

    // rcgen has no registeredID form, so the whole extension is encoded here.
    if let Some(san) = subject_alt_names {
        let entries = parse_subject_alt_names(san)?;
        if !entries.is_empty() {
            params
                .custom_extensions
                .push(subject_alt_name_extension(&entries));
        }
    }

    // First pass: materialize a signature to see what the signer records.
    let first = params.clone().self_signed(&key.signing_key(algorithm)?)?;
    let recorded = recorded_signature_algorithm(first.der())?;
    if recorded != algorithm {
        tracing::debug!(
            requested = ?algorithm,
            recorded = ?recorded,
            "signer recorded a different algorithm, re-binding key"
        );
    }

    // Second pass: declare and sign with the recorded algorithm.
    let cert = params.self_signed(&key.signing_key(recorded)?)?;
    ensure_algorithms_agree(cert.der())?;

    Ok(SelfSignedCert::from_der(cert.der().to_vec()))
}

/// Positive, non-zero 64-bit serial.
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 8] = rand::random();
    bytes[0] &= 0x7f;
    if bytes.iter().all(|b| *b == 0) {
        bytes[7] = 1;
    }
    SerialNumber::from_slice(&bytes)
}

fn recorded_signature_algorithm(der: &[u8]) -> Result<&'static SignatureAlgorithm> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;
    let arcs: Vec<u64> = cert
        .signature_algorithm
        .algorithm
        .iter()
        .ok_or_else(|| Error::CertParse("signature algorithm OID out of range".into()))?
        .collect();
    Ok(SignatureAlgorithm::from_oid(&arcs)?)
}

fn ensure_algorithms_agree(der: &[u8]) -> Result<()> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;
    let declared = &cert.tbs_certificate.signature.algorithm;
    let actual = &cert.signature_algorithm.algorithm;
    if declared != actual {
        return Err(Error::CertParse(format!(
            "declared signature algorithm {} does not match signature algorithm {}",
            declared.to_id_string(),
            actual.to_id_string()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static KEY: Lazy<KeyMaterial> =
        Lazy::new(|| KeyMaterial::generate_rsa(RSA_KEY_BITS).unwrap());

    const DN: &str = "CN=localhost, OU=remote-tls, O=remote-tls";

    #[test]
    fn test_validate_days() {
        assert!(validate_days(0).is_err());
        assert!(validate_days(MAX_CERT_DAYS + 1).is_err());
        assert!(validate_days(1).is_ok());
        assert!(validate_days(1825).is_ok());
    }

    #[test]
    fn test_parse_san_entries() {
        let entries =
            parse_subject_alt_names("dns:localhost, IP:::1,uri:https://127.0.0.1:8112").unwrap();
        assert_eq!(
            entries,
            vec![
                SanEntry::Dns("localhost".into()),
                SanEntry::Ip("::1".parse().unwrap()),
                SanEntry::Uri("https://127.0.0.1:8112".into()),
            ]
        );
    }

    #[test]
    fn test_parse_san_registered_id() {
        let entry = SanEntry::parse("other:1.3.6.1.4.1.99999.1").unwrap();
        assert_eq!(
            entry,
            SanEntry::RegisteredId(ObjectIdentifier::new("1.3.6.1.4.1.99999.1").unwrap())
        );
        assert_eq!(entry.to_string(), "RID:1.3.6.1.4.1.99999.1");
        assert!(SanEntry::parse("other:not-an-oid").is_err());
        assert!(SanEntry::parse("other:").is_err());
    }

    #[test]
    fn test_parse_san_trims_values() {
        let entries =
            parse_subject_alt_names("dns: localhost ,ip: 127.0.0.1,uri: https://[::1]:8112")
                .unwrap();
        assert_eq!(
            entries,
            vec![
                SanEntry::Dns("localhost".into()),
                SanEntry::Ip("127.0.0.1".parse().unwrap()),
                SanEntry::Uri("https://[::1]:8112".into()),
            ]
        );
    }

    #[test]
    fn test_parse_san_rejects_blank_or_inner_whitespace() {
        for bad in ["dns:", "dns:local host", "uri:https://a b", "dns:caf\u{e9}"] {
            let err = SanEntry::parse(bad).unwrap_err();
            assert!(matches!(err, Error::MalformedInput { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_parse_san_rejects_malformed() {
        for bad in ["badentry", "dns:localhost,badentry", "ip:localhost", "email:a@b.c"] {
            let err = parse_subject_alt_names(bad).unwrap_err();
            assert!(matches!(err, Error::MalformedInput { .. }), "{}", bad);
        }
        assert!(parse_subject_alt_names("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_distinguished_name() {
        assert!(parse_distinguished_name(DN).is_ok());
        assert!(parse_distinguished_name("CN=localhost, L=Paris, ST=IDF, C=FR").is_ok());
        assert!(matches!(
            parse_distinguished_name("localhost"),
            Err(Error::MalformedInput { .. })
        ));
        assert!(parse_distinguished_name("CN=").is_err());
        assert!(parse_distinguished_name("XX=foo").is_err());
    }

    #[test]
    fn test_generate_rejects_malformed_san_before_signing() {
        let err = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, Some("badentry"))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn test_generate_rejects_zero_days() {
        let err = generate_certificate(DN, &KEY, 0, DEFAULT_SIGNING_ALGORITHM, None).unwrap_err();
        assert!(matches!(err, Error::InvalidDays(_)));
    }

    #[test]
    fn test_generated_certificate_fields() {
        let before = ::time::OffsetDateTime::now_utc().unix_timestamp();
        let cert = generate_certificate(
            DN,
            &KEY,
            1825,
            DEFAULT_SIGNING_ALGORITHM,
            Some("dns:localhost,ip:127.0.0.1"),
        )
        .unwrap();
        let after = ::time::OffsetDateTime::now_utc().unix_timestamp();
        let info = cert.info().unwrap();

        assert!(info.not_before_timestamp <= after);
        assert!(info.not_before_timestamp >= before - 1);
        assert_eq!(
            info.not_after_timestamp - info.not_before_timestamp,
            1825 * 86_400
        );
        assert_eq!(info.common_name.as_deref(), Some("localhost"));
        assert_eq!(info.subject, info.issuer);
        assert_eq!(
            info.subject_alt_names,
            vec!["DNS:localhost".to_string(), "IP:127.0.0.1".to_string()]
        );
        assert!(!info.san_critical);
        assert!(!info.is_ca);
        assert_eq!(info.path_len_constraint, Some(0));
        assert!(info.basic_constraints_critical);
        assert!(info.server_auth_only);
        assert!(info.eku_critical);
        assert_eq!(info.signature_algorithm, "sha256WithRSAEncryption");
    }

    #[test]
    fn test_generated_certificate_carries_registered_id() {
        let cert = generate_certificate(
            DN,
            &KEY,
            30,
            DEFAULT_SIGNING_ALGORITHM,
            Some("dns:localhost,other:1.3.6.1.4.1.99999.1,ip:::1"),
        )
        .unwrap();
        let info = cert.info().unwrap();
        assert_eq!(
            info.subject_alt_names,
            vec![
                "DNS:localhost".to_string(),
                "RID:1.3.6.1.4.1.99999.1".to_string(),
                "IP:::1".to_string(),
            ]
        );
        assert!(!info.san_critical);
    }

    #[test]
    fn test_empty_san_list_omits_extension() {
        let cert = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, Some("")).unwrap();
        assert!(cert.info().unwrap().subject_alt_names.is_empty());
    }

    #[test]
    fn test_der_tlv_long_form_length() {
        let encoded = der_tlv(TAG_SEQUENCE, &[0u8; 200]);
        assert_eq!(&encoded[..3], &[0x30, 0x81, 200]);
        assert_eq!(encoded.len(), 203);
    }

    #[test]
    fn test_signature_verifies_with_own_key() {
        let cert = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, None).unwrap();
        crate::x509::verify_self_signed(cert.der().as_ref()).unwrap();
        ensure_algorithms_agree(cert.der().as_ref()).unwrap();
    }

    #[test]
    fn test_no_san_extension_when_absent() {
        let cert = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, None).unwrap();
        assert!(cert.info().unwrap().subject_alt_names.is_empty());
    }

    #[test]
    fn test_serials_are_random_and_positive() {
        let a = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, None).unwrap();
        let b = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, None).unwrap();
        let (sa, sb) = (a.info().unwrap().serial, b.info().unwrap().serial);
        assert_ne!(sa, sb);
        assert!(sa.len() <= 16);
    }

    #[test]
    fn test_fingerprint_format() {
        let cert = generate_certificate(DN, &KEY, 30, DEFAULT_SIGNING_ALGORITHM, None).unwrap();
        let fp = cert.fingerprint_sha256();
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.split(':').all(|b| b.len() == 2));
        assert!(cert.pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_debug_redacts_key() {
        assert_eq!(format!("{:?}", *KEY), "KeyMaterial(**redacted**)");
    }
}
