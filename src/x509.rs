// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Parse X.509 certificates without shelling out to openssl.

use crate::error::{Error, Result};
use x509_parser::oid_registry::{
    Oid, OID_PKCS1_RSASSAPSS, OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA384WITHRSA,
    OID_PKCS1_SHA512WITHRSA, OID_SIG_ECDSA_WITH_SHA256, OID_SIG_ECDSA_WITH_SHA384,
    OID_SIG_ED25519,
};
use x509_parser::prelude::*;

#[derive(Debug, Clone)]
pub struct CertInfo {
    pub not_after_timestamp: i64,
    pub not_before_timestamp: i64,
    pub common_name: Option<String>,
    pub subject: String,
    pub issuer: String,
    /// Lower-case hex of the DER serial number.
    pub serial: String,
    /// SAN entries in certificate order, e.g. `DNS:localhost`, `IP:::1`.
    pub subject_alt_names: Vec<String>,
    pub san_critical: bool,
    pub is_ca: bool,
    pub path_len_constraint: Option<u32>,
    pub basic_constraints_critical: bool,
    /// EKU present and restricted to TLS server authentication.
    pub server_auth_only: bool,
    pub eku_critical: bool,
    /// Outer signature algorithm, by short name when known.
    pub signature_algorithm: String,
}

impl CertInfo {
    pub fn expiry_string(&self) -> String {
        match ::time::OffsetDateTime::from_unix_timestamp(self.not_after_timestamp) {
            Ok(dt) => format!("{}-{:02}-{:02}", dt.year(), dt.month() as u8, dt.day()),
            Err(_) => "Invalid date".to_string(),
        }
    }

    pub fn days_remaining(&self) -> i64 {
        let now = ::time::OffsetDateTime::now_utc();
        match ::time::OffsetDateTime::from_unix_timestamp(self.not_after_timestamp) {
            Ok(expiry) => (expiry - now).whole_days(),
            Err(_) => -1, // Treat invalid timestamps as expired
        }
    }

    pub fn is_expired(&self) -> bool {
        self.days_remaining() < 0
    }

    pub fn validity_days(&self) -> i64 {
        (self.not_after_timestamp - self.not_before_timestamp) / 86_400
    }
}

pub fn parse_cert_pem(pem_str: &str) -> Result<CertInfo> {
    let pem = ::pem::parse(pem_str)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM: {}", e)))?;

    if pem.tag() != "CERTIFICATE" {
        return Err(Error::CertParse(format!(
            "Expected CERTIFICATE, got {}",
            pem.tag()
        )));
    }

    parse_cert_der(pem.contents())
}

pub fn parse_cert_der(der: &[u8]) -> Result<CertInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let mut info = CertInfo {
        not_after_timestamp: cert.validity().not_after.timestamp(),
        not_before_timestamp: cert.validity().not_before.timestamp(),
        common_name,
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: hex::encode(cert.raw_serial()),
        subject_alt_names: Vec::new(),
        san_critical: false,
        is_ca: false,
        path_len_constraint: None,
        basic_constraints_critical: false,
        server_auth_only: false,
        eku_critical: false,
        signature_algorithm: signature_algorithm_name(&cert.signature_algorithm.algorithm),
    };

    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => {
                info.san_critical = ext.critical;
                for name in &san.general_names {
                    if let Some(rendered) = render_general_name(name) {
                        info.subject_alt_names.push(rendered);
                    }
                }
            }
            ParsedExtension::BasicConstraints(bc) => {
                info.basic_constraints_critical = ext.critical;
                info.is_ca = bc.ca;
                info.path_len_constraint = bc.path_len_constraint;
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                info.eku_critical = ext.critical;
                info.server_auth_only = eku.server_auth
                    && !eku.any
                    && !eku.client_auth
                    && !eku.code_signing
                    && !eku.email_protection
                    && !eku.time_stamping
                    && !eku.ocsp_signing
                    && eku.other.is_empty();
            }
            _ => {}
        }
    }

    Ok(info)
}

/// Verify a self-signed certificate against its own public key.
pub fn verify_self_signed(der: &[u8]) -> Result<()> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::CertParse(format!("Invalid X.509: {}", e)))?;
    cert.verify_signature(None)
        .map_err(|e| Error::CertParse(format!("Signature verification failed: {}", e)))
}

fn render_general_name(name: &GeneralName<'_>) -> Option<String> {
    match name {
        GeneralName::DNSName(dns) => Some(format!("DNS:{}", dns)),
        GeneralName::URI(uri) => Some(format!("URI:{}", uri)),
        GeneralName::IPAddress(ip_bytes) if ip_bytes.len() == 4 => {
            let octets = <[u8; 4]>::try_from(*ip_bytes).ok()?;
            Some(format!("IP:{}", std::net::Ipv4Addr::from(octets)))
        }
        GeneralName::IPAddress(ip_bytes) if ip_bytes.len() == 16 => {
            let octets = <[u8; 16]>::try_from(*ip_bytes).ok()?;
            Some(format!("IP:{}", std::net::Ipv6Addr::from(octets)))
        }
        GeneralName::RegisteredID(oid) => Some(format!("RID:{}", oid.to_id_string())),
        GeneralName::OtherName(oid, _) => Some(format!("othername:{}", oid.to_id_string())),
        _ => None,
    }
}

fn signature_algorithm_name(oid: &Oid<'_>) -> String {
    let known = [
        (OID_PKCS1_SHA256WITHRSA, "sha256WithRSAEncryption"),
        (OID_PKCS1_SHA384WITHRSA, "sha384WithRSAEncryption"),
        (OID_PKCS1_SHA512WITHRSA, "sha512WithRSAEncryption"),
        (OID_PKCS1_RSASSAPSS, "rsassaPss"),
        (OID_SIG_ECDSA_WITH_SHA256, "ecdsa-with-SHA256"),
        (OID_SIG_ECDSA_WITH_SHA384, "ecdsa-with-SHA384"),
        (OID_SIG_ED25519, "ED25519"),
    ];
    known
        .iter()
        .find(|(candidate, _)| candidate == oid)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| oid.to_id_string())
}
