// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Parse X.509 certificates without shelling out to openssl.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use x509_parser::prelude::*;

#[derive(Debug, Clone)]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    pub common_name: Option<String>,
    pub serial_hex: String,
    pub not_before_timestamp: i64,
    pub not_after_timestamp: i64,
    pub subject_alt_names: Vec<String>,
    pub is_ca: bool,
    pub server_auth: bool,
    pub client_auth: bool,
    /// SHA-256 over the DER encoding, colon-separated uppercase hex.
    pub fingerprint: String,
}

impl CertInfo {
    /// Issuer and subject are the same name.
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Belongs in a root trust store: self-issued or a CA.
    pub fn is_trust_anchor(&self) -> bool {
        self.is_self_issued() || self.is_ca
    }

    /// Whole days between notBefore and notAfter.
    pub fn validity_days(&self) -> i64 {
        (self.not_after_timestamp - self.not_before_timestamp) / 86_400
    }
}

pub fn parse_cert_file(path: &Path) -> Result<CertInfo> {
    parse_cert_pem(&crate::fs::read_to_string(path)?)
}

/// Parse the first CERTIFICATE block of a PEM document.
pub fn parse_cert_pem(pem_str: &str) -> Result<CertInfo> {
    parse_cert_der(&cert_der_from_pem(pem_str)?)
}

/// DER bytes of the first CERTIFICATE block, skipping any key blocks.
pub fn cert_der_from_pem(pem_str: &str) -> Result<Vec<u8>> {
    let blocks = ::pem::parse_many(pem_str)
        .map_err(|e| Error::CertParse(format!("Failed to parse PEM: {}", e)))?;
    blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .ok_or_else(|| Error::CertParse("No CERTIFICATE block found".to_string()))
}

pub fn der_to_pem(der: &[u8]) -> String {
    ::pem::encode_config(
        &::pem::Pem::new("CERTIFICATE", der.to_vec()),
        ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
    )
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

    let mut subject_alt_names = Vec::new();
    let mut is_ca = false;
    let mut server_auth = false;
    let mut client_auth = false;

    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => subject_alt_names.push(dns.to_string()),
                        GeneralName::IPAddress(ip_bytes) => {
                            if let Ok(v4) = <[u8; 4]>::try_from(*ip_bytes) {
                                subject_alt_names.push(Ipv4Addr::from(v4).to_string());
                            } else if let Ok(v6) = <[u8; 16]>::try_from(*ip_bytes) {
                                subject_alt_names.push(Ipv6Addr::from(v6).to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            ParsedExtension::BasicConstraints(bc) => is_ca = bc.ca,
            ParsedExtension::ExtendedKeyUsage(eku) => {
                server_auth = eku.server_auth;
                client_auth = eku.client_auth;
            }
            _ => {}
        }
    }

    Ok(CertInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        common_name,
        serial_hex: cert.raw_serial_as_string(),
        not_before_timestamp: cert.validity().not_before.timestamp(),
        not_after_timestamp: cert.validity().not_after.timestamp(),
        subject_alt_names,
        is_ca,
        server_auth,
        client_auth,
        fingerprint: fingerprint(der),
    })
}

pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
