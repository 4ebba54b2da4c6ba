// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Read a rendered OpenSSL-style request config into certificate parameters.
//!
//! Only the subset the built-in templates use is understood: the `[req]`
//! pointers, a prompt-less distinguished-name section, and
//! `basicConstraints`, `keyUsage`, `extendedKeyUsage` and `subjectAltName`
//! in the extensions section.

use crate::error::{Error, Result};
use crate::san::{AltName, SanKind};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;

/// OID for PKCS#9 emailAddress.
const EMAIL_ADDRESS_OID: &[u64] = &[1, 2, 840, 113549, 1, 9, 1];

/// Ordered sections of an INI-style config.
#[derive(Debug, Default)]
struct ConfigSections {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl ConfigSections {
    fn parse(text: &str) -> Result<Self> {
        let mut parsed = Self::default();
        let mut current = String::from("default");
        parsed.sections.push((current.clone(), Vec::new()));

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| {
                    Error::Configuration(format!(
                        "line {}: unterminated section header",
                        lineno + 1
                    ))
                })?;
                current = name.trim().to_string();
                parsed.sections.push((current.clone(), Vec::new()));
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Configuration(format!(
                    "line {}: expected 'key = value', got '{}'",
                    lineno + 1,
                    line
                ))
            })?;
            let section = parsed.sections.iter_mut().rev().find(|(n, _)| *n == current);
            if let Some((_, entries)) = section {
                entries.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        Ok(parsed)
    }

    fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entries)| entries.as_slice())
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Drop `#` comments and `;` comment lines; `\#` and `\\` are literal.
fn strip_comment(line: &str) -> String {
    if line.trim_start().starts_with(';') {
        return String::new();
    }
    let mut kept = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => kept.push(chars.next().unwrap_or('\\')),
            '#' => break,
            _ => kept.push(c),
        }
    }
    kept
}

/// Certificate parameters described by a rendered config.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub subject: Vec<(DnType, String)>,
    pub common_name: String,
    pub is_ca: IsCa,
    pub key_usages: Vec<KeyUsagePurpose>,
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
    pub alt_names: Vec<AltName>,
}

impl RequestProfile {
    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&crate::fs::read_to_string(path)?)
    }

    pub fn parse(config: &str) -> Result<Self> {
        let sections = ConfigSections::parse(config)?;

        let dn_section = sections
            .get("req", "distinguished_name")
            .ok_or_else(|| Error::Configuration("[req] has no distinguished_name".into()))?;
        let dn_entries = sections.section(dn_section).ok_or_else(|| {
            Error::Configuration(format!("section [{}] not found", dn_section))
        })?;

        let mut subject = Vec::new();
        let mut common_name = None;
        for (key, value) in dn_entries {
            if value.is_empty() {
                continue;
            }
            let dn_type = match key.as_str() {
                "C" | "countryName" => DnType::CountryName,
                "ST" | "stateOrProvinceName" => DnType::StateOrProvinceName,
                "L" | "localityName" => DnType::LocalityName,
                "O" | "organizationName" => DnType::OrganizationName,
                "OU" | "organizationalUnitName" => DnType::OrganizationalUnitName,
                "CN" | "commonName" => {
                    common_name = Some(value.clone());
                    DnType::CommonName
                }
                "emailAddress" => DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()),
                other => {
                    return Err(Error::Configuration(format!(
                        "unsupported distinguished name field '{}'",
                        other
                    )))
                }
            };
            subject.push((dn_type, value.clone()));
        }
        let common_name = common_name.ok_or(Error::MissingRequiredField("CN"))?;

        let mut profile = Self {
            subject,
            common_name,
            is_ca: IsCa::NoCa,
            key_usages: Vec::new(),
            extended_key_usages: Vec::new(),
            alt_names: Vec::new(),
        };

        let ext_section = sections
            .get("req", "req_extensions")
            .or_else(|| sections.get("req", "x509_extensions"));
        if let Some(ext_section) = ext_section {
            let entries = sections.section(ext_section).ok_or_else(|| {
                Error::Configuration(format!("section [{}] not found", ext_section))
            })?;
            for (key, value) in entries {
                match key.as_str() {
                    "basicConstraints" => profile.is_ca = parse_basic_constraints(value)?,
                    "keyUsage" => profile.key_usages = parse_key_usage(value)?,
                    "extendedKeyUsage" => {
                        profile.extended_key_usages = parse_extended_key_usage(value)?
                    }
                    "subjectAltName" => profile.alt_names = parse_san_value(&sections, value)?,
                    other => tracing::debug!(extension = other, "Ignoring unsupported extension"),
                }
            }
        }

        Ok(profile)
    }

    pub fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        for (dn_type, value) in &self.subject {
            dn.push(dn_type.clone(), value.as_str());
        }
        dn
    }

    pub fn is_ca(&self) -> bool {
        matches!(self.is_ca, IsCa::Ca(_))
    }

    pub fn san_entries(&self) -> Result<Vec<SanType>> {
        self.alt_names.iter().map(san_type).collect()
    }

    /// Parameters for a signing request: subject and SAN only.
    pub fn request_params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.distinguished_name();
        params.subject_alt_names = self.san_entries()?;
        Ok(params)
    }

    /// Overwrite the extension-bearing fields of `params` with this profile.
    pub fn apply_extensions(&self, params: &mut CertificateParams) -> Result<()> {
        params.is_ca = self.is_ca.clone();
        params.key_usages = self.key_usages.clone();
        params.extended_key_usages = self.extended_key_usages.clone();
        params.subject_alt_names = self.san_entries()?;
        Ok(())
    }
}

fn split_values(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn parse_basic_constraints(value: &str) -> Result<IsCa> {
    let mut ca = None;
    let mut path_len = None;
    for item in split_values(value) {
        if item.eq_ignore_ascii_case("critical") {
            continue;
        }
        match item.split_once(':') {
            Some((k, v)) if k.eq_ignore_ascii_case("CA") => {
                ca = Some(v.trim().eq_ignore_ascii_case("true"));
            }
            Some((k, v)) if k.eq_ignore_ascii_case("pathlen") => {
                path_len = Some(v.trim().parse::<u8>().map_err(|_| {
                    Error::Configuration(format!("invalid pathlen '{}'", v.trim()))
                })?);
            }
            _ => {
                return Err(Error::Configuration(format!(
                    "unsupported basicConstraints value '{}'",
                    item
                )))
            }
        }
    }
    Ok(match (ca, path_len) {
        (Some(true), Some(n)) => IsCa::Ca(BasicConstraints::Constrained(n)),
        (Some(true), None) => IsCa::Ca(BasicConstraints::Unconstrained),
        (Some(false), _) => IsCa::ExplicitNoCa,
        (None, _) => IsCa::NoCa,
    })
}

fn parse_key_usage(value: &str) -> Result<Vec<KeyUsagePurpose>> {
    split_values(value)
        .filter(|v| !v.eq_ignore_ascii_case("critical"))
        .map(|v| match v {
            "digitalSignature" => Ok(KeyUsagePurpose::DigitalSignature),
            "nonRepudiation" | "contentCommitment" => Ok(KeyUsagePurpose::ContentCommitment),
            "keyEncipherment" => Ok(KeyUsagePurpose::KeyEncipherment),
            "dataEncipherment" => Ok(KeyUsagePurpose::DataEncipherment),
            "keyAgreement" => Ok(KeyUsagePurpose::KeyAgreement),
            "keyCertSign" => Ok(KeyUsagePurpose::KeyCertSign),
            "cRLSign" => Ok(KeyUsagePurpose::CrlSign),
            "encipherOnly" => Ok(KeyUsagePurpose::EncipherOnly),
            "decipherOnly" => Ok(KeyUsagePurpose::DecipherOnly),
            other => Err(Error::Configuration(format!(
                "unsupported keyUsage '{}'",
                other
            ))),
        })
        .collect()
}

fn parse_extended_key_usage(value: &str) -> Result<Vec<ExtendedKeyUsagePurpose>> {
    split_values(value)
        .filter(|v| !v.eq_ignore_ascii_case("critical"))
        .map(|v| match v {
            "serverAuth" => Ok(ExtendedKeyUsagePurpose::ServerAuth),
            "clientAuth" => Ok(ExtendedKeyUsagePurpose::ClientAuth),
            "codeSigning" => Ok(ExtendedKeyUsagePurpose::CodeSigning),
            "emailProtection" => Ok(ExtendedKeyUsagePurpose::EmailProtection),
            "timeStamping" => Ok(ExtendedKeyUsagePurpose::TimeStamping),
            "OCSPSigning" => Ok(ExtendedKeyUsagePurpose::OcspSigning),
            other => Err(Error::Configuration(format!(
                "unsupported extendedKeyUsage '{}'",
                other
            ))),
        })
        .collect()
}

fn parse_san_value(sections: &ConfigSections, value: &str) -> Result<Vec<AltName>> {
    let mut names = Vec::new();
    for item in split_values(value) {
        if let Some(section) = item.strip_prefix('@') {
            let entries = sections.section(section.trim()).ok_or_else(|| {
                Error::Configuration(format!("section [{}] not found", section.trim()))
            })?;
            for (key, value) in entries {
                let tag = key.split('.').next().unwrap_or(key);
                names.push(tagged_alt_name(tag, value)?);
            }
        } else {
            let (tag, value) = item.split_once(':').ok_or_else(|| {
                Error::Configuration(format!("invalid subjectAltName entry '{}'", item))
            })?;
            names.push(tagged_alt_name(tag.trim(), value.trim())?);
        }
    }
    Ok(names)
}

fn tagged_alt_name(tag: &str, value: &str) -> Result<AltName> {
    if tag.eq_ignore_ascii_case("DNS") {
        Ok(AltName::dns(value))
    } else if tag.eq_ignore_ascii_case("IP") {
        Ok(AltName::ip(value))
    } else {
        Err(Error::Configuration(format!(
            "unsupported subjectAltName type '{}'",
            tag
        )))
    }
}

fn san_type(name: &AltName) -> Result<SanType> {
    match name.kind {
        SanKind::Dns => Ok(SanType::DnsName(name.value.clone().try_into().map_err(
            |_| Error::Configuration(format!("invalid DNS name '{}'", name.value)),
        )?)),
        SanKind::Ip => name
            .value
            .parse::<IpAddr>()
            .map(SanType::IpAddress)
            .map_err(|_| Error::Configuration(format!("invalid IP address '{}'", name.value))),
    }
}
