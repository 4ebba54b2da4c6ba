// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! PEM bundle and PKCS#12 packaging for issued certificates.

use crate::ca::{decrypt_key_pem, CertificateAuthority};
use crate::error::{Error, Result};
use crate::fs::{atomic_write, atomic_write_secret};
use crate::issue::IssuedCertificate;
use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// A post-export check that did not pass. Never fails the export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationWarning {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for VerificationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub written: Vec<PathBuf>,
    pub warnings: Vec<VerificationWarning>,
}

pub struct ExportPackager<'a> {
    ca: &'a CertificateAuthority,
    pfx_password: &'a str,
}

impl<'a> ExportPackager<'a> {
    pub fn new(ca: &'a CertificateAuthority, pfx_password: &'a str) -> Self {
        Self { ca, pfx_password }
    }

    /// Write `{name}.pem`, `{name}.pfx` and `{name}.p12`, then verify them.
    pub fn package(&self, cert: &IssuedCertificate) -> Result<ExportReport> {
        let mut report = ExportReport::default();
        let ca_der = self.ca.cert_der()?;

        let bundle = format!("{}{}", cert.cert_pem, cert.encrypted_key_pem);
        atomic_write_secret(&cert.files.pem, bundle.as_bytes())?;
        report.written.push(cert.files.pem.clone());

        // Two separate containers: each write draws fresh salts.
        for path in [&cert.files.pfx, &cert.files.p12] {
            let data = build_pkcs12(cert, &ca_der, self.pfx_password)?;
            atomic_write(path, &data)?;
            report.written.push(path.clone());
        }

        for path in [&cert.files.pfx, &cert.files.p12] {
            report
                .warnings
                .extend(verify_pkcs12(path, cert, self.pfx_password));
        }
        report.warnings.extend(verify_private_key(cert));

        for warning in &report.warnings {
            tracing::warn!(name = %cert.name, "{}", warning);
        }
        tracing::debug!(name = %cert.name, files = report.written.len(), "Exported certificate");
        Ok(report)
    }
}

/// Local key id linking the key bag to the leaf certificate bag.
pub fn local_key_id(cert_der: &[u8]) -> Vec<u8> {
    Sha256::digest(cert_der).to_vec()
}

/// PKCS#12 container with the leaf key, the leaf certificate and the CA.
pub fn build_pkcs12(cert: &IssuedCertificate, ca_der: &[u8], password: &str) -> Result<Vec<u8>> {
    let leaf = Certificate::from_der(&cert.cert_der)
        .map_err(|e| Error::Pkcs12Export(format!("Failed to parse certificate DER: {}", e)))?;
    let mut chain = vec![leaf];
    // A self-signed entity is its own chain.
    if cert.cert_der != ca_der && cert.cert_type != crate::config::CertType::Ca {
        chain.push(
            Certificate::from_der(ca_der)
                .map_err(|e| Error::Pkcs12Export(format!("Failed to parse CA DER: {}", e)))?,
        );
    }

    let key_chain = PrivateKeyChain::new(
        cert.key_der.as_slice(),
        local_key_id(&cert.cert_der),
        chain,
    );
    let mut keystore = KeyStore::new();
    keystore.add_entry(
        &cert.friendly_name,
        KeyStoreEntry::PrivateKeyChain(key_chain),
    );

    keystore
        .writer(password)
        .write()
        .map_err(|e| Error::Pkcs12Export(format!("Failed to create PKCS12: {}", e)))
}

/// Open a PKCS#12 file and return its keystore.
pub fn open_pkcs12(path: &Path, password: &str) -> Result<KeyStore> {
    let data = crate::fs::read_bytes(path)?;
    KeyStore::from_pkcs12(&data, password).map_err(|e| Error::Pkcs12Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn verify_pkcs12(
    path: &Path,
    cert: &IssuedCertificate,
    password: &str,
) -> Option<VerificationWarning> {
    let warn = |message: String| {
        Some(VerificationWarning {
            path: path.to_path_buf(),
            message,
        })
    };

    let keystore = match open_pkcs12(path, password) {
        Ok(keystore) => keystore,
        Err(e) => return warn(format!("container cannot be read back: {}", e)),
    };
    let Some((alias, chain)) = keystore.private_key_chain() else {
        return warn("container holds no private key".to_string());
    };

    if alias != cert.friendly_name && chain.local_key_id() != local_key_id(&cert.cert_der) {
        return warn(format!(
            "neither friendly name '{}' nor local key id found",
            cert.friendly_name
        ));
    }
    match chain.chain().first() {
        Some(leaf) if leaf.as_der() == cert.cert_der.as_slice() => None,
        Some(_) => warn("leaf certificate differs from the issued certificate".to_string()),
        None => warn("container holds no certificate".to_string()),
    }
}

fn verify_private_key(cert: &IssuedCertificate) -> Option<VerificationWarning> {
    let warn = |message: String| {
        Some(VerificationWarning {
            path: cert.files.key.clone(),
            message,
        })
    };

    let key_pem = match decrypt_key_pem(&cert.encrypted_key_pem, &cert.key_password) {
        Ok(pem) => zeroize::Zeroizing::new(pem),
        Err(e) => return warn(format!("private key does not open with its password: {}", e)),
    };
    let key_pair = match rcgen::KeyPair::from_pem(&key_pem) {
        Ok(key_pair) => key_pair,
        Err(e) => return warn(format!("private key is unreadable: {}", e)),
    };

    let parsed = match x509_parser::parse_x509_certificate(&cert.cert_der) {
        Ok((_, parsed)) => parsed,
        Err(e) => return warn(format!("certificate is unreadable: {}", e)),
    };
    let cert_key = parsed.public_key().subject_public_key.data.as_ref();
    if cert_key == key_pair.public_key_raw() {
        None
    } else {
        warn("private key does not match the certificate".to_string())
    }
}
