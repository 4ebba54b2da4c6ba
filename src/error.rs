// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing required setting: {0}")]
    MissingRequiredField(&'static str),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No '{cert_type}' template found at {path}. Run 'certforge init' to install the defaults.")]
    TemplateNotFound { cert_type: String, path: PathBuf },

    #[error("Template for '{cert_type}' rendered to an unusable configuration ({bytes} bytes)")]
    TemplateRender { cert_type: String, bytes: usize },

    #[error("'{name}' matches more than one certificate:\n{}", .candidates.join("\n"))]
    AmbiguousMatch {
        name: String,
        candidates: Vec<String>,
    },

    #[error("No certificate matching '{name}'. Available:\n{}", .available.join("\n"))]
    NotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("Unsupported certificate file extension: {0}")]
    UnsupportedExtension(String),

    #[error("Invalid certificate name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid validity period: {0}")]
    InvalidDays(String),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid path (non-UTF8): {0}")]
    InvalidPath(PathBuf),

    #[error("Certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("Failed to parse certificate: {0}")]
    CertParse(String),

    #[error("Failed to parse CSR: {0}")]
    CsrParse(String),

    #[error("Failed to export PKCS12: {0}")]
    Pkcs12Export(String),

    #[error("Failed to open PKCS12 container {path}: {reason}")]
    Pkcs12Open { path: PathBuf, reason: String },

    #[error("Incorrect password or corrupted encrypted key")]
    PasswordIncorrect,

    #[error("Key encryption failed: {0}")]
    KeyEncryption(String),

    #[error("Key decryption failed: {0}")]
    KeyDecryption(String),

    #[error("Serial number file {path} is corrupt: {reason}")]
    SerialCorrupt { path: PathBuf, reason: String },

    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    #[error("Trust store operation failed: {0}")]
    TrustStore(String),

    #[error("Command '{command}' not found.\n{hint}")]
    CommandNotFound { command: String, hint: String },

    #[error("Command failed: {command}\n{stderr}")]
    Command { command: String, stderr: String },
}

impl Error {
    /// Key, CSR, signing and packaging failures from the crypto layer.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Error::CertGen(_)
                | Error::CertParse(_)
                | Error::CsrParse(_)
                | Error::Pkcs12Export(_)
                | Error::Pkcs12Open { .. }
                | Error::PasswordIncorrect
                | Error::KeyEncryption(_)
                | Error::KeyDecryption(_)
                | Error::SerialCorrupt { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_match_lists_candidates() {
        let err = Error::AmbiguousMatch {
            name: "alpha".into(),
            candidates: vec!["  alpha-1.pfx".into(), "  alpha-2.pfx".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("alpha-1.pfx"));
        assert!(msg.contains("alpha-2.pfx"));
    }

    #[test]
    fn test_crypto_classification() {
        assert!(Error::PasswordIncorrect.is_crypto());
        assert!(Error::Pkcs12Export("x".into()).is_crypto());
        assert!(!Error::MissingRequiredField("CERT_CN").is_crypto());
        assert!(!Error::Privilege("denied".into()).is_crypto());
    }
}
