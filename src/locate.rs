// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Resolve a symbolic name to a certificate artifact in a store.

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Passwords tried, in order, when previewing a container's identity.
///
/// Used only to label candidates for a human; trust decisions always use the
/// operator's password.
pub const PREVIEW_PASSWORDS: &[&str] = &["", crate::config::DEFAULT_PASSWORD, "password"];

/// The root CA file that stores always expose next to the containers.
pub const CA_CERT_FILE: &str = "ca.crt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// `.pfx` / `.p12`: key, chain and friendly name.
    Pkcs12,
    /// `.crt` / `.pem` / `.cer`: certificate only.
    Certificate,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "pfx" | "p12" => Ok(ArtifactKind::Pkcs12),
            "crt" | "pem" | "cer" => Ok(ArtifactKind::Certificate),
            _ => Err(Error::UnsupportedExtension(path.display().to_string())),
        }
    }
}

/// One certificate file in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?
            .to_string();
        Ok(Self {
            kind: ArtifactKind::from_path(path)?,
            file_name,
            path: path.to_path_buf(),
        })
    }

    pub fn stem(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.file_name)
    }

    fn extension(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("")
    }

    /// Name equals the file name, or the stem of a `.pfx`/`.crt` file.
    pub fn matches_exactly(&self, name: &str) -> bool {
        let ext = self.extension();
        self.file_name == name
            || ((ext.eq_ignore_ascii_case("pfx") || ext.eq_ignore_ascii_case("crt"))
                && self.stem() == name)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name)
    }
}

/// Where certificates are read from.
pub trait CertificateSource {
    /// Human-readable location for messages.
    fn describe(&self) -> String;

    /// Installable artifacts, sorted by file name.
    fn list(&self) -> Result<Vec<Artifact>>;
}

/// A local or mounted directory of exported certificates.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CertificateSource for DirectorySource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn list(&self) -> Result<Vec<Artifact>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| Error::ReadDir {
            path: self.root.clone(),
            source: e,
        })?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::ReadDir {
                path: self.root.clone(),
                source: e,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(artifact) = Artifact::from_path(&path) else {
                continue;
            };
            if artifact.kind == ArtifactKind::Pkcs12 || artifact.file_name == CA_CERT_FILE {
                artifacts.push(artifact);
            }
        }
        artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(artifacts)
    }
}

/// Find the artifact for `name`: exact match first, then a unique partial match.
pub fn find(
    name: &str,
    source: &dyn CertificateSource,
    password: Option<&str>,
) -> Result<Artifact> {
    let artifacts = source.list()?;

    if let Some(exact) = artifacts.iter().find(|a| a.matches_exactly(name)) {
        tracing::debug!(name, artifact = %exact, "Exact match");
        return Ok(exact.clone());
    }

    let mut partial: Vec<&Artifact> = artifacts
        .iter()
        .filter(|a| a.file_name.contains(name))
        .collect();

    match partial.len() {
        1 => {
            let found = partial.remove(0);
            tracing::debug!(name, artifact = %found, "Partial match");
            Ok(found.clone())
        }
        0 => Err(Error::NotFound {
            name: name.to_string(),
            available: artifacts.iter().map(|a| format!("  {}", a)).collect(),
        }),
        _ => Err(Error::AmbiguousMatch {
            name: name.to_string(),
            candidates: partial
                .iter()
                .map(|a| describe_candidate(a, password))
                .collect(),
        }),
    }
}

/// Best-effort identity of an artifact, for display only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityPreview {
    pub common_name: Option<String>,
    pub friendly_name: Option<String>,
}

impl fmt::Display for IdentityPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(cn) = &self.common_name {
            parts.push(format!("CN={}", cn));
        }
        if let Some(friendly) = &self.friendly_name {
            parts.push(format!("friendly name={}", friendly));
        }
        f.write_str(&parts.join(", "))
    }
}

/// Try to read the Common Name and friendly name without knowing the password.
pub fn preview(artifact: &Artifact, password: Option<&str>) -> Option<IdentityPreview> {
    match artifact.kind {
        ArtifactKind::Certificate => {
            let info = crate::x509::parse_cert_file(&artifact.path).ok()?;
            Some(IdentityPreview {
                common_name: info.common_name,
                friendly_name: None,
            })
        }
        ArtifactKind::Pkcs12 => {
            let data = std::fs::read(&artifact.path).ok()?;
            password
                .into_iter()
                .chain(PREVIEW_PASSWORDS.iter().copied())
                .find_map(|candidate| {
                    let keystore = p12_keystore::KeyStore::from_pkcs12(&data, candidate).ok()?;
                    let (alias, chain) = keystore.private_key_chain()?;
                    let leaf = chain.chain().first()?;
                    let info = crate::x509::parse_cert_der(leaf.as_der()).ok()?;
                    Some(IdentityPreview {
                        common_name: info.common_name,
                        friendly_name: Some(alias.to_string()),
                    })
                })
        }
    }
}

fn describe_candidate(artifact: &Artifact, password: Option<&str>) -> String {
    match preview(artifact, password) {
        Some(identity) => format!("  {} ({})", artifact, identity),
        None => format!("  {}", artifact),
    }
}

/// One listing line per artifact, with identity where it can be read.
pub fn describe_all(source: &dyn CertificateSource, password: Option<&str>) -> Result<Vec<String>> {
    Ok(source
        .list()?
        .iter()
        .map(|a| describe_candidate(a, password))
        .collect())
}
