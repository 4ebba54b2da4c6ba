// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::locate::ArtifactKind;
use crate::trust::{
    command_failure, run_command, ScopeWarning, TrustCertificate, TrustStoreBackend,
    TrustStoreEntry,
};
use std::path::PathBuf;

const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// The System keychain via the `security` tool. Every write needs admin rights.
pub struct MacOsBackend;

impl MacOsBackend {
    /// `security` wants a certificate file; containers get a temporary PEM copy.
    fn certificate_file(&self, cert: &TrustCertificate) -> Result<(PathBuf, bool)> {
        if cert.artifact.kind == ArtifactKind::Certificate {
            return Ok((cert.artifact.path.clone(), false));
        }
        let random_suffix: u64 = rand::Rng::random(&mut rand::rng());
        let path = std::env::temp_dir().join(format!("certforge-{:x}.pem", random_suffix));
        crate::fs::atomic_write(&path, cert.cert_pem().as_bytes())?;
        Ok((path, true))
    }

    fn hashes_labelled(&self, label: &str) -> Result<Vec<String>> {
        let output = run_command(
            "security",
            &["find-certificate", "-a", "-c", label, "-Z", SYSTEM_KEYCHAIN],
            &[],
        )?;
        // Exit status is non-zero when nothing matches.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let found = parse_find_output(&String::from_utf8_lossy(&output.stdout));
        Ok(hashes_with_label(found, label))
    }

    fn delete_labelled(&self, label: &str) -> Result<usize> {
        let hashes = self.hashes_labelled(label)?;
        for hash in &hashes {
            let output = run_command(
                "security",
                &["delete-certificate", "-Z", hash, SYSTEM_KEYCHAIN],
                &[],
            )?;
            if !output.status.success() {
                return Err(command_failure("security delete-certificate", &output));
            }
        }
        Ok(hashes.len())
    }
}

impl TrustStoreBackend for MacOsBackend {
    fn name(&self) -> &'static str {
        "macOS System Keychain"
    }

    fn install(&self, cert: &TrustCertificate, _friendly_name: &str) -> Result<Vec<ScopeWarning>> {
        let (path, temporary) = self.certificate_file(cert)?;
        let result = path_to_str(&path).and_then(|path_str| {
            run_command(
                "security",
                &[
                    "add-trusted-cert",
                    "-d", // admin trust settings
                    "-r",
                    "trustRoot",
                    "-k",
                    SYSTEM_KEYCHAIN,
                    path_str,
                ],
                &[],
            )
        });
        if temporary {
            let _ = crate::fs::remove_if_exists(&path);
        }

        let output = result?;
        if !output.status.success() {
            return Err(command_failure("security add-trusted-cert", &output));
        }
        Ok(Vec::new())
    }

    /// Keychain items are labelled with the subject CN, not the friendly name.
    fn remove_prior(&self, cert: &TrustCertificate) -> Result<usize> {
        replace_label(cert).map_or(Ok(0), |label| self.delete_labelled(label))
    }

    fn uninstall(&self, label: &str) -> Result<usize> {
        self.delete_labelled(label)
    }

    fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
        let output = run_command(
            "security",
            &["find-certificate", "-a", "-Z", SYSTEM_KEYCHAIN],
            &[],
        )?;
        if !output.status.success() {
            return Err(Error::TrustStore(format!(
                "Cannot read {}: {}",
                SYSTEM_KEYCHAIN,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_find_output(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(|(hash, label)| TrustStoreEntry {
                friendly_name: label.clone(),
                subject: label,
                location: format!("{}#{}", SYSTEM_KEYCHAIN, hash),
            })
            .collect())
    }
}

/// The label `add-trusted-cert` gives `cert`, if it has one.
fn replace_label(cert: &TrustCertificate) -> Option<&str> {
    let cn = cert.info.common_name.as_deref()?;
    (!cn.is_empty()).then_some(cn)
}

fn hashes_with_label(found: Vec<(String, String)>, label: &str) -> Vec<String> {
    found
        .into_iter()
        .filter(|(_, l)| l == label)
        .map(|(hash, _)| hash)
        .collect()
}

/// Pair each `SHA-1 hash:` with the `"labl"` attribute that follows it.
fn parse_find_output(stdout: &str) -> Vec<(String, String)> {
    let mut found = Vec::new();
    let mut hash: Option<String> = None;
    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("SHA-1 hash:") {
            hash = Some(value.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("\"labl\"<blob>=") {
            if let Some(h) = hash.take() {
                found.push((h, rest.trim_matches('"').to_string()));
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_find_output() {
        let out = r#"SHA-256 hash: 00AA
SHA-1 hash: 1111
keychain: "/Library/Keychains/System.keychain"
attributes:
    "labl"<blob>="Service"
SHA-1 hash: 2222
attributes:
    "labl"<blob>="Other"
"#;
        assert_eq!(
            parse_find_output(out),
            vec![
                ("1111".to_string(), "Service".to_string()),
                ("2222".to_string(), "Other".to_string())
            ]
        );
    }

    #[test]
    fn test_prior_entry_selected_by_common_name() {
        // `-c` is a substring search; only exact labels are deleted.
        let out = r#"SHA-1 hash: AAAA
    "labl"<blob>="api.example.com"
SHA-1 hash: BBBB
    "labl"<blob>="api.example.com.old"
SHA-1 hash: CCCC
    "labl"<blob>="api.example.com"
"#;
        let found = parse_find_output(out);
        assert_eq!(hashes_with_label(found.clone(), "api.example.com"), vec!["AAAA", "CCCC"]);
        // The friendly name never appears as a label.
        assert!(hashes_with_label(found, "api").is_empty());
    }

    #[test]
    fn test_replace_label_is_common_name() {
        let key = rcgen::KeyPair::generate().unwrap();
        let names = vec!["api.example.com".to_string()];
        let mut params = rcgen::CertificateParams::new(names).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "api.example.com");
        let cert = params.self_signed(&key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.crt");
        std::fs::write(&path, cert.pem()).unwrap();
        let artifact = crate::locate::Artifact::from_path(&path).unwrap();
        let cert = TrustCertificate::open(&artifact, "").unwrap();

        assert_eq!(cert.friendly_name, "");
        assert_eq!(replace_label(&cert), Some("api.example.com"));
    }
}
