// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::trust::{
    command_failure, run_command, ScopeWarning, TrustCertificate, TrustStoreBackend,
    TrustStoreEntry,
};
use std::path::{Path, PathBuf};

const ANCHOR_FILE_NAME: &str = "certforge.crt";

/// Overrides the anchor file path.
pub const ANCHOR_ENV: &str = "CERTFORGE_TRUST_ANCHOR";
/// Overrides the bundle refresh command (whitespace-separated).
pub const REFRESH_ENV: &str = "CERTFORGE_TRUST_REFRESH";

/// One well-known anchor file plus the distribution's bundle refresh command.
///
/// There is no friendly-name concept here: installing replaces the file and
/// uninstalling removes it whatever name is asked for.
pub struct LinuxBackend {
    distro: LinuxDistro,
    anchor: Option<PathBuf>,
    refresh: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinuxDistro {
    Debian, // Ubuntu, Mint, Pop!_OS, etc.
    Fedora, // RHEL, CentOS, Rocky, Alma
    Arch,   // Manjaro, EndeavourOS
    Unknown,
}

impl LinuxDistro {
    fn anchor_dir(&self) -> Option<&'static Path> {
        match self {
            LinuxDistro::Debian => Some(Path::new("/usr/local/share/ca-certificates")),
            LinuxDistro::Fedora => Some(Path::new("/etc/pki/ca-trust/source/anchors")),
            LinuxDistro::Arch => Some(Path::new("/etc/ca-certificates/trust-source/anchors")),
            LinuxDistro::Unknown => None,
        }
    }

    fn refresh_command(&self) -> &'static [&'static str] {
        match self {
            LinuxDistro::Debian => &["update-ca-certificates"],
            LinuxDistro::Fedora => &["update-ca-trust", "extract"],
            LinuxDistro::Arch => &["trust", "extract-compat"],
            LinuxDistro::Unknown => &[],
        }
    }
}

impl LinuxBackend {
    pub fn detect() -> Self {
        let distro = detect_distro();
        let anchor = std::env::var_os(ANCHOR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| distro.anchor_dir().map(|dir| dir.join(ANCHOR_FILE_NAME)));
        let refresh = match std::env::var(REFRESH_ENV) {
            Ok(cmd) if !cmd.trim().is_empty() => {
                cmd.split_whitespace().map(str::to_string).collect()
            }
            _ => distro
                .refresh_command()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        tracing::debug!(?distro, ?anchor, ?refresh, "Detected Linux trust store");
        Self {
            distro,
            anchor,
            refresh,
        }
    }

    /// A backend writing to `anchor` and running `refresh` afterwards.
    pub fn with_anchor(anchor: impl Into<PathBuf>, refresh: &[&str]) -> Self {
        Self {
            distro: LinuxDistro::Unknown,
            anchor: Some(anchor.into()),
            refresh: refresh.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn anchor(&self) -> Result<&Path> {
        self.anchor.as_deref().ok_or_else(|| {
            Error::TrustStore(format!(
                "Unknown Linux distribution. Set {} to the CA anchor file path.",
                ANCHOR_ENV
            ))
        })
    }

    fn refresh_bundle(&self) -> Result<()> {
        let Some((program, args)) = self.refresh.split_first() else {
            return Err(Error::TrustStore(format!(
                "No CA bundle refresh command for this distribution. Set {}.",
                REFRESH_ENV
            )));
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command(program, &args, &[])?;
        if !output.status.success() {
            return Err(command_failure(&self.refresh.join(" "), &output));
        }
        Ok(())
    }
}

impl TrustStoreBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        match self.distro {
            LinuxDistro::Debian => "Debian/Ubuntu ca-certificates",
            LinuxDistro::Fedora => "Fedora/RHEL ca-trust",
            LinuxDistro::Arch => "Arch trust",
            LinuxDistro::Unknown => "Linux anchor file",
        }
    }

    fn install(&self, cert: &TrustCertificate, _friendly_name: &str) -> Result<Vec<ScopeWarning>> {
        let anchor = self.anchor()?;
        // The key never leaves the artifact.
        crate::fs::atomic_write(anchor, cert.cert_pem().as_bytes()).map_err(privilege_hint)?;
        tracing::info!(anchor = %anchor.display(), "Wrote CA anchor");
        self.refresh_bundle()?;
        Ok(Vec::new())
    }

    fn uninstall(&self, _friendly_name: &str) -> Result<usize> {
        let anchor = self.anchor()?;
        let removed = crate::fs::remove_if_exists(anchor).map_err(privilege_hint)?;
        self.refresh_bundle()?;
        Ok(usize::from(removed))
    }

    fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
        let anchor = self.anchor()?;
        if !crate::fs::is_present(anchor) {
            return Ok(Vec::new());
        }
        let info = crate::x509::parse_cert_file(anchor)?;
        Ok(vec![TrustStoreEntry {
            friendly_name: String::new(),
            subject: info.subject,
            location: anchor.display().to_string(),
        }])
    }
}

fn privilege_hint(err: Error) -> Error {
    let denied = match &err {
        Error::WriteFile { source, .. } | Error::Remove { source, .. } => {
            source.kind() == std::io::ErrorKind::PermissionDenied
        }
        _ => false,
    };
    if denied {
        Error::Privilege(format!("{}. Run as root or with sudo.", err))
    } else {
        err
    }
}

fn detect_distro() -> LinuxDistro {
    if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
        let distro = distro_from_os_release(&content);
        if distro != LinuxDistro::Unknown {
            return distro;
        }
    }

    // Fallback: check for refresh commands
    if Path::new("/usr/sbin/update-ca-certificates").exists() {
        return LinuxDistro::Debian;
    }
    if Path::new("/usr/bin/update-ca-trust").exists() {
        return LinuxDistro::Fedora;
    }
    if Path::new("/usr/bin/trust").exists() {
        return LinuxDistro::Arch;
    }

    LinuxDistro::Unknown
}

fn distro_from_os_release(content: &str) -> LinuxDistro {
    let content = content.to_lowercase();
    let mentions = |names: &[&str]| names.iter().any(|n| content.contains(n));

    if mentions(&["debian", "ubuntu", "mint", "pop!_os"]) {
        LinuxDistro::Debian
    } else if mentions(&["fedora", "rhel", "centos", "rocky", "alma"]) {
        LinuxDistro::Fedora
    } else if mentions(&["arch", "manjaro", "endeavour"]) {
        LinuxDistro::Arch
    } else {
        LinuxDistro::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::Artifact;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    fn ca_artifact(dir: &Path) -> Artifact {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Anchor Test Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        let path = dir.join("ca.crt");
        std::fs::write(&path, cert.pem()).unwrap();
        Artifact::from_path(&path).unwrap()
    }

    #[test]
    fn test_install_writes_anchor_and_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = dir.path().join("anchors").join("certforge.crt");
        std::fs::create_dir_all(anchor.parent().unwrap()).unwrap();
        let backend = LinuxBackend::with_anchor(&anchor, &["true"]);

        let cert = TrustCertificate::open(&ca_artifact(dir.path()), "").unwrap();
        assert!(backend.install(&cert, "").unwrap().is_empty());

        let written = std::fs::read_to_string(&anchor).unwrap();
        assert!(written.contains("BEGIN CERTIFICATE"));
        assert!(!written.contains("PRIVATE KEY"));

        let entries = backend.list_installed().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].subject.contains("Anchor Test Root"));
    }

    #[test]
    fn test_uninstall_removes_anchor_regardless_of_name() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = dir.path().join("certforge.crt");
        let backend = LinuxBackend::with_anchor(&anchor, &["true"]);
        let cert = TrustCertificate::open(&ca_artifact(dir.path()), "").unwrap();
        backend.install(&cert, "").unwrap();

        assert_eq!(backend.uninstall("anything").unwrap(), 1);
        assert!(!anchor.exists());
        assert_eq!(backend.uninstall("anything").unwrap(), 0);
        assert!(backend.list_installed().unwrap().is_empty());
    }

    #[test]
    fn test_failed_refresh_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LinuxBackend::with_anchor(dir.path().join("certforge.crt"), &["false"]);
        let cert = TrustCertificate::open(&ca_artifact(dir.path()), "").unwrap();
        assert!(matches!(
            backend.install(&cert, ""),
            Err(Error::Command { .. })
        ));
    }

    #[test]
    fn test_missing_refresh_tool() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LinuxBackend::with_anchor(
            dir.path().join("certforge.crt"),
            &["certforge-no-such-refresh-tool"],
        );
        assert!(matches!(
            backend.uninstall(""),
            Err(Error::CommandNotFound { .. })
        ));
    }

    #[test]
    fn test_distro_from_os_release() {
        assert_eq!(
            distro_from_os_release("NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n"),
            LinuxDistro::Debian
        );
        assert_eq!(
            distro_from_os_release("ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n"),
            LinuxDistro::Fedora
        );
        assert_eq!(distro_from_os_release("ID=manjaro\n"), LinuxDistro::Arch);
        assert_eq!(distro_from_os_release("ID=alpine\n"), LinuxDistro::Unknown);
        assert!(LinuxDistro::Unknown.anchor_dir().is_none());
    }
}
