// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Install and remove certificates in the platform trust store.
//!
//! A [`Reconciler`] drives one certificate from a resolved artifact to an
//! installed trust entry. Platform work happens behind [`TrustStoreBackend`];
//! [`detect_backend`] picks the implementation for the running OS.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(any(target_os = "macos", test))]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod macos;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;
#[cfg(target_os = "macos")]
pub use macos::MacOsBackend;
#[cfg(windows)]
pub use windows::WindowsBackend;

use crate::config::DEFAULT_PASSWORD;
use crate::error::{Error, Result};
use crate::locate::{self, Artifact, ArtifactKind, CertificateSource};
use crate::x509::{self, CertInfo};
use std::fmt;
use std::process::{Command, Output};
use zeroize::Zeroizing;

/// A certificate opened from an artifact and ready to hand to a backend.
pub struct TrustCertificate {
    pub artifact: Artifact,
    pub cert_der: Vec<u8>,
    pub info: CertInfo,
    /// Empty for bare certificate files.
    pub friendly_name: String,
    /// Whether the artifact carries the private key.
    pub has_key: bool,
    pub password: Zeroizing<String>,
}

impl TrustCertificate {
    /// Open `artifact` with `password`; a wrong password fails here.
    pub fn open(artifact: &Artifact, password: &str) -> Result<Self> {
        let (cert_der, friendly_name, has_key) = match artifact.kind {
            ArtifactKind::Pkcs12 => {
                let keystore = crate::export::open_pkcs12(&artifact.path, password)?;
                let Some((alias, chain)) = keystore.private_key_chain() else {
                    return Err(Error::Pkcs12Open {
                        path: artifact.path.clone(),
                        reason: "container holds no private key".into(),
                    });
                };
                let leaf = chain.chain().first().ok_or_else(|| Error::Pkcs12Open {
                    path: artifact.path.clone(),
                    reason: "container holds no certificate".into(),
                })?;
                (leaf.as_der().to_vec(), alias.to_string(), true)
            }
            ArtifactKind::Certificate => {
                let pem = crate::fs::read_to_string(&artifact.path)?;
                (x509::cert_der_from_pem(&pem)?, String::new(), false)
            }
        };

        Ok(Self {
            info: x509::parse_cert_der(&cert_der)?,
            artifact: artifact.clone(),
            cert_der,
            friendly_name,
            has_key,
            password: Zeroizing::new(password.to_string()),
        })
    }

    pub fn cert_pem(&self) -> String {
        x509::der_to_pem(&self.cert_der)
    }

    /// Self-issued or a CA: belongs in the trusted roots as well.
    pub fn is_trust_anchor(&self) -> bool {
        self.info.is_trust_anchor()
    }
}

/// One entry a backend manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustStoreEntry {
    pub friendly_name: String,
    pub subject: String,
    /// Store and identifier, e.g. `CurrentUser\My\<thumbprint>` or a file path.
    pub location: String,
}

impl fmt::Display for TrustStoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.friendly_name.is_empty() {
            write!(f, "{} [{}]", self.subject, self.location)
        } else {
            write!(f, "{} ({}) [{}]", self.friendly_name, self.subject, self.location)
        }
    }
}

/// A machine-wide store write that failed after the per-user write succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeWarning {
    pub store: String,
    pub message: String,
}

impl fmt::Display for ScopeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.store, self.message)
    }
}

pub trait TrustStoreBackend {
    fn name(&self) -> &'static str;

    /// Add `cert` under `friendly_name`. Machine-scope failures that were
    /// tolerated come back as warnings.
    fn install(&self, cert: &TrustCertificate, friendly_name: &str) -> Result<Vec<ScopeWarning>>;

    /// Remove entries carrying `friendly_name`; returns how many went away.
    fn uninstall(&self, friendly_name: &str) -> Result<usize>;

    fn list_installed(&self) -> Result<Vec<TrustStoreEntry>>;

    /// Remove the entries an install of `cert` would duplicate. Stores that
    /// key entries by something other than the friendly name override this.
    fn remove_prior(&self, cert: &TrustCertificate) -> Result<usize> {
        if cert.friendly_name.is_empty() {
            return Ok(0);
        }
        self.uninstall(&cert.friendly_name)
    }
}

impl<T: TrustStoreBackend + ?Sized> TrustStoreBackend for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn install(&self, cert: &TrustCertificate, friendly_name: &str) -> Result<Vec<ScopeWarning>> {
        (**self).install(cert, friendly_name)
    }

    fn uninstall(&self, friendly_name: &str) -> Result<usize> {
        (**self).uninstall(friendly_name)
    }

    fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
        (**self).list_installed()
    }

    fn remove_prior(&self, cert: &TrustCertificate) -> Result<usize> {
        (**self).remove_prior(cert)
    }
}

pub fn detect_backend() -> Box<dyn TrustStoreBackend> {
    #[cfg(target_os = "macos")]
    {
        Box::new(MacOsBackend)
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxBackend::detect())
    }

    #[cfg(windows)]
    {
        Box::new(WindowsBackend)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        Box::new(UnsupportedBackend)
    }
}

pub struct UnsupportedBackend;

impl TrustStoreBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "Unsupported"
    }

    fn install(&self, _cert: &TrustCertificate, _friendly_name: &str) -> Result<Vec<ScopeWarning>> {
        Err(Error::TrustStore(
            "Trust store not supported on this platform. Add the certificate manually.".into(),
        ))
    }

    fn uninstall(&self, _friendly_name: &str) -> Result<usize> {
        Ok(0)
    }

    fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
        Ok(Vec::new())
    }
}

/// Progress of one certificate through an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallState {
    Absent,
    /// The selector resolved to an artifact.
    Resolved,
    /// The password opened the artifact.
    Verified,
    /// Entries the new one would duplicate are gone.
    ReplacedPrior,
    Installed,
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub artifact: Artifact,
    pub friendly_name: String,
    pub subject: String,
    pub replaced: usize,
    /// Machine-scope failures tolerated by the backend. The certificate may
    /// not be trusted system-wide when this is non-empty.
    pub downgraded: Vec<ScopeWarning>,
    pub state: InstallState,
}

pub struct Reconciler<B: TrustStoreBackend> {
    backend: B,
}

impl<B: TrustStoreBackend> Reconciler<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Resolve `selector` in `source`, then install it.
    pub fn install_named(
        &self,
        selector: &str,
        source: &dyn CertificateSource,
        password: Option<&str>,
    ) -> Result<InstallOutcome> {
        let artifact = locate::find(selector, source, password)?;
        tracing::info!(selector, artifact = %artifact, "Resolved certificate");
        self.install(&artifact, password)
    }

    /// Install a resolved artifact. A failure stops at the state reached;
    /// nothing already done is rolled back.
    pub fn install(&self, artifact: &Artifact, password: Option<&str>) -> Result<InstallOutcome> {
        let mut state = InstallState::Resolved;
        let result = self.advance(artifact, password, &mut state);
        if let Err(e) = &result {
            tracing::error!(artifact = %artifact, state = ?state, error = %e, "Install halted");
        }
        result
    }

    fn advance(
        &self,
        artifact: &Artifact,
        password: Option<&str>,
        state: &mut InstallState,
    ) -> Result<InstallOutcome> {
        let cert = TrustCertificate::open(artifact, password.unwrap_or(DEFAULT_PASSWORD))?;
        *state = InstallState::Verified;

        let replaced = self.backend.remove_prior(&cert)?;
        if replaced > 0 {
            tracing::info!(friendly_name = %cert.friendly_name, replaced, "Removed prior entries");
        }
        *state = InstallState::ReplacedPrior;

        let downgraded = self.backend.install(&cert, &cert.friendly_name)?;
        *state = InstallState::Installed;
        for warning in &downgraded {
            tracing::warn!(
                store = %warning.store,
                "Machine-wide install failed: {}",
                warning.message
            );
        }
        tracing::info!(
            backend = self.backend.name(),
            subject = %cert.info.subject,
            friendly_name = %cert.friendly_name,
            "Installed certificate"
        );

        Ok(InstallOutcome {
            artifact: cert.artifact.clone(),
            friendly_name: cert.friendly_name.clone(),
            subject: cert.info.subject.clone(),
            replaced,
            downgraded,
            state: *state,
        })
    }

    pub fn uninstall(&self, friendly_name: &str) -> Result<usize> {
        let removed = self.backend.uninstall(friendly_name)?;
        tracing::info!(backend = self.backend.name(), friendly_name, removed, "Uninstalled");
        Ok(removed)
    }

    pub fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
        self.backend.list_installed()
    }
}

/// Run an external tool, capturing its output.
#[cfg_attr(
    not(any(target_os = "macos", target_os = "linux", windows)),
    allow(dead_code)
)]
pub(crate) fn run_command(program: &str, args: &[&str], envs: &[(&str, &str)]) -> Result<Output> {
    tracing::debug!(program, ?args, "Running");
    Command::new(program)
        .args(args)
        .envs(envs.iter().copied())
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: program.to_string(),
                    hint: install_hint(program),
                }
            } else {
                Error::Command {
                    command: program.to_string(),
                    stderr: e.to_string(),
                }
            }
        })
}

/// Map a failed command to `Privilege` when the tool says access was denied.
#[cfg_attr(
    not(any(target_os = "macos", target_os = "linux", windows)),
    allow(dead_code)
)]
pub(crate) fn command_failure(command: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if is_permission_denied(&stderr) {
        Error::Privilege(format!("{}: {}", command, stderr))
    } else {
        Error::Command {
            command: command.to_string(),
            stderr,
        }
    }
}

pub(crate) fn is_permission_denied(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission denied")
        || lower.contains("access is denied")
        || lower.contains("authorization")
        || lower.contains("not permitted")
        || lower.contains("must be run as root")
}

fn install_hint(command: &str) -> String {
    match command {
        "update-ca-certificates" => {
            "Install ca-certificates package: sudo apt install ca-certificates".to_string()
        }
        "update-ca-trust" => {
            "Install ca-certificates package: sudo dnf install ca-certificates".to_string()
        }
        "trust" => "Install p11-kit-trust package: sudo pacman -S p11-kit".to_string(),
        "powershell" | "powershell.exe" => "Windows PowerShell is required".to_string(),
        "security" => "The macOS 'security' tool is required".to_string(),
        _ => format!("Please install the '{}' command", command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use std::cell::RefCell;
    use std::path::Path;

    /// Keeps entries in memory, keyed by friendly name.
    #[derive(Default)]
    struct MemoryBackend {
        entries: RefCell<Vec<TrustStoreEntry>>,
        machine_warning: Option<String>,
    }

    impl TrustStoreBackend for MemoryBackend {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn install(
            &self,
            cert: &TrustCertificate,
            friendly_name: &str,
        ) -> Result<Vec<ScopeWarning>> {
            self.entries.borrow_mut().push(TrustStoreEntry {
                friendly_name: friendly_name.to_string(),
                subject: cert.info.subject.clone(),
                location: x509::fingerprint(&cert.cert_der),
            });
            Ok(self
                .machine_warning
                .iter()
                .map(|m| ScopeWarning {
                    store: "LocalMachine\\Root".into(),
                    message: m.clone(),
                })
                .collect())
        }

        fn uninstall(&self, friendly_name: &str) -> Result<usize> {
            let mut entries = self.entries.borrow_mut();
            let before = entries.len();
            entries.retain(|e| e.friendly_name != friendly_name);
            Ok(before - entries.len())
        }

        fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
            Ok(self.entries.borrow().clone())
        }
    }

    fn write_pfx(dir: &Path, file: &str, friendly_name: &str, password: &str) -> Artifact {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["svc.test".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "svc.test");
        let cert = params.self_signed(&key).unwrap();

        let leaf = Certificate::from_der(cert.der()).unwrap();
        let chain = PrivateKeyChain::new(key.serialize_der(), vec![1, 2, 3], vec![leaf]);
        let mut keystore = KeyStore::new();
        keystore.add_entry(friendly_name, KeyStoreEntry::PrivateKeyChain(chain));
        let data = keystore.writer(password).write().unwrap();

        let path = dir.join(file);
        std::fs::write(&path, data).unwrap();
        Artifact::from_path(&path).unwrap()
    }

    fn write_ca_crt(dir: &Path) -> Artifact {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        let path = dir.join("ca.crt");
        std::fs::write(&path, cert.pem()).unwrap();
        Artifact::from_path(&path).unwrap()
    }

    #[test]
    fn test_install_twice_leaves_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_pfx(dir.path(), "svc.pfx", "Service", "pw");
        let reconciler = Reconciler::new(MemoryBackend::default());

        let first = reconciler.install(&artifact, Some("pw")).unwrap();
        assert_eq!(first.replaced, 0);
        assert_eq!(first.state, InstallState::Installed);

        let second = reconciler.install(&artifact, Some("pw")).unwrap();
        assert_eq!(second.replaced, 1);

        let entries = reconciler.list_installed().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friendly_name, "Service");
    }

    /// Labels entries with the subject CN, the way the macOS keychain does.
    #[derive(Default)]
    struct LabelledBackend(MemoryBackend);

    impl LabelledBackend {
        fn label(cert: &TrustCertificate) -> String {
            cert.info.common_name.clone().unwrap_or_default()
        }
    }

    impl TrustStoreBackend for LabelledBackend {
        fn name(&self) -> &'static str {
            "labelled"
        }

        fn install(
            &self,
            cert: &TrustCertificate,
            _friendly_name: &str,
        ) -> Result<Vec<ScopeWarning>> {
            self.0.install(cert, &Self::label(cert))
        }

        fn uninstall(&self, label: &str) -> Result<usize> {
            self.0.uninstall(label)
        }

        fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
            self.0.list_installed()
        }

        fn remove_prior(&self, cert: &TrustCertificate) -> Result<usize> {
            self.0.uninstall(&Self::label(cert))
        }
    }

    #[test]
    fn test_reinstall_replaces_entry_keyed_by_common_name() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_pfx(dir.path(), "svc.pfx", "Service", "pw");
        let reconciler =
            Reconciler::new(Box::new(LabelledBackend::default()) as Box<dyn TrustStoreBackend>);
        assert_eq!(reconciler.install(&first, Some("pw")).unwrap().replaced, 0);

        // A regenerated container for the same identity
        let second = write_pfx(dir.path(), "svc.pfx", "Service", "pw");
        let outcome = reconciler.install(&second, Some("pw")).unwrap();
        assert_eq!(outcome.replaced, 1);

        let entries = reconciler.list_installed().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].friendly_name, "svc.test");
    }

    #[test]
    fn test_wrong_password_halts_before_backend() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_pfx(dir.path(), "svc.pfx", "Service", "pw");
        let reconciler = Reconciler::new(MemoryBackend::default());

        let err = reconciler.install(&artifact, Some("wrong")).unwrap_err();
        assert!(matches!(err, Error::Pkcs12Open { .. }));
        assert!(reconciler.list_installed().unwrap().is_empty());
    }

    #[test]
    fn test_default_password_used_when_none_given() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_pfx(dir.path(), "svc.pfx", "Service", DEFAULT_PASSWORD);
        let reconciler = Reconciler::new(MemoryBackend::default());
        assert!(reconciler.install(&artifact, None).is_ok());
    }

    #[test]
    fn test_certificate_file_has_no_friendly_name() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_ca_crt(dir.path());
        let backend = MemoryBackend::default();
        backend.entries.borrow_mut().push(TrustStoreEntry {
            friendly_name: String::new(),
            subject: "CN=Other".into(),
            location: "x".into(),
        });
        let reconciler = Reconciler::new(backend);

        let outcome = reconciler.install(&artifact, None).unwrap();
        assert_eq!(outcome.friendly_name, "");
        // nothing is removed for an empty friendly name
        assert_eq!(outcome.replaced, 0);
        assert_eq!(reconciler.list_installed().unwrap().len(), 2);

        let cert = TrustCertificate::open(&artifact, "ignored").unwrap();
        assert!(!cert.has_key);
        assert!(cert.is_trust_anchor());
    }

    #[test]
    fn test_downgraded_machine_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_pfx(dir.path(), "svc.pfx", "Service", "pw");
        let reconciler = Reconciler::new(MemoryBackend {
            machine_warning: Some("Access is denied.".into()),
            ..Default::default()
        });

        let outcome = reconciler.install(&artifact, Some("pw")).unwrap();
        assert_eq!(outcome.state, InstallState::Installed);
        assert_eq!(outcome.downgraded.len(), 1);
        assert!(outcome.downgraded[0].to_string().contains("Access is denied."));
    }

    #[test]
    fn test_install_named_resolves_through_locator() {
        let dir = tempfile::tempdir().unwrap();
        write_pfx(dir.path(), "alpha.pfx", "Alpha", "pw");
        write_pfx(dir.path(), "alpha-backup.pfx", "Alpha backup", "pw");
        let source = locate::DirectorySource::new(dir.path());
        let reconciler = Reconciler::new(MemoryBackend::default());

        let outcome = reconciler.install_named("alpha", &source, Some("pw")).unwrap();
        assert_eq!(outcome.artifact.file_name, "alpha.pfx");
        assert_eq!(outcome.friendly_name, "Alpha");

        let err = reconciler.install_named("gamma", &source, Some("pw")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_uninstall_by_friendly_name() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_pfx(dir.path(), "svc.pfx", "Service", "pw");
        let reconciler = Reconciler::new(MemoryBackend::default());
        reconciler.install(&artifact, Some("pw")).unwrap();

        assert_eq!(reconciler.uninstall("Other").unwrap(), 0);
        assert_eq!(reconciler.uninstall("Service").unwrap(), 1);
        assert!(reconciler.list_installed().unwrap().is_empty());
    }

    #[test]
    fn test_boxed_backend_dispatch() {
        let backend: Box<dyn TrustStoreBackend> = Box::new(UnsupportedBackend);
        let reconciler = Reconciler::new(backend);
        assert_eq!(reconciler.backend().name(), "Unsupported");
        assert_eq!(reconciler.uninstall("x").unwrap(), 0);
    }

    #[test]
    fn test_permission_denied_detection() {
        assert!(is_permission_denied("cp: cannot create regular file: Permission denied"));
        assert!(is_permission_denied("Access is denied."));
        assert!(!is_permission_denied("No such file or directory"));
    }
}
