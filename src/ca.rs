// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Root CA lifecycle: bootstrap once, reuse, purge on request.

use crate::config::{CaPaths, CertType, Paths, Settings};
use crate::error::{Error, Result};
use crate::fs::{atomic_write, atomic_write_secret, is_present, read_to_string, remove_if_exists};
use crate::profile::RequestProfile;
use crate::san::{TemplateRenderer, TemplateVars};
use fs2::FileExt;
use pkcs8::{EncryptedPrivateKeyInfo, LineEnding, PrivateKeyInfo};
use rcgen::{
    Certificate, CertificateParams, CertificateSigningRequestParams, Issuer, KeyPair,
    RsaKeySize, SerialNumber,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// PBKDF2 rounds for encrypted private keys.
const PBKDF2_ITERATIONS: u32 = 100_000;

/// The root CA used to sign every certificate in a run.
///
/// Holds the decrypted key and certificate; the serial counter lives on disk
/// next to the certificate so that separate runs never reuse a serial.
pub struct CertificateAuthority {
    key_pair: KeyPair,
    cert_pem: String,
    paths: CaPaths,
}

impl CertificateAuthority {
    /// Load the CA from disk, creating whatever pieces are missing.
    ///
    /// Existing non-empty files are reused as-is, so repeated calls leave the
    /// CA untouched. A freshly generated key always gets a fresh certificate.
    pub fn ensure(settings: &Settings, renderer: &TemplateRenderer) -> Result<Self> {
        let paths = settings.paths.ca();
        crate::fs::ensure_dir(&settings.paths.certs)?;
        crate::fs::ensure_dir(&settings.paths.config)?;
        let password = settings.key_password.as_str();

        let (key_pair, key_created) = if is_present(&paths.key) {
            (load_encrypted_key(&paths.key, password)?, false)
        } else {
            tracing::info!(bits = settings.key_size, "Generating root CA key");
            let key_pair = generate_key(settings.key_size)?;
            save_encrypted_key(&key_pair, &paths.key, password)?;
            (key_pair, true)
        };

        if !is_present(&paths.conf) {
            let vars = TemplateVars::for_request(settings, &settings.ca_common_name, &[]);
            renderer.render_to_file(CertType::Ca, &vars, &paths.conf)?;
        }

        let cert_pem = if is_present(&paths.cert) && !key_created {
            tracing::debug!(cert = %paths.cert.display(), "Reusing existing root CA");
            read_to_string(&paths.cert)?
        } else {
            let profile = RequestProfile::load(&paths.conf)?;
            let csr = profile.request_params()?.serialize_request(&key_pair)?;
            atomic_write(&paths.csr, csr.pem()?.as_bytes())?;

            let mut params = profile.request_params()?;
            profile.apply_extensions(&mut params)?;
            set_validity(&mut params, settings.ca_validity_days);
            params.serial_number = Some(SerialNumber::from(next_serial(&paths.serial)?));

            let cert = params.self_signed(&key_pair)?;
            atomic_write(&paths.cert, cert.pem().as_bytes())?;
            tracing::info!(
                cn = %profile.common_name,
                days = settings.ca_validity_days,
                "Created root CA certificate"
            );
            cert.pem()
        };

        if pem_is_stale(&paths.pem, &paths.cert) {
            atomic_write(&paths.pem, cert_pem.as_bytes())?;
        }

        Ok(Self {
            key_pair,
            cert_pem,
            paths,
        })
    }

    /// Delete every CA file so the next `ensure` starts from scratch.
    /// Returns the files that were removed.
    pub fn purge(paths: &Paths) -> Result<Vec<PathBuf>> {
        let ca = paths.ca();
        let mut removed = Vec::new();
        for path in [ca.key, ca.cert, ca.csr, ca.pem, ca.serial, ca.conf] {
            if remove_if_exists(&path)? {
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            tracing::info!(files = removed.len(), "Removed previous root CA files");
        }
        Ok(removed)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> Result<Vec<u8>> {
        crate::x509::cert_der_from_pem(&self.cert_pem)
    }

    pub fn paths(&self) -> &CaPaths {
        &self.paths
    }

    pub fn info(&self) -> Result<crate::x509::CertInfo> {
        crate::x509::parse_cert_pem(&self.cert_pem)
    }

    /// Create an Issuer for signing certificates
    ///
    /// Note: This recreates the KeyPair because Issuer takes ownership
    pub fn issuer(&self) -> Result<Issuer<'_, KeyPair>> {
        let key_pair = KeyPair::from_pem(&self.key_pair.serialize_pem())?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key_pair).map_err(Error::CertGen)
    }

    pub fn next_serial(&self) -> Result<u64> {
        next_serial(&self.paths.serial)
    }

    /// Sign a PEM CSR. Extensions come from `profile`, not from the CSR.
    pub fn sign(&self, csr_pem: &str, profile: &RequestProfile, days: u32) -> Result<Certificate> {
        crate::config::validate_days(days)?;
        let csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::CsrParse(e.to_string()))?;

        let mut params = csr.params;
        profile.apply_extensions(&mut params)?;
        set_validity(&mut params, days);
        params.serial_number = Some(SerialNumber::from(self.next_serial()?));

        let csr = CertificateSigningRequestParams {
            params,
            public_key: csr.public_key,
        };
        let issuer = self.issuer()?;
        Ok(csr.signed_by(&issuer)?)
    }
}

pub fn set_validity(params: &mut CertificateParams, days: u32) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(days as i64);
}

fn pem_is_stale(pem: &Path, cert: &Path) -> bool {
    if !is_present(pem) {
        return true;
    }
    let modified = |p: &Path| -> Option<SystemTime> { std::fs::metadata(p).ok()?.modified().ok() };
    match (modified(pem), modified(cert)) {
        (Some(pem_time), Some(cert_time)) => pem_time < cert_time,
        _ => true,
    }
}

/// Advance the serial counter in `path` and return the new serial.
///
/// The file holds the last issued serial as hex. An absent or empty file is
/// seeded with a random 63-bit value. The file is exclusively locked for the
/// whole read-modify-write.
pub fn next_serial(path: &Path) -> Result<u64> {
    let write_err = |e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(write_err)?;
    file.lock_exclusive().map_err(write_err)?;

    let result = advance_serial(&mut file, path);
    let _ = FileExt::unlock(&file);
    result
}

fn advance_serial(file: &mut File, path: &Path) -> Result<u64> {
    let write_err = |e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    };
    let mut content = String::new();
    file.read_to_string(&mut content).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let current = content.trim();
    let serial = if current.is_empty() {
        (rand::Rng::random::<u64>(&mut rand::rng()) >> 1).max(1)
    } else {
        let corrupt = |reason: String| Error::SerialCorrupt {
            path: path.to_path_buf(),
            reason,
        };
        let last = u64::from_str_radix(current, 16)
            .map_err(|e| corrupt(format!("'{}' is not hex: {}", current, e)))?;
        last.checked_add(1)
            .filter(|next| *next <= i64::MAX as u64)
            .ok_or_else(|| corrupt("serial space exhausted".to_string()))?
    };

    file.set_len(0).map_err(write_err)?;
    file.seek(SeekFrom::Start(0)).map_err(write_err)?;
    writeln!(file, "{:016X}", serial).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    Ok(serial)
}

/// Generate an RSA key of `bits` (2048, 3072 or 4096).
pub fn generate_key(bits: u32) -> Result<KeyPair> {
    let size = match bits {
        2048 => RsaKeySize::_2048,
        3072 => RsaKeySize::_3072,
        4096 => RsaKeySize::_4096,
        other => {
            return Err(Error::Configuration(format!(
                "unsupported RSA key size {}",
                other
            )))
        }
    };
    Ok(KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, size)?)
}

pub fn save_encrypted_key(key_pair: &KeyPair, path: &Path, password: &str) -> Result<()> {
    let encrypted = encrypt_key_pem(&key_pair.serialize_pem(), password)?;
    atomic_write_secret(path, encrypted.as_bytes())
}

pub fn load_encrypted_key(path: &Path, password: &str) -> Result<KeyPair> {
    let key_pem = decrypt_key_pem(&read_to_string(path)?, password)?;
    Ok(KeyPair::from_pem(&key_pem)?)
}

/// Encrypt a PEM private key with a password (PKCS#8, PBKDF2-SHA256, AES-256-CBC).
pub fn encrypt_key_pem(key_pem: &str, password: &str) -> Result<String> {
    use pkcs8::der::Decode;
    use rand::RngCore;

    if password.is_empty() {
        return Err(Error::KeyEncryption("Password cannot be empty".to_string()));
    }

    let pem_obj = pem::parse(key_pem)
        .map_err(|e| Error::KeyEncryption(format!("Failed to parse PEM: {}", e)))?;
    let pki = PrivateKeyInfo::from_der(pem_obj.contents())
        .map_err(|e| Error::KeyEncryption(format!("Failed to parse key: {}", e)))?;

    let mut rng = rand::rng();
    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let params =
        pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ITERATIONS, &salt, &iv)
            .map_err(|e| {
                Error::KeyEncryption(format!("Failed to create encryption params: {}", e))
            })?;
    let encrypted = pki
        .encrypt_with_params(params, password)
        .map_err(|e| Error::KeyEncryption(format!("Encryption failed: {}", e)))?;

    let pem_str = encrypted
        .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
        .map_err(|e| Error::KeyEncryption(format!("Failed to convert to PEM: {}", e)))?;
    Ok(pem_str.to_string())
}

/// Decrypt a PEM encrypted private key with a password
pub fn decrypt_key_pem(encrypted_pem: &str, password: &str) -> Result<String> {
    use pkcs8::der::Decode;

    if password.is_empty() {
        return Err(Error::KeyDecryption("Password cannot be empty".to_string()));
    }

    let pem_obj = pem::parse(encrypted_pem)
        .map_err(|e| Error::KeyDecryption(format!("Failed to parse encrypted PEM: {}", e)))?;
    let encrypted = EncryptedPrivateKeyInfo::from_der(pem_obj.contents())
        .map_err(|e| Error::KeyDecryption(format!("Failed to parse encrypted key: {}", e)))?;
    let decrypted = encrypted
        .decrypt(password)
        .map_err(|_| Error::PasswordIncorrect)?;
    // A wrong password can still yield valid padding over garbage.
    decrypted
        .decode_msg::<PrivateKeyInfo<'_>>()
        .map_err(|_| Error::PasswordIncorrect)?;

    let pem_str = decrypted
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|e| Error::KeyDecryption(format!("Failed to convert to PEM: {}", e)))?;
    Ok(pem_str.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::san::install_default_templates;

    fn test_settings(root: &Path) -> Settings {
        let certs = root.join("certs").display().to_string();
        let config = root.join("config").display().to_string();
        let templates = root.join("templates").display().to_string();
        let home = root.display().to_string();
        Settings::load(|key| match key {
            "CERTFORGE_HOME" => Some(home.clone()),
            "CERT_OUTPUT_DIR" => Some(certs.clone()),
            "CERT_CONFIG_DIR" => Some(config.clone()),
            "CERT_TEMPLATES_DIR" => Some(templates.clone()),
            "CERT_CA_CN" => Some("Test Root CA".into()),
            _ => None,
        })
        .unwrap()
    }

    fn bootstrap(root: &Path) -> (Settings, TemplateRenderer) {
        let settings = test_settings(root);
        install_default_templates(&settings.paths, false).unwrap();
        let renderer = TemplateRenderer::new(&settings.paths);
        (settings, renderer)
    }

    #[test]
    fn test_ensure_creates_ca_files() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer) = bootstrap(dir.path());

        let ca = CertificateAuthority::ensure(&settings, &renderer).unwrap();
        let paths = settings.paths.ca();
        for path in [&paths.key, &paths.cert, &paths.csr, &paths.pem, &paths.serial, &paths.conf] {
            assert!(is_present(path), "missing {}", path.display());
        }

        let key = std::fs::read_to_string(&paths.key).unwrap();
        assert!(key.contains("ENCRYPTED PRIVATE KEY"));

        let info = ca.info().unwrap();
        assert!(info.is_ca);
        assert!(info.is_self_issued());
        assert_eq!(info.common_name.as_deref(), Some("Test Root CA"));
        assert!((3649..=3650).contains(&info.validity_days()));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer) = bootstrap(dir.path());
        let paths = settings.paths.ca();

        CertificateAuthority::ensure(&settings, &renderer).unwrap();
        let snapshot: Vec<Vec<u8>> = [&paths.key, &paths.cert, &paths.pem, &paths.conf]
            .iter()
            .map(|p| std::fs::read(p).unwrap())
            .collect();

        CertificateAuthority::ensure(&settings, &renderer).unwrap();
        let again: Vec<Vec<u8>> = [&paths.key, &paths.cert, &paths.pem, &paths.conf]
            .iter()
            .map(|p| std::fs::read(p).unwrap())
            .collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_ensure_restores_missing_pem() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer) = bootstrap(dir.path());
        let paths = settings.paths.ca();

        CertificateAuthority::ensure(&settings, &renderer).unwrap();
        std::fs::write(&paths.pem, b"").unwrap();
        CertificateAuthority::ensure(&settings, &renderer).unwrap();

        assert_eq!(
            std::fs::read_to_string(&paths.pem).unwrap(),
            std::fs::read_to_string(&paths.cert).unwrap()
        );
    }

    #[test]
    fn test_purge_forces_new_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer) = bootstrap(dir.path());

        let first = CertificateAuthority::ensure(&settings, &renderer)
            .unwrap()
            .info()
            .unwrap();
        let removed = CertificateAuthority::purge(&settings.paths).unwrap();
        assert_eq!(removed.len(), 6);
        assert!(CertificateAuthority::purge(&settings.paths).unwrap().is_empty());

        let second = CertificateAuthority::ensure(&settings, &renderer)
            .unwrap()
            .info()
            .unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_wrong_password_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer) = bootstrap(dir.path());
        CertificateAuthority::ensure(&settings, &renderer).unwrap();

        let err = load_encrypted_key(&settings.paths.ca().key, "wrong").unwrap_err();
        assert!(matches!(err, Error::PasswordIncorrect));
    }

    #[test]
    fn test_serial_counter_increments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.srl");

        let first = next_serial(&path).unwrap();
        let second = next_serial(&path).unwrap();
        assert_eq!(second, first + 1);
        assert!(first <= i64::MAX as u64);

        std::fs::write(&path, "0A\n").unwrap();
        assert_eq!(next_serial(&path).unwrap(), 11);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "000000000000000B");
    }

    #[test]
    fn test_corrupt_serial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.srl");
        std::fs::write(&path, "not-hex").unwrap();
        assert!(matches!(
            next_serial(&path),
            Err(Error::SerialCorrupt { .. })
        ));
    }

    #[test]
    fn test_key_encryption_roundtrip() {
        let key = KeyPair::generate().unwrap();
        let encrypted = encrypt_key_pem(&key.serialize_pem(), "secret").unwrap();
        assert!(encrypted.contains("ENCRYPTED PRIVATE KEY"));

        let decrypted = decrypt_key_pem(&encrypted, "secret").unwrap();
        let restored = KeyPair::from_pem(&decrypted).unwrap();
        assert_eq!(restored.public_key_raw(), key.public_key_raw());

        assert!(encrypt_key_pem(&key.serialize_pem(), "").is_err());
        assert!(matches!(
            decrypt_key_pem(&encrypted, "other"),
            Err(Error::PasswordIncorrect)
        ));
    }

    #[test]
    fn test_generate_key_sizes() {
        assert!(generate_key(2048).is_ok());
        assert!(generate_key(1024).is_err());
    }
}
