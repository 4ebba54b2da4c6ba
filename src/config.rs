// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Settings for the issuance pipeline.
//!
//! Values resolve in three layers: built-in defaults, an optional TOML
//! settings file, then `CERT_*` environment variables. The result is one
//! [`Settings`] value that the entry point builds once and passes down.

use crate::error::{Error, Result};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use zeroize::Zeroizing;

/// Password used for keys and PKCS#12 exports when none is configured.
pub const DEFAULT_PASSWORD: &str = "changeit";
pub const DEFAULT_CERT_DAYS: u32 = 365;
pub const DEFAULT_CA_DAYS: u32 = 3650;
pub const DEFAULT_KEY_SIZE: u32 = 2048;
pub const DEFAULT_CERT_NAME: &str = "default";
pub const DEFAULT_CA_COMMON_NAME: &str = "certforge Root CA";
pub const DEFAULT_COUNTRY: &str = "US";
pub const DEFAULT_STATE: &str = "California";
pub const DEFAULT_LOCALITY: &str = "San Francisco";
pub const DEFAULT_ORGANIZATION: &str = "certforge";
pub const DEFAULT_ORG_UNIT: &str = "Development";

/// Maximum leaf certificate validity period (10 years).
pub const MAX_CERT_DAYS: u32 = 3650;
/// Maximum root CA validity period (100 years).
pub const MAX_CA_DAYS: u32 = 36500;
pub const SUPPORTED_KEY_SIZES: &[u32] = &[2048, 3072, 4096];

const SETTINGS_FILE_NAME: &str = "certforge.toml";

/// Overrides the data directory holding `certforge.toml`, `certs/`,
/// `config/` and `templates/`.
pub const HOME_ENV: &str = "CERTFORGE_HOME";

/// Kind of certificate a request produces; selects the config template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
    Server,
    Client,
    Ca,
}

impl CertType {
    pub const ALL: [CertType; 3] = [CertType::Server, CertType::Client, CertType::Ca];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertType::Server => "server",
            CertType::Client => "client",
            CertType::Ca => "ca",
        }
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CertType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "server" => Ok(CertType::Server),
            "client" => Ok(CertType::Client),
            "ca" => Ok(CertType::Ca),
            other => Err(Error::Configuration(format!(
                "CERT_TYPE must be one of server, client, ca (got '{}')",
                other
            ))),
        }
    }
}

/// Distinguished-name fields shared by every rendered template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFields {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub org_unit: String,
}

impl Default for SubjectFields {
    fn default() -> Self {
        Self {
            country: DEFAULT_COUNTRY.into(),
            state: DEFAULT_STATE.into(),
            locality: DEFAULT_LOCALITY.into(),
            organization: DEFAULT_ORGANIZATION.into(),
            org_unit: DEFAULT_ORG_UNIT.into(),
        }
    }
}

/// Optional on-disk settings. Every field may be omitted.
///
/// Passwords are deliberately absent: they come from the environment only.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    pub common_name: Option<String>,
    pub alt_names: Option<String>,
    pub cert_type: Option<CertType>,
    pub names: Option<Vec<String>>,
    pub validity_days: Option<u32>,
    pub ca_validity_days: Option<u32>,
    pub friendly_name: Option<String>,
    pub key_size: Option<u32>,
    pub preserve_ca_files: Option<bool>,
    pub ca_common_name: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub org_unit: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = crate::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub common_name: Option<String>,
    pub alt_names: String,
    pub cert_type: CertType,
    pub names: Vec<String>,
    pub validity_days: u32,
    pub ca_validity_days: u32,
    pub key_password: Zeroizing<String>,
    pub pfx_password: Zeroizing<String>,
    pub friendly_name: Option<String>,
    pub key_size: u32,
    pub preserve_ca_files: bool,
    pub ca_common_name: String,
    pub subject: SubjectFields,
    pub paths: Paths,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Resolve settings using `lookup` for environment variables.
    ///
    /// Empty values are treated as unset.
    pub fn load<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base = env(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Paths::default_base);

        let file = match env("CERTFORGE_SETTINGS") {
            Some(path) => SettingsFile::load(Path::new(&path))?,
            None => {
                let default_path = base.join(SETTINGS_FILE_NAME);
                if default_path.is_file() {
                    SettingsFile::load(&default_path)?
                } else {
                    SettingsFile::default()
                }
            }
        };

        let paths = Paths::new(
            env("CERT_OUTPUT_DIR")
                .map(PathBuf::from)
                .or(file.output_dir)
                .unwrap_or_else(|| base.join("certs")),
            env("CERT_CONFIG_DIR")
                .map(PathBuf::from)
                .or(file.config_dir)
                .unwrap_or_else(|| base.join("config")),
            env("CERT_TEMPLATES_DIR")
                .map(PathBuf::from)
                .or(file.templates_dir)
                .unwrap_or_else(|| base.join("templates")),
        );

        let cert_type = match env("CERT_TYPE") {
            Some(value) => value.parse()?,
            None => file.cert_type.unwrap_or(CertType::Server),
        };

        let names = match env("CERT_NAMES") {
            Some(value) => split_list(&value),
            None => file
                .names
                .unwrap_or_else(|| vec![DEFAULT_CERT_NAME.to_string()]),
        };

        let settings = Self {
            common_name: env("CERT_CN")
                .or(file.common_name)
                .map(|cn| cn.trim().to_string()),
            alt_names: env("CERT_ALT_NAMES")
                .or(file.alt_names)
                .unwrap_or_default(),
            cert_type,
            names,
            validity_days: parse_number(env("CERT_VALIDITY_DAYS"), "CERT_VALIDITY_DAYS")?
                .or(file.validity_days)
                .unwrap_or(DEFAULT_CERT_DAYS),
            ca_validity_days: parse_number(env("CERT_CA_VALIDITY_DAYS"), "CERT_CA_VALIDITY_DAYS")?
                .or(file.ca_validity_days)
                .unwrap_or(DEFAULT_CA_DAYS),
            key_password: Zeroizing::new(
                env("CERT_KEY_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            ),
            pfx_password: Zeroizing::new(
                env("CERT_PFX_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            ),
            friendly_name: env("CERT_FRIENDLY_NAME").or(file.friendly_name),
            key_size: parse_number(env("CERT_SIZE"), "CERT_SIZE")?
                .or(file.key_size)
                .unwrap_or(DEFAULT_KEY_SIZE),
            preserve_ca_files: match env("CERT_PRESERVE_CA_FILES") {
                Some(value) => parse_bool(&value),
                None => file.preserve_ca_files.unwrap_or(false),
            },
            ca_common_name: env("CERT_CA_CN")
                .or(file.ca_common_name)
                .unwrap_or_else(|| DEFAULT_CA_COMMON_NAME.to_string()),
            subject: SubjectFields {
                country: env("CERT_COUNTRY")
                    .or(file.country)
                    .unwrap_or_else(|| DEFAULT_COUNTRY.into()),
                state: env("CERT_STATE")
                    .or(file.state)
                    .unwrap_or_else(|| DEFAULT_STATE.into()),
                locality: env("CERT_LOCALITY")
                    .or(file.locality)
                    .unwrap_or_else(|| DEFAULT_LOCALITY.into()),
                organization: env("CERT_ORGANIZATION")
                    .or(file.organization)
                    .unwrap_or_else(|| DEFAULT_ORGANIZATION.into()),
                org_unit: env("CERT_ORG_UNIT")
                    .or(file.org_unit)
                    .unwrap_or_else(|| DEFAULT_ORG_UNIT.into()),
            },
            paths,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        validate_days(self.validity_days)?;
        if self.ca_validity_days == 0 || self.ca_validity_days > MAX_CA_DAYS {
            return Err(Error::InvalidDays(format!(
                "CA validity must be between 1 and {} days",
                MAX_CA_DAYS
            )));
        }
        validate_key_size(self.key_size)?;
        if self.names.is_empty() {
            return Err(Error::Configuration(
                "CERT_NAMES must list at least one name".into(),
            ));
        }
        for name in &self.names {
            crate::fs::validate_name(name)?;
        }
        Ok(())
    }

    /// The Common Name, or `MissingRequiredField` if none was configured.
    pub fn require_common_name(&self) -> Result<&str> {
        match self.common_name.as_deref() {
            Some(cn) if !cn.is_empty() => Ok(cn),
            _ => Err(Error::MissingRequiredField("CERT_CN")),
        }
    }

    pub fn uses_default_passwords(&self) -> bool {
        self.key_password.as_str() == DEFAULT_PASSWORD
            || self.pfx_password.as_str() == DEFAULT_PASSWORD
    }

    /// Friendly name for the certificate called `name` in this batch.
    pub fn friendly_name_for(&self, name: &str) -> String {
        match &self.friendly_name {
            Some(friendly) if self.names.len() == 1 => friendly.clone(),
            Some(friendly) => format!("{}-{}", friendly, name),
            None => name.to_string(),
        }
    }
}

/// Validate that a leaf validity period is within allowed bounds.
pub fn validate_days(days: u32) -> Result<()> {
    if days == 0 {
        return Err(Error::InvalidDays("days cannot be 0".into()));
    }
    if days > MAX_CERT_DAYS {
        return Err(Error::InvalidDays(format!(
            "days cannot exceed {} (10 years)",
            MAX_CERT_DAYS
        )));
    }
    Ok(())
}

pub fn validate_key_size(bits: u32) -> Result<()> {
    if SUPPORTED_KEY_SIZES.contains(&bits) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "CERT_SIZE must be one of {:?} (got {})",
            SUPPORTED_KEY_SIZES, bits
        )))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_number(value: Option<String>, key: &str) -> Result<Option<u32>> {
    value
        .map(|v| {
            v.trim().parse::<u32>().map_err(|_| {
                Error::Configuration(format!("{} must be a positive integer (got '{}')", key, v))
            })
        })
        .transpose()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Directory layout for certificates, rendered configs and templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub certs: PathBuf,
    pub config: PathBuf,
    pub templates: PathBuf,
}

/// Every file produced for one certificate name.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub key: PathBuf,
    pub crt: PathBuf,
    pub csr: PathBuf,
    pub pem: PathBuf,
    pub pfx: PathBuf,
    pub p12: PathBuf,
    pub conf: PathBuf,
}

/// Root CA files.
#[derive(Debug, Clone)]
pub struct CaPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub csr: PathBuf,
    pub pem: PathBuf,
    pub serial: PathBuf,
    pub conf: PathBuf,
}

impl Paths {
    pub fn new(certs: PathBuf, config: PathBuf, templates: PathBuf) -> Self {
        Self {
            certs,
            config,
            templates,
        }
    }

    /// All three directories under one root.
    pub fn under(root: &Path) -> Self {
        Self::new(
            root.join("certs"),
            root.join("config"),
            root.join("templates"),
        )
    }

    pub fn default_base() -> PathBuf {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "certforge") {
            proj_dirs.data_dir().to_path_buf()
        } else if let Some(base_dirs) = BaseDirs::new() {
            base_dirs.home_dir().join(".certforge")
        } else {
            PathBuf::from("/tmp/.certforge")
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        crate::fs::ensure_dir(&self.certs)?;
        crate::fs::ensure_dir(&self.config)?;
        crate::fs::ensure_dir(&self.templates)?;
        Ok(())
    }

    pub fn artifacts(&self, name: &str) -> ArtifactPaths {
        let cert = |ext: &str| self.certs.join(format!("{}.{}", name, ext));
        ArtifactPaths {
            key: cert("key"),
            crt: cert("crt"),
            csr: cert("csr"),
            pem: cert("pem"),
            pfx: cert("pfx"),
            p12: cert("p12"),
            conf: self.config.join(format!("{}.conf", name)),
        }
    }

    pub fn ca(&self) -> CaPaths {
        CaPaths {
            key: self.certs.join("ca.key"),
            cert: self.certs.join("ca.crt"),
            csr: self.certs.join("ca.csr"),
            pem: self.certs.join("ca.pem"),
            serial: self.certs.join("ca.srl"),
            conf: self.config.join("ca.conf"),
        }
    }

    pub fn template(&self, cert_type: CertType) -> PathBuf {
        self.templates.join(format!("{}.cnf", cert_type.as_str()))
    }
}
