// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Subject Alternative Name parsing and configuration template rendering.

use crate::config::{CertType, Paths, Settings};
use crate::error::{Error, Result};
use crate::fs::{atomic_write, ensure_dir, is_present};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Marker replaced by the generated `DNS.n`/`IP.n` block.
pub const ALT_NAMES_MARKER: &str = "${CERT_ALT_NAMES}";

/// Rendered configs shorter than this are treated as a failed substitution.
const MIN_RENDERED_BYTES: usize = 64;

static VARIABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("invalid variable regex"));

const SERVER_TEMPLATE: &str = include_str!("templates/server.cnf");
const CLIENT_TEMPLATE: &str = include_str!("templates/client.cnf");
const CA_TEMPLATE: &str = include_str!("templates/ca.cnf");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanKind {
    Dns,
    Ip,
}

impl SanKind {
    pub fn tag(&self) -> &'static str {
        match self {
            SanKind::Dns => "DNS",
            SanKind::Ip => "IP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltName {
    pub kind: SanKind,
    pub value: String,
}

impl AltName {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: SanKind::Dns,
            value: value.into(),
        }
    }

    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            kind: SanKind::Ip,
            value: value.into(),
        }
    }
}

impl fmt::Display for AltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.tag(), self.value)
    }
}

/// Parse a comma-separated list such as `DNS:a.com,IP:1.2.3.4,b.com`.
///
/// Untagged items are DNS names. Blank items are skipped.
pub fn parse_alt_names(raw: &str) -> Vec<AltName> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(':') {
            Some((tag, value)) if tag.eq_ignore_ascii_case("dns") => AltName::dns(value.trim()),
            Some((tag, value)) if tag.eq_ignore_ascii_case("ip") => AltName::ip(value.trim()),
            _ => AltName::dns(item),
        })
        .filter(|name| !name.value.is_empty())
        .collect()
}

/// Alt names for a request, falling back to the Common Name when none are given.
pub fn alt_names_for(common_name: &str, raw: &str) -> Vec<AltName> {
    let names = parse_alt_names(raw);
    if !names.is_empty() {
        return names;
    }
    if common_name.parse::<IpAddr>().is_ok() {
        vec![AltName::ip(common_name)]
    } else {
        vec![AltName::dns(common_name)]
    }
}

/// Number entries with one 1-based counter shared by every tag kind.
pub fn render_alt_names(names: &[AltName]) -> String {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{}.{} = {}\n", name.kind.tag(), i + 1, name.value))
        .collect()
}

/// Variables available to `${NAME}` references in templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables for a certificate with the given Common Name and alt names.
    pub fn for_request(settings: &Settings, common_name: &str, alt_names: &[AltName]) -> Self {
        let subject = &settings.subject;
        let mut vars = Self::new();
        vars.set("CERT_CN", escape_config_value(common_name));
        vars.set("CERT_ALT_NAMES", escape_config_value(&render_alt_names(alt_names)));
        vars.set("CERT_KEY_SIZE", settings.key_size.to_string());
        vars.set("CERT_COUNTRY", escape_config_value(&subject.country));
        vars.set("CERT_STATE", escape_config_value(&subject.state));
        vars.set("CERT_LOCALITY", escape_config_value(&subject.locality));
        vars.set("CERT_ORGANIZATION", escape_config_value(&subject.organization));
        vars.set("CERT_ORG_UNIT", escape_config_value(&subject.org_unit));
        vars
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Escape `\` and `#` so a value survives the config comment syntax.
pub fn escape_config_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '#') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Renders type-specific templates from the templates directory.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    templates_dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new(paths: &Paths) -> Self {
        Self {
            templates_dir: paths.templates.clone(),
        }
    }

    pub fn template_path(&self, cert_type: CertType) -> PathBuf {
        self.templates_dir.join(format!("{}.cnf", cert_type.as_str()))
    }

    /// Render the template for `cert_type` into a configuration string.
    pub fn render(&self, cert_type: CertType, vars: &TemplateVars) -> Result<String> {
        let path = self.template_path(cert_type);
        if !path.is_file() {
            return Err(Error::TemplateNotFound {
                cert_type: cert_type.to_string(),
                path,
            });
        }
        let template = crate::fs::read_to_string(&path)?;

        let rendered = expand_variables(&template, vars);
        if rendered.trim().len() >= MIN_RENDERED_BYTES {
            return Ok(rendered);
        }

        tracing::warn!(
            template = %path.display(),
            bytes = rendered.len(),
            "Variable expansion produced a suspiciously small config, retrying with literal substitution"
        );
        let fallback = substitute_literal(&template, vars);
        if fallback.trim().len() >= MIN_RENDERED_BYTES {
            return Ok(fallback);
        }

        Err(Error::TemplateRender {
            cert_type: cert_type.to_string(),
            bytes: fallback.len(),
        })
    }

    /// Render and write the configuration to `dest`.
    pub fn render_to_file(
        &self,
        cert_type: CertType,
        vars: &TemplateVars,
        dest: &Path,
    ) -> Result<String> {
        let rendered = self.render(cert_type, vars)?;
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        atomic_write(dest, rendered.as_bytes())?;
        tracing::debug!(config = %dest.display(), %cert_type, "Rendered configuration");
        Ok(rendered)
    }
}

/// envsubst-style expansion: every `${NAME}` is replaced, unknown names become empty.
fn expand_variables(template: &str, vars: &TemplateVars) -> String {
    VARIABLE_REGEX
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1]).unwrap_or_default().to_string()
        })
        .into_owned()
}

/// Replace only the known markers, leaving anything else untouched.
fn substitute_literal(template: &str, vars: &TemplateVars) -> String {
    vars.values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("${{{}}}", key), value)
        })
}

pub fn builtin_template(cert_type: CertType) -> &'static str {
    match cert_type {
        CertType::Server => SERVER_TEMPLATE,
        CertType::Client => CLIENT_TEMPLATE,
        CertType::Ca => CA_TEMPLATE,
    }
}

/// Where a template on disk comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateState {
    Builtin,
    Customized,
    Missing,
}

pub fn template_state(paths: &Paths, cert_type: CertType) -> TemplateState {
    match std::fs::read_to_string(paths.template(cert_type)) {
        Ok(content) if content == builtin_template(cert_type) => TemplateState::Builtin,
        Ok(_) => TemplateState::Customized,
        Err(_) => TemplateState::Missing,
    }
}

/// Write the built-in templates. Existing files are kept unless `overwrite` is set.
/// Returns the paths that were written.
pub fn install_default_templates(paths: &Paths, overwrite: bool) -> Result<Vec<PathBuf>> {
    ensure_dir(&paths.templates)?;
    let mut written = Vec::new();
    for cert_type in CertType::ALL {
        let path = paths.template(cert_type);
        if overwrite || !is_present(&path) {
            atomic_write(&path, builtin_template(cert_type).as_bytes())?;
            written.push(path);
        }
    }
    Ok(written)
}
