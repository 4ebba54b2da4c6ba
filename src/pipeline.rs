// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! The `generate` batch: CA bootstrap, then issue and export every name.

use crate::ca::CertificateAuthority;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::export::{ExportPackager, VerificationWarning};
use crate::issue::{CertificateIssuer, CertificateRequest};
use crate::san::{install_default_templates, TemplateRenderer};
use std::path::PathBuf;

/// Outcome of one `generate` run.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Names whose certificates were issued and exported, derived clients included.
    pub issued: Vec<String>,
    pub failed: Vec<(String, Error)>,
    pub warnings: Vec<VerificationWarning>,
    pub written: Vec<PathBuf>,
    pub ca_purged: bool,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.warnings.is_empty()
    }
}

/// Run the issuance batch.
///
/// Errors returned here are fatal for the whole batch: missing Common Name,
/// directory setup, or CA bootstrap. Failures for individual names are
/// logged and collected in the report instead.
pub fn generate(settings: &Settings) -> Result<BatchReport> {
    settings.require_common_name()?;
    settings.paths.ensure_dirs()?;

    let installed = install_default_templates(&settings.paths, false)?;
    for path in &installed {
        tracing::info!(template = %path.display(), "Installed default template");
    }

    if settings.uses_default_passwords() {
        tracing::warn!(
            "Using the default password for keys or PKCS#12 files; set CERT_KEY_PASSWORD and CERT_PFX_PASSWORD"
        );
    }

    let mut report = BatchReport::default();
    if !settings.preserve_ca_files {
        report.ca_purged = !CertificateAuthority::purge(&settings.paths)?.is_empty();
    }

    let renderer = TemplateRenderer::new(&settings.paths);
    let ca = CertificateAuthority::ensure(settings, &renderer).map_err(|e| {
        tracing::error!(error = %e, crypto = e.is_crypto(), "Root CA bootstrap failed");
        e
    })?;

    let issuer = CertificateIssuer::new(settings, &ca, &renderer);
    let packager = ExportPackager::new(&ca, &settings.pfx_password);

    for name in &settings.names {
        let _span = tracing::info_span!("certificate", name = %name).entered();
        match issue_and_export(&issuer, &packager, settings, name, &mut report) {
            Ok(()) => {}
            Err(e) => {
                tracing::error!(error = %e, crypto = e.is_crypto(), "Failed to issue certificate");
                report.failed.push((name.clone(), e));
            }
        }
    }

    tracing::info!(
        issued = report.issued.len(),
        failed = report.failed.len(),
        warnings = report.warnings.len(),
        "Generation finished"
    );
    Ok(report)
}

fn issue_and_export(
    issuer: &CertificateIssuer<'_>,
    packager: &ExportPackager<'_>,
    settings: &Settings,
    name: &str,
    report: &mut BatchReport,
) -> Result<()> {
    let request = CertificateRequest::from_settings(settings, name)?;
    let issuance = issuer.issue(&request)?;
    for cert in issuance.certificates() {
        let export = packager.package(cert)?;
        report.written.extend([
            cert.files.key.clone(),
            cert.files.csr.clone(),
            cert.files.crt.clone(),
        ]);
        report.written.extend(export.written);
        report.warnings.extend(export.warnings);
        report.issued.push(cert.name.clone());
    }
    Ok(())
}
