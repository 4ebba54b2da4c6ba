// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Key, CSR and certificate generation for one named certificate.

use crate::ca::{self, CertificateAuthority};
use crate::config::{ArtifactPaths, CertType, Settings};
use crate::error::Result;
use crate::fs::{atomic_write, atomic_write_secret, is_present};
use crate::profile::RequestProfile;
use crate::san::{alt_names_for, AltName, TemplateRenderer, TemplateVars};
use rcgen::{KeyPair, SerialNumber};
use zeroize::Zeroizing;

/// Suffix for the client certificate derived from a server certificate.
pub const CLIENT_SUFFIX: &str = "_client";

/// Everything needed to issue one certificate.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub name: String,
    pub cert_type: CertType,
    pub common_name: String,
    pub alt_names: Vec<AltName>,
    pub key_size: u32,
    pub validity_days: u32,
    pub key_password: Zeroizing<String>,
    pub friendly_name: String,
}

impl CertificateRequest {
    /// Build the request for `name` from the run settings.
    pub fn from_settings(settings: &Settings, name: &str) -> Result<Self> {
        crate::fs::validate_name(name)?;
        let common_name = settings.require_common_name()?;
        Ok(Self {
            name: name.to_string(),
            cert_type: settings.cert_type,
            common_name: common_name.to_string(),
            alt_names: alt_names_for(common_name, &settings.alt_names),
            key_size: settings.key_size,
            validity_days: settings.validity_days,
            key_password: settings.key_password.clone(),
            friendly_name: settings.friendly_name_for(name),
        })
    }

    /// The companion client request issued alongside a server certificate.
    pub fn derived_client(&self) -> Self {
        Self {
            name: format!("{}{}", self.name, CLIENT_SUFFIX),
            cert_type: CertType::Client,
            friendly_name: format!("{}{}", self.friendly_name, CLIENT_SUFFIX),
            ..self.clone()
        }
    }
}

/// A signed certificate and the material it was produced from.
pub struct IssuedCertificate {
    pub name: String,
    pub cert_type: CertType,
    pub friendly_name: String,
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub csr_pem: String,
    /// Password-protected key, as written to disk.
    pub encrypted_key_pem: String,
    /// Unencrypted PKCS#8 key, kept in memory for packaging only.
    pub key_der: Zeroizing<Vec<u8>>,
    pub key_password: Zeroizing<String>,
    pub files: ArtifactPaths,
}

/// Result of issuing one request.
pub struct Issuance {
    pub primary: IssuedCertificate,
    /// Present for server requests.
    pub derived_client: Option<IssuedCertificate>,
}

impl Issuance {
    pub fn certificates(&self) -> impl Iterator<Item = &IssuedCertificate> {
        std::iter::once(&self.primary).chain(self.derived_client.as_ref())
    }
}

pub struct CertificateIssuer<'a> {
    settings: &'a Settings,
    ca: &'a CertificateAuthority,
    renderer: &'a TemplateRenderer,
}

impl<'a> CertificateIssuer<'a> {
    pub fn new(
        settings: &'a Settings,
        ca: &'a CertificateAuthority,
        renderer: &'a TemplateRenderer,
    ) -> Self {
        Self {
            settings,
            ca,
            renderer,
        }
    }

    /// Issue the certificate for `request`, plus a client certificate
    /// sharing its key when the request is a server certificate.
    pub fn issue(&self, request: &CertificateRequest) -> Result<Issuance> {
        let profile = self.resolve_profile(request)?;

        tracing::debug!(name = %request.name, bits = request.key_size, "Generating private key");
        let key_pair = ca::generate_key(request.key_size)?;

        let primary = self.sign_request(request, &profile, &key_pair)?;
        tracing::info!(
            name = %request.name,
            cn = %request.common_name,
            cert_type = %request.cert_type,
            "Issued certificate"
        );

        let derived_client = if request.cert_type == CertType::Server {
            let client_request = request.derived_client();
            let client_profile = self.resolve_profile(&client_request)?;
            let client = self.sign_request(&client_request, &client_profile, &key_pair)?;
            tracing::info!(name = %client_request.name, "Issued derived client certificate");
            Some(client)
        } else {
            None
        };

        Ok(Issuance {
            primary,
            derived_client,
        })
    }

    /// Load the request's rendered config, rendering it first when absent.
    fn resolve_profile(&self, request: &CertificateRequest) -> Result<RequestProfile> {
        let conf = self.settings.paths.artifacts(&request.name).conf;
        if !is_present(&conf) {
            let mut vars =
                TemplateVars::for_request(self.settings, &request.common_name, &request.alt_names);
            vars.set("CERT_KEY_SIZE", request.key_size.to_string());
            self.renderer
                .render_to_file(request.cert_type, &vars, &conf)?;
        } else {
            tracing::debug!(config = %conf.display(), "Using existing configuration");
        }
        RequestProfile::load(&conf)
    }

    fn sign_request(
        &self,
        request: &CertificateRequest,
        profile: &RequestProfile,
        key_pair: &KeyPair,
    ) -> Result<IssuedCertificate> {
        let files = self.settings.paths.artifacts(&request.name);

        let key_pem = Zeroizing::new(key_pair.serialize_pem());
        let encrypted_key_pem = ca::encrypt_key_pem(&key_pem, &request.key_password)?;
        atomic_write_secret(&files.key, encrypted_key_pem.as_bytes())?;

        let csr_pem = profile.request_params()?.serialize_request(key_pair)?.pem()?;
        atomic_write(&files.csr, csr_pem.as_bytes())?;

        let cert = if request.cert_type == CertType::Ca {
            let mut params = profile.request_params()?;
            profile.apply_extensions(&mut params)?;
            ca::set_validity(&mut params, request.validity_days);
            params.serial_number = Some(SerialNumber::from(self.ca.next_serial()?));
            params.self_signed(key_pair)?
        } else {
            self.ca.sign(&csr_pem, profile, request.validity_days)?
        };

        let cert_pem = cert.pem();
        atomic_write(&files.crt, cert_pem.as_bytes())?;

        Ok(IssuedCertificate {
            name: request.name.clone(),
            cert_type: request.cert_type,
            friendly_name: request.friendly_name.clone(),
            cert_der: cert.der().to_vec(),
            cert_pem,
            csr_pem,
            encrypted_key_pem,
            key_der: Zeroizing::new(key_pair.serialize_der()),
            key_password: request.key_password.clone(),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::san::install_default_templates;
    use crate::x509::parse_cert_pem;
    use std::path::Path;

    fn settings_for(root: &Path, extra: &[(&str, &str)]) -> Settings {
        let mut vars: Vec<(String, String)> = vec![
            ("CERTFORGE_HOME".into(), root.display().to_string()),
            ("CERT_OUTPUT_DIR".into(), root.join("certs").display().to_string()),
            ("CERT_CONFIG_DIR".into(), root.join("config").display().to_string()),
            ("CERT_TEMPLATES_DIR".into(), root.join("templates").display().to_string()),
        ];
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        Settings::load(|key| {
            vars.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    fn setup(
        root: &Path,
        extra: &[(&str, &str)],
    ) -> (Settings, TemplateRenderer, CertificateAuthority) {
        let settings = settings_for(root, extra);
        install_default_templates(&settings.paths, false).unwrap();
        let renderer = TemplateRenderer::new(&settings.paths);
        let ca = CertificateAuthority::ensure(&settings, &renderer).unwrap();
        (settings, renderer, ca)
    }

    #[test]
    fn test_server_issuance_derives_client() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer, ca) = setup(
            dir.path(),
            &[
                ("CERT_CN", "api.example.com"),
                ("CERT_ALT_NAMES", "DNS:api.example.com,IP:10.0.0.5"),
            ],
        );
        let issuer = CertificateIssuer::new(&settings, &ca, &renderer);
        let request = CertificateRequest::from_settings(&settings, "api").unwrap();
        let issuance = issuer.issue(&request).unwrap();

        let ca_info = ca.info().unwrap();
        let server = parse_cert_pem(&issuance.primary.cert_pem).unwrap();
        assert_eq!(server.issuer, ca_info.subject);
        assert_eq!(server.common_name.as_deref(), Some("api.example.com"));
        assert!(server.server_auth);
        assert!(!server.is_ca);
        assert_eq!(
            server.subject_alt_names,
            vec!["api.example.com".to_string(), "10.0.0.5".to_string()]
        );
        assert!((364..=365).contains(&server.validity_days()));

        let client = issuance.derived_client.as_ref().unwrap();
        assert_eq!(client.name, "api_client");
        assert_eq!(client.friendly_name, "api_client");
        let client_info = parse_cert_pem(&client.cert_pem).unwrap();
        assert!(client_info.client_auth);
        assert_eq!(client_info.issuer, ca_info.subject);
        assert_ne!(client_info.serial_hex, server.serial_hex);

        // the client reuses the server key
        assert_eq!(*client.key_der, *issuance.primary.key_der);

        for files in [&issuance.primary.files, &client.files] {
            for path in [&files.key, &files.csr, &files.crt, &files.conf] {
                assert!(is_present(path), "missing {}", path.display());
            }
        }
        assert_eq!(issuance.certificates().count(), 2);
    }

    #[test]
    fn test_client_issuance_has_no_companion() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer, ca) = setup(
            dir.path(),
            &[("CERT_CN", "device-1"), ("CERT_TYPE", "client")],
        );
        let issuer = CertificateIssuer::new(&settings, &ca, &renderer);
        let request = CertificateRequest::from_settings(&settings, "device").unwrap();
        let issuance = issuer.issue(&request).unwrap();

        assert!(issuance.derived_client.is_none());
        let info = parse_cert_pem(&issuance.primary.cert_pem).unwrap();
        assert!(info.client_auth);
        // CN becomes the only SAN when none are configured
        assert_eq!(info.subject_alt_names, vec!["device-1".to_string()]);
    }

    #[test]
    fn test_ca_type_request_is_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer, ca) = setup(
            dir.path(),
            &[("CERT_CN", "Team Root"), ("CERT_TYPE", "ca")],
        );
        let issuer = CertificateIssuer::new(&settings, &ca, &renderer);
        let request = CertificateRequest::from_settings(&settings, "team-root").unwrap();
        let issuance = issuer.issue(&request).unwrap();

        let info = parse_cert_pem(&issuance.primary.cert_pem).unwrap();
        assert!(info.is_ca);
        assert!(info.is_self_issued());
        assert!(issuance.derived_client.is_none());
    }

    #[test]
    fn test_missing_common_name_fails_before_generation() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path(), &[]);
        assert!(matches!(
            CertificateRequest::from_settings(&settings, "api"),
            Err(Error::MissingRequiredField("CERT_CN"))
        ));
        assert!(!settings.paths.artifacts("api").key.exists());
    }

    #[test]
    fn test_existing_config_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, renderer, ca) = setup(
            dir.path(),
            &[("CERT_CN", "web.example.com"), ("CERT_TYPE", "client")],
        );
        let conf = settings.paths.artifacts("web").conf;
        std::fs::write(
            &conf,
            "[req]\ndistinguished_name = dn\nreq_extensions = ext\n[dn]\nCN = custom.example.com\n\
             [ext]\nextendedKeyUsage = clientAuth\nsubjectAltName = DNS:custom.example.com\n",
        )
        .unwrap();

        let issuer = CertificateIssuer::new(&settings, &ca, &renderer);
        let request = CertificateRequest::from_settings(&settings, "web").unwrap();
        let issuance = issuer.issue(&request).unwrap();
        let info = parse_cert_pem(&issuance.primary.cert_pem).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("custom.example.com"));
    }

    #[test]
    fn test_derived_client_request() {
        let request = CertificateRequest {
            name: "api".into(),
            cert_type: CertType::Server,
            common_name: "api.local".into(),
            alt_names: vec![AltName::dns("api.local")],
            key_size: 2048,
            validity_days: 30,
            key_password: Zeroizing::new("pw".into()),
            friendly_name: "My API".into(),
        };
        let client = request.derived_client();
        assert_eq!(client.name, "api_client");
        assert_eq!(client.friendly_name, "My API_client");
        assert_eq!(client.cert_type, CertType::Client);
        assert_eq!(client.alt_names, request.alt_names);
    }
}
