// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Local root CA, server/client certificate issuance, and trust-store
//! installation.
//!
//! ```rust,no_run
//! use certforge::{pipeline, Settings};
//!
//! let settings = Settings::from_env()?;
//! let report = pipeline::generate(&settings)?;
//! for name in &report.issued {
//!     println!("{}", name);
//! }
//! # Ok::<(), certforge::Error>(())
//! ```
//!
//! Installing an exported container:
//!
//! ```rust,no_run
//! use certforge::locate::DirectorySource;
//! use certforge::trust::{detect_backend, Reconciler};
//!
//! let reconciler = Reconciler::new(detect_backend());
//! let source = DirectorySource::new("certs");
//! let outcome = reconciler.install_named("api", &source, Some("changeit"))?;
//! println!("{}", outcome.subject);
//! # Ok::<(), certforge::Error>(())
//! ```

/// Root CA lifecycle and key encryption.
pub mod ca;
/// Binary process setup.
pub mod cli;
/// Settings and filesystem layout.
pub mod config;
/// Error types.
pub mod error;
/// PEM and PKCS#12 packaging.
pub mod export;
/// Filesystem utilities.
pub mod fs;
/// Leaf certificate issuance.
pub mod issue;
/// Name resolution in a certificate store.
pub mod locate;
/// The `generate` batch.
pub mod pipeline;
/// Request configuration parsing.
pub mod profile;
/// Template rendering and subject alternative names.
pub mod san;
/// System trust store management.
pub mod trust;
/// X.509 certificate parsing.
pub mod x509;

pub use ca::CertificateAuthority;
pub use config::{CertType, Paths, Settings, DEFAULT_PASSWORD};
pub use error::{Error, Result};
pub use export::{ExportPackager, VerificationWarning};
pub use issue::{CertificateIssuer, CertificateRequest, IssuedCertificate, CLIENT_SUFFIX};
pub use locate::{Artifact, CertificateSource, DirectorySource};
pub use trust::{detect_backend, Reconciler, TrustStoreBackend};
pub use x509::{parse_cert_file, parse_cert_pem, CertInfo};
