// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{
    command_failure, run_command, ScopeWarning, TrustCertificate, TrustStoreBackend,
    TrustStoreEntry,
};

/// Values reach PowerShell through the environment, never the script text.
const ENV_CERT_PATH: &str = "CERTFORGE_CERT_PATH";
const ENV_PASSWORD: &str = "CERTFORGE_PFX_PASSWORD";
const ENV_FRIENDLY_NAME: &str = "CERTFORGE_FRIENDLY_NAME";
const ENV_STORE: &str = "CERTFORGE_STORE_NAME";
const ENV_SCOPE: &str = "CERTFORGE_STORE_SCOPE";
const ENV_HAS_KEY: &str = "CERTFORGE_HAS_KEY";

const INSTALL_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$X509 = 'System.Security.Cryptography.X509Certificates'
if ($env:CERTFORGE_HAS_KEY -eq '1') {
    $flags = if ($env:CERTFORGE_STORE_SCOPE -eq 'LocalMachine') { 'PersistKeySet,MachineKeySet' } else { 'PersistKeySet,UserKeySet' }
    $cert = New-Object "$X509.X509Certificate2" ($env:CERTFORGE_CERT_PATH, $env:CERTFORGE_PFX_PASSWORD, $flags)
} else {
    $cert = New-Object "$X509.X509Certificate2" (,$env:CERTFORGE_CERT_PATH)
}
$cert.FriendlyName = $env:CERTFORGE_FRIENDLY_NAME
$store = New-Object "$X509.X509Store" ($env:CERTFORGE_STORE_NAME, $env:CERTFORGE_STORE_SCOPE)
$store.Open('ReadWrite')
try { $store.Add($cert) } finally { $store.Close() }
"#;

const UNINSTALL_SCRIPT: &str = r#"
$removed = 0
foreach ($scope in 'CurrentUser', 'LocalMachine') {
    foreach ($name in 'My', 'Root') {
        Get-ChildItem -Path "Cert:\$scope\$name" -ErrorAction SilentlyContinue |
            Where-Object { $_.FriendlyName -eq $env:CERTFORGE_FRIENDLY_NAME } |
            ForEach-Object {
                try { Remove-Item -Path $_.PSPath -ErrorAction Stop; $removed++ } catch { }
            }
    }
}
Write-Output $removed
"#;

const LIST_SCRIPT: &str = r#"
foreach ($scope in 'CurrentUser', 'LocalMachine') {
    foreach ($name in 'My', 'Root') {
        Get-ChildItem -Path "Cert:\$scope\$name" -ErrorAction SilentlyContinue |
            Where-Object { $_.FriendlyName -ne '' } |
            ForEach-Object { "$scope\$name`t$($_.Thumbprint)`t$($_.FriendlyName)`t$($_.Subject)" }
    }
}
"#;

/// Windows certificate stores, driven through PowerShell and .NET.
pub struct WindowsBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    CurrentUser,
    LocalMachine,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::CurrentUser => "CurrentUser",
            Scope::LocalMachine => "LocalMachine",
        }
    }
}

fn powershell(script: &str, envs: &[(&str, &str)]) -> Result<std::process::Output> {
    run_command(
        "powershell.exe",
        &["-NoProfile", "-NonInteractive", "-Command", script],
        envs,
    )
}

impl WindowsBackend {
    fn add_to_store(
        &self,
        cert: &TrustCertificate,
        friendly_name: &str,
        store: &str,
        scope: Scope,
    ) -> Result<()> {
        let path = path_to_str(&cert.artifact.path)?;
        let envs = [
            (ENV_CERT_PATH, path),
            (ENV_PASSWORD, cert.password.as_str()),
            (ENV_FRIENDLY_NAME, friendly_name),
            (ENV_STORE, store),
            (ENV_SCOPE, scope.as_str()),
            (ENV_HAS_KEY, if cert.has_key { "1" } else { "0" }),
        ];
        let output = powershell(INSTALL_SCRIPT, &envs)?;
        if !output.status.success() {
            return Err(command_failure(
                &format!("add to {}\\{}", scope.as_str(), store),
                &output,
            ));
        }
        tracing::debug!(scope = scope.as_str(), store, "Added certificate");
        Ok(())
    }
}

impl TrustStoreBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "Windows Certificate Store"
    }

    fn install(&self, cert: &TrustCertificate, friendly_name: &str) -> Result<Vec<ScopeWarning>> {
        let mut stores = vec!["My"];
        if cert.is_trust_anchor() {
            stores.push("Root");
        }

        let mut warnings = Vec::new();
        for store in stores {
            // Per-user failures are fatal.
            self.add_to_store(cert, friendly_name, store, Scope::CurrentUser)?;

            if let Err(e) = self.add_to_store(cert, friendly_name, store, Scope::LocalMachine) {
                warnings.push(ScopeWarning {
                    store: format!("{}\\{}", Scope::LocalMachine.as_str(), store),
                    message: e.to_string(),
                });
            }
        }
        Ok(warnings)
    }

    fn uninstall(&self, friendly_name: &str) -> Result<usize> {
        let output = powershell(UNINSTALL_SCRIPT, &[(ENV_FRIENDLY_NAME, friendly_name)])?;
        if !output.status.success() {
            return Err(command_failure("remove certificates", &output));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse()
            .map_err(|_| {
                Error::TrustStore(format!("Unexpected PowerShell output: {}", stdout.trim()))
            })
    }

    fn list_installed(&self) -> Result<Vec<TrustStoreEntry>> {
        let output = powershell(LIST_SCRIPT, &[])?;
        if !output.status.success() {
            return Err(command_failure("list certificates", &output));
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `store<TAB>thumbprint<TAB>friendly<TAB>subject` lines.
fn parse_listing(stdout: &str) -> Vec<TrustStoreEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim_end_matches('\r').splitn(4, '\t');
            let store = fields.next()?;
            let thumbprint = fields.next()?;
            let friendly_name = fields.next()?;
            let subject = fields.next()?;
            Some(TrustStoreEntry {
                friendly_name: friendly_name.to_string(),
                subject: subject.to_string(),
                location: format!("{}\\{}", store, thumbprint),
            })
        })
        .collect()
}
