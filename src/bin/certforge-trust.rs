// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use certforge::locate::{self, DirectorySource};
use certforge::trust::{detect_backend, InstallOutcome, Reconciler, TrustStoreBackend};
use certforge::{cli, Artifact, CertificateSource, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "certforge-trust")]
#[command(about = "Install exported certificates into the system trust store")]
#[command(version)]
#[command(after_help = "\
EXAMPLES:
    certforge-trust api                      # install certs/api.pfx
    certforge-trust --store /mnt/certs --list
    certforge-trust --uninstall \"My Service\"")]
struct Cli {
    /// Certificate to install: file name, stem, a unique part of the name, or
    /// a path to a certificate file. With --uninstall, the friendly name to remove.
    #[arg(required_unless_present_any = ["list", "installed"])]
    name: Option<String>,

    /// Password of the PKCS#12 container (default: changeit)
    #[arg(short, long)]
    password: Option<String>,

    /// Directory holding the exported certificates
    #[arg(short, long, default_value = "certs")]
    store: PathBuf,

    /// List the certificates available in the store
    #[arg(short, long)]
    list: bool,

    /// List the entries currently installed in the trust store
    #[arg(long, conflicts_with = "list")]
    installed: bool,

    /// Remove trust entries with this friendly name instead of installing
    #[arg(long)]
    uninstall: bool,
}

fn main() {
    cli::reset_sigpipe();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    cli::init_logging();

    if let Err(e) = run(cli) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    cli::exit_on_interrupt()?;
    let source = DirectorySource::new(&cli.store);

    if cli.list {
        return cmd_list(&source, cli.password.as_deref());
    }

    let reconciler = Reconciler::new(detect_backend());
    if cli.installed {
        return cmd_installed(&reconciler);
    }

    let name = cli.name.unwrap_or_default();
    if cli.uninstall {
        let removed = reconciler.uninstall(&name)?;
        println!(
            "Removed {} entr{} named '{}' from {}",
            removed,
            if removed == 1 { "y" } else { "ies" },
            name,
            reconciler.backend().name()
        );
        return Ok(());
    }

    // A path to an existing file skips name resolution.
    let path = Path::new(&name);
    let outcome = if path.is_file() {
        reconciler.install(&Artifact::from_path(path)?, cli.password.as_deref())?
    } else {
        reconciler.install_named(&name, &source, cli.password.as_deref())?
    };
    print_outcome(&outcome, reconciler.backend().name());
    Ok(())
}

fn cmd_list(source: &DirectorySource, password: Option<&str>) -> Result<()> {
    let lines = locate::describe_all(source, password)?;
    println!("Certificates in {}:", source.describe());
    if lines.is_empty() {
        println!("  (none)");
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_installed<B: TrustStoreBackend>(reconciler: &Reconciler<B>) -> Result<()> {
    let entries = reconciler.list_installed()?;
    println!("Installed in {}:", reconciler.backend().name());
    if entries.is_empty() {
        println!("  (none)");
    }
    for entry in entries {
        println!("  {}", entry);
    }
    Ok(())
}

fn print_outcome(outcome: &InstallOutcome, backend: &str) {
    println!("Installed {} into {}", outcome.artifact, backend);
    println!("  Subject:       {}", outcome.subject);
    if !outcome.friendly_name.is_empty() {
        println!("  Friendly name: {}", outcome.friendly_name);
    }
    if outcome.replaced > 0 {
        println!(
            "  Replaced:      {} prior entr{}",
            outcome.replaced,
            if outcome.replaced == 1 { "y" } else { "ies" }
        );
    }

    if !outcome.downgraded.is_empty() {
        eprintln!();
        eprintln!("WARNING: the certificate is NOT trusted machine-wide.");
        eprintln!("The per-user install succeeded, but these stores were not updated:");
        for warning in &outcome.downgraded {
            eprintln!("  - {}", warning);
        }
        eprintln!("Re-run as Administrator to install for all users.");
    }
}
