// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use certforge::config::CertType;
use certforge::san::{install_default_templates, template_state, TemplateState};
use certforge::{cli, pipeline, Result, Settings};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "certforge")]
#[command(about = "Issue a local root CA and server/client certificates")]
#[command(version)]
#[command(after_help = "\
Settings come from CERT_* environment variables (CERT_CN is required for generate)
and an optional certforge.toml named by CERTFORGE_SETTINGS.

EXAMPLES:
    CERT_CN=api.example.com CERT_NAMES=api,web certforge
    certforge init
    certforge templates --reset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the CA, then issue and export every name in CERT_NAMES (default)
    Generate,

    /// Create the output directories and install missing default templates
    Init,

    /// Show where each certificate template comes from
    Templates {
        /// Overwrite all templates with the built-in defaults
        #[arg(long)]
        reset: bool,
    },
}

fn main() {
    cli::reset_sigpipe();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help and version go to stdout and are not failures
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
    let settings = Settings::from_env()?;

    match cli.command.unwrap_or(Commands::Generate) {
        Commands::Generate => cmd_generate(&settings),
        Commands::Init => cmd_init(&settings),
        Commands::Templates { reset } => cmd_templates(&settings, reset),
    }
}

fn cmd_generate(settings: &Settings) -> Result<()> {
    let report = pipeline::generate(settings)?;

    for name in &report.issued {
        println!("Issued: {}", name);
    }
    for (name, err) in &report.failed {
        println!("Failed: {} ({})", name, err);
    }
    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }
    println!();
    println!("Certificates: {}", settings.paths.certs.display());
    println!("CA:           {}", settings.paths.ca().cert.display());

    // Per-name failures are reported, not fatal.
    Ok(())
}

fn cmd_init(settings: &Settings) -> Result<()> {
    settings.paths.ensure_dirs()?;
    let written = install_default_templates(&settings.paths, false)?;
    if written.is_empty() {
        println!("Templates already installed in {}", settings.paths.templates.display());
    }
    for path in &written {
        println!("Installed template: {}", path.display());
    }
    println!("Certificates: {}", settings.paths.certs.display());
    println!("Configs:      {}", settings.paths.config.display());
    Ok(())
}

fn cmd_templates(settings: &Settings, reset: bool) -> Result<()> {
    if reset {
        for path in install_default_templates(&settings.paths, true)? {
            tracing::info!(template = %path.display(), "Reset template");
        }
    }

    for cert_type in CertType::ALL {
        let state = match template_state(&settings.paths, cert_type) {
            TemplateState::Builtin => "built-in",
            TemplateState::Customized => "customized",
            TemplateState::Missing => "missing (run 'certforge init')",
        };
        println!(
            "{:<8} {:<12} {}",
            cert_type,
            state,
            settings.paths.template(cert_type).display()
        );
    }
    Ok(())
}
