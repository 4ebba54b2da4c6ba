// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Process setup shared by the `certforge` and `certforge-trust` binaries.

use crate::error::{Error, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log filter variable, e.g. `CERTFORGE_LOG=certforge=debug`.
pub const LOG_ENV: &str = "CERTFORGE_LOG";

/// Exit status after SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Leveled logs to stderr; stdout stays free for command output.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}

/// Log and exit with [`EXIT_INTERRUPTED`] on SIGINT/SIGTERM. No rollback
/// happens; an interrupted run may leave partial artifacts behind.
pub fn exit_on_interrupt() -> Result<()> {
    ctrlc::set_handler(|| {
        tracing::warn!("Interrupted, exiting");
        std::process::exit(EXIT_INTERRUPTED);
    })
    .map_err(|e| Error::Configuration(format!("Failed to set signal handler: {}", e)))
}

/// Restore default SIGPIPE so piping into `head` ends quietly.
pub fn reset_sigpipe() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}
