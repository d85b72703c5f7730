// --- File: src/logging.rs ---

//! Logging setup.
//!
//! Library code only emits `tracing` events; the binary installs the
//! subscriber once. `RUST_LOG` takes precedence over the configured level.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a console subscriber at `level`, optionally mirroring every
/// event into `log_file` (without ANSI colours).
///
/// Returns `false` when a global subscriber was already installed, which is
/// harmless in tests that start several runs in one process.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> std::io::Result<bool> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            Some(fmt::layer().with_ansi(false).with_target(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .is_ok())
}
