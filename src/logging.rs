//! Subscriber setup: stderr output plus an optional append-only log file

use crate::{Error, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("bakvault=debug")
    } else {
        EnvFilter::new("bakvault=info")
    }
}

/// Log to stderr and, when `log_file` is given, append to that file as well
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(verbose)
        .with_line_number(verbose);

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Logging {
            reason: e.to_string(),
        })
}
