use std::{fs::OpenOptions, io, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEBUG_DIRECTIVES: &str = "info,create_template=debug,rpve=debug,provisioner=debug,iac=debug,resources=debug";

fn filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new(DEBUG_DIRECTIVES);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr, and also append to `log_file` when given.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        },
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter(debug))
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .with_context(|| "Failed to initialize logging")
}
