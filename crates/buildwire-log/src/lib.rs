// ABOUTME: Shared logging setup for the buildwire binary
// ABOUTME: init() logs to stderr; init_file() appends to a log file for long-running sessions

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(filter(Level::INFO))
        .with_writer(io::stderr)
        .init();
}

/// Append logs to `path`, creating parent directories. Default: INFO level,
/// RUST_LOG override. Falls back to stderr with a warning if the file cannot
/// be opened.
pub fn init_file(path: &Path) {
    match open_log(path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter(Level::INFO))
            .with_writer(file)
            .with_ansi(false)
            .init(),
        Err(e) => {
            eprintln!(
                "Warning: cannot log to {}: {e}; logging to stderr",
                path.display()
            );
            init();
        }
    }
}

fn filter(default: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(default.into())
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}
