//! Shared helpers and error types for CineVault.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Result type for shared helpers.
pub type UtilsResult<T> = Result<T, UtilsError>;

/// Shared error variants for cross-crate helpers.
#[derive(Debug, Error)]
pub enum UtilsError {
    /// An IO error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The tracing subscriber could not be installed.
    #[error("logging error: {0}")]
    Logging(String),
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise warnings are shown, or debug output
/// when `verbose` is true. Logs go to stderr so command output stays clean.
pub fn init_tracing(verbose: bool) -> UtilsResult<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| UtilsError::Logging(err.to_string()))
}

/// Replace the contents of `path` in one step.
///
/// The text goes to a sibling temp file that is then renamed over the
/// target, so readers see either the old contents or the new ones.
pub fn write_atomic(path: &Path, contents: &str) -> UtilsResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("tmp");
    if let Err(err) = fs::write(&temp, contents) {
        let _ = fs::remove_file(&temp);
        return Err(err.into());
    }
    fs::rename(&temp, path)?;
    Ok(())
}

/// Read `path` as text, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> UtilsResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
