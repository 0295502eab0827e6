//! Crate-level error taxonomy
//!
//! Only startup-time failures are allowed to abort the process; everything a
//! worker hits at runtime is caught, classified and converted into a state
//! transition. The fatal variants here map to a non-zero exit code in `main`.

use std::path::PathBuf;

/// Errors that abort startup (exit non-zero)
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// Config file exists but cannot be parsed
    #[error("failed to parse config file {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// Required credential missing from every config source
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// Vote log or session storage cannot be opened/created
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
