use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid recipe: {0}")]
    #[diagnostic(help("parameters look like {{Name}}; `*` and `**` must stand alone"))]
    Recipe(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("missing config file {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("{0}")]
    Extraction(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("file list error: {0}")]
    Ledger(String),

    #[error("could not compute digest of {0}")]
    Digest(PathBuf),

    #[error("archive request failed: {0}")]
    Transport(String),

    #[error("archive returned status {status}: {message}")]
    TransportStatus { status: u16, message: String },

    #[error("archive target unavailable: {0}")]
    #[diagnostic(help("check that the project exists and that you have write access to it"))]
    TargetUnavailable(String),

    #[error("upload interrupted")]
    Interrupted,
}

/// Raised when captured and extracted values can't fill the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum MappingError {
    #[error("value {0} not found")]
    Missing(String),

    #[error("value {0} is empty")]
    Null(String),
}

impl KiraError {
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, KiraError::TargetUnavailable(_))
    }
}
