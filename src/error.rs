use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GamelibError {
    #[error("corrupt catalog: {0}")]
    #[diagnostic(help("fix or remove the catalog file, then re-import the URL list"))]
    CorruptCatalog(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("already placed at {0}")]
    AlreadyPlaced(PathBuf),

    #[error("placement failed: {0}")]
    PlacementFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unknown catalog entry: {0}")]
    UnknownEntry(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("required tool not found: {0}")]
    #[diagnostic(help("install the tool and make sure it is on PATH, or run with --no-convert"))]
    MissingTool(String),

    #[error("failed to read settings file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse settings: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl GamelibError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GamelibError::Cancelled)
    }
}
