//! Error types for bakvault

use crate::backup::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for bakvault operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Cannot open file list {}: {source}", path.display())]
    FileList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create directory {}: {source}", path.display())]
    DestinationDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error creating archive {}: {source}", path.display())]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive is corrupt: {reason}")]
    ArchiveCorrupt { reason: String },

    #[error("Invalid encrypted file: {reason}")]
    InvalidEncryptedFile { reason: String },

    #[error("Source file {} changed while it was being encrypted", path.display())]
    SourceChanged { path: PathBuf },

    #[error("Cipher error: {reason}")]
    Cipher { reason: String },

    #[error("Decryption of {} failed", path.display())]
    DecryptionFailed { path: PathBuf },

    #[error("Invalid manifest format: {reason}")]
    InvalidManifest { reason: String },

    #[error("Manifest verification failed: {mismatched} mismatched, {missing} missing")]
    VerificationFailed { mismatched: usize, missing: usize },

    #[error("Unsupported hash algorithm: {name}")]
    UnsupportedHashAlgorithm { name: String },

    #[error("Object store error for key '{key}': {reason}")]
    Store { key: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Logging setup failed: {reason}")]
    Logging { reason: String },

    #[error("Backup failed during {stage}: {source}")]
    Pipeline {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the pipeline stage an error surfaced in
    pub fn at(self, stage: Stage) -> Self {
        match self {
            already @ Error::Pipeline { .. } => already,
            other => Error::Pipeline {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage a pipeline error came from, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Pipeline { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any pipeline wrapping removed
    pub fn root(&self) -> &Error {
        match self {
            Error::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for bakvault operations
pub type Result<T> = std::result::Result<T, Error>;
