use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Database does not exist: {0}")]
    SourceNotFound(String),

    #[error("Destination already exist: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("Could not read version metadata from database {db_name}")]
    SourceUnavailable {
        db_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pg_dump for database {db_name} failed ({status})\nStderr:\n{stderr}")]
    DumpFailed {
        db_name: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to copy filestore {}", .path.display())]
    FilestoreCopyFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Upload of {key} could not be confirmed, local archive kept at {}: {reason}", .kept.display())]
    UploadUnconfirmed {
        key: String,
        kept: PathBuf,
        reason: String,
    },

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackupError {
    /// Errors raised while validating the request, before any side effect.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BackupError::SourceNotFound(_) | BackupError::DestinationExists(_) | BackupError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
