//! # Mirror Errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::signals::SecondaryErrorKind;

/// Result type for mirror operations
pub type SecondaryResult<T> = Result<T, SecondaryStorageError>;

/// Mirror storage errors
#[derive(Debug, Error)]
pub enum SecondaryStorageError {
    #[error("Mirror paths are not configured")]
    NotConfigured,

    #[error("Unexpected database file on primary medium: {0}")]
    UnexpectedFile(PathBuf),

    #[error("Both copies of {0} are invalid")]
    Unrecoverable(String),

    #[error("Copy of {0} does not match its source")]
    CopyMismatch(String),

    #[error("Volume discovery failed: {0}")]
    Discovery(#[source] io::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Database error on {path}: {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl SecondaryStorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Signal kind published for this error
    pub fn kind(&self) -> SecondaryErrorKind {
        match self {
            Self::NotConfigured | Self::Discovery(_) => SecondaryErrorKind::NotConnected,
            Self::UnexpectedFile(_) => SecondaryErrorKind::UnexpectedFile,
            Self::Unrecoverable(_) => SecondaryErrorKind::Unrecoverable,
            Self::CopyMismatch(_) | Self::Io { .. } | Self::Database { .. } => {
                SecondaryErrorKind::RepairFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            SecondaryStorageError::UnexpectedFile(PathBuf::from("/data/x.sqlite")).kind(),
            SecondaryErrorKind::UnexpectedFile
        );
        assert_eq!(
            SecondaryStorageError::io("/data", io::Error::from(io::ErrorKind::PermissionDenied))
                .kind(),
            SecondaryErrorKind::RepairFailed
        );
    }

    #[test]
    fn test_display() {
        let err = SecondaryStorageError::Unrecoverable("egm_storage.sqlite".to_string());
        assert_eq!(err.to_string(), "Both copies of egm_storage.sqlite are invalid");
    }
}
