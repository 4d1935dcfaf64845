//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::io;

use thiserror::Error;

use crate::secondary::SecondaryStorageError;
use crate::storage::StorageError;

/// CLI error
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Mirror(#[from] SecondaryStorageError),

    #[error("Mirroring is not enabled in the configuration")]
    MirrorDisabled,

    #[error("No secondary medium found")]
    MirrorNotFound,

    #[error("Integrity check failed")]
    VerifyFailed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.code().code(),
            Self::Mirror(_) => "EGM_CLI_MIRROR_ERROR",
            Self::MirrorDisabled => "EGM_CLI_MIRROR_DISABLED",
            Self::MirrorNotFound => "EGM_CLI_MIRROR_NOT_FOUND",
            Self::VerifyFailed => "EGM_CLI_VERIFY_FAILED",
            Self::Io(_) => "EGM_CLI_IO_ERROR",
            Self::Json(_) => "EGM_CLI_IO_ERROR",
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_code_passes_through() {
        let err = CliError::from(StorageError::invalid_handle("Meters"));
        assert_eq!(err.code(), "EGM_STORAGE_INVALID_HANDLE");
    }
}
