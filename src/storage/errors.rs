//! Storage engine error types
//!
//! Error codes:
//! - EGM_STORAGE_READ_FAILURE (ERROR)
//! - EGM_STORAGE_WRITE_FAILURE (ERROR)
//! - EGM_STORAGE_CLEAR_FAILURE (FATAL)
//! - EGM_STORAGE_INVALID_HANDLE (ERROR, contract violation)
//! - EGM_STORAGE_DUPLICATE_BLOCK (ERROR, contract violation)
//! - EGM_STORAGE_FIELD_OVERFLOW (ERROR, contract violation)
//! - EGM_STORAGE_TYPE_MISMATCH (ERROR, contract violation)
//! - EGM_STORAGE_UNKNOWN_FIELD (ERROR, contract violation)
//! - EGM_STORAGE_ELEMENT_OUT_OF_RANGE (ERROR, contract violation)
//! - EGM_STORAGE_INTEGRITY_FAILURE (FATAL)
//! - EGM_STORAGE_FAULTED (FATAL)
//! - EGM_STORAGE_CLEAR_ABORTED (ERROR)
//! - EGM_STORAGE_CONFIG_ERROR (ERROR)

use std::error::Error as StdError;
use std::fmt;

use rusqlite::ErrorCode as SqliteCode;

use crate::signals::StorageErrorKind;

/// Severity levels for storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, the store continues
    Error,
    /// The store must not be trusted until an operator intervenes
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Storage error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    ReadFailure,
    WriteFailure,
    ClearFailure,
    InvalidHandle,
    DuplicateBlock,
    FieldOverflow,
    TypeMismatch,
    UnknownField,
    ElementOutOfRange,
    IntegrityFailure,
    Faulted,
    ClearAborted,
    ConfigError,
}

impl StorageErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::ReadFailure => "EGM_STORAGE_READ_FAILURE",
            StorageErrorCode::WriteFailure => "EGM_STORAGE_WRITE_FAILURE",
            StorageErrorCode::ClearFailure => "EGM_STORAGE_CLEAR_FAILURE",
            StorageErrorCode::InvalidHandle => "EGM_STORAGE_INVALID_HANDLE",
            StorageErrorCode::DuplicateBlock => "EGM_STORAGE_DUPLICATE_BLOCK",
            StorageErrorCode::FieldOverflow => "EGM_STORAGE_FIELD_OVERFLOW",
            StorageErrorCode::TypeMismatch => "EGM_STORAGE_TYPE_MISMATCH",
            StorageErrorCode::UnknownField => "EGM_STORAGE_UNKNOWN_FIELD",
            StorageErrorCode::ElementOutOfRange => "EGM_STORAGE_ELEMENT_OUT_OF_RANGE",
            StorageErrorCode::IntegrityFailure => "EGM_STORAGE_INTEGRITY_FAILURE",
            StorageErrorCode::Faulted => "EGM_STORAGE_FAULTED",
            StorageErrorCode::ClearAborted => "EGM_STORAGE_CLEAR_ABORTED",
            StorageErrorCode::ConfigError => "EGM_STORAGE_CONFIG_ERROR",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::ClearFailure
            | StorageErrorCode::IntegrityFailure
            | StorageErrorCode::Faulted => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Whether the error is a caller bug rather than a storage fault
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::InvalidHandle
                | StorageErrorCode::DuplicateBlock
                | StorageErrorCode::FieldOverflow
                | StorageErrorCode::TypeMismatch
                | StorageErrorCode::UnknownField
                | StorageErrorCode::ElementOutOfRange
        )
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Storage error with code, message, optional context and source
#[derive(Debug)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl StorageError {
    /// Create an error with no source
    pub fn new(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Attach an underlying cause
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach free-form context
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn read_failed(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::ReadFailure, message)
    }

    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::WriteFailure, message)
    }

    pub fn clear_failed(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::ClearFailure, message)
    }

    /// Block name does not exist (or was destroyed by a clear)
    pub fn invalid_handle(block: &str) -> Self {
        Self::new(
            StorageErrorCode::InvalidHandle,
            format!("block '{}' does not exist", block),
        )
    }

    pub fn duplicate_block(block: &str) -> Self {
        Self::new(
            StorageErrorCode::DuplicateBlock,
            format!("block '{}' already exists", block),
        )
    }

    /// Value wider than the field's declared fixed width
    pub fn field_overflow(block: &str, field: &str, width: usize, actual: usize) -> Self {
        Self::new(
            StorageErrorCode::FieldOverflow,
            format!(
                "value of {} bytes exceeds the {} byte width of field '{}'",
                actual, width, field
            ),
        )
        .with_details(format!("block: {}", block))
    }

    pub fn type_mismatch(
        block: &str,
        field: &str,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::new(
            StorageErrorCode::TypeMismatch,
            format!(
                "field '{}' holds {} but {} was used",
                field, expected, actual
            ),
        )
        .with_details(format!("block: {}", block))
    }

    pub fn unknown_field(block: &str, field: &str) -> Self {
        Self::new(
            StorageErrorCode::UnknownField,
            format!("field '{}' is not declared by the block format", field),
        )
        .with_details(format!("block: {}", block))
    }

    pub fn element_out_of_range(block: &str, element: usize, count: usize) -> Self {
        Self::new(
            StorageErrorCode::ElementOutOfRange,
            format!("element {} is outside 0..{}", element, count),
        )
        .with_details(format!("block: {}", block))
    }

    pub fn integrity_failure(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::IntegrityFailure, message)
    }

    /// The store is in the faulted state after an unrecoverable clear
    pub fn faulted() -> Self {
        Self::new(
            StorageErrorCode::Faulted,
            "store is faulted after an unrecoverable clear; manual resolution required",
        )
    }

    pub fn clear_aborted(observer: &str, reason: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::ClearAborted, reason).with_details(format!("observer: {}", observer))
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::new(StorageErrorCode::ConfigError, message)
    }

    /// Returns the error code
    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error leaves the store untrustworthy
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Maps an engine error to the signal kind published for it.
///
/// `code` says which side of the operation failed; engine-level conditions
/// (corruption, full disk, lock contention) take precedence over it.
pub fn classify_engine_error(code: StorageErrorCode, err: &rusqlite::Error) -> StorageErrorKind {
    if let rusqlite::Error::SqliteFailure(failure, _) = err {
        match failure.code {
            SqliteCode::DatabaseCorrupt | SqliteCode::NotADatabase => {
                return StorageErrorKind::Corrupt
            }
            SqliteCode::DiskFull => return StorageErrorKind::DiskFull,
            SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked => {
                return StorageErrorKind::Busy
            }
            _ => {}
        }
    }
    match code {
        StorageErrorCode::ReadFailure => StorageErrorKind::Read,
        StorageErrorCode::ClearFailure => StorageErrorKind::Clear,
        _ => StorageErrorKind::Write,
    }
}
