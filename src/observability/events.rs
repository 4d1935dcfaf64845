//! Observable lifecycle events of the storage engine
//!
//! Events are explicit and typed; the logger only ever sees their
//! string form.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Store lifecycle
    /// Store open begins
    StoreOpenBegin,
    /// Store opened and serving
    StoreOpenComplete,
    /// Transient blocks dropped at startup
    TransientCleared,
    /// Database file set deleted and recreated empty after a failed clear
    StoreRecreated,
    /// Configuration loaded from disk
    ConfigLoaded,

    // Catalog
    /// Block created
    BlockCreated,
    /// Block element count changed
    BlockResized,
    /// Block persistence level changed
    BlockLevelChanged,

    // Transactions
    /// Transaction committed
    TransactionCommitted,
    /// Transaction dropped without commit
    TransactionDiscarded,

    // Maintenance
    /// Integrity check passed
    IntegrityCheckPassed,
    /// Integrity check failed
    IntegrityCheckFailed,
    /// Defragmentation complete
    Defragmented,

    // Clear protocol
    /// Clear requested, observers being notified
    ClearStarted,
    /// All observers acknowledged
    ClearReady,
    /// Clear aborted by an observer before deletion
    ClearAborted,
    /// Clear orchestrator moved to another state
    ClearStateChanged,
    /// Deleting the database file set failed; retrying after backoff
    ClearFileDeleteRetry,
    /// Clear finished
    Cleared,
    /// Clear deletion failed, falling back to file deletion
    ClearFailed,
    /// Store refuses further writes (FATAL)
    StorageFaulted,

    // Engine errors
    /// A read or write failed in the engine
    StorageError,

    // Secondary storage
    /// Mirror directory resolved and fixed
    MirrorAttached,
    /// A mirrored file failed to open or failed its integrity check
    MirrorFileInvalid,
    /// Copying the primary file set to the mirror failed
    MirrorSyncFailed,
    /// Mirror copy of a file deleted
    MirrorCounterpartRemoved,
    /// Mirror copy of a file could not be deleted
    MirrorCounterpartRemoveFailed,
    /// Mirror verification finished
    MirrorVerified,
    /// A mirror file was repaired from its valid counterpart
    MirrorRepaired,
    /// Both copies of a mirrored file are invalid (FATAL)
    MirrorUnrecoverable,
    /// A database file outside the allow-list was found
    MirrorUnexpectedFile,
    /// Mirror required but not connected
    MirrorNotConnected,
    /// Mirror present but not required
    MirrorNotSupported,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::StoreOpenBegin => "STORE_OPEN_BEGIN",
            Event::StoreOpenComplete => "STORE_OPEN_COMPLETE",
            Event::TransientCleared => "TRANSIENT_CLEARED",
            Event::StoreRecreated => "STORE_RECREATED",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::BlockCreated => "BLOCK_CREATED",
            Event::BlockResized => "BLOCK_RESIZED",
            Event::BlockLevelChanged => "BLOCK_LEVEL_CHANGED",

            Event::TransactionCommitted => "TRANSACTION_COMMITTED",
            Event::TransactionDiscarded => "TRANSACTION_DISCARDED",

            Event::IntegrityCheckPassed => "INTEGRITY_CHECK_PASSED",
            Event::IntegrityCheckFailed => "INTEGRITY_CHECK_FAILED",
            Event::Defragmented => "DEFRAGMENTED",

            Event::ClearStarted => "CLEAR_STARTED",
            Event::ClearReady => "CLEAR_READY",
            Event::ClearAborted => "CLEAR_ABORTED",
            Event::ClearStateChanged => "CLEAR_STATE",
            Event::ClearFileDeleteRetry => "CLEAR_FILE_DELETE_RETRY",
            Event::Cleared => "CLEARED",
            Event::ClearFailed => "CLEAR_FAILED",
            Event::StorageFaulted => "STORAGE_FAULTED",

            Event::StorageError => "STORAGE_ERROR",

            Event::MirrorAttached => "MIRROR_ATTACHED",
            Event::MirrorFileInvalid => "MIRROR_FILE_INVALID",
            Event::MirrorSyncFailed => "MIRROR_SYNC_FAILED",
            Event::MirrorCounterpartRemoved => "MIRROR_COUNTERPART_REMOVED",
            Event::MirrorCounterpartRemoveFailed => "MIRROR_COUNTERPART_REMOVE_FAILED",
            Event::MirrorVerified => "MIRROR_VERIFIED",
            Event::MirrorRepaired => "MIRROR_REPAIRED",
            Event::MirrorUnrecoverable => "MIRROR_UNRECOVERABLE",
            Event::MirrorUnexpectedFile => "MIRROR_UNEXPECTED_FILE",
            Event::MirrorNotConnected => "MIRROR_NOT_CONNECTED",
            Event::MirrorNotSupported => "MIRROR_NOT_SUPPORTED",
        }
    }

    /// Returns true if this event indicates the store can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::StorageFaulted | Event::MirrorUnrecoverable | Event::MirrorUnexpectedFile
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
