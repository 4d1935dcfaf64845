//! egm-storage: persistent state storage for an electronic gaming machine
//!
//! Regulator-critical state (meters, transaction logs, configuration) lives
//! in named blocks of typed fields, written atomically, cleared by retention
//! class, and mirrored to a second medium.

pub mod cli;
pub mod config;
pub mod crash_point;
pub mod observability;
pub mod secondary;
pub mod signals;
pub mod storage;

pub use config::{SecondaryConfig, StorageConfig};
pub use signals::{SignalBus, StorageSignal};
pub use storage::{
    BlockAccessor, BlockFormat, ClearObserver, FieldType, PersistenceLevel, ReadyToken,
    StorageError, StorageErrorCode, StorageManager, StorageResult,
};
