//! Persistent state storage
//!
//! Named blocks of typed fields held in a single SQLite database file.
//!
//! # Design Principles
//!
//! - Every write goes through a transaction; nothing staged is visible
//!   before commit
//! - Reads always go to committed database state
//! - Blocks are cleared by retention class, never individually
//! - A clear that cannot delete data faults the store rather than carry on
//!
//! # Layout
//!
//! - `codec`: field values and their on-disk encoding
//! - `format`: declared schemas of dynamic blocks
//! - `catalog`: SQL schema, connections and row access
//! - `accessor`, `transaction`: the per-block read/write surface
//! - `clear`: the two-phase clear protocol
//! - `manager`: lifecycle, catalog and maintenance

mod accessor;
pub(crate) mod catalog;
mod clear;
mod codec;
mod engine;
mod errors;
mod format;
mod level;
mod manager;
mod transaction;

pub use accessor::BlockAccessor;
pub use catalog::derive_key;
pub use clear::{ClearObserver, ClearState, ReadyToken};
pub use codec::{decode_column, decode_value, encode_column, encode_value, FieldType, FieldValue, Value};
pub use errors::{Severity, StorageError, StorageErrorCode, StorageResult};
pub use format::{BlockFormat, FieldDescription};
pub use level::PersistenceLevel;
pub use manager::{BlockInfo, StorageManager, LAST_CLEARED_BLOCK, LAST_CLEARED_FIELD};
pub use transaction::{FieldTransaction, ScopedTransaction};
