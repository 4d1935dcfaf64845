//! Field transactions
//!
//! Writes are staged in memory and applied all at once on commit. Nothing
//! staged is visible to readers until the commit succeeds, and a dropped
//! transaction leaves storage untouched.
//!
//! Two shapes exist:
//! - `FieldTransaction`: started from an accessor, with further blocks
//!   enrolled explicitly via `add_block`
//! - `ScopedTransaction`: started from the manager, enrolling blocks as they
//!   are written, committed with `complete`

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::accessor::BlockAccessor;
use super::codec::{FieldType, FieldValue, Value};
use super::engine::Engine;
use super::errors::{StorageError, StorageResult};
use crate::observability::{Event, Logger};

/// Values staged for one field of one block
#[derive(Debug, Clone)]
pub(crate) struct StagedField {
    pub(crate) field_type: FieldType,
    pub(crate) values: BTreeMap<usize, Value>,
}

/// One block enrolled in a transaction
#[derive(Debug, Clone)]
pub(crate) struct EnrolledBlock {
    pub(crate) accessor: BlockAccessor,
    pub(crate) fields: BTreeMap<String, StagedField>,
}

/// Everything a transaction will apply, grouped by block in enrollment order
#[derive(Debug, Default, Clone)]
pub(crate) struct WriteSet {
    blocks: Vec<EnrolledBlock>,
}

impl WriteSet {
    pub(crate) fn blocks(&self) -> &[EnrolledBlock] {
        &self.blocks
    }

    /// True when no value is staged
    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.fields.is_empty())
    }

    pub(crate) fn staged_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| b.fields.values())
            .map(|f| f.values.len())
            .sum()
    }

    fn position(&self, block: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.accessor.name() == block)
    }

    pub(crate) fn is_enrolled(&self, block: &str) -> bool {
        self.position(block).is_some()
    }

    /// Enroll a block; enrolling twice is a no-op
    pub(crate) fn enroll(&mut self, accessor: &BlockAccessor) -> StorageResult<()> {
        accessor.ensure_valid()?;
        if !self.is_enrolled(accessor.name()) {
            self.blocks.push(EnrolledBlock {
                accessor: accessor.clone(),
                fields: BTreeMap::new(),
            });
        }
        Ok(())
    }

    /// Validate and stage one element value of an enrolled block.
    ///
    /// A later write to the same element replaces the earlier one.
    pub(crate) fn stage(&mut self, block: &str, element: usize, field: &str, value: Value) -> StorageResult<()> {
        let index = self
            .position(block)
            .ok_or_else(|| StorageError::invalid_handle(block).with_details(format!(
                "block '{}' is not enrolled in this transaction",
                block
            )))?;
        let enrolled = &mut self.blocks[index];
        enrolled.accessor.check_write(element, field, &value)?;

        let field_type = value.field_type();
        let staged = enrolled
            .fields
            .entry(field.to_string())
            .or_insert_with(|| StagedField {
                field_type,
                values: BTreeMap::new(),
            });
        if staged.field_type != field_type {
            return Err(StorageError::type_mismatch(
                block,
                field,
                staged.field_type,
                field_type,
            ));
        }
        staged.values.insert(element, value);
        Ok(())
    }

    fn clear(&mut self) {
        self.blocks.clear();
    }
}

fn log_discarded(engine: &Engine, writes: &WriteSet) {
    engine.metrics().increment_discarded();
    let blocks: Vec<&str> = writes.blocks().iter().map(|b| b.accessor.name()).collect();
    Logger::info(
        Event::TransactionDiscarded.as_str(),
        &[
            ("blocks", &blocks.join(",")),
            ("values", &writes.staged_count().to_string()),
        ],
    );
}

/// Transaction started from a block accessor.
///
/// ```ignore
/// let mut tx = meters.start_transaction();
/// tx.set(3, "Value", 42i64)?;
/// tx.add_block(&history)?;
/// tx.set_in(&history, 0, "LastMeter", 42i64)?;
/// tx.commit()?;
/// ```
pub struct FieldTransaction {
    engine: Arc<Engine>,
    primary: String,
    writes: WriteSet,
    finished: bool,
}

impl FieldTransaction {
    pub(crate) fn new(accessor: &BlockAccessor, engine: Arc<Engine>) -> Self {
        let mut writes = WriteSet::default();
        // An invalid accessor is reported on first write instead
        let _ = writes.enroll(accessor);
        Self {
            engine,
            primary: accessor.name().to_string(),
            writes,
            finished: false,
        }
    }

    /// Enroll another block so it commits atomically with this one
    pub fn add_block(&mut self, accessor: &BlockAccessor) -> StorageResult<&mut Self> {
        self.writes.enroll(accessor)?;
        Ok(self)
    }

    /// Stage a write to the originating block
    pub fn set<T: FieldValue>(&mut self, element: usize, field: &str, value: T) -> StorageResult<&mut Self> {
        self.set_value(element, field, value.into_value())
    }

    pub fn set_value(&mut self, element: usize, field: &str, value: Value) -> StorageResult<&mut Self> {
        if !self.writes.is_enrolled(&self.primary) {
            return Err(StorageError::invalid_handle(&self.primary));
        }
        let primary = self.primary.clone();
        self.writes.stage(&primary, element, field, value)?;
        Ok(self)
    }

    /// Stage a structured value serialized to JSON text
    pub fn set_json<T: Serialize>(&mut self, element: usize, field: &str, value: &T) -> StorageResult<&mut Self> {
        self.set_value(element, field, Value::Text(to_json(field, value)?))
    }

    /// Stage a write to an enrolled block
    pub fn set_in<T: FieldValue>(
        &mut self,
        accessor: &BlockAccessor,
        element: usize,
        field: &str,
        value: T,
    ) -> StorageResult<&mut Self> {
        self.writes
            .stage(accessor.name(), element, field, value.into_value())?;
        Ok(self)
    }

    /// Number of staged element values
    pub fn staged(&self) -> usize {
        self.writes.staged_count()
    }

    /// Apply every staged write atomically; returns the values written
    pub fn commit(mut self) -> StorageResult<usize> {
        self.finished = true;
        let writes = std::mem::take(&mut self.writes);
        self.engine.commit(&writes)
    }

    /// Drop every staged write
    pub fn rollback(mut self) {
        if !self.writes.is_empty() {
            log_discarded(&self.engine, &self.writes);
        }
        self.finished = true;
        self.writes.clear();
    }
}

impl fmt::Debug for FieldTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldTransaction")
            .field("primary", &self.primary)
            .field("staged", &self.staged())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for FieldTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.writes.is_empty() {
            log_discarded(&self.engine, &self.writes);
        }
    }
}

/// Transaction started from the manager.
///
/// Blocks enroll themselves on first write. `complete` commits; dropping the
/// transaction without completing discards everything staged.
pub struct ScopedTransaction {
    engine: Arc<Engine>,
    writes: WriteSet,
    completed: bool,
}

impl ScopedTransaction {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            writes: WriteSet::default(),
            completed: false,
        }
    }

    pub fn set<T: FieldValue>(
        &mut self,
        accessor: &BlockAccessor,
        element: usize,
        field: &str,
        value: T,
    ) -> StorageResult<&mut Self> {
        self.set_value(accessor, element, field, value.into_value())
    }

    pub fn set_value(
        &mut self,
        accessor: &BlockAccessor,
        element: usize,
        field: &str,
        value: Value,
    ) -> StorageResult<&mut Self> {
        self.writes.enroll(accessor)?;
        self.writes.stage(accessor.name(), element, field, value)?;
        Ok(self)
    }

    pub fn set_json<T: Serialize>(
        &mut self,
        accessor: &BlockAccessor,
        element: usize,
        field: &str,
        value: &T,
    ) -> StorageResult<&mut Self> {
        self.set_value(accessor, element, field, Value::Text(to_json(field, value)?))
    }

    pub fn staged(&self) -> usize {
        self.writes.staged_count()
    }

    /// Commit everything staged as one atomic unit
    pub fn complete(mut self) -> StorageResult<usize> {
        self.completed = true;
        let writes = std::mem::take(&mut self.writes);
        self.engine.commit(&writes)
    }
}

impl fmt::Debug for ScopedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedTransaction")
            .field("blocks", &self.writes.blocks().len())
            .field("staged", &self.staged())
            .finish()
    }
}

impl Drop for ScopedTransaction {
    fn drop(&mut self) {
        if !self.completed && !self.writes.is_empty() {
            log_discarded(&self.engine, &self.writes);
        }
    }
}

fn to_json<T: Serialize>(field: &str, value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| {
        StorageError::write_failed(format!("failed to serialize value for field '{}'", field))
            .with_source(e)
    })
}
