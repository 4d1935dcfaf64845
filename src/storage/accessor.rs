//! Block accessors
//!
//! A `BlockAccessor` is the handle a subsystem holds for one named block.
//! Clones share state, and the manager hands out the same accessor for a
//! block until a clear removes it. Once the block is cleared, every clone is
//! invalid and all operations fail with `InvalidHandle`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;

use super::catalog::BlockRecord;
use super::codec::{decode_column, FieldType, FieldValue, Value};
use super::engine::Engine;
use super::errors::{StorageError, StorageResult};
use super::format::BlockFormat;
use super::level::PersistenceLevel;
use super::transaction::FieldTransaction;

struct AccessorInner {
    name: String,
    version: u32,
    format: Option<BlockFormat>,
    level: RwLock<PersistenceLevel>,
    count: AtomicUsize,
    /// Types of fields seen so far (simple blocks learn them from writes)
    field_types: RwLock<HashMap<String, FieldType>>,
    valid: AtomicBool,
}

/// Handle for reading and writing one block
#[derive(Clone)]
pub struct BlockAccessor {
    inner: Arc<AccessorInner>,
    engine: Arc<Engine>,
}

impl BlockAccessor {
    pub(crate) fn from_record(
        record: BlockRecord,
        field_types: Vec<(String, FieldType)>,
        engine: Arc<Engine>,
    ) -> Self {
        Self {
            inner: Arc::new(AccessorInner {
                name: record.name,
                version: record.version,
                format: record.format,
                level: RwLock::new(record.level),
                count: AtomicUsize::new(record.count),
                field_types: RwLock::new(field_types.into_iter().collect()),
                valid: AtomicBool::new(true),
            }),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn level(&self) -> PersistenceLevel {
        *self.inner.level.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Declared schema; `None` for simple blocks
    pub fn format(&self) -> Option<&BlockFormat> {
        self.inner.format.as_ref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.inner.format.is_some()
    }

    /// False once a clear has removed the block
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    /// Declared type, or the type learned from stored data
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        match &self.inner.format {
            Some(format) => format.field(field).map(|f| f.field_type),
            None => self
                .inner
                .field_types
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(field)
                .copied(),
        }
    }

    /// Read one element of a field.
    ///
    /// A field never written reads as the type's default value.
    pub fn get<T: FieldValue>(&self, element: usize, field: &str) -> StorageResult<T> {
        let value = self
            .read_element(element, field, Some(T::FIELD_TYPE))?
            .unwrap_or_else(|| T::FIELD_TYPE.default_value());
        T::from_value(value).ok_or_else(|| {
            StorageError::read_failed(format!(
                "stored value of field '{}' does not decode as {}",
                field,
                T::FIELD_TYPE
            ))
            .with_details(format!("block: {}", self.name()))
        })
    }

    /// Read one element without naming its type.
    ///
    /// Returns `None` for a field of a simple block that was never written.
    pub fn get_value(&self, element: usize, field: &str) -> StorageResult<Option<Value>> {
        self.read_element(element, field, None)
    }

    /// Read a structured value stored as JSON text; empty text reads as `None`
    pub fn get_json<T: DeserializeOwned>(&self, element: usize, field: &str) -> StorageResult<Option<T>> {
        let text: String = self.get(element, field)?;
        if text.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text).map(Some).map_err(|e| {
            StorageError::read_failed(format!("field '{}' does not hold valid JSON", field))
                .with_details(format!("block: {}", self.name()))
                .with_source(e)
        })
    }

    /// Every field of one element, declared fields included
    pub fn get_all(&self, element: usize) -> StorageResult<BTreeMap<String, Value>> {
        self.ensure_valid()?;
        self.ensure_in_range(element)?;

        let mut values = BTreeMap::new();
        if let Some(format) = &self.inner.format {
            for field in format.fields() {
                values.insert(field.name.clone(), field.field_type.default_value());
            }
        }
        for record in self.engine.read_fields(self.name())? {
            let column = decode_column(record.field_type, &record.data, self.count())?;
            let value = column
                .into_iter()
                .nth(element)
                .flatten()
                .unwrap_or_else(|| record.field_type.default_value());
            self.learn_field_type(&record.field_name, record.field_type);
            values.insert(record.field_name, value);
        }
        Ok(values)
    }

    /// Start a transaction with this block enrolled
    pub fn start_transaction(&self) -> FieldTransaction {
        FieldTransaction::new(self, Arc::clone(&self.engine))
    }

    fn read_element(
        &self,
        element: usize,
        field: &str,
        requested: Option<FieldType>,
    ) -> StorageResult<Option<Value>> {
        self.ensure_valid()?;
        self.ensure_in_range(element)?;

        let declared = match &self.inner.format {
            Some(format) => Some(
                format
                    .field(field)
                    .ok_or_else(|| StorageError::unknown_field(self.name(), field))?
                    .field_type,
            ),
            None => self.field_type(field),
        };
        if let (Some(declared), Some(requested)) = (declared, requested) {
            if declared != requested {
                return Err(StorageError::type_mismatch(self.name(), field, declared, requested));
            }
        }

        let record = match self.engine.read_field(self.name(), field)? {
            Some(record) => record,
            None => return Ok(declared.map(FieldType::default_value)),
        };
        if let Some(requested) = requested {
            if record.field_type != requested {
                return Err(StorageError::type_mismatch(
                    self.name(),
                    field,
                    record.field_type,
                    requested,
                ));
            }
        }
        self.learn_field_type(field, record.field_type);

        let column = decode_column(record.field_type, &record.data, self.count())?;
        Ok(Some(
            column
                .into_iter()
                .nth(element)
                .flatten()
                .unwrap_or_else(|| record.field_type.default_value()),
        ))
    }

    pub(crate) fn ensure_valid(&self) -> StorageResult<()> {
        if !self.is_valid() {
            return Err(StorageError::invalid_handle(self.name()));
        }
        Ok(())
    }

    fn ensure_in_range(&self, element: usize) -> StorageResult<()> {
        let count = self.count();
        if element >= count {
            return Err(StorageError::element_out_of_range(self.name(), element, count));
        }
        Ok(())
    }

    /// Contract checks applied when a write is staged
    pub(crate) fn check_write(&self, element: usize, field: &str, value: &Value) -> StorageResult<()> {
        self.ensure_valid()?;
        self.ensure_in_range(element)?;
        if field.is_empty() {
            return Err(StorageError::unknown_field(self.name(), field));
        }
        match &self.inner.format {
            Some(format) => format
                .field(field)
                .ok_or_else(|| StorageError::unknown_field(self.name(), field))?
                .check(self.name(), value),
            None => match self.field_type(field) {
                Some(known) if known != value.field_type() => Err(StorageError::type_mismatch(
                    self.name(),
                    field,
                    known,
                    value.field_type(),
                )),
                _ => Ok(()),
            },
        }
    }

    pub(crate) fn learn_field_type(&self, field: &str, field_type: FieldType) {
        if self.inner.format.is_some() {
            return;
        }
        self.inner
            .field_types
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(field.to_string(), field_type);
    }

    pub(crate) fn set_count(&self, count: usize) {
        self.inner.count.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_level(&self, level: PersistenceLevel) {
        *self.inner.level.write().unwrap_or_else(|p| p.into_inner()) = level;
    }

    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for BlockAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAccessor")
            .field("name", &self.inner.name)
            .field("level", &self.level())
            .field("count", &self.count())
            .field("version", &self.inner.version)
            .field("dynamic", &self.is_dynamic())
            .field("valid", &self.is_valid())
            .finish()
    }
}
