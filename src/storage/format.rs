//! Block formats: the declared field schema of a dynamic block

use serde::{Deserialize, Serialize};

use super::codec::{FieldType, Value};
use super::errors::{StorageError, StorageResult};

/// One declared field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    pub field_type: FieldType,
    /// Maximum encoded width in bytes (text and binary only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl FieldDescription {
    /// Reject a value this field cannot hold
    pub fn check(&self, block: &str, value: &Value) -> StorageResult<()> {
        if value.field_type() != self.field_type {
            return Err(StorageError::type_mismatch(
                block,
                &self.name,
                self.field_type,
                value.field_type(),
            ));
        }
        if let Some(width) = self.size {
            if value.width() > width {
                return Err(StorageError::field_overflow(
                    block,
                    &self.name,
                    width,
                    value.width(),
                ));
            }
        }
        Ok(())
    }
}

/// Field schema of a dynamic block.
///
/// Built once by the owning subsystem and handed to
/// `StorageManager::create_dynamic_block`; it is stored in the catalog so the
/// block keeps its schema across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFormat {
    version: u32,
    fields: Vec<FieldDescription>,
}

impl BlockFormat {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            fields: Vec::new(),
        }
    }

    /// Declare a field with no width bound
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescription {
            name: name.into(),
            field_type,
            size: None,
        });
        self
    }

    /// Declare a text or binary field bounded to `size` bytes
    pub fn with_sized_field(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        size: usize,
    ) -> Self {
        self.fields.push(FieldDescription {
            name: name.into(),
            field_type,
            size: Some(size),
        });
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescription> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks the schema is usable: at least one field, unique non-empty
    /// names, and widths only on non-zero text/binary fields.
    pub fn validate(&self, block: &str) -> StorageResult<()> {
        if self.fields.is_empty() {
            return Err(StorageError::config_error(format!(
                "format of block '{}' declares no fields",
                block
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(StorageError::config_error(format!(
                    "format of block '{}' has an unnamed field",
                    block
                )));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(StorageError::config_error(format!(
                    "format of block '{}' declares field '{}' twice",
                    block, field.name
                )));
            }
            match field.size {
                Some(0) => {
                    return Err(StorageError::config_error(format!(
                        "field '{}' of block '{}' has zero width",
                        field.name, block
                    )))
                }
                Some(_) if !field.field_type.is_variable_width() => {
                    return Err(StorageError::config_error(format!(
                        "field '{}' of block '{}' is {} and cannot carry a width",
                        field.name, block, field.field_type
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}
