//! Field codec
//!
//! Converts typed field values to and from the on-disk representation.
//!
//! A field row holds the values of every element of one field in a single
//! blob ("column"). Each element is a 4-byte little-endian length followed by
//! that many value bytes; the length `u32::MAX` marks an element that was
//! never written and reads as the type's default.
//!
//! Value encodings:
//! - `Bool`: 1 byte, 0 or 1
//! - `Int64` / `Int32` / `Enum`: little-endian two's complement
//! - `DateTime`: i64 seconds since the Unix epoch + u32 nanoseconds, both LE
//! - `Guid`: the 16 UUID bytes
//! - `Text`: UTF-8 bytes
//! - `Binary`: raw bytes

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{StorageError, StorageResult};

/// Marks an element that has never been written
const UNSET: u32 = u32::MAX;

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Int64,
    Int32,
    DateTime,
    Guid,
    Text,
    Binary,
    Enum,
}

impl FieldType {
    /// Tag stored in the `data_type` column
    pub fn tag(self) -> i64 {
        match self {
            FieldType::Bool => 1,
            FieldType::Int64 => 2,
            FieldType::Int32 => 3,
            FieldType::DateTime => 4,
            FieldType::Guid => 5,
            FieldType::Text => 6,
            FieldType::Binary => 7,
            FieldType::Enum => 8,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(FieldType::Bool),
            2 => Some(FieldType::Int64),
            3 => Some(FieldType::Int32),
            4 => Some(FieldType::DateTime),
            5 => Some(FieldType::Guid),
            6 => Some(FieldType::Text),
            7 => Some(FieldType::Binary),
            8 => Some(FieldType::Enum),
            _ => None,
        }
    }

    /// Value read back from an element that was never written
    pub fn default_value(self) -> Value {
        match self {
            FieldType::Bool => Value::Bool(false),
            FieldType::Int64 => Value::Int64(0),
            FieldType::Int32 => Value::Int32(0),
            FieldType::DateTime => Value::DateTime(DateTime::<Utc>::default()),
            FieldType::Guid => Value::Guid(Uuid::nil()),
            FieldType::Text => Value::Text(String::new()),
            FieldType::Binary => Value::Binary(Vec::new()),
            FieldType::Enum => Value::Enum(0),
        }
    }

    /// Whether a declared fixed width applies to values of this type
    pub fn is_variable_width(self) -> bool {
        matches!(self, FieldType::Text | FieldType::Binary)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Int64 => "int64",
            FieldType::Int32 => "int32",
            FieldType::DateTime => "datetime",
            FieldType::Guid => "guid",
            FieldType::Text => "text",
            FieldType::Binary => "binary",
            FieldType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int64(i64),
    Int32(i32),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Text(String),
    Binary(Vec<u8>),
    Enum(i32),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::Int64(_) => FieldType::Int64,
            Value::Int32(_) => FieldType::Int32,
            Value::DateTime(_) => FieldType::DateTime,
            Value::Guid(_) => FieldType::Guid,
            Value::Text(_) => FieldType::Text,
            Value::Binary(_) => FieldType::Binary,
            Value::Enum(_) => FieldType::Enum,
        }
    }

    /// Encoded size in bytes, the quantity a fixed width bounds
    pub fn width(&self) -> usize {
        match self {
            Value::Bool(_) => 1,
            Value::Int64(_) => 8,
            Value::Int32(_) | Value::Enum(_) => 4,
            Value::DateTime(_) => 12,
            Value::Guid(_) => 16,
            Value::Text(s) => s.len(),
            Value::Binary(b) => b.len(),
        }
    }
}

/// Encode one value
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Bool(b) => vec![u8::from(*b)],
        Value::Int64(v) => v.to_le_bytes().to_vec(),
        Value::Int32(v) | Value::Enum(v) => v.to_le_bytes().to_vec(),
        Value::DateTime(ts) => {
            let mut out = Vec::with_capacity(12);
            out.extend_from_slice(&ts.timestamp().to_le_bytes());
            out.extend_from_slice(&ts.timestamp_subsec_nanos().to_le_bytes());
            out
        }
        Value::Guid(id) => id.as_bytes().to_vec(),
        Value::Text(s) => s.as_bytes().to_vec(),
        Value::Binary(b) => b.clone(),
    }
}

fn fixed<const N: usize>(field_type: FieldType, bytes: &[u8]) -> StorageResult<[u8; N]> {
    bytes.try_into().map_err(|_| {
        StorageError::read_failed(format!(
            "malformed {} value: expected {} bytes, found {}",
            field_type,
            N,
            bytes.len()
        ))
    })
}

/// Decode one value of a known type
pub fn decode_value(field_type: FieldType, bytes: &[u8]) -> StorageResult<Value> {
    let value = match field_type {
        FieldType::Bool => match fixed::<1>(field_type, bytes)?[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(StorageError::read_failed(format!(
                    "malformed bool value: {}",
                    other
                )))
            }
        },
        FieldType::Int64 => Value::Int64(i64::from_le_bytes(fixed(field_type, bytes)?)),
        FieldType::Int32 => Value::Int32(i32::from_le_bytes(fixed(field_type, bytes)?)),
        FieldType::Enum => Value::Enum(i32::from_le_bytes(fixed(field_type, bytes)?)),
        FieldType::DateTime => {
            let raw: [u8; 12] = fixed(field_type, bytes)?;
            let mut secs = [0u8; 8];
            let mut nanos = [0u8; 4];
            secs.copy_from_slice(&raw[..8]);
            nanos.copy_from_slice(&raw[8..]);
            let ts = Utc
                .timestamp_opt(i64::from_le_bytes(secs), u32::from_le_bytes(nanos))
                .single()
                .ok_or_else(|| StorageError::read_failed("malformed datetime value"))?;
            Value::DateTime(ts)
        }
        FieldType::Guid => Value::Guid(Uuid::from_bytes(fixed(field_type, bytes)?)),
        FieldType::Text => Value::Text(String::from_utf8(bytes.to_vec()).map_err(|e| {
            StorageError::read_failed("malformed text value").with_source(e)
        })?),
        FieldType::Binary => Value::Binary(bytes.to_vec()),
    };
    Ok(value)
}

/// Encode the values of every element of one field
pub fn encode_column(values: &[Option<Value>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for value in values {
        match value {
            None => out.extend_from_slice(&UNSET.to_le_bytes()),
            Some(value) => {
                let bytes = encode_value(value);
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
        }
    }
    out
}

/// Decode a column and fit it to `count` elements.
///
/// Missing trailing elements read as unset; surplus elements are dropped.
pub fn decode_column(
    field_type: FieldType,
    data: &[u8],
    count: usize,
) -> StorageResult<Vec<Option<Value>>> {
    let mut values = Vec::with_capacity(count);
    let mut pos = 0;
    while pos < data.len() {
        let header = data
            .get(pos..pos + 4)
            .ok_or_else(|| StorageError::read_failed("truncated field column header"))?;
        let len = u32::from_le_bytes(fixed(field_type, header)?);
        pos += 4;
        if len == UNSET {
            values.push(None);
            continue;
        }
        let end = pos + len as usize;
        let bytes = data
            .get(pos..end)
            .ok_or_else(|| StorageError::read_failed("truncated field column value"))?;
        values.push(Some(decode_value(field_type, bytes)?));
        pos = end;
    }
    values.resize(count, None);
    Ok(values)
}

/// Statically typed access to field values.
///
/// Implemented for every Rust type a field can hold. Enumerations opt in
/// with [`enum_field!`](crate::enum_field).
pub trait FieldValue: Sized {
    /// Declared type values of `Self` are stored as
    const FIELD_TYPE: FieldType;

    fn into_value(self) -> Value;

    /// `None` if `value` is not a `Self`
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_field_value {
    ($ty:ty, $field_type:ident, $variant:ident) => {
        impl FieldValue for $ty {
            const FIELD_TYPE: FieldType = FieldType::$field_type;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_field_value!(bool, Bool, Bool);
impl_field_value!(i64, Int64, Int64);
impl_field_value!(i32, Int32, Int32);
impl_field_value!(DateTime<Utc>, DateTime, DateTime);
impl_field_value!(Uuid, Guid, Guid);
impl_field_value!(String, Text, Text);
impl_field_value!(Vec<u8>, Binary, Binary);

/// Implements [`FieldValue`] for an i32-backed enumeration.
///
/// The type needs `From<T> for i32` and `TryFrom<i32> for T`.
///
/// ```ignore
/// enum_field!(DoorState);
/// tx.set(0, "Door", DoorState::Open)?;
/// ```
#[macro_export]
macro_rules! enum_field {
    ($ty:ty) => {
        impl $crate::storage::FieldValue for $ty {
            const FIELD_TYPE: $crate::storage::FieldType = $crate::storage::FieldType::Enum;

            fn into_value(self) -> $crate::storage::Value {
                $crate::storage::Value::Enum(i32::from(self))
            }

            fn from_value(value: $crate::storage::Value) -> Option<Self> {
                match value {
                    $crate::storage::Value::Enum(raw) => {
                        <$ty as ::std::convert::TryFrom<i32>>::try_from(raw).ok()
                    }
                    _ => None,
                }
            }
        }
    };
}
