//! Block lifecycle tests
//!
//! Creation, lookup, typed field access, resizing and level changes.

mod common;

use chrono::{TimeZone, Utc};
use egm_storage::enum_field;
use egm_storage::storage::{
    BlockFormat, FieldType, PersistenceLevel, StorageErrorCode, Value,
};
use uuid::Uuid;

use common::{create_temp_data_dir, database_path, open_store, test_config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DoorState {
    Closed,
    Open,
}

impl From<DoorState> for i32 {
    fn from(state: DoorState) -> i32 {
        match state {
            DoorState::Closed => 0,
            DoorState::Open => 1,
        }
    }
}

impl TryFrom<i32> for DoorState {
    type Error = ();

    fn try_from(raw: i32) -> Result<Self, ()> {
        match raw {
            0 => Ok(DoorState::Closed),
            1 => Ok(DoorState::Open),
            _ => Err(()),
        }
    }
}

enum_field!(DoorState);

// =============================================================================
// Creation and lookup
// =============================================================================

#[test]
fn test_create_and_get_block() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);

    let block = store
        .create_block(PersistenceLevel::Static, "Meters", 10)
        .unwrap();
    assert_eq!(block.name(), "Meters");
    assert_eq!(block.count(), 10);
    assert_eq!(block.level(), PersistenceLevel::Static);
    assert!(!block.is_dynamic());

    assert!(store.block_exists("Meters").unwrap());
    assert!(!store.block_exists("Missing").unwrap());
    assert_eq!(store.get_block("Meters").unwrap().count(), 10);
}

#[test]
fn test_duplicate_block_fails_without_mutation() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);

    store
        .create_block(PersistenceLevel::Static, "Meters", 10)
        .unwrap();
    let err = store
        .create_block(PersistenceLevel::Critical, "Meters", 3)
        .unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::DuplicateBlock);

    let info = store.block_info("Meters").unwrap();
    assert_eq!(info.count, 10);
    assert_eq!(info.level, PersistenceLevel::Static);
}

#[test]
fn test_get_missing_block_is_invalid_handle() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let err = store.get_block("Nope").unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::InvalidHandle);
}

#[test]
fn test_blocks_survive_reopen() {
    let dir = create_temp_data_dir();
    {
        let store = open_store(&dir);
        let block = store
            .create_block(PersistenceLevel::Critical, "Meters", 4)
            .unwrap();
        let mut tx = block.start_transaction();
        tx.set(2, "Coins", 1234i64).unwrap();
        tx.commit().unwrap();
    }

    let store = open_store(&dir);
    let block = store.get_block("Meters").unwrap();
    assert_eq!(block.get::<i64>(2, "Coins").unwrap(), 1234);
    assert_eq!(block.field_type("Coins"), Some(FieldType::Int64));
}

#[test]
fn test_transient_blocks_dropped_on_reopen() {
    let dir = create_temp_data_dir();
    {
        let store = open_store(&dir);
        store
            .create_block(PersistenceLevel::Transient, "Scratch", 1)
            .unwrap();
        store
            .create_block(PersistenceLevel::Static, "Config", 1)
            .unwrap();
    }

    let store = open_store(&dir);
    assert!(!store.block_exists("Scratch").unwrap());
    assert!(store.block_exists("Config").unwrap());
    assert!(store
        .last_cleared(PersistenceLevel::Transient)
        .unwrap()
        .is_some());
}

// =============================================================================
// Field access
// =============================================================================

#[test]
fn test_unwritten_fields_read_defaults() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Static, "Defaults", 2)
        .unwrap();

    assert!(!block.get::<bool>(0, "Flag").unwrap());
    assert_eq!(block.get::<i64>(1, "Count").unwrap(), 0);
    assert_eq!(block.get::<String>(0, "Name").unwrap(), "");
    assert_eq!(block.get::<Uuid>(0, "Id").unwrap(), Uuid::nil());
    assert_eq!(
        block.get::<chrono::DateTime<Utc>>(0, "When").unwrap(),
        Utc.timestamp_opt(0, 0).unwrap()
    );
    assert_eq!(block.get_value(0, "Never").unwrap(), None);
}

#[test]
fn test_every_field_type_roundtrips_through_storage() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Critical, "Everything", 1)
        .unwrap();
    let when = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
    let id = Uuid::new_v4();

    let mut tx = block.start_transaction();
    tx.set(0, "Bool", true).unwrap();
    tx.set(0, "Int64", -9_000_000_000i64).unwrap();
    tx.set(0, "Int32", 77i32).unwrap();
    tx.set(0, "When", when).unwrap();
    tx.set(0, "Id", id).unwrap();
    tx.set(0, "Text", "jackpot".to_string()).unwrap();
    tx.set(0, "Blob", vec![0u8, 1, 2, 255]).unwrap();
    tx.set(0, "Door", DoorState::Open).unwrap();
    tx.commit().unwrap();

    assert!(block.get::<bool>(0, "Bool").unwrap());
    assert_eq!(block.get::<i64>(0, "Int64").unwrap(), -9_000_000_000);
    assert_eq!(block.get::<i32>(0, "Int32").unwrap(), 77);
    assert_eq!(block.get::<chrono::DateTime<Utc>>(0, "When").unwrap(), when);
    assert_eq!(block.get::<Uuid>(0, "Id").unwrap(), id);
    assert_eq!(block.get::<String>(0, "Text").unwrap(), "jackpot");
    assert_eq!(block.get::<Vec<u8>>(0, "Blob").unwrap(), vec![0, 1, 2, 255]);
    assert_eq!(block.get::<DoorState>(0, "Door").unwrap(), DoorState::Open);
}

#[test]
fn test_simple_block_infers_and_keeps_type() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Static, "Simple", 2)
        .unwrap();

    let mut tx = block.start_transaction();
    tx.set(0, "Credits", 10i64).unwrap();
    tx.commit().unwrap();

    let mut tx = block.start_transaction();
    let err = tx.set(1, "Credits", "ten".to_string()).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::TypeMismatch);

    let err = block.get::<i32>(0, "Credits").unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::TypeMismatch);
}

#[test]
fn test_element_out_of_range() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Static, "Small", 2)
        .unwrap();

    let err = block.get::<i64>(2, "Value").unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::ElementOutOfRange);

    let mut tx = block.start_transaction();
    let err = tx.set(5, "Value", 1i64).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::ElementOutOfRange);
}

#[test]
fn test_json_fields() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Ticket {
        barcode: String,
        amount: i64,
    }

    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Critical, "Tickets", 3)
        .unwrap();
    let ticket = Ticket {
        barcode: "123456789012345678".to_string(),
        amount: 2500,
    };

    let mut tx = block.start_transaction();
    tx.set_json(1, "Ticket", &ticket).unwrap();
    tx.commit().unwrap();

    assert_eq!(block.get_json::<Ticket>(1, "Ticket").unwrap(), Some(ticket));
    assert_eq!(block.get_json::<Ticket>(0, "Ticket").unwrap(), None);
}

// =============================================================================
// Dynamic blocks
// =============================================================================

fn ticket_format() -> BlockFormat {
    BlockFormat::new(3)
        .with_field("Amount", FieldType::Int64)
        .with_sized_field("Barcode", FieldType::Text, 18)
}

#[test]
fn test_dynamic_block_declares_schema() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_dynamic_block(PersistenceLevel::Critical, "Vouchers", 4, ticket_format())
        .unwrap();

    assert!(block.is_dynamic());
    assert_eq!(block.version(), 3);
    assert_eq!(block.get::<i64>(3, "Amount").unwrap(), 0);

    let all = block.get_all(0).unwrap();
    assert_eq!(all.get("Amount"), Some(&Value::Int64(0)));
    assert_eq!(all.get("Barcode"), Some(&Value::Text(String::new())));
}

#[test]
fn test_dynamic_block_rejects_undeclared_and_oversized() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_dynamic_block(PersistenceLevel::Critical, "Vouchers", 4, ticket_format())
        .unwrap();

    let mut tx = block.start_transaction();
    let err = tx.set(0, "Color", 1i64).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::UnknownField);

    let err = tx.set(0, "Barcode", "9".repeat(19)).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::FieldOverflow);

    let err = tx.set(0, "Amount", 1i32).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::TypeMismatch);

    let err = block.get::<i64>(0, "Color").unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::UnknownField);
}

#[test]
fn test_dynamic_block_schema_survives_reopen() {
    let dir = create_temp_data_dir();
    {
        let store = open_store(&dir);
        store
            .create_dynamic_block(PersistenceLevel::Critical, "Vouchers", 2, ticket_format())
            .unwrap();
    }
    let store = open_store(&dir);
    let block = store.get_block("Vouchers").unwrap();
    assert_eq!(block.format(), Some(&ticket_format()));
    let mut tx = block.start_transaction();
    assert_eq!(
        tx.set(0, "Barcode", "9".repeat(19)).unwrap_err().code(),
        StorageErrorCode::FieldOverflow
    );
}

#[test]
fn test_invalid_format_rejected() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let err = store
        .create_dynamic_block(PersistenceLevel::Static, "Empty", 1, BlockFormat::new(1))
        .unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::ConfigError);
    assert!(!store.block_exists("Empty").unwrap());
}

#[cfg(not(feature = "encryption"))]
#[test]
fn test_passphrase_without_encryption_support_refuses_open() {
    let dir = create_temp_data_dir();
    let mut config = test_config(&dir);
    config.encryption_passphrase = Some("secret".to_string());

    let err = egm_storage::storage::StorageManager::open(config).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::ConfigError);
    // Nothing was written in plaintext
    assert!(!database_path(&dir).exists());
}

// =============================================================================
// Resize and level changes
// =============================================================================

#[test]
fn test_resize_preserves_retained_elements() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Critical, "History", 4)
        .unwrap();
    let mut tx = block.start_transaction();
    for i in 0..4 {
        tx.set(i, "Amount", (i as i64 + 1) * 100).unwrap();
    }
    tx.commit().unwrap();

    store.resize_block("History", 6).unwrap();
    assert_eq!(block.count(), 6);
    assert_eq!(block.get::<i64>(3, "Amount").unwrap(), 400);
    assert_eq!(block.get::<i64>(5, "Amount").unwrap(), 0);

    store.resize_block("History", 2).unwrap();
    assert_eq!(block.count(), 2);
    assert_eq!(block.get::<i64>(1, "Amount").unwrap(), 200);
    assert_eq!(
        block.get::<i64>(3, "Amount").unwrap_err().code(),
        StorageErrorCode::ElementOutOfRange
    );

    // Growing again does not resurrect truncated values
    store.resize_block("History", 4).unwrap();
    assert_eq!(block.get::<i64>(3, "Amount").unwrap(), 0);
}

#[test]
fn test_resize_missing_block() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    assert_eq!(
        store.resize_block("Nope", 3).unwrap_err().code(),
        StorageErrorCode::InvalidHandle
    );
}

#[test]
fn test_update_persistence_level() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Static, "Promoted", 1)
        .unwrap();

    store
        .update_persistence_level("Promoted", PersistenceLevel::Critical)
        .unwrap();
    assert_eq!(block.level(), PersistenceLevel::Critical);

    store.clear(PersistenceLevel::Static).unwrap();
    assert!(block.is_valid());
    assert!(store.block_exists("Promoted").unwrap());
}

#[test]
fn test_list_blocks() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    store
        .create_block(PersistenceLevel::Static, "B", 1)
        .unwrap();
    store
        .create_dynamic_block(PersistenceLevel::Critical, "A", 2, ticket_format())
        .unwrap();

    let names: Vec<String> = store
        .list_blocks()
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(names, vec!["A", "B", "StorageManager.LastCleared"]);
}
