//! Transaction atomicity tests
//!
//! Staged writes are invisible until commit, land all together, and vanish
//! when the transaction is dropped or a commit fails.

mod common;

use std::sync::Arc;
use std::thread;

use egm_storage::storage::{PersistenceLevel, StorageErrorCode};

use common::{create_temp_data_dir, open_store};

// =============================================================================
// Visibility
// =============================================================================

#[test]
fn test_staged_writes_invisible_until_commit() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Critical, "Meters", 2)
        .unwrap();

    let mut tx = block.start_transaction();
    tx.set(0, "Coins", 50i64).unwrap();
    assert_eq!(tx.staged(), 1);
    assert_eq!(block.get::<i64>(0, "Coins").unwrap(), 0);

    assert_eq!(tx.commit().unwrap(), 1);
    assert_eq!(block.get::<i64>(0, "Coins").unwrap(), 50);
}

#[test]
fn test_drop_without_commit_discards() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Critical, "Meters", 2)
        .unwrap();

    let before = store.metrics();
    {
        let mut tx = block.start_transaction();
        tx.set(1, "Coins", 99i64).unwrap();
    }
    assert_eq!(block.get::<i64>(1, "Coins").unwrap(), 0);
    let after = store.metrics();
    assert_eq!(after.transactions_discarded, before.transactions_discarded + 1);
    assert_eq!(after.transactions_committed, before.transactions_committed);
}

#[test]
fn test_later_write_to_same_element_wins() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Static, "Meters", 1)
        .unwrap();

    let mut tx = block.start_transaction();
    tx.set(0, "Coins", 1i64).unwrap();
    tx.set(0, "Coins", 2i64).unwrap();
    assert_eq!(tx.staged(), 1);
    tx.commit().unwrap();
    assert_eq!(block.get::<i64>(0, "Coins").unwrap(), 2);
}

#[test]
fn test_committed_writes_survive_reopen() {
    let dir = create_temp_data_dir();
    {
        let store = open_store(&dir);
        let block = store
            .create_block(PersistenceLevel::Critical, "Meters", 3)
            .unwrap();
        let mut tx = block.start_transaction();
        tx.set(0, "Coins", 10i64).unwrap();
        tx.set(2, "Bills", 20i64).unwrap();
        tx.commit().unwrap();

        let mut uncommitted = block.start_transaction();
        uncommitted.set(1, "Coins", 30i64).unwrap();
        drop(uncommitted);
    }

    let store = open_store(&dir);
    let block = store.get_block("Meters").unwrap();
    assert_eq!(block.get::<i64>(0, "Coins").unwrap(), 10);
    assert_eq!(block.get::<i64>(1, "Coins").unwrap(), 0);
    assert_eq!(block.get::<i64>(2, "Bills").unwrap(), 20);
}

// =============================================================================
// Cross-block transactions
// =============================================================================

#[test]
fn test_cross_block_commit_lands_together() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let meters = store
        .create_block(PersistenceLevel::Critical, "Meters", 1)
        .unwrap();
    let history = store
        .create_block(PersistenceLevel::Critical, "History", 5)
        .unwrap();

    let mut tx = meters.start_transaction();
    tx.add_block(&history).unwrap();
    tx.set(0, "Won", 500i64).unwrap();
    tx.set_in(&history, 4, "Win", 500i64).unwrap();
    tx.commit().unwrap();

    assert_eq!(meters.get::<i64>(0, "Won").unwrap(), 500);
    assert_eq!(history.get::<i64>(4, "Win").unwrap(), 500);
}

#[test]
fn test_write_to_unenrolled_block_rejected() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let meters = store
        .create_block(PersistenceLevel::Critical, "Meters", 1)
        .unwrap();
    let other = store
        .create_block(PersistenceLevel::Critical, "Other", 1)
        .unwrap();

    let mut tx = meters.start_transaction();
    let err = tx.set_in(&other, 0, "X", 1i64).unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::InvalidHandle);
}

#[test]
fn test_failed_commit_applies_nothing() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let meters = store
        .create_block(PersistenceLevel::Critical, "Meters", 1)
        .unwrap();
    let doomed = store
        .create_block(PersistenceLevel::Static, "Doomed", 1)
        .unwrap();

    let mut tx = meters.start_transaction();
    tx.add_block(&doomed).unwrap();
    tx.set(0, "Won", 7i64).unwrap();
    tx.set_in(&doomed, 0, "Won", 7i64).unwrap();

    // The second block disappears between staging and commit
    store.clear(PersistenceLevel::Static).unwrap();

    let err = tx.commit().unwrap_err();
    assert_eq!(err.code(), StorageErrorCode::InvalidHandle);
    assert_eq!(meters.get::<i64>(0, "Won").unwrap(), 0);
}

// =============================================================================
// Scoped transactions
// =============================================================================

#[test]
fn test_scoped_transaction_complete() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let a = store
        .create_block(PersistenceLevel::Static, "A", 1)
        .unwrap();
    let b = store
        .create_block(PersistenceLevel::Static, "B", 1)
        .unwrap();

    let mut tx = store.scoped_transaction();
    tx.set(&a, 0, "Value", 1i64).unwrap();
    tx.set(&b, 0, "Value", true).unwrap();
    assert_eq!(tx.staged(), 2);
    assert_eq!(tx.complete().unwrap(), 2);

    assert_eq!(a.get::<i64>(0, "Value").unwrap(), 1);
    assert!(b.get::<bool>(0, "Value").unwrap());
}

#[test]
fn test_scoped_transaction_dropped_discards() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let a = store
        .create_block(PersistenceLevel::Static, "A", 1)
        .unwrap();

    {
        let mut tx = store.scoped_transaction();
        tx.set(&a, 0, "Value", 1i64).unwrap();
    }
    assert_eq!(a.get::<i64>(0, "Value").unwrap(), 0);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_writers_to_distinct_elements() {
    let dir = create_temp_data_dir();
    let store = open_store(&dir);
    let block = store
        .create_block(PersistenceLevel::Critical, "Meters", 8)
        .unwrap();
    let block = Arc::new(block);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let block = Arc::clone(&block);
            thread::spawn(move || {
                for n in 1..=5i64 {
                    let mut tx = block.start_transaction();
                    tx.set(i, "Coins", n * 10).unwrap();
                    tx.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..8 {
        assert_eq!(block.get::<i64>(i, "Coins").unwrap(), 50);
    }
}
