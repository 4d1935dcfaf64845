//! Crash recovery tests
//!
//! Each test runs the operator binary with `EGM_STORAGE_CRASH_POINT` set so
//! the process aborts mid-operation, then reopens the store in-process and
//! checks that the interrupted operation landed entirely or not at all.
//!
//! Opening a store commits, so commit points are armed from code instead: the
//! test binary reruns itself with only `commit_crash_child` selected.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use egm_storage::config::StorageConfig;
use egm_storage::crash_point::{self, points, CRASH_POINT_ENV};
use egm_storage::secondary::files_match;
use egm_storage::storage::{PersistenceLevel, StorageManager};
use tempfile::TempDir;

use common::{corrupt_file, create_temp_data_dir, database_path, test_config};

// =============================================================================
// Harness
// =============================================================================

fn write_config(dir: &TempDir, config: &StorageConfig) -> PathBuf {
    let path = dir.path().join("egm_storage.json");
    fs::write(&path, serde_json::to_string_pretty(config).unwrap()).unwrap();
    path
}

fn run_with_crash_point(crash_point: &str, config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_egm-storage"))
        .args(args)
        .arg("--config")
        .arg(config)
        .env(CRASH_POINT_ENV, crash_point)
        .output()
        .expect("Failed to run egm-storage")
}

fn assert_crashed(output: &Output, crash_point: &str) {
    assert!(
        !output.status.success(),
        "process survived crash point {}",
        crash_point
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!("[CRASH] Triggering crash at point: {}", crash_point)),
        "crash point {} not reached, stderr: {}",
        crash_point,
        stderr
    );
}

const CHILD_CONFIG_ENV: &str = "EGM_STORAGE_TEST_CHILD_CONFIG";
const CHILD_POINT_ENV: &str = "EGM_STORAGE_TEST_CHILD_POINT";

fn run_commit_child(crash_point: &str, config: &Path) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args(["commit_crash_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_CONFIG_ENV, config)
        .env(CHILD_POINT_ENV, crash_point)
        .env_remove(CRASH_POINT_ENV)
        .output()
        .expect("Failed to rerun test binary")
}

/// Store holding one Static and one Critical block with a value each
fn seed(config: &StorageConfig) {
    let store = StorageManager::open(config.clone()).unwrap();
    for (level, name) in [
        (PersistenceLevel::Static, "Settings"),
        (PersistenceLevel::Critical, "Meters"),
    ] {
        let block = store.create_block(level, name, 4).unwrap();
        let mut tx = block.start_transaction();
        tx.set(2, "Value", 99i64).unwrap();
        tx.commit().unwrap();
    }
    store.sync_mirror().unwrap();
}

// =============================================================================
// Transaction commit
// =============================================================================

/// Runs only when rerun by `run_commit_child`; a no-op in the normal suite
#[test]
fn commit_crash_child() {
    let (Ok(config_path), Ok(point)) = (
        std::env::var(CHILD_CONFIG_ENV),
        std::env::var(CHILD_POINT_ENV),
    ) else {
        return;
    };
    let config: StorageConfig =
        serde_json::from_str(&fs::read_to_string(config_path).unwrap()).unwrap();
    let store = StorageManager::open(config).unwrap();
    let settings = store.get_block("Settings").unwrap();
    let meters = store.get_block("Meters").unwrap();

    let mut tx = settings.start_transaction();
    tx.add_block(&meters).unwrap();
    tx.set(2, "Value", 7i64).unwrap();
    tx.set_in(&meters, 2, "Value", 7i64).unwrap();

    assert!(crash_point::arm(&point));
    tx.commit().unwrap();
    panic!("commit survived crash point {}", point);
}

fn stored_values(config: StorageConfig) -> (i64, i64) {
    let store = StorageManager::open(config).unwrap();
    assert!(store.verify_integrity(true));
    let settings = store.get_block("Settings").unwrap();
    let meters = store.get_block("Meters").unwrap();
    (
        settings.get::<i64>(2, "Value").unwrap(),
        meters.get::<i64>(2, "Value").unwrap(),
    )
}

#[test]
fn test_crash_before_commit_lands_nothing() {
    let dir = create_temp_data_dir();
    let config = test_config(&dir);
    seed(&config);
    let config_path = write_config(&dir, &config);

    let output = run_commit_child(points::COMMIT_BEFORE, &config_path);
    assert_crashed(&output, points::COMMIT_BEFORE);

    assert_eq!(stored_values(config), (99, 99));
}

#[test]
fn test_crash_after_commit_lands_both_blocks() {
    let dir = create_temp_data_dir();
    let config = test_config(&dir);
    seed(&config);
    let config_path = write_config(&dir, &config);

    let output = run_commit_child(points::COMMIT_AFTER, &config_path);
    assert_crashed(&output, points::COMMIT_AFTER);

    assert_eq!(stored_values(config), (7, 7));
}

// =============================================================================
// Clear
// =============================================================================

#[test]
fn test_crash_before_clear_commit_keeps_blocks() {
    let dir = create_temp_data_dir();
    let config = test_config(&dir);
    seed(&config);
    let config_path = write_config(&dir, &config);

    let output = run_with_crash_point(
        points::CLEAR_BEFORE_COMMIT,
        &config_path,
        &["clear", "--level", "static"],
    );
    assert_crashed(&output, points::CLEAR_BEFORE_COMMIT);

    let store = StorageManager::open(config).unwrap();
    assert!(store.verify_integrity(true));
    let settings = store.get_block("Settings").unwrap();
    assert_eq!(settings.get::<i64>(2, "Value").unwrap(), 99);
    assert!(store.last_cleared(PersistenceLevel::Static).unwrap().is_none());
}

#[test]
fn test_crash_after_clear_delete_removes_blocks() {
    let dir = create_temp_data_dir();
    let config = test_config(&dir);
    seed(&config);
    let config_path = write_config(&dir, &config);

    let output = run_with_crash_point(
        points::CLEAR_AFTER_DELETE,
        &config_path,
        &["clear", "--level", "static"],
    );
    assert_crashed(&output, points::CLEAR_AFTER_DELETE);

    let store = StorageManager::open(config).unwrap();
    assert!(store.verify_integrity(true));
    assert!(!store.block_exists("Settings").unwrap());
    let meters = store.get_block("Meters").unwrap();
    assert_eq!(meters.get::<i64>(2, "Value").unwrap(), 99);
}

#[test]
fn test_clear_without_crash_point_succeeds() {
    let dir = create_temp_data_dir();
    let config = test_config(&dir);
    seed(&config);
    let config_path = write_config(&dir, &config);

    let output = run_with_crash_point("no_such_point", &config_path, &["clear", "--level", "critical"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"status\":\"ok\""));

    let store = StorageManager::open(config).unwrap();
    assert!(!store.block_exists("Meters").unwrap());
    assert!(store.last_cleared(PersistenceLevel::Critical).unwrap().is_some());
}

// =============================================================================
// Mirror repair
// =============================================================================

#[test]
fn test_crash_during_repair_is_repaired_again() {
    let dir = create_temp_data_dir();
    let mut config = test_config(&dir);
    config.secondary.enabled = true;
    config.secondary.required = true;
    config.secondary.path = Some(dir.path().join("mirror"));
    seed(&config);
    corrupt_file(&database_path(&dir));
    let config_path = write_config(&dir, &config);

    let output = run_with_crash_point(points::MIRROR_BEFORE_RENAME, &config_path, &["init"]);
    assert_crashed(&output, points::MIRROR_BEFORE_RENAME);

    // The staged copy never replaced the damaged primary
    let store = StorageManager::open(config).unwrap();
    assert_eq!(store.metrics().mirror_repairs, 1);
    let meters = store.get_block("Meters").unwrap();
    assert_eq!(meters.get::<i64>(2, "Value").unwrap(), 99);
    assert!(files_match(
        &database_path(&dir),
        &dir.path().join("mirror").join("egm_storage.sqlite")
    )
    .unwrap());
}
