//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use egm_storage::config::StorageConfig;
use egm_storage::storage::StorageManager;
use tempfile::TempDir;

pub fn create_temp_data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

pub fn test_config(dir: &TempDir) -> StorageConfig {
    let mut config = StorageConfig::new(dir.path().join("data"));
    config.clear_retry_attempts = 2;
    config.clear_retry_backoff_ms = 1;
    config
}

pub fn open_store(dir: &TempDir) -> StorageManager {
    StorageManager::open(test_config(dir)).expect("Failed to open store")
}

pub fn database_path(dir: &TempDir) -> PathBuf {
    dir.path().join("data").join("egm_storage.sqlite")
}

/// Overwrite the start of a file, destroying the SQLite header
pub fn corrupt_file(path: &std::path::Path) {
    let mut contents = std::fs::read(path).expect("Failed to read file");
    for byte in contents.iter_mut().take(100) {
        *byte = 0xA5;
    }
    std::fs::write(path, contents).expect("Failed to write file");
}
