//! CLI command implementations
//!
//! Commands operate on a stopped machine: each opens the store from the
//! configuration file, does one thing, and prints one JSON object.

use std::path::Path;

use serde_json::{json, Value};

use crate::config::StorageConfig;
use crate::observability::{log_event_with_fields, Event};
use crate::secondary::{SecondaryStorageManager, SysfsVolumeSource};
use crate::storage::{PersistenceLevel, StorageManager};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Run a parsed command and print its result
pub fn run_command(command: Command) -> CliResult<()> {
    let result = match command {
        Command::Init { config } => init(&config),
        Command::Verify { config, full } => verify(&config, full),
        Command::Defrag { config } => defrag(&config),
        Command::Clear { config, level } => clear(&config, level),
        Command::Blocks { config } => blocks(&config),
        Command::MirrorVerify { config } => mirror_verify(&config),
    };
    match result {
        Ok(data) => write_response(data),
        Err(e) => {
            write_error(e.code(), &e.to_string())?;
            Err(e)
        }
    }
}

fn load_config(path: &Path) -> CliResult<StorageConfig> {
    let config = StorageConfig::load(path)?;
    log_event_with_fields(
        Event::ConfigLoaded,
        &[("path", &path.display().to_string())],
    );
    Ok(config)
}

fn open(path: &Path) -> CliResult<StorageManager> {
    Ok(StorageManager::open(load_config(path)?)?)
}

/// Create the data directory and an empty store
pub fn init(config_path: &Path) -> CliResult<Value> {
    let manager = open(config_path)?;
    Ok(json!({
        "database": manager.database_path().display().to_string(),
        "blocks": manager.list_blocks()?.len(),
    }))
}

/// Run the integrity check; a failed check is an error
pub fn verify(config_path: &Path, full: bool) -> CliResult<Value> {
    let manager = open(config_path)?;
    if !manager.verify_integrity(full) {
        return Err(CliError::VerifyFailed);
    }
    Ok(json!({
        "mode": if full { "full" } else { "quick" },
        "passed": true,
    }))
}

pub fn defrag(config_path: &Path) -> CliResult<Value> {
    let manager = open(config_path)?;
    manager.defragment()?;
    Ok(json!({ "metrics": serde_json::to_value(manager.metrics())? }))
}

pub fn clear(config_path: &Path, level: PersistenceLevel) -> CliResult<Value> {
    let manager = open(config_path)?;
    manager.clear(level)?;
    let mut last_cleared = serde_json::Map::new();
    for level in PersistenceLevel::ALL {
        let stamp = manager.last_cleared(level)?.map(|t| t.to_rfc3339());
        last_cleared.insert(level.as_str().to_string(), json!(stamp));
    }
    Ok(json!({
        "level": level,
        "state": manager.clear_state(),
        "last_cleared": last_cleared,
    }))
}

pub fn blocks(config_path: &Path) -> CliResult<Value> {
    let manager = open(config_path)?;
    Ok(serde_json::to_value(manager.list_blocks()?)?)
}

/// Verify and repair the mirror without opening the store
pub fn mirror_verify(config_path: &Path) -> CliResult<Value> {
    let config = load_config(config_path)?;
    if !config.secondary.enabled {
        return Err(CliError::MirrorDisabled);
    }
    let mirror = SecondaryStorageManager::new(&config, Box::new(SysfsVolumeSource::new()));
    if !mirror.attach(&config.data_dir)? {
        return Err(CliError::MirrorNotFound);
    }
    let status = mirror.verify_configuration();
    let valid = mirror.verify()?;
    let paths = mirror.paths().ok_or(CliError::MirrorNotFound)?;
    Ok(json!({
        "status": status,
        "valid": valid,
        "repaired": mirror.metrics().mirror_repairs,
        "primary": paths.primary.display().to_string(),
        "secondary": paths.secondary.display().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, extra: &str) -> std::path::PathBuf {
        let path = dir.path().join("egm_storage.json");
        let data_dir = dir.path().join("data");
        fs::write(
            &path,
            format!(
                r#"{{"data_dir": {}{}}}"#,
                serde_json::to_string(&data_dir).unwrap(),
                extra
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_init_creates_store() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        let data = init(&config).unwrap();
        assert!(dir.path().join("data").join("egm_storage.sqlite").exists());
        // Only the reserved last-cleared block exists
        assert_eq!(data["blocks"], 1);
    }

    #[test]
    fn test_verify_and_blocks() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        init(&config).unwrap();
        assert_eq!(verify(&config, true).unwrap()["passed"], true);
        let listed = blocks(&config).unwrap();
        assert_eq!(listed[0]["name"], "StorageManager.LastCleared");
    }

    #[test]
    fn test_clear_reports_timestamps() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        let data = clear(&config, PersistenceLevel::Static).unwrap();
        assert_eq!(data["state"], "cleared");
        assert!(data["last_cleared"]["static"].is_string());
        assert!(data["last_cleared"]["critical"].is_null());
    }

    #[test]
    fn test_mirror_verify_requires_enabled() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        assert!(matches!(mirror_verify(&config), Err(CliError::MirrorDisabled)));
    }

    #[test]
    fn test_missing_config_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let err = init(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), "EGM_STORAGE_CONFIG_ERROR");
    }
}
