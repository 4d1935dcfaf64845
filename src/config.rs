//! Storage configuration
//!
//! Loaded from a JSON file by the operator CLI, or built in code by the
//! machine's start-up sequence. Every field except `data_dir` has a default.
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/egm/storage",
//!   "database_file": "egm_storage.sqlite",
//!   "log_level": "info",
//!   "secondary": { "enabled": true, "required": true }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observability::Severity;
use crate::storage::{StorageError, StorageResult};

/// Top-level storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the primary database file set
    pub data_dir: PathBuf,

    /// File name of the primary database inside `data_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Passphrase for whole-file encryption; requires the `encryption` feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_passphrase: Option<String>,

    /// How long a connection waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// File-deletion attempts after a failed clear
    #[serde(default = "default_clear_retry_attempts")]
    pub clear_retry_attempts: u32,

    /// Backoff step between file-deletion attempts (grows linearly)
    #[serde(default = "default_clear_retry_backoff_ms")]
    pub clear_retry_backoff_ms: u64,

    /// Minimum severity written by the logger
    #[serde(default = "default_log_level")]
    pub log_level: Severity,

    #[serde(default)]
    pub secondary: SecondaryConfig,
}

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConfig {
    /// Whether the engine looks for a secondary medium at all
    #[serde(default)]
    pub enabled: bool,

    /// Whether the platform requires a mirror to be connected
    #[serde(default)]
    pub required: bool,

    /// Explicit mirror directory; discovered from mounted volumes when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Directory created on the discovered secondary volume
    #[serde(default = "default_mirror_dir_name")]
    pub mirror_dir_name: String,

    /// Per-protocol database files allowed next to the primary database
    #[serde(default)]
    pub additional_files: Vec<String>,

    /// Extension identifying database files on the primary medium
    #[serde(default = "default_database_extension")]
    pub database_extension: String,
}

fn default_database_file() -> String {
    "egm_storage.sqlite".to_string()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_clear_retry_attempts() -> u32 {
    5
}
fn default_clear_retry_backoff_ms() -> u64 {
    250
}
fn default_log_level() -> Severity {
    Severity::Info
}
fn default_mirror_dir_name() -> String {
    "egm_storage_mirror".to_string()
}
fn default_database_extension() -> String {
    "sqlite".to_string()
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            path: None,
            mirror_dir_name: default_mirror_dir_name(),
            additional_files: Vec::new(),
            database_extension: default_database_extension(),
        }
    }
}

impl StorageConfig {
    /// Configuration with every default and the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database_file: default_database_file(),
            encryption_passphrase: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            clear_retry_attempts: default_clear_retry_attempts(),
            clear_retry_backoff_ms: default_clear_retry_backoff_ms(),
            log_level: default_log_level(),
            secondary: SecondaryConfig::default(),
        }
    }

    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> StorageResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StorageError::config_error(format!("failed to read config {}", path.display()))
                .with_source(e)
        })?;

        let config: StorageConfig = serde_json::from_str(&content).map_err(|e| {
            StorageError::config_error(format!("invalid config JSON in {}", path.display()))
                .with_source(e)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StorageError::config_error("data_dir must not be empty"));
        }
        if !is_plain_file_name(&self.database_file) {
            return Err(StorageError::config_error(format!(
                "database_file '{}' must be a bare file name",
                self.database_file
            )));
        }
        if self.clear_retry_attempts == 0 {
            return Err(StorageError::config_error(
                "clear_retry_attempts must be > 0",
            ));
        }
        if matches!(self.encryption_passphrase.as_deref(), Some("")) {
            return Err(StorageError::config_error(
                "encryption_passphrase must not be empty when set",
            ));
        }
        #[cfg(not(feature = "encryption"))]
        if self.encryption_passphrase.is_some() {
            return Err(StorageError::config_error(
                "encryption_passphrase requires a build with the `encryption` feature",
            ));
        }
        if let Some(bad) = self
            .secondary
            .additional_files
            .iter()
            .find(|f| !is_plain_file_name(f))
        {
            return Err(StorageError::config_error(format!(
                "additional file '{}' must be a bare file name",
                bad
            )));
        }
        if self.secondary.required && !self.secondary.enabled {
            return Err(StorageError::config_error(
                "secondary.required needs secondary.enabled",
            ));
        }
        Ok(())
    }

    /// Full path of the primary database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn clear_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.clear_retry_backoff_ms)
    }

    /// Database files allowed on the primary medium, primary first
    pub fn allowed_files(&self) -> Vec<String> {
        let mut files = vec![self.database_file.clone()];
        for extra in &self.secondary.additional_files {
            if !files.contains(extra) {
                files.push(extra.clone());
            }
        }
        files
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
