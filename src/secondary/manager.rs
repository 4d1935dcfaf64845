//! Secondary (mirror) storage manager
//!
//! Keeps a copy of every allow-listed database file on a second physical
//! medium. At startup `verify` checks both copies of each file and repairs
//! whichever side is damaged from the sound one. When both copies are
//! damaged nothing is touched and the store must not open.
//!
//! The primary directory is also scanned for database files that are not on
//! the allow-list; finding one is treated as tampering.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Serialize;

use super::checksum::files_match;
use super::errors::{SecondaryResult, SecondaryStorageError};
use super::volumes::{find_secondary, VolumeSource};
use crate::config::StorageConfig;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry, MetricsSnapshot, ObservationScope};
use crate::signals::{SecondaryErrorKind, SignalBus, StorageSignal};
use crate::storage::catalog::{self, side_files, ConnectionFactory};

/// Outcome of the mirror configuration check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    /// Mirroring is switched off in configuration
    Disabled,
    /// Mirror required and connected
    Connected,
    /// Mirror required but missing
    NotConnected,
    /// Mirror connected although the platform does not require one
    NotSupported,
    /// Mirror neither required nor connected
    Absent,
}

/// Primary and secondary directories, fixed once set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPaths {
    pub primary: PathBuf,
    pub secondary: PathBuf,
}

pub struct SecondaryStorageManager {
    enabled: bool,
    required: bool,
    configured_path: Option<PathBuf>,
    mirror_dir_name: String,
    allowed: Vec<String>,
    extension: String,
    factory: ConnectionFactory,
    source: Box<dyn VolumeSource>,
    paths: OnceLock<MirrorPaths>,
    signals: SignalBus,
    metrics: MetricsRegistry,
}

impl SecondaryStorageManager {
    pub fn new(config: &StorageConfig, source: Box<dyn VolumeSource>) -> Self {
        Self {
            enabled: config.secondary.enabled,
            required: config.secondary.required,
            configured_path: config.secondary.path.clone(),
            mirror_dir_name: config.secondary.mirror_dir_name.clone(),
            allowed: config.allowed_files(),
            extension: config.secondary.database_extension.clone(),
            factory: ConnectionFactory::from_config(config),
            source,
            paths: OnceLock::new(),
            signals: SignalBus::new(),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Bus the mirror publishes on; the storage manager shares it
    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Fix the mirrored directories. Only the first call takes effect.
    pub fn set_paths(&self, primary: impl Into<PathBuf>, secondary: impl Into<PathBuf>) -> bool {
        self.paths
            .set(MirrorPaths {
                primary: primary.into(),
                secondary: secondary.into(),
            })
            .is_ok()
    }

    pub fn paths(&self) -> Option<&MirrorPaths> {
        self.paths.get()
    }

    /// Mirror directory on a disk other than the one hosting `primary`
    pub fn discover_secondary(&self, primary: &Path) -> SecondaryResult<Option<PathBuf>> {
        let volumes = self
            .source
            .volumes()
            .map_err(SecondaryStorageError::Discovery)?;
        let primary = fs::canonicalize(primary).unwrap_or_else(|_| primary.to_path_buf());
        Ok(find_secondary(&volumes, &primary).map(|v| v.mount_point.join(&self.mirror_dir_name)))
    }

    /// Resolve and create the mirror directory for `primary_dir`.
    ///
    /// Returns false when mirroring is disabled or no secondary medium was
    /// found.
    pub fn attach(&self, primary_dir: &Path) -> SecondaryResult<bool> {
        if !self.enabled {
            return Ok(false);
        }
        if self.paths().is_some() {
            return Ok(true);
        }
        let secondary = match &self.configured_path {
            Some(path) => Some(path.clone()),
            None => self.discover_secondary(primary_dir)?,
        };
        let secondary = match secondary {
            Some(path) => path,
            None => return Ok(false),
        };
        fs::create_dir_all(&secondary).map_err(|e| SecondaryStorageError::io(&secondary, e))?;
        self.set_paths(primary_dir, &secondary);
        Logger::info(
            Event::MirrorAttached.as_str(),
            &[
                ("primary", &primary_dir.display().to_string()),
                ("secondary", &secondary.display().to_string()),
            ],
        );
        Ok(true)
    }

    /// Check the connected mirror against the platform requirement
    pub fn verify_configuration(&self) -> MirrorStatus {
        if !self.enabled {
            return MirrorStatus::Disabled;
        }
        let connected = self
            .paths()
            .map(|p| p.secondary.is_dir())
            .unwrap_or(false);
        match (connected, self.required) {
            (true, true) => MirrorStatus::Connected,
            (true, false) => {
                log_event_with_fields(Event::MirrorNotSupported, &[]);
                self.signals.publish(StorageSignal::SecondaryStorageError(
                    SecondaryErrorKind::NotSupported,
                ));
                MirrorStatus::NotSupported
            }
            (false, true) => {
                Logger::error(Event::MirrorNotConnected.as_str(), &[]);
                self.signals.publish(StorageSignal::SecondaryStorageError(
                    SecondaryErrorKind::NotConnected,
                ));
                MirrorStatus::NotConnected
            }
            (false, false) => MirrorStatus::Absent,
        }
    }

    /// Verify both copies of every allow-listed file and repair one-sided
    /// damage.
    ///
    /// Returns `Ok(false)` when some file is invalid on both sides; nothing
    /// is modified in that case.
    pub fn verify(&self) -> SecondaryResult<bool> {
        let paths = self.paths().ok_or(SecondaryStorageError::NotConfigured)?;
        let scope = ObservationScope::with_fields(
            "MIRROR_VERIFY",
            &[
                ("primary", &paths.primary.display().to_string()),
                ("secondary", &paths.secondary.display().to_string()),
            ],
        );

        if let Err(e) = self.scan_unexpected(&paths.primary) {
            self.report(&e);
            scope.fail_fatal(&e.to_string());
            return Err(e);
        }

        let mut repairs = Vec::new();
        for file in &self.allowed {
            let primary = paths.primary.join(file);
            let secondary = paths.secondary.join(file);
            if !primary.exists() && !secondary.exists() {
                continue;
            }
            match (self.is_valid(&primary), self.is_valid(&secondary)) {
                (true, true) => {}
                (true, false) => repairs.push((primary, secondary)),
                (false, true) => repairs.push((secondary, primary)),
                (false, false) => {
                    let e = SecondaryStorageError::Unrecoverable(file.clone());
                    self.report(&e);
                    scope.fail_fatal(&e.to_string());
                    return Ok(false);
                }
            }
        }

        let repaired = repairs.len();
        for (source, target) in repairs {
            if let Err(e) = self.copy_over(&source, &target) {
                self.report(&e);
                scope.fail(&e.to_string());
                return Err(e);
            }
            self.metrics.increment_mirror_repairs();
            Logger::warn(
                Event::MirrorRepaired.as_str(),
                &[
                    ("source", &source.display().to_string()),
                    ("target", &target.display().to_string()),
                ],
            );
        }

        log_event_with_fields(Event::MirrorVerified, &[("repaired", &repaired.to_string())]);
        scope.complete_with_fields(&[("repaired", &repaired.to_string())]);
        Ok(true)
    }

    /// Refresh the mirror from every sound primary file that differs from its
    /// copy. Returns the number of files copied.
    pub fn synchronize(&self) -> SecondaryResult<usize> {
        let paths = self.paths().ok_or(SecondaryStorageError::NotConfigured)?;
        let mut copied = 0;
        for file in &self.allowed {
            let primary = paths.primary.join(file);
            if !primary.exists() || !self.is_valid(&primary) {
                continue;
            }
            let secondary = paths.secondary.join(file);
            self.checkpoint(&primary)?;
            let current = secondary.exists()
                && files_match(&primary, &secondary)
                    .map_err(|e| SecondaryStorageError::io(&secondary, e))?;
            if current {
                continue;
            }
            if let Err(e) = self.copy_over(&primary, &secondary) {
                self.report(&e);
                return Err(e);
            }
            copied += 1;
        }
        Ok(copied)
    }

    /// Delete the mirror copy of `file` and its side files
    pub fn remove_counterpart(&self, file: &str) -> SecondaryResult<()> {
        let paths = self.paths().ok_or(SecondaryStorageError::NotConfigured)?;
        let target = paths.secondary.join(file);
        remove_if_present(&target)?;
        for side in side_files(&target) {
            remove_if_present(&side)?;
        }
        Logger::info(Event::MirrorCounterpartRemoved.as_str(), &[("file", file)]);
        Ok(())
    }

    fn scan_unexpected(&self, dir: &Path) -> SecondaryResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SecondaryStorageError::io(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| SecondaryStorageError::io(dir, e))?;
            let path = entry.path();
            let is_database = path
                .extension()
                .map(|ext| ext.to_string_lossy() == self.extension.as_str())
                .unwrap_or(false);
            if !is_database || !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.allowed.contains(&name) {
                return Err(SecondaryStorageError::UnexpectedFile(path));
            }
        }
        Ok(())
    }

    /// A file is valid when it exists, opens, and passes a full integrity
    /// check
    fn is_valid(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let result = self
            .factory
            .for_path(path)
            .open_existing()
            .and_then(|conn| catalog::integrity_problems(&conn, true));
        match result {
            Ok(problems) if problems.is_empty() => true,
            Ok(problems) => {
                Logger::warn(
                    Event::MirrorFileInvalid.as_str(),
                    &[
                        ("path", &path.display().to_string()),
                        ("problems", &problems.join("; ")),
                    ],
                );
                false
            }
            Err(e) => {
                Logger::warn(
                    Event::MirrorFileInvalid.as_str(),
                    &[
                        ("path", &path.display().to_string()),
                        ("reason", &e.to_string()),
                    ],
                );
                false
            }
        }
    }

    fn checkpoint(&self, path: &Path) -> SecondaryResult<()> {
        self.factory
            .for_path(path)
            .open_existing()
            .and_then(|conn| catalog::checkpoint(&conn))
            .map_err(|source| SecondaryStorageError::Database {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Replace `target` with a byte-for-byte copy of the sound `source`
    fn copy_over(&self, source: &Path, target: &Path) -> SecondaryResult<()> {
        self.checkpoint(source)?;
        maybe_crash(points::MIRROR_BEFORE_COPY);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SecondaryStorageError::io(parent, e))?;
        }
        for side in side_files(target) {
            remove_if_present(&side)?;
        }

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = target.with_file_name(format!("{}.tmp", name));
        fs::copy(source, &staging).map_err(|e| SecondaryStorageError::io(&staging, e))?;
        File::open(&staging)
            .and_then(|f| f.sync_all())
            .map_err(|e| SecondaryStorageError::io(&staging, e))?;

        maybe_crash(points::MIRROR_BEFORE_RENAME);
        fs::rename(&staging, target).map_err(|e| SecondaryStorageError::io(target, e))?;

        let matches = files_match(source, target).map_err(|e| SecondaryStorageError::io(target, e))?;
        if !matches {
            return Err(SecondaryStorageError::CopyMismatch(name));
        }
        Ok(())
    }

    fn report(&self, err: &SecondaryStorageError) {
        let event = match err {
            SecondaryStorageError::UnexpectedFile(_) => Event::MirrorUnexpectedFile,
            SecondaryStorageError::Unrecoverable(_) => Event::MirrorUnrecoverable,
            _ => Event::StorageError,
        };
        if event.is_fatal() {
            Logger::fatal(event.as_str(), &[("reason", &err.to_string())]);
        } else {
            Logger::error(event.as_str(), &[("reason", &err.to_string())]);
        }
        self.metrics.increment_storage_errors();
        self.signals
            .publish(StorageSignal::SecondaryStorageError(err.kind()));
    }
}

fn remove_if_present(path: &Path) -> SecondaryResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SecondaryStorageError::io(path, e)),
    }
}
