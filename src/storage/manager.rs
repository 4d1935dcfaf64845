//! Storage manager
//!
//! Owns the database file set, the block catalog and the accessor cache, and
//! runs the maintenance operations: integrity verification, defragmentation
//! and the persistence clear protocol.
//!
//! One manager-wide mutex (the catalog lock) serializes block creation,
//! catalog changes and clear deletion. It is always taken before the
//! engine's clear gate. Signals raised while either is held reach
//! subscribers only after both are released.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::accessor::BlockAccessor;
use super::catalog::{self, side_files, BlockRecord, ConnectionFactory, FieldRecord};
use super::clear::{delete_database_files, ClearObserver, ClearOrchestrator, ClearState};
use super::codec::{decode_column, encode_column, FieldType};
use super::engine::Engine;
use super::errors::{classify_engine_error, StorageError, StorageErrorCode, StorageResult};
use super::format::BlockFormat;
use super::level::PersistenceLevel;
use super::transaction::ScopedTransaction;
use crate::config::StorageConfig;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsSnapshot, ObservationScope};
use crate::secondary::{SecondaryStorageError, SecondaryStorageManager, SysfsVolumeSource};
use crate::signals::{Deferred, SignalBus, StorageErrorKind, StorageSignal};

/// Reserved block recording when each level was last cleared
pub const LAST_CLEARED_BLOCK: &str = "StorageManager.LastCleared";
/// Timestamp field of [`LAST_CLEARED_BLOCK`], one element per level rank
pub const LAST_CLEARED_FIELD: &str = "Timestamp";

/// Catalog entry as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub name: String,
    pub level: PersistenceLevel,
    pub version: u32,
    pub count: usize,
    pub dynamic: bool,
}

impl From<BlockRecord> for BlockInfo {
    fn from(record: BlockRecord) -> Self {
        Self {
            name: record.name,
            level: record.level,
            version: record.version,
            count: record.count,
            dynamic: record.format.is_some(),
        }
    }
}

struct ManagerInner {
    config: StorageConfig,
    engine: Arc<Engine>,
    catalog: Mutex<HashMap<String, BlockAccessor>>,
    clear: ClearOrchestrator,
    secondary: Option<Arc<SecondaryStorageManager>>,
}

/// Entry point of the storage engine.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<ManagerInner>,
}

impl StorageManager {
    /// Open the store described by `config`.
    ///
    /// When mirroring is enabled the secondary medium is discovered from the
    /// mounted volumes unless `secondary.path` is configured.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let secondary = if config.secondary.enabled {
            Some(Arc::new(SecondaryStorageManager::new(
                &config,
                Box::new(SysfsVolumeSource::new()),
            )))
        } else {
            None
        };
        let signals = secondary
            .as_ref()
            .map(|s| s.signals().clone())
            .unwrap_or_default();
        Self::open_inner(config, signals, secondary)
    }

    /// Open with an explicitly constructed mirror; signals go to the mirror's
    /// bus
    pub fn open_with_secondary(
        config: StorageConfig,
        secondary: Arc<SecondaryStorageManager>,
    ) -> StorageResult<Self> {
        let signals = secondary.signals().clone();
        Self::open_inner(config, signals, Some(secondary))
    }

    /// Open without a mirror, publishing on `signals` from the first step
    pub fn open_with_signals(config: StorageConfig, signals: SignalBus) -> StorageResult<Self> {
        Self::open_inner(config, signals, None)
    }

    fn open_inner(
        config: StorageConfig,
        signals: SignalBus,
        secondary: Option<Arc<SecondaryStorageManager>>,
    ) -> StorageResult<Self> {
        config.validate()?;
        Logger::set_min_severity(config.log_level);

        let path = config.database_path();
        let scope = ObservationScope::with_fields("STORE_OPEN", &[("path", &path.display().to_string())]);

        fs::create_dir_all(&config.data_dir).map_err(|e| {
            StorageError::write_failed(format!(
                "failed to create data directory {}",
                config.data_dir.display()
            ))
            .with_source(e)
        })?;

        if let Some(mirror) = &secondary {
            mirror.attach(&config.data_dir).map_err(mirror_failure)?;
            mirror.verify_configuration();
            if mirror.paths().is_some() && !mirror.verify().map_err(mirror_failure)? {
                let err = StorageError::integrity_failure(
                    "both copies of a mirrored database file are invalid",
                );
                scope.fail_fatal(err.message());
                return Err(err);
            }
        }

        let engine = Arc::new(Engine::new(ConnectionFactory::from_config(&config), signals));
        engine
            .factory()
            .initialize()
            .map_err(|e| refuse_corrupt(&engine, "failed to initialize database", e))?;

        let problems = {
            let conn = engine.connect(StorageErrorCode::ReadFailure)?;
            catalog::integrity_problems(&conn, false)
                .map_err(|e| refuse_corrupt(&engine, "quick check failed to run", e))?
        };
        engine.metrics().record_integrity_check(problems.is_empty());
        if !problems.is_empty() {
            Logger::error(
                Event::IntegrityCheckFailed.as_str(),
                &[("problems", &problems.join("; "))],
            );
            engine.signals().publish(StorageSignal::IntegrityCheckFailed);
            let err = StorageError::integrity_failure("database failed the quick integrity check")
                .with_details(problems.join("; "));
            scope.fail_fatal(err.message());
            return Err(err);
        }

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                engine,
                catalog: Mutex::new(HashMap::new()),
                clear: ClearOrchestrator::new(),
                secondary,
            }),
        };

        let dropped = manager.drop_transient()?;
        manager.record_last_cleared(PersistenceLevel::Transient)?;
        log_event_with_fields(Event::TransientCleared, &[("blocks", &dropped.to_string())]);

        if let Err(e) = manager.sync_mirror() {
            Logger::warn(Event::MirrorSyncFailed.as_str(), &[("reason", &e.to_string())]);
        }

        scope.complete();
        Ok(manager)
    }

    fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    fn lock_catalog(&self) -> Deferred<MutexGuard<'_, HashMap<String, BlockAccessor>>> {
        Deferred::new(
            self.inner
                .catalog
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        )
    }

    fn drop_transient(&self) -> StorageResult<usize> {
        let mut cache = self.lock_catalog();
        let engine = self.engine();
        let _gate = engine.exclusive();
        let mut conn = engine.connect(StorageErrorCode::ClearFailure)?;
        let tx = engine.begin_immediate(&mut conn, StorageErrorCode::ClearFailure)?;
        let names = catalog::delete_cleared_blocks(&tx, PersistenceLevel::Transient)
            .map_err(engine.err(StorageErrorCode::ClearFailure, "failed to drop transient blocks"))?;
        tx.commit()
            .map_err(engine.err(StorageErrorCode::ClearFailure, "failed to drop transient blocks"))?;
        for name in &names {
            if let Some(accessor) = cache.remove(name) {
                accessor.invalidate();
            }
        }
        Ok(names.len())
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Create a simple block whose fields are typed by their first write
    pub fn create_block(
        &self,
        level: PersistenceLevel,
        name: &str,
        count: usize,
    ) -> StorageResult<BlockAccessor> {
        self.create(level, name, count, None)
    }

    /// Create a block with a declared schema
    pub fn create_dynamic_block(
        &self,
        level: PersistenceLevel,
        name: &str,
        count: usize,
        format: BlockFormat,
    ) -> StorageResult<BlockAccessor> {
        format.validate(name)?;
        self.create(level, name, count, Some(format))
    }

    fn create(
        &self,
        level: PersistenceLevel,
        name: &str,
        count: usize,
        format: Option<BlockFormat>,
    ) -> StorageResult<BlockAccessor> {
        let engine = self.engine();
        engine.ensure_writable()?;
        if name.is_empty() {
            return Err(StorageError::config_error("block name must not be empty"));
        }

        let mut cache = self.lock_catalog();
        let _gate = engine.shared();
        let mut conn = engine.connect(StorageErrorCode::WriteFailure)?;
        let tx = engine.begin_immediate(&mut conn, StorageErrorCode::WriteFailure)?;

        let exists = catalog::load_block(&tx, name)
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to look up block '{}'", name)))?
            .is_some();
        if exists {
            return Err(StorageError::duplicate_block(name));
        }

        let record = BlockRecord {
            name: name.to_string(),
            version: format.as_ref().map(|f| f.version()).unwrap_or(0),
            level,
            count,
            format,
        };
        catalog::insert_block(&tx, &record)
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to create block '{}'", name)))?;

        let mut field_types = Vec::new();
        if let Some(format) = &record.format {
            let unset = encode_column(&vec![None; count]);
            for field in format.fields() {
                catalog::upsert_field(
                    &tx,
                    &FieldRecord {
                        block_name: name.to_string(),
                        field_name: field.name.clone(),
                        field_type: field.field_type,
                        data: unset.clone(),
                        count,
                    },
                )
                .map_err(engine.err(
                    StorageErrorCode::WriteFailure,
                    format!("failed to allocate field '{}' of block '{}'", field.name, name),
                ))?;
                field_types.push((field.name.clone(), field.field_type));
            }
        }
        tx.commit()
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to create block '{}'", name)))?;

        let accessor = BlockAccessor::from_record(record, field_types, Arc::clone(&self.inner.engine));
        cache.insert(name.to_string(), accessor.clone());
        engine.metrics().increment_blocks_created();
        log_event_with_fields(
            Event::BlockCreated,
            &[
                ("block", name),
                ("count", &count.to_string()),
                ("dynamic", &accessor.is_dynamic().to_string()),
                ("level", level.as_str()),
            ],
        );
        Ok(accessor)
    }

    pub fn block_exists(&self, name: &str) -> StorageResult<bool> {
        let cache = self.lock_catalog();
        if cache.contains_key(name) {
            return Ok(true);
        }
        let engine = self.engine();
        let _gate = engine.shared();
        let conn = engine.connect(StorageErrorCode::ReadFailure)?;
        let record = catalog::load_block(&conn, name)
            .map_err(engine.err(StorageErrorCode::ReadFailure, format!("failed to look up block '{}'", name)))?;
        Ok(record.is_some())
    }

    /// Accessor for an existing block; the same accessor is returned until a
    /// clear removes the block
    pub fn get_block(&self, name: &str) -> StorageResult<BlockAccessor> {
        let mut cache = self.lock_catalog();
        if let Some(accessor) = cache.get(name) {
            return Ok(accessor.clone());
        }

        let engine = self.engine();
        let _gate = engine.shared();
        let conn = engine.connect(StorageErrorCode::ReadFailure)?;
        let record = catalog::load_block(&conn, name)
            .map_err(engine.err(StorageErrorCode::ReadFailure, format!("failed to load block '{}'", name)))?
            .ok_or_else(|| StorageError::invalid_handle(name))?;
        let field_types = catalog::field_types(&conn, name)
            .map_err(engine.err(StorageErrorCode::ReadFailure, format!("failed to load fields of '{}'", name)))?;

        let accessor = BlockAccessor::from_record(record, field_types, Arc::clone(&self.inner.engine));
        cache.insert(name.to_string(), accessor.clone());
        Ok(accessor)
    }

    /// Change a block's element count.
    ///
    /// Values at indices below both counts are kept; new elements read as
    /// defaults.
    pub fn resize_block(&self, name: &str, count: usize) -> StorageResult<()> {
        let engine = self.engine();
        engine.ensure_writable()?;

        let cache = self.lock_catalog();
        let _gate = engine.shared();
        let mut conn = engine.connect(StorageErrorCode::WriteFailure)?;
        let tx = engine.begin_immediate(&mut conn, StorageErrorCode::WriteFailure)?;

        let record = catalog::load_block(&tx, name)
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to load block '{}'", name)))?
            .ok_or_else(|| StorageError::invalid_handle(name))?;
        if record.count == count {
            return Ok(());
        }

        let fields = catalog::load_fields(&tx, name)
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to load fields of '{}'", name)))?;
        for mut field in fields {
            let column = decode_column(field.field_type, &field.data, count)?;
            field.data = encode_column(&column);
            field.count = count;
            catalog::upsert_field(&tx, &field).map_err(engine.err(
                StorageErrorCode::WriteFailure,
                format!("failed to resize field '{}' of '{}'", field.field_name, name),
            ))?;
        }
        catalog::set_block_count(&tx, name, count)
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to resize block '{}'", name)))?;
        tx.commit()
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to resize block '{}'", name)))?;

        if let Some(accessor) = cache.get(name) {
            accessor.set_count(count);
        }
        log_event_with_fields(
            Event::BlockResized,
            &[
                ("block", name),
                ("from", &record.count.to_string()),
                ("to", &count.to_string()),
            ],
        );
        Ok(())
    }

    pub fn update_persistence_level(&self, name: &str, level: PersistenceLevel) -> StorageResult<()> {
        let engine = self.engine();
        engine.ensure_writable()?;

        let cache = self.lock_catalog();
        let _gate = engine.shared();
        let conn = engine.connect(StorageErrorCode::WriteFailure)?;
        let updated = catalog::set_block_level(&conn, name, level)
            .map_err(engine.err(StorageErrorCode::WriteFailure, format!("failed to update level of '{}'", name)))?;
        if updated == 0 {
            return Err(StorageError::invalid_handle(name));
        }
        if let Some(accessor) = cache.get(name) {
            accessor.set_level(level);
        }
        log_event_with_fields(Event::BlockLevelChanged, &[("block", name), ("level", level.as_str())]);
        Ok(())
    }

    pub fn list_blocks(&self) -> StorageResult<Vec<BlockInfo>> {
        let engine = self.engine();
        let _gate = engine.shared();
        let conn = engine.connect(StorageErrorCode::ReadFailure)?;
        let records = catalog::list_blocks(&conn)
            .map_err(engine.err(StorageErrorCode::ReadFailure, "failed to list blocks"))?;
        Ok(records.into_iter().map(BlockInfo::from).collect())
    }

    pub fn block_info(&self, name: &str) -> StorageResult<BlockInfo> {
        let engine = self.engine();
        let _gate = engine.shared();
        let conn = engine.connect(StorageErrorCode::ReadFailure)?;
        catalog::load_block(&conn, name)
            .map_err(engine.err(StorageErrorCode::ReadFailure, format!("failed to load block '{}'", name)))?
            .map(BlockInfo::from)
            .ok_or_else(|| StorageError::invalid_handle(name))
    }

    /// Transaction that enrolls blocks as they are written
    pub fn scoped_transaction(&self) -> ScopedTransaction {
        ScopedTransaction::new(Arc::clone(&self.inner.engine))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Run `integrity_check` (full) or `quick_check`.
    ///
    /// A failure is logged and signalled; nothing is deleted.
    pub fn verify_integrity(&self, full: bool) -> bool {
        let engine = self.engine();
        let mode = if full { "full" } else { "quick" };
        let scope = ObservationScope::with_fields("INTEGRITY_CHECK", &[("mode", mode)]);

        let result = {
            let _gate = engine.shared();
            engine.connect(StorageErrorCode::ReadFailure).and_then(|conn| {
                catalog::integrity_problems(&conn, full)
                    .map_err(engine.err(StorageErrorCode::ReadFailure, "integrity check failed to run"))
            })
        };
        let problems = match result {
            Ok(problems) => problems,
            Err(e) => vec![e.to_string()],
        };

        engine.metrics().record_integrity_check(problems.is_empty());
        if problems.is_empty() {
            Logger::info(Event::IntegrityCheckPassed.as_str(), &[("mode", mode)]);
            scope.complete();
            return true;
        }

        let summary = problems.join("; ");
        Logger::error(
            Event::IntegrityCheckFailed.as_str(),
            &[("mode", mode), ("problems", &summary)],
        );
        engine.signals().publish(StorageSignal::IntegrityCheckFailed);
        scope.fail(&summary);
        false
    }

    /// Rebuild the database file and fold the WAL back in
    pub fn defragment(&self) -> StorageResult<()> {
        let engine = self.engine();
        engine.ensure_writable()?;
        let scope = ObservationScope::new("DEFRAGMENT");
        {
            let _cache = self.lock_catalog();
            let _gate = engine.exclusive();
            let conn = engine.connect(StorageErrorCode::WriteFailure)?;
            catalog::vacuum(&conn)
                .map_err(engine.err(StorageErrorCode::WriteFailure, "defragmentation failed"))?;
        }
        engine.metrics().increment_defragmentations();
        Logger::info(Event::Defragmented.as_str(), &[]);
        scope.complete();
        Ok(())
    }

    /// Copy the primary file set to the mirror; returns the files copied
    pub fn sync_mirror(&self) -> StorageResult<usize> {
        let mirror = match &self.inner.secondary {
            Some(mirror) if mirror.paths().is_some() => mirror,
            _ => return Ok(0),
        };
        let _cache = self.lock_catalog();
        let _gate = self.engine().exclusive();
        mirror.synchronize().map_err(|e| {
            StorageError::write_failed("failed to synchronize the mirror").with_source(e)
        })
    }

    // =========================================================================
    // Clear
    // =========================================================================

    /// Register a subsystem that must acknowledge every clear
    pub fn add_clear_observer(&self, observer: Arc<dyn ClearObserver>) -> usize {
        self.inner.clear.register(observer)
    }

    /// Clear every block at or below `level`.
    ///
    /// Observers are asked first; a refusal aborts with `ClearAborted` and
    /// nothing deleted. If deletion fails the whole database file set is
    /// removed instead, and if that fails too the store becomes faulted.
    pub fn clear(&self, level: PersistenceLevel) -> StorageResult<()> {
        let engine = self.engine();
        engine.ensure_writable()?;
        let orchestrator = &self.inner.clear;
        let _running = orchestrator.begin();
        let scope = ObservationScope::with_fields("CLEAR", &[("level", level.as_str())]);

        orchestrator.transition(ClearState::ClearRequested);
        orchestrator.set_clear_started(true);
        log_event_with_fields(Event::ClearStarted, &[("level", level.as_str())]);
        engine.signals().publish(StorageSignal::ClearStarted(level));

        orchestrator.transition(ClearState::AwaitingReadiness);
        let ready = match orchestrator.await_readiness(level) {
            Ok(ready) => ready,
            Err(e) => {
                orchestrator.set_clear_started(false);
                orchestrator.transition(ClearState::Idle);
                scope.fail(e.message());
                return Err(e);
            }
        };
        log_event_with_fields(
            Event::ClearReady,
            &[("level", level.as_str()), ("observers", &ready.to_string())],
        );
        engine.signals().publish(StorageSignal::ClearReady(level));

        orchestrator.transition(ClearState::Clearing);
        let deleted = match self.delete_cleared(level) {
            Ok(names) => names.len(),
            Err(e) => {
                orchestrator.transition(ClearState::ClearFailed);
                engine.metrics().increment_clear_failures();
                Logger::error(
                    Event::ClearFailed.as_str(),
                    &[("level", level.as_str()), ("reason", &e.to_string())],
                );
                if let Err(fatal) = self.remove_database_files() {
                    orchestrator.set_clear_started(false);
                    scope.fail_fatal(fatal.message());
                    return Err(fatal);
                }
                0
            }
        };

        orchestrator.transition(ClearState::Cleared);
        orchestrator.set_clear_started(false);
        log_event_with_fields(
            Event::Cleared,
            &[("level", level.as_str()), ("blocks", &deleted.to_string())],
        );
        engine.signals().publish(StorageSignal::Cleared(level));
        orchestrator.notify_cleared(level);
        engine.metrics().increment_clears();

        self.record_last_cleared(level)?;
        if let Err(e) = self.sync_mirror() {
            Logger::warn(Event::MirrorSyncFailed.as_str(), &[("reason", &e.to_string())]);
        }
        scope.complete_with_fields(&[("blocks", &deleted.to_string())]);
        Ok(())
    }

    fn delete_cleared(&self, level: PersistenceLevel) -> StorageResult<Vec<String>> {
        let mut cache = self.lock_catalog();
        let engine = self.engine();
        let _gate = engine.exclusive();

        #[cfg(test)]
        if engine.take_injected_clear_failure() {
            return Err(StorageError::clear_failed("injected clear failure"));
        }

        let mut conn = engine.connect(StorageErrorCode::ClearFailure)?;
        let tx = engine.begin_immediate(&mut conn, StorageErrorCode::ClearFailure)?;
        let names = catalog::delete_cleared_blocks(&tx, level)
            .map_err(engine.err(StorageErrorCode::ClearFailure, "failed to delete cleared blocks"))?;
        maybe_crash(points::CLEAR_BEFORE_COMMIT);
        tx.commit()
            .map_err(engine.err(StorageErrorCode::ClearFailure, "failed to commit clear"))?;
        maybe_crash(points::CLEAR_AFTER_DELETE);

        cache.retain(|_, accessor| {
            if accessor.level().is_cleared_by(level) {
                accessor.invalidate();
                false
            } else {
                true
            }
        });

        if let Err(e) = catalog::vacuum(&conn) {
            engine.engine_error(StorageErrorCode::WriteFailure, "defragmentation after clear failed", e);
        } else {
            engine.metrics().increment_defragmentations();
        }
        match catalog::integrity_problems(&conn, false) {
            Ok(problems) if problems.is_empty() => {}
            Ok(problems) => {
                Logger::error(
                    Event::IntegrityCheckFailed.as_str(),
                    &[("problems", &problems.join("; "))],
                );
                engine.signals().publish(StorageSignal::IntegrityCheckFailed);
            }
            Err(e) => {
                engine.engine_error(StorageErrorCode::ReadFailure, "quick check after clear failed", e);
            }
        }
        Ok(names)
    }

    /// Fallback after a failed clear: delete the whole file set and start
    /// over with an empty store
    fn remove_database_files(&self) -> StorageResult<()> {
        let mut cache = self.lock_catalog();
        let engine = self.engine();
        let _gate = engine.exclusive();

        for (_, accessor) in cache.drain() {
            accessor.invalidate();
        }

        let config = &self.inner.config;
        let path = config.database_path();
        let mut files = vec![path.clone()];
        files.extend(side_files(&path));

        if let Err(e) = delete_database_files(
            &files,
            config.clear_retry_attempts,
            config.clear_retry_backoff(),
        ) {
            engine.set_faulted();
            return Err(StorageError::clear_failed(format!(
                "failed to delete {} after {} attempts",
                path.display(),
                config.clear_retry_attempts
            ))
            .with_source(e));
        }

        if let Some(mirror) = &self.inner.secondary {
            match mirror.remove_counterpart(&config.database_file) {
                Ok(()) | Err(SecondaryStorageError::NotConfigured) => {}
                Err(e) => Logger::warn(
                    Event::MirrorCounterpartRemoveFailed.as_str(),
                    &[("reason", &e.to_string())],
                ),
            }
        }

        if let Err(e) = engine.factory().initialize() {
            engine.set_faulted();
            return Err(engine.engine_error(
                StorageErrorCode::ClearFailure,
                "failed to recreate the store after clear",
                e,
            ));
        }
        Logger::warn(Event::StoreRecreated.as_str(), &[("path", &path.display().to_string())]);
        Ok(())
    }

    /// Stamp the current time for every level a clear at `level` removed
    fn record_last_cleared(&self, level: PersistenceLevel) -> StorageResult<()> {
        let block = self.last_cleared_block()?;
        let now = Utc::now();
        let mut tx = block.start_transaction();
        for cleared in level.cleared_levels() {
            tx.set(cleared.rank() as usize, LAST_CLEARED_FIELD, now)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn last_cleared_block(&self) -> StorageResult<BlockAccessor> {
        match self.get_block(LAST_CLEARED_BLOCK) {
            Ok(block) => Ok(block),
            Err(e) if e.code() == StorageErrorCode::InvalidHandle => {
                let format = BlockFormat::new(1).with_field(LAST_CLEARED_FIELD, FieldType::DateTime);
                match self.create_dynamic_block(
                    PersistenceLevel::Critical,
                    LAST_CLEARED_BLOCK,
                    PersistenceLevel::ALL.len(),
                    format,
                ) {
                    Err(e) if e.code() == StorageErrorCode::DuplicateBlock => {
                        self.get_block(LAST_CLEARED_BLOCK)
                    }
                    other => other,
                }
            }
            Err(e) => Err(e),
        }
    }

    /// When `level` was last cleared; `None` if never
    pub fn last_cleared(&self, level: PersistenceLevel) -> StorageResult<Option<DateTime<Utc>>> {
        let block = match self.get_block(LAST_CLEARED_BLOCK) {
            Ok(block) => block,
            Err(e) if e.code() == StorageErrorCode::InvalidHandle => return Ok(None),
            Err(e) => return Err(e),
        };
        let stamp: DateTime<Utc> = block.get(level.rank() as usize, LAST_CLEARED_FIELD)?;
        if stamp == DateTime::<Utc>::default() {
            return Ok(None);
        }
        Ok(Some(stamp))
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn clear_state(&self) -> ClearState {
        self.inner.clear.state()
    }

    /// True while a clear is between `ClearStarted` and its outcome
    pub fn is_clear_started(&self) -> bool {
        self.inner.clear.is_clear_started()
    }

    pub fn clear_observer_count(&self) -> usize {
        self.inner.clear.observer_count()
    }

    pub fn is_faulted(&self) -> bool {
        self.engine().is_faulted()
    }

    /// Subscribe to engine signals; returns the subscriber count
    pub fn subscribe<F>(&self, handler: F) -> usize
    where
        F: Fn(&StorageSignal) + Send + Sync + 'static,
    {
        self.engine().signals().subscribe(handler)
    }

    pub fn signals(&self) -> &SignalBus {
        self.engine().signals()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.engine().metrics().snapshot();
        if let Some(mirror) = &self.inner.secondary {
            let mirror_metrics = mirror.metrics();
            snapshot.mirror_repairs += mirror_metrics.mirror_repairs;
            snapshot.storage_errors += mirror_metrics.storage_errors;
        }
        snapshot
    }

    pub fn database_path(&self) -> &Path {
        self.engine().factory().path()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn secondary(&self) -> Option<&Arc<SecondaryStorageManager>> {
        self.inner.secondary.as_ref()
    }

    #[cfg(test)]
    fn inject_clear_failure(&self) {
        self.engine().inject_clear_failure();
    }
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("database", &self.database_path())
            .field("clear_state", &self.clear_state())
            .field("faulted", &self.is_faulted())
            .field("mirrored", &self.inner.secondary.is_some())
            .finish()
    }
}

/// Map an engine failure during open, refusing corrupt files outright
fn refuse_corrupt(engine: &Engine, context: &str, err: rusqlite::Error) -> StorageError {
    let corrupt = classify_engine_error(StorageErrorCode::ReadFailure, &err) == StorageErrorKind::Corrupt;
    let routed = engine.engine_error(StorageErrorCode::ReadFailure, context, err);
    if !corrupt {
        return routed;
    }
    engine.metrics().record_integrity_check(false);
    engine.signals().publish(StorageSignal::IntegrityCheckFailed);
    StorageError::integrity_failure("database file is corrupt or not a database").with_source(routed)
}

fn mirror_failure(err: SecondaryStorageError) -> StorageError {
    StorageError::integrity_failure(format!("mirror verification failed: {}", err)).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::clear::ReadyToken;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StorageManager {
        let mut config = StorageConfig::new(dir.path());
        config.clear_retry_attempts = 2;
        config.clear_retry_backoff_ms = 1;
        StorageManager::open(config).unwrap()
    }

    #[test]
    fn test_open_records_transient_clear() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        assert!(manager.last_cleared(PersistenceLevel::Transient).unwrap().is_some());
        assert!(manager.last_cleared(PersistenceLevel::Critical).unwrap().is_none());
        assert!(manager.block_exists(LAST_CLEARED_BLOCK).unwrap());
    }

    #[test]
    fn test_get_block_reuses_accessor() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        manager
            .create_block(PersistenceLevel::Static, "Meters", 4)
            .unwrap();
        let a = manager.get_block("Meters").unwrap();
        let b = manager.get_block("Meters").unwrap();

        let mut tx = a.start_transaction();
        tx.set(0, "Coins", 5i64).unwrap();
        tx.commit().unwrap();
        // Type learned through `a` is visible through `b`
        assert_eq!(b.field_type("Coins"), Some(FieldType::Int64));
    }

    #[test]
    fn test_failed_delete_falls_back_to_file_removal() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let meters = manager
            .create_block(PersistenceLevel::Critical, "Meters", 2)
            .unwrap();
        let mut tx = meters.start_transaction();
        tx.set(0, "Coins", 9i64).unwrap();
        tx.commit().unwrap();

        manager.inject_clear_failure();
        manager.clear(PersistenceLevel::Static).unwrap();

        // The whole file went, Critical data included
        assert_eq!(manager.clear_state(), ClearState::Cleared);
        assert!(!meters.is_valid());
        assert!(!manager.block_exists("Meters").unwrap());
        assert!(!manager.is_faulted());
        assert_eq!(manager.metrics().clears_failed, 1);
    }

    #[test]
    fn test_unrecoverable_clear_faults_the_store() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let log = manager.signals().recorder();

        // remove_file cannot delete a directory, so the retry loop gives up
        let journal = dir.path().join("egm_storage.sqlite-journal");
        fs::create_dir(&journal).unwrap();
        manager.inject_clear_failure();

        let err = manager.clear(PersistenceLevel::Static).unwrap_err();
        assert_eq!(err.code(), StorageErrorCode::ClearFailure);
        assert!(err.is_fatal());
        assert!(manager.is_faulted());
        assert_eq!(manager.clear_state(), ClearState::ClearFailed);
        assert!(log.contains(&StorageSignal::StorageError(StorageErrorKind::Faulted)));

        let err = manager
            .create_block(PersistenceLevel::Static, "Later", 1)
            .unwrap_err();
        assert_eq!(err.code(), StorageErrorCode::Faulted);
        let err = manager.clear(PersistenceLevel::Static).unwrap_err();
        assert_eq!(err.code(), StorageErrorCode::Faulted);
    }

    struct Writer {
        manager: StorageManager,
    }

    impl ClearObserver for Writer {
        fn name(&self) -> &str {
            "writer"
        }

        fn on_clear_requested(&self, _level: PersistenceLevel) -> Result<ReadyToken, String> {
            // Observers flush state before acknowledging; no locks are held
            let block = self.manager.get_block("Audit").map_err(|e| e.to_string())?;
            let mut tx = block.start_transaction();
            tx.set(0, "Flushed", true).map_err(|e| e.to_string())?;
            tx.commit().map_err(|e| e.to_string())?;
            Ok(ReadyToken::ready())
        }
    }

    #[test]
    fn test_observer_may_write_before_acknowledging() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let audit = manager
            .create_block(PersistenceLevel::Critical, "Audit", 1)
            .unwrap();
        manager.add_clear_observer(Arc::new(Writer {
            manager: manager.clone(),
        }));

        manager.clear(PersistenceLevel::Static).unwrap();
        assert!(audit.get::<bool>(0, "Flushed").unwrap());
    }

    #[test]
    fn test_delete_retry_backoff_is_bounded() {
        let dir = TempDir::new().unwrap();
        let stubborn = dir.path().join("x");
        fs::create_dir(&stubborn).unwrap();
        let started = std::time::Instant::now();
        assert!(delete_database_files(&[stubborn], 3, Duration::from_millis(5)).is_err());
        // 5ms + 10ms of backoff between three attempts
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
