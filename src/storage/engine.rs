//! Shared engine core
//!
//! One `Engine` per database file, shared (`Arc`) by the manager, every
//! accessor and every transaction. It owns the connection factory, the clear
//! gate, the fault flag, metrics and the signal bus, and implements the two
//! primitives everything else is built from: reading field rows and
//! committing a write set atomically.
//!
//! The clear gate is held shared by every field read and commit and
//! exclusively by the clear deletion step, so field traffic never overlaps a
//! clear. Signals raised while a gate guard is held are delivered after it
//! is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::catalog::{self, ConnectionFactory, FieldRecord};
use super::codec::{decode_column, encode_column};
use super::errors::{classify_engine_error, StorageError, StorageErrorCode, StorageResult};
use super::transaction::WriteSet;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::signals::{Deferred, SignalBus, StorageErrorKind, StorageSignal};

pub(crate) struct Engine {
    factory: ConnectionFactory,
    gate: RwLock<()>,
    faulted: AtomicBool,
    metrics: MetricsRegistry,
    signals: SignalBus,
    #[cfg(test)]
    inject_clear_failure: AtomicBool,
}

impl Engine {
    pub(crate) fn new(factory: ConnectionFactory, signals: SignalBus) -> Self {
        Self {
            factory,
            gate: RwLock::new(()),
            faulted: AtomicBool::new(false),
            metrics: MetricsRegistry::new(),
            signals,
            #[cfg(test)]
            inject_clear_failure: AtomicBool::new(false),
        }
    }

    pub(crate) fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub(crate) fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Enter the faulted state; only an operator can leave it
    pub(crate) fn set_faulted(&self) {
        if !self.faulted.swap(true, Ordering::SeqCst) {
            Logger::fatal(
                Event::StorageFaulted.as_str(),
                &[("path", &self.factory.path().display().to_string())],
            );
            self.signals
                .publish(StorageSignal::StorageError(StorageErrorKind::Faulted));
        }
    }

    pub(crate) fn ensure_writable(&self) -> StorageResult<()> {
        if self.is_faulted() {
            return Err(StorageError::faulted());
        }
        Ok(())
    }

    /// Field traffic side of the clear gate
    pub(crate) fn shared(&self) -> Deferred<RwLockReadGuard<'_, ()>> {
        Deferred::new(self.gate.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// Clear side of the clear gate
    pub(crate) fn exclusive(&self) -> Deferred<RwLockWriteGuard<'_, ()>> {
        Deferred::new(self.gate.write().unwrap_or_else(|p| p.into_inner()))
    }

    /// Route an engine failure: log it, count it, publish `storage-error`,
    /// and wrap it for the caller. Nothing is retried here.
    pub(crate) fn engine_error(
        &self,
        code: StorageErrorCode,
        context: impl Into<String>,
        err: rusqlite::Error,
    ) -> StorageError {
        let context = context.into();
        let kind = classify_engine_error(code, &err);
        let reason = err.to_string();
        Logger::error(
            Event::StorageError.as_str(),
            &[
                ("code", code.code()),
                ("context", &context),
                ("kind", &format!("{:?}", kind)),
                ("reason", &reason),
            ],
        );
        self.metrics.increment_storage_errors();
        self.signals.publish(StorageSignal::StorageError(kind));
        StorageError::new(code, context).with_source(err)
    }

    /// `map_err` adapter for [`Engine::engine_error`]
    pub(crate) fn err<'a>(
        &'a self,
        code: StorageErrorCode,
        context: impl Into<String> + 'a,
    ) -> impl FnOnce(rusqlite::Error) -> StorageError + 'a {
        move |e| self.engine_error(code, context, e)
    }

    pub(crate) fn begin_immediate<'c>(
        &self,
        conn: &'c mut Connection,
        code: StorageErrorCode,
    ) -> StorageResult<Transaction<'c>> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(self.err(code, "failed to begin transaction"))
    }

    pub(crate) fn connect(&self, code: StorageErrorCode) -> StorageResult<Connection> {
        self.factory.open().map_err(|e| {
            self.engine_error(
                code,
                format!("failed to open {}", self.factory.path().display()),
                e,
            )
        })
    }

    pub(crate) fn read_field(&self, block: &str, field: &str) -> StorageResult<Option<FieldRecord>> {
        let _gate = self.shared();
        let conn = self.connect(StorageErrorCode::ReadFailure)?;
        let record = catalog::load_field(&conn, block, field).map_err(|e| {
            self.engine_error(
                StorageErrorCode::ReadFailure,
                format!("failed to read field '{}' of block '{}'", field, block),
                e,
            )
        })?;
        self.metrics.increment_field_reads();
        Ok(record)
    }

    pub(crate) fn read_fields(&self, block: &str) -> StorageResult<Vec<FieldRecord>> {
        let _gate = self.shared();
        let conn = self.connect(StorageErrorCode::ReadFailure)?;
        let records = catalog::load_fields(&conn, block).map_err(|e| {
            self.engine_error(
                StorageErrorCode::ReadFailure,
                format!("failed to read fields of block '{}'", block),
                e,
            )
        })?;
        self.metrics.increment_field_reads();
        Ok(records)
    }

    /// Apply every staged write in one IMMEDIATE transaction.
    ///
    /// Either every write lands or none does: any contract violation or
    /// engine error drops the transaction, which rolls it back. Returns the
    /// number of element values written.
    pub(crate) fn commit(&self, writes: &WriteSet) -> StorageResult<usize> {
        self.ensure_writable()?;
        if writes.is_empty() {
            return Ok(0);
        }

        let _gate = self.shared();
        let mut conn = self.connect(StorageErrorCode::WriteFailure)?;
        let tx = self.begin_immediate(&mut conn, StorageErrorCode::WriteFailure)?;

        let mut written = 0;
        let mut learned = Vec::new();

        for block in writes.blocks() {
            let name = block.accessor.name();
            if !block.accessor.is_valid() {
                return Err(StorageError::invalid_handle(name));
            }
            let record = catalog::load_block(&tx, name)
                .map_err(|e| {
                    self.engine_error(
                        StorageErrorCode::WriteFailure,
                        format!("failed to load block '{}'", name),
                        e,
                    )
                })?
                .ok_or_else(|| StorageError::invalid_handle(name))?;

            for (field, staged) in &block.fields {
                let existing = catalog::load_field(&tx, name, field).map_err(|e| {
                    self.engine_error(
                        StorageErrorCode::WriteFailure,
                        format!("failed to load field '{}' of block '{}'", field, name),
                        e,
                    )
                })?;

                let (field_type, mut column) = match existing {
                    Some(existing) => {
                        if existing.field_type != staged.field_type {
                            return Err(StorageError::type_mismatch(
                                name,
                                field,
                                existing.field_type,
                                staged.field_type,
                            ));
                        }
                        let column =
                            decode_column(existing.field_type, &existing.data, record.count)?;
                        (existing.field_type, column)
                    }
                    None => (staged.field_type, vec![None; record.count]),
                };

                for (&element, value) in &staged.values {
                    let slot = column
                        .get_mut(element)
                        .ok_or_else(|| StorageError::element_out_of_range(name, element, record.count))?;
                    *slot = Some(value.clone());
                    written += 1;
                }

                catalog::upsert_field(
                    &tx,
                    &FieldRecord {
                        block_name: name.to_string(),
                        field_name: field.clone(),
                        field_type,
                        data: encode_column(&column),
                        count: record.count,
                    },
                )
                .map_err(|e| {
                    self.engine_error(
                        StorageErrorCode::WriteFailure,
                        format!("failed to write field '{}' of block '{}'", field, name),
                        e,
                    )
                })?;
                learned.push((block.accessor.clone(), field.clone(), field_type));
            }
        }

        maybe_crash(points::COMMIT_BEFORE);
        tx.commit().map_err(|e| {
            self.engine_error(StorageErrorCode::WriteFailure, "failed to commit transaction", e)
        })?;
        maybe_crash(points::COMMIT_AFTER);

        for (accessor, field, field_type) in learned {
            accessor.learn_field_type(&field, field_type);
        }
        self.metrics.record_commit(written as u64);
        Logger::trace(
            Event::TransactionCommitted.as_str(),
            &[
                ("blocks", &writes.blocks().len().to_string()),
                ("values", &written.to_string()),
            ],
        );
        Ok(written)
    }

    /// Make the next clear deletion fail, exercising the fallback path
    #[cfg(test)]
    pub(crate) fn inject_clear_failure(&self) {
        self.inject_clear_failure.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn take_injected_clear_failure(&self) -> bool {
        self.inject_clear_failure.swap(false, Ordering::SeqCst)
    }
}
