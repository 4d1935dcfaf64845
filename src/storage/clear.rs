//! Persistence clear protocol
//!
//! A clear runs in two phases. Registered observers are asked first and
//! must each hand back a `ReadyToken` before anything is deleted; any
//! observer refusing aborts the clear with nothing touched. Deletion then
//! runs with field traffic shut out by the engine's clear gate.
//!
//! State machine:
//!
//! ```text
//! Idle -> ClearRequested -> AwaitingReadiness -> Clearing -> Cleared
//!                                 |                  |
//!                                 v                  v
//!                               Idle            ClearFailed
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use super::errors::{StorageError, StorageResult};
use super::level::PersistenceLevel;
use crate::observability::{Event, Logger};

/// Where the orchestrator is in the clear protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearState {
    Idle,
    ClearRequested,
    AwaitingReadiness,
    Clearing,
    Cleared,
    ClearFailed,
}

impl ClearState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearState::Idle => "idle",
            ClearState::ClearRequested => "clear_requested",
            ClearState::AwaitingReadiness => "awaiting_readiness",
            ClearState::Clearing => "clearing",
            ClearState::Cleared => "cleared",
            ClearState::ClearFailed => "clear_failed",
        }
    }
}

impl fmt::Display for ClearState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that an observer has quiesced and accepts the clear.
///
/// Only obtainable through [`ReadyToken::ready`], so an observer has to say
/// so explicitly.
#[derive(Debug)]
pub struct ReadyToken {
    _private: (),
}

impl ReadyToken {
    pub fn ready() -> Self {
        Self { _private: () }
    }
}

/// Subsystem that must get out of the way before a clear deletes anything.
///
/// `on_clear_requested` runs on the clearing thread with no storage locks
/// held, so it may read and write blocks. It must not call `clear` itself.
pub trait ClearObserver: Send + Sync {
    /// Name used in logs and in `ClearAborted` errors
    fn name(&self) -> &str {
        "observer"
    }

    /// Quiesce and acknowledge, or refuse with a reason to abort the clear
    fn on_clear_requested(&self, level: PersistenceLevel) -> Result<ReadyToken, String>;

    /// Called once the clear has completed
    fn on_cleared(&self, _level: PersistenceLevel) {}
}

/// Observer registry, state machine and readiness barrier
pub(crate) struct ClearOrchestrator {
    observers: RwLock<Vec<Arc<dyn ClearObserver>>>,
    state: Mutex<ClearState>,
    clear_started: AtomicBool,
    running: Mutex<()>,
}

impl ClearOrchestrator {
    pub(crate) fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            state: Mutex::new(ClearState::Idle),
            clear_started: AtomicBool::new(false),
            running: Mutex::new(()),
        }
    }

    /// Register an observer; returns the number now registered
    pub(crate) fn register(&self, observer: Arc<dyn ClearObserver>) -> usize {
        let mut observers = self.observers.write().unwrap_or_else(|p| p.into_inner());
        observers.push(observer);
        observers.len()
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ClearObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Serializes clears; held for the whole protocol
    pub(crate) fn begin(&self) -> MutexGuard<'_, ()> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn state(&self) -> ClearState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn transition(&self, next: ClearState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Logger::trace(
            Event::ClearStateChanged.as_str(),
            &[("from", state.as_str()), ("to", next.as_str())],
        );
        *state = next;
    }

    pub(crate) fn set_clear_started(&self, started: bool) {
        self.clear_started.store(started, Ordering::SeqCst);
    }

    pub(crate) fn is_clear_started(&self) -> bool {
        self.clear_started.load(Ordering::SeqCst)
    }

    /// Ask every observer and wait for all tokens.
    ///
    /// The first refusal aborts with `ClearAborted`; observers after it are
    /// not asked.
    pub(crate) fn await_readiness(&self, level: PersistenceLevel) -> StorageResult<usize> {
        let observers = self.snapshot();
        let mut tokens = Vec::with_capacity(observers.len());
        for observer in &observers {
            match observer.on_clear_requested(level) {
                Ok(token) => tokens.push(token),
                Err(reason) => {
                    Logger::warn(
                        Event::ClearAborted.as_str(),
                        &[
                            ("level", level.as_str()),
                            ("observer", observer.name()),
                            ("reason", &reason),
                        ],
                    );
                    return Err(StorageError::clear_aborted(observer.name(), reason));
                }
            }
        }
        if tokens.len() != observers.len() {
            return Err(StorageError::clear_aborted(
                "barrier",
                format!("{} of {} observers ready", tokens.len(), observers.len()),
            ));
        }
        Ok(tokens.len())
    }

    pub(crate) fn notify_cleared(&self, level: PersistenceLevel) {
        for observer in self.snapshot() {
            observer.on_cleared(level);
        }
    }
}

/// Remove a database file set, retrying with linearly growing backoff.
///
/// Files already gone count as removed.
pub(crate) fn delete_database_files(
    files: &[PathBuf],
    attempts: u32,
    backoff: Duration,
) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        match remove_all(files) {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                Logger::warn(
                    Event::ClearFileDeleteRetry.as_str(),
                    &[
                        ("attempt", &attempt.to_string()),
                        ("reason", &e.to_string()),
                    ],
                );
                thread::sleep(backoff * attempt);
                attempt += 1;
            }
        }
    }
}

fn remove_all(files: &[PathBuf]) -> io::Result<()> {
    let mut failure = None;
    for file in files {
        match fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => failure = Some(e),
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
