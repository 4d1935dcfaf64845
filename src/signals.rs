//! Signals published by the storage engine
//!
//! Collaborators (operator lockout policy, tilt logging, diagnostics)
//! subscribe to a [`SignalBus`] handed to them at construction. Delivery is
//! synchronous on the publishing thread: `publish` returns only after every
//! handler has run.
//!
//! The one exception: while the publishing thread holds a storage lock
//! (see [`Deferred`]), signals are queued and delivered once the thread's
//! last lock is released. Handlers may therefore call back into storage.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, RwLock};

use crate::storage::PersistenceLevel;

/// Engine fault classes carried by [`StorageSignal::StorageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// A field or catalog read failed
    Read,
    /// A field or catalog write failed
    Write,
    /// A clear could not delete data
    Clear,
    /// The engine reported a corrupt or foreign file
    Corrupt,
    /// The medium is full
    DiskFull,
    /// The database stayed locked past the busy timeout
    Busy,
    /// The store entered the faulted state
    Faulted,
}

/// Mirror fault classes carried by [`StorageSignal::SecondaryStorageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecondaryErrorKind {
    /// Mirror required but no secondary medium is connected
    NotConnected,
    /// A secondary medium is connected but mirroring is not required
    NotSupported,
    /// A database file outside the allow-list exists on the primary medium
    UnexpectedFile,
    /// Both copies of a mirrored file are invalid
    Unrecoverable,
    /// Copying a valid file over its invalid counterpart failed
    RepairFailed,
}

/// A published engine signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSignal {
    ClearStarted(PersistenceLevel),
    ClearReady(PersistenceLevel),
    Cleared(PersistenceLevel),
    IntegrityCheckFailed,
    StorageError(StorageErrorKind),
    SecondaryStorageError(SecondaryErrorKind),
}

impl fmt::Display for StorageSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageSignal::ClearStarted(level) => write!(f, "clear-started({})", level),
            StorageSignal::ClearReady(level) => write!(f, "clear-ready({})", level),
            StorageSignal::Cleared(level) => write!(f, "cleared({})", level),
            StorageSignal::IntegrityCheckFailed => write!(f, "integrity-check-failed"),
            StorageSignal::StorageError(kind) => write!(f, "storage-error({:?})", kind),
            StorageSignal::SecondaryStorageError(kind) => {
                write!(f, "secondary-storage-error({:?})", kind)
            }
        }
    }
}

/// Signal handler
pub type SignalHandler = Arc<dyn Fn(&StorageSignal) + Send + Sync>;

/// Fan-out of [`StorageSignal`]s to subscribed handlers
#[derive(Clone, Default)]
pub struct SignalBus {
    handlers: Arc<RwLock<Vec<SignalHandler>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns the number of handlers now registered
    pub fn subscribe<F>(&self, handler: F) -> usize
    where
        F: Fn(&StorageSignal) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.push(Arc::new(handler));
        handlers.len()
    }

    /// Deliver a signal to every handler, or queue it until this thread
    /// releases its storage locks.
    pub fn publish(&self, signal: StorageSignal) {
        if DEFERRAL_DEPTH.with(Cell::get) > 0 {
            DEFERRED.with(|queue| queue.borrow_mut().push((self.clone(), signal)));
            return;
        }
        self.deliver(signal);
    }

    /// Handlers run outside the registry lock so they may subscribe or
    /// publish themselves.
    fn deliver(&self, signal: StorageSignal) {
        let handlers: Vec<SignalHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for handler in handlers {
            handler(&signal);
        }
    }

    /// Subscribe a recorder that keeps every signal published from now on
    pub fn recorder(&self) -> SignalLog {
        let log = SignalLog::default();
        let sink = log.clone();
        self.subscribe(move |signal| sink.push(signal.clone()));
        log
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("SignalBus").field("handlers", &count).finish()
    }
}

thread_local! {
    static DEFERRAL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DEFERRED: RefCell<Vec<(SignalBus, StorageSignal)>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as holding a storage lock.
///
/// Nests; when the outermost one drops, every queued signal is delivered in
/// publication order.
pub(crate) struct SignalDeferral {
    _thread_bound: PhantomData<*const ()>,
}

impl SignalDeferral {
    pub(crate) fn new() -> Self {
        DEFERRAL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for SignalDeferral {
    fn drop(&mut self) {
        let remaining = DEFERRAL_DEPTH.with(|depth| {
            let next = depth.get().saturating_sub(1);
            depth.set(next);
            next
        });
        if remaining > 0 {
            return;
        }
        let queued = DEFERRED.with(|queue| std::mem::take(&mut *queue.borrow_mut()));
        for (bus, signal) in queued {
            bus.deliver(signal);
        }
    }
}

/// A lock guard that holds back signals until it is released.
///
/// The guard is dropped before the deferral, so handlers run with the lock
/// already free.
pub(crate) struct Deferred<G> {
    guard: G,
    _deferral: SignalDeferral,
}

impl<G> Deferred<G> {
    pub(crate) fn new(guard: G) -> Self {
        Self {
            guard,
            _deferral: SignalDeferral::new(),
        }
    }
}

impl<G: Deref> Deref for Deferred<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Deferred<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Recorded signals, in publication order
#[derive(Debug, Clone, Default)]
pub struct SignalLog {
    signals: Arc<Mutex<Vec<StorageSignal>>>,
}

impl SignalLog {
    fn push(&self, signal: StorageSignal) {
        self.signals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(signal);
    }

    /// Copy of everything recorded so far
    pub fn signals(&self) -> Vec<StorageSignal> {
        self.signals.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn contains(&self, signal: &StorageSignal) -> bool {
        self.signals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(signal)
    }
}
