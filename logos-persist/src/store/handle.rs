//! Generation-tagged store handle.
//!
//! ```text
//!   Live ──mark_stale()──► Stale ──close()──► Closed
//!     └──────────────close()─────────────────┘
//! ```
//!
//! Every transaction checks the state first, so a handle left behind by a
//! schema upgrade (or by store erasure) reports `PersistError::Stale` instead
//! of touching a database that is being replaced.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{PersistError, Result};
use crate::store::engine::{Database, Transaction};

/// Lifecycle of a store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    /// Usable for reads and writes
    Live = 0,
    /// A newer generation is being opened; no new transactions
    Stale = 1,
    /// The underlying database has been dropped
    Closed = 2,
}

impl HandleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Live,
            1 => HandleState::Stale,
            _ => HandleState::Closed,
        }
    }
}

/// Shared connection to the store at one schema generation.
pub struct StoreHandle {
    generation: u64,
    /// Process-wide current generation, owned by the manager
    current: Arc<AtomicU64>,
    state: AtomicU8,
    db: RwLock<Option<Database>>,
}

impl StoreHandle {
    pub(crate) fn new(db: Database, current: Arc<AtomicU64>) -> Self {
        Self {
            generation: db.generation(),
            current,
            state: AtomicU8::new(HandleState::Live as u8),
            db: RwLock::new(Some(db)),
        }
    }

    /// Generation this handle was opened at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Live and opened at the process's current generation.
    pub fn is_live(&self) -> bool {
        self.state() == HandleState::Live
            && self.generation == self.current.load(Ordering::SeqCst)
    }

    /// Whether the partition exists at this handle's generation.
    pub fn has_partition(&self, name: &str) -> bool {
        match self.db.read() {
            Ok(guard) => guard.as_ref().is_some_and(|db| db.has_partition(name)),
            Err(_) => false,
        }
    }

    /// Run a single-partition transaction, refusing if the handle is stale.
    pub fn transact<R, F>(&self, partition: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        let guard = self.db.read()?;
        if !self.is_live() {
            return Err(self.stale_error());
        }
        match guard.as_ref() {
            Some(db) => db.transact(partition, f),
            None => Err(self.stale_error()),
        }
    }

    /// Stop handing out transactions. In-flight ones finish normally.
    pub(crate) fn mark_stale(&self) {
        let _ = self.state.compare_exchange(
            HandleState::Live as u8,
            HandleState::Stale as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Wait for in-flight transactions, then drop the database.
    pub(crate) fn close(&self) -> Result<()> {
        self.state.store(HandleState::Closed as u8, Ordering::SeqCst);
        let mut guard = self.db.write()?;
        if let Some(db) = guard.take() {
            db.flush()?;
            log::debug!("Closed store handle at generation {}", self.generation);
        }
        Ok(())
    }

    fn stale_error(&self) -> PersistError {
        PersistError::Stale {
            handle: self.generation,
            current: self.current.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

/// A session's cached handle, refreshed after staleness.
#[derive(Debug, Default)]
pub struct HandleCache {
    slot: Mutex<Option<Arc<StoreHandle>>>,
}

impl HandleCache {
    pub fn get(&self) -> Option<Arc<StoreHandle>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set(&self, handle: Arc<StoreHandle>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(handle);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}
