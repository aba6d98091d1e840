//! Process-wide owner of the store connection.
//!
//! All sessions share one `StoreManager`. It opens the store lazily, adds
//! partitions for new namespaces by bumping the schema generation, and hands
//! out the live [`StoreHandle`]. Opens, upgrades and erasures all run under
//! one async mutex, so at most one structural change is in flight and later
//! requests queue behind it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::error::{PersistError, Result};
use crate::meta::MetaTable;
use crate::store::engine::{Database, Upgrade};
use crate::store::handle::{HandleCache, StoreHandle};
use crate::update_log::UpdateLog;

/// Owner of the shared store handle.
pub struct StoreManager {
    config: StoreConfig,
    /// Current handle; `None` until first use and after close/erase
    slot: Mutex<Option<Arc<StoreHandle>>>,
    /// Latest generation known to this process (0 = unknown)
    generation: Arc<AtomicU64>,
    /// Set by `erase_store`, cleared when a new session re-opens the store
    erased: AtomicBool,
    /// Namespaces erased since a session last opened them
    erased_namespaces: std::sync::Mutex<HashSet<String>>,
}

impl StoreManager {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            erased: AtomicBool::new(false),
            erased_namespaces: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Create a manager ready to be shared between sessions.
    pub fn shared(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Latest schema generation known to this process.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether `erase_store` ran and nothing has re-opened the store since.
    pub fn is_erased(&self) -> bool {
        self.erased.load(Ordering::SeqCst)
    }

    /// Whether `erase_namespace` ran for `namespace` and nothing has
    /// re-opened it since.
    pub fn is_namespace_erased(&self, namespace: &str) -> bool {
        self.erased_namespaces
            .lock()
            .is_ok_and(|erased| erased.contains(namespace))
    }

    /// Get the live handle, opening the store if needed.
    ///
    /// Concurrent callers queue on the slot lock; the first one opens and
    /// the rest receive the same handle. A failed open leaves the slot empty
    /// so the next caller tries again.
    pub async fn acquire(&self) -> Result<Arc<StoreHandle>> {
        let mut slot = self.slot.lock().await;
        self.erased.store(false, Ordering::SeqCst);
        self.live_or_open(&mut slot)
    }

    /// Like [`acquire`](Self::acquire), but refuses after `erase_store`.
    pub async fn current(&self, op: &'static str) -> Result<Arc<StoreHandle>> {
        let mut slot = self.slot.lock().await;
        if self.is_erased() {
            return Err(PersistError::Erased { op });
        }
        self.live_or_open(&mut slot)
    }

    /// Make sure the namespace's partitions exist.
    ///
    /// Returns the same handle when they do; otherwise upgrades the store
    /// to the next generation and returns the new handle.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<Arc<StoreHandle>> {
        let mut slot = self.slot.lock().await;
        self.erased.store(false, Ordering::SeqCst);
        self.erased_namespaces.lock()?.remove(namespace);
        self.namespace_handle(&mut slot, namespace)
    }

    /// [`ensure_namespace`](Self::ensure_namespace) for data accessors:
    /// fails instead of re-opening an erased store or namespace.
    pub async fn current_namespace(
        &self,
        op: &'static str,
        namespace: &str,
    ) -> Result<Arc<StoreHandle>> {
        let mut slot = self.slot.lock().await;
        if self.is_erased() {
            return Err(PersistError::Erased { op });
        }
        if self.is_namespace_erased(namespace) {
            return Err(PersistError::NamespaceErased {
                op,
                namespace: namespace.to_string(),
            });
        }
        self.namespace_handle(&mut slot, namespace)
    }

    fn namespace_handle(
        &self,
        slot: &mut Option<Arc<StoreHandle>>,
        namespace: &str,
    ) -> Result<Arc<StoreHandle>> {
        let handle = self.live_or_open(slot)?;

        let updates = UpdateLog::partition_name(namespace);
        let custom = MetaTable::partition_name(namespace);
        if handle.has_partition(&updates) && handle.has_partition(&custom) {
            return Ok(handle);
        }

        log::info!("Adding namespace '{namespace}'");
        self.upgrade(slot, handle, |up| {
            up.create_partition(&custom)?;
            up.create_partition(&updates)
        })
    }

    /// Remove every log record and key/value entry of one namespace.
    ///
    /// Other namespaces are untouched. A missing namespace is a no-op.
    /// Data accessors on the namespace fail until a session re-opens it.
    pub async fn erase_namespace(&self, namespace: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.erased.store(false, Ordering::SeqCst);
        self.erased_namespaces.lock()?.insert(namespace.to_string());
        let handle = self.live_or_open(&mut slot)?;

        let updates = UpdateLog::partition_name(namespace);
        let custom = MetaTable::partition_name(namespace);
        if !handle.has_partition(&updates) && !handle.has_partition(&custom) {
            return Ok(());
        }

        log::info!("Erasing namespace '{namespace}'");
        self.upgrade(&mut slot, handle, |up| {
            up.delete_partition(&custom)?;
            up.delete_partition(&updates)
        })?;
        Ok(())
    }

    /// Delete the entire store and reset all shared state.
    ///
    /// Sessions still holding handles get `Stale` errors, and their retries
    /// fail with `PersistError::Erased`.
    pub async fn erase_store(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.take() {
            handle.mark_stale();
            handle.close()?;
        }
        Database::destroy(&self.config)?;
        self.generation.store(0, Ordering::SeqCst);
        self.erased.store(true, Ordering::SeqCst);
        self.erased_namespaces.lock()?.clear();
        log::info!("Erased store at {}", self.config.path.display());
        Ok(())
    }

    /// Close the live handle without erasing anything.
    pub async fn close(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.take() {
            handle.mark_stale();
            handle.close()?;
        }
        self.generation.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Run a store operation against a session's cached handle.
    ///
    /// A stale handle is dropped from the cache, and the operation is
    /// retried against a fresh one with capped exponential backoff. Once the
    /// retry budget is spent the write surfaces as
    /// `PersistError::RetriesExhausted`.
    pub async fn write<R, F>(&self, op: &'static str, cache: &HandleCache, mut f: F) -> Result<R>
    where
        F: FnMut(&StoreHandle) -> Result<R>,
    {
        let policy = self.config.retry;
        let mut attempt = 0u32;
        loop {
            let handle = match cache.get() {
                Some(handle) => handle,
                None => {
                    let handle = self.current(op).await?;
                    cache.set(handle.clone());
                    handle
                }
            };

            match f(&handle) {
                Err(e) if e.is_stale() => {
                    cache.clear();
                    if !policy.allows(attempt) {
                        return Err(PersistError::RetriesExhausted {
                            attempts: attempt + 1,
                            last: e.to_string(),
                        });
                    }
                    attempt += 1;
                    let delay = policy.backoff(attempt);
                    log::warn!("{op}: {e}; retry {attempt} in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Return the slot's handle if still live, otherwise open the store at
    /// the latest generation.
    fn live_or_open(&self, slot: &mut Option<Arc<StoreHandle>>) -> Result<Arc<StoreHandle>> {
        if let Some(handle) = slot.as_ref() {
            if handle.is_live() {
                return Ok(handle.clone());
            }
        }
        if let Some(stale) = slot.take() {
            stale.mark_stale();
            stale.close()?;
        }

        let known = self.generation();
        let target = if known == 0 {
            // Discover generation and partitions before the real open
            match Database::probe(&self.config)? {
                Some(probe) => {
                    log::debug!(
                        "Probed store: generation {}, {} partitions",
                        probe.generation,
                        probe.partitions.len()
                    );
                    Some(probe.generation.max(1))
                }
                None => Some(1),
            }
        } else {
            Some(known)
        };

        let db = Database::open(&self.config, target, |_, _, _| Ok(()))?;
        Ok(self.install(slot, db))
    }

    /// Close `current` and reopen one generation up, applying `change`.
    fn upgrade<F>(
        &self,
        slot: &mut Option<Arc<StoreHandle>>,
        current: Arc<StoreHandle>,
        change: F,
    ) -> Result<Arc<StoreHandle>>
    where
        F: FnOnce(&mut Upgrade<'_>) -> Result<()>,
    {
        let next = current.generation() + 1;
        current.mark_stale();
        // RocksDB admits one open instance per directory
        current.close()?;
        *slot = None;

        match Database::open(&self.config, Some(next), |up, _, _| change(up)) {
            Ok(db) => Ok(self.install(slot, db)),
            Err(e) => {
                log::error!("Schema upgrade to generation {next} failed: {e}");
                self.generation.store(0, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn install(&self, slot: &mut Option<Arc<StoreHandle>>, db: Database) -> Arc<StoreHandle> {
        let generation = db.generation();
        self.generation.store(generation, Ordering::SeqCst);
        let handle = Arc::new(StoreHandle::new(db, self.generation.clone()));
        *slot = Some(handle.clone());
        log::info!(
            "Store open at {} (generation {generation})",
            self.config.path.display()
        );
        handle
    }
}
