//! Per-document persistence session.
//!
//! ```text
//!  Opening ──► Replaying ──► Synced
//!     │            │           │
//!     └────────────┴───────────┴──► Destroyed
//! ```
//!
//! A session replays the namespace's log into its document on startup, then
//! forwards every local document update to a writer task that appends it to
//! the log. Updates the session applies itself carry the session's origin
//! and are never written back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use yrs::{Doc, Origin, Subscription};

use crate::compactor::{Compactor, Debouncer};
use crate::config::SessionConfig;
use crate::crdt;
use crate::error::{PersistError, Result};
use crate::meta::MetaTable;
use crate::store::{HandleCache, StoreManager};
use crate::update_log::{Fetched, UpdateLog};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Replaying,
    Synced,
    Destroyed,
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistEvent {
    /// Persisted history has been applied to the document (at most once)
    Synced,
    /// The session stopped observing its document
    Destroyed,
    /// The log was folded into a snapshot; `records` remain
    Compacted { records: u64 },
    /// A background append or compaction failed
    WriteFailed(PersistError),
}

#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready,
    Failed(PersistError),
}

/// State shared between the session, its document observers and its
/// background tasks.
struct SessionCore {
    name: String,
    doc: Doc,
    /// Tags transactions this session applies itself
    origin: Origin,
    manager: Arc<StoreManager>,
    log: UpdateLog,
    meta: MetaTable,
    compactor: Compactor,
    handle: HandleCache,
    /// Serializes replay and compaction so the cursor only moves forward
    replay_lock: tokio::sync::Mutex<()>,
    cursor: AtomicU64,
    size: AtomicU64,
    state: Mutex<SessionState>,
    /// Namespace exists; updates from here on are persisted
    created: AtomicBool,
    synced: AtomicBool,
    destroyed: AtomicBool,
    debounce: Debouncer,
    events: mpsc::UnboundedSender<PersistEvent>,
    ready: watch::Sender<Readiness>,
    /// Updates handed to the writer
    enqueued: AtomicU64,
    /// Updates the writer finished with, successfully or not
    persisted: watch::Sender<u64>,
    updates: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl SessionCore {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PersistEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != SessionState::Destroyed {
                *state = next;
            }
        }
    }

    /// Document observer: hand a local update to the writer.
    fn forward(&self, origin: Option<&Origin>, update: &[u8]) {
        if origin == Some(&self.origin)
            || !self.created.load(Ordering::SeqCst)
            || self.is_destroyed()
        {
            return;
        }
        let Ok(updates) = self.updates.lock() else {
            return;
        };
        if let Some(tx) = updates.as_ref() {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            if tx.send(update.to_vec()).is_err() {
                self.persisted.send_modify(|n| *n += 1);
            }
        }
    }

    async fn start(self: Arc<Self>) {
        match self.initialize().await {
            Ok(()) => {
                self.ready.send_replace(Readiness::Ready);
            }
            Err(e) => {
                log::error!("{}: failed to open persisted history: {e}", self.name);
                self.ready.send_replace(Readiness::Failed(e));
            }
        }
    }

    async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.manager.acquire().await?;
        let handle = self.manager.ensure_namespace(&self.name).await?;
        self.handle.set(handle);
        self.created.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Replaying);

        {
            let _replay = self.replay_lock.lock().await;
            // Content that predates the session is not in the log yet
            let seed = (!self.is_destroyed() && !crdt::is_empty(&self.doc))
                .then(|| crdt::encode_full_state(&self.doc));
            let fetched = self.replay("open", seed).await?;
            log::info!(
                "{}: replayed {} records (cursor {}, {} stored)",
                self.name,
                fetched.records.len(),
                self.cursor.load(Ordering::SeqCst),
                fetched.count
            );
        }
        self.maybe_schedule_compaction();

        let mut state = self.state.lock()?;
        if *state != SessionState::Destroyed {
            *state = SessionState::Synced;
            self.synced.store(true, Ordering::SeqCst);
            self.emit(PersistEvent::Synced);
        }
        Ok(())
    }

    /// Read everything from the cursor (appending `seed` in the same
    /// transaction) and apply it. Callers hold `replay_lock`.
    async fn replay(&self, op: &'static str, seed: Option<Vec<u8>>) -> Result<Fetched> {
        let from = self.cursor.load(Ordering::SeqCst);
        let fetched = self
            .manager
            .write(op, &self.handle, |h| self.log.fetch(h, from, seed.as_deref()))
            .await?;

        if !self.is_destroyed() {
            crdt::apply_records(&self.doc, &fetched.records, &self.origin)?;
        }
        if let Some(next) = fetched.next_cursor() {
            self.cursor.fetch_max(next, Ordering::SeqCst);
        }
        self.size.store(fetched.count, Ordering::SeqCst);
        Ok(fetched)
    }

    async fn store_state(&self, force: bool) -> Result<()> {
        let _replay = self.replay_lock.lock().await;
        self.replay("store_state", None).await?;

        let size = self.size.load(Ordering::SeqCst);
        if !self.compactor.should_compact(size, force) {
            return Ok(());
        }
        let cursor = self.cursor.load(Ordering::SeqCst);
        let records = self
            .manager
            .write("store_state", &self.handle, |h| {
                self.compactor.compact(&self.log, h, &self.doc, cursor)
            })
            .await?;
        self.size.store(records, Ordering::SeqCst);
        log::debug!("{}: compacted {size} records into {records}", self.name);
        self.emit(PersistEvent::Compacted { records });
        Ok(())
    }

    async fn persist(self: &Arc<Self>, update: Vec<u8>) {
        let result = self
            .manager
            .write("store_update", &self.handle, |h| self.log.append(h, &update))
            .await;
        match result {
            Ok(_) => {
                self.size.fetch_add(1, Ordering::SeqCst);
                self.maybe_schedule_compaction();
            }
            Err(e) => {
                log::error!("{}: failed to persist update: {e}", self.name);
                self.emit(PersistEvent::WriteFailed(e));
            }
        }
        self.persisted.send_modify(|n| *n += 1);
    }

    fn maybe_schedule_compaction(self: &Arc<Self>) {
        if self.is_destroyed()
            || !self.compactor.should_compact(self.size.load(Ordering::SeqCst), false)
        {
            return;
        }
        let weak = Arc::downgrade(self);
        self.debounce.schedule(move || async move {
            if let Some(core) = weak.upgrade() {
                core.compact_when_idle().await;
            }
        });
    }

    /// Debounced compaction: let the writer catch up, then fold.
    async fn compact_when_idle(&self) {
        self.drained().await;
        if self.is_destroyed() {
            return;
        }
        if let Err(e) = self.store_state(false).await {
            log::error!("{}: compaction failed: {e}", self.name);
            self.emit(PersistEvent::WriteFailed(e));
        }
    }

    /// Wait for the writer to finish every update enqueued so far.
    async fn drained(&self) {
        let target = self.enqueued.load(Ordering::SeqCst);
        let mut rx = self.persisted.subscribe();
        let _ = rx.wait_for(|n| *n >= target).await;
    }

    /// Stop observing and persisting. Safe to call any number of times.
    fn shut_down(&self) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if self.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            *state = SessionState::Destroyed;
        }
        self.debounce.cancel();
        // The writer drains what it already has, then exits
        if let Ok(mut updates) = self.updates.lock() {
            updates.take();
        }
        log::debug!("{}: session destroyed", self.name);
        self.emit(PersistEvent::Destroyed);
    }
}

async fn run_writer(core: Arc<SessionCore>, mut updates: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(update) = updates.recv().await {
        core.persist(update).await;
    }
    log::trace!("{}: writer stopped", core.name);
}

/// Persistence for one document in one namespace.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> logos_persist::Result<()> {
/// use logos_persist::{DocumentSession, SessionConfig, StoreConfig, StoreManager};
///
/// let manager = StoreManager::shared(StoreConfig::default());
/// let session = DocumentSession::open(manager, "doc1", yrs::Doc::new(), SessionConfig::default())?;
/// session.when_synced().await?;
/// session.set("owner", "ada").await?;
/// # Ok(())
/// # }
/// ```
pub struct DocumentSession {
    core: Arc<SessionCore>,
    subscriptions: Mutex<Vec<Subscription>>,
    event_rx: Option<mpsc::UnboundedReceiver<PersistEvent>>,
}

impl DocumentSession {
    /// Start persisting `doc` under namespace `name`.
    ///
    /// Returns immediately; replay runs in the background. Must be called
    /// within a tokio runtime.
    pub fn open(
        manager: Arc<StoreManager>,
        name: impl Into<String>,
        doc: Doc,
        config: SessionConfig,
    ) -> Result<Self> {
        let name = name.into();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(Readiness::Pending);
        let (persisted, _) = watch::channel(0);

        let core = Arc::new(SessionCore {
            origin: Origin::from(format!("logos-persist/{}", Uuid::new_v4()).as_str()),
            log: UpdateLog::new(name.as_str()),
            meta: MetaTable::new(&name),
            compactor: Compactor::new(config.trim_size),
            debounce: Debouncer::new(config.store_timeout),
            name,
            doc,
            manager,
            handle: HandleCache::default(),
            replay_lock: tokio::sync::Mutex::new(()),
            cursor: AtomicU64::new(0),
            size: AtomicU64::new(0),
            state: Mutex::new(SessionState::Opening),
            created: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            events,
            ready,
            enqueued: AtomicU64::new(0),
            persisted,
            updates: Mutex::new(Some(updates_tx)),
        });

        let on_update = {
            let weak: Weak<SessionCore> = Arc::downgrade(&core);
            core.doc
                .observe_update_v1(move |txn, event| {
                    if let Some(core) = weak.upgrade() {
                        core.forward(txn.origin(), &event.update);
                    }
                })
                .map_err(|_| PersistError::Document("cannot observe document updates".into()))?
        };
        let on_destroy = {
            let weak: Weak<SessionCore> = Arc::downgrade(&core);
            core.doc
                .observe_destroy(move |_txn, _doc| {
                    if let Some(core) = weak.upgrade() {
                        core.shut_down();
                    }
                })
                .map_err(|_| PersistError::Document("cannot observe document destroy".into()))?
        };

        tokio::spawn(run_writer(core.clone(), updates_rx));
        tokio::spawn(core.clone().start());
        log::debug!("{}: session opened", core.name);

        Ok(Self {
            core,
            subscriptions: Mutex::new(vec![on_update, on_destroy]),
            event_rx: Some(event_rx),
        })
    }

    /// Namespace this session persists to.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn doc(&self) -> &Doc {
        &self.core.doc
    }

    pub fn state(&self) -> SessionState {
        self.core
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Destroyed)
    }

    /// Whether the persisted history has been applied.
    pub fn is_synced(&self) -> bool {
        self.core.synced.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    /// First sequence number not yet replayed.
    pub fn cursor(&self) -> u64 {
        self.core.cursor.load(Ordering::SeqCst)
    }

    /// Records stored for this namespace, as last observed.
    pub fn size(&self) -> u64 {
        self.core.size.load(Ordering::SeqCst)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<PersistEvent>> {
        self.event_rx.take()
    }

    /// Resolve once the startup replay has finished.
    ///
    /// Also resolves for a session destroyed during startup; fails only if
    /// the store or namespace could not be opened.
    pub async fn when_synced(&self) -> Result<()> {
        let mut rx = self.core.ready.subscribe();
        let readiness = rx
            .wait_for(|r| !matches!(r, Readiness::Pending))
            .await
            .map_err(|_| PersistError::Destroyed(self.core.name.clone()))?;
        match &*readiness {
            Readiness::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Apply records other sessions appended since the last replay.
    /// Returns how many were applied. Fails once the session is destroyed.
    pub async fn fetch_updates(&self) -> Result<usize> {
        self.ensure_alive()?;
        let fetched = {
            let _replay = self.core.replay_lock.lock().await;
            self.core.replay("fetch_updates", None).await?
        };
        self.core.maybe_schedule_compaction();
        Ok(fetched.records.len())
    }

    /// Replay, then fold the log into one snapshot if `force` or the log
    /// has reached the trim size. Fails once the session is destroyed.
    pub async fn store_state(&self, force: bool) -> Result<()> {
        self.ensure_alive()?;
        self.core.store_state(force).await
    }

    /// Wait until every update observed so far is in the log and any
    /// scheduled compaction has run.
    pub async fn flush(&self) -> Result<()> {
        self.core.drained().await;
        self.core.debounce.wait_idle().await;
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.core.is_destroyed() {
            return Err(PersistError::Destroyed(self.core.name.clone()));
        }
        Ok(())
    }

    /// Stop observing the document. Idempotent; the shared store stays open.
    pub fn destroy(&self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
        self.core.shut_down();
    }

    /// Destroy the session and delete everything stored under its namespace.
    pub async fn erase(&self) -> Result<()> {
        self.destroy();
        self.flush().await?;
        self.core.manager.erase_namespace(&self.core.name).await
    }

    pub async fn get<K, V>(&self, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let handle = self.core.manager.current_namespace("get", &self.core.name).await?;
        self.core.meta.get(&handle, key)
    }

    pub async fn set<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let handle = self.core.manager.current_namespace("set", &self.core.name).await?;
        self.core.meta.set(&handle, key, value)
    }

    pub async fn del<K>(&self, key: &K) -> Result<()>
    where
        K: Serialize + ?Sized,
    {
        let handle = self.core.manager.current_namespace("del", &self.core.name).await?;
        self.core.meta.del(&handle, key)
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("name", &self.core.name)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .field("size", &self.size())
            .finish()
    }
}
