//! # logos-persist — Local update-log persistence for Logos documents
//!
//! Stores the update history of a Yrs document in an embedded RocksDB store
//! so edits survive restarts and every instance of a document opened in the
//! same process converges on the same state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  observe_update_v1   ┌─────────────────┐
//! │ Yrs Doc     │ ───────────────────► │ DocumentSession │ ──► writer task
//! │ (local)     │ ◄─────────────────── │ (per document)  │       │ append
//! └─────────────┘   replay (origin)    └────────┬────────┘       ▼
//!                                               │          ┌───────────┐
//!                                   debounced   │          │ UpdateLog │
//!                                   compaction  ▼          │ updates-* │
//!                                        ┌───────────┐     └─────┬─────┘
//!                                        │ Compactor │ ──fold──► │
//!                                        └───────────┘           │
//!                                                        ┌───────┴──────┐
//!                                                        │ StoreManager │
//!                                                        │ (shared)     │
//!                                                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`] — RocksDB engine, generation-tagged handles, shared manager
//! - [`update_log`] — Append-only per-namespace record sequence
//! - [`compactor`] — Snapshot folding and its debounced trigger
//! - [`session`] — Per-document persistence session
//! - [`meta`] — Namespaced key/value entries
//!
//! ## Example
//!
//! ```no_run
//! use logos_persist::{DocumentSession, SessionConfig, StoreConfig, StoreManager};
//! use yrs::{Array, Doc, Transact, WriteTxn};
//!
//! # async fn demo() -> logos_persist::Result<()> {
//! let manager = StoreManager::shared(StoreConfig::default());
//! let doc = Doc::new();
//! let session = DocumentSession::open(manager, "doc1", doc.clone(), SessionConfig::default())?;
//! session.when_synced().await?;
//!
//! {
//!     let mut txn = doc.transact_mut();
//!     let items = txn.get_or_insert_array("items");
//!     items.insert(&mut txn, 0, "first");
//! }
//! session.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod compactor;
pub mod config;
pub mod crdt;
pub mod error;
pub mod meta;
pub mod retry;
pub mod session;
pub mod store;
pub mod update_log;

// Re-exports for convenience
pub use compactor::{Compactor, Debouncer};
pub use config::{SessionConfig, StoreConfig, DEFAULT_STORE_TIMEOUT, PREFERRED_TRIM_SIZE};
pub use error::{PersistError, Result};
pub use meta::MetaTable;
pub use retry::RetryPolicy;
pub use session::{DocumentSession, PersistEvent, SessionState};
pub use store::{HandleState, StoreHandle, StoreManager};
pub use update_log::{Fetched, LogRecord, UpdateLog};
