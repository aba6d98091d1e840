//! Embedded transactional store shared by all document sessions.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  acquire / ensure_namespace  ┌──────────────┐
//! │ Document     │ ───────────────────────────► │ StoreManager │
//! │ sessions     │ ◄─────────────────────────── │ (one/process)│
//! └──────┬───────┘     Arc<StoreHandle>         └──────┬───────┘
//!        │                                             │ upgrade:
//!        │ transact(partition, ..)                     │ stale → close → open(gen+1)
//!        ▼                                             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RocksDB                                                      │
//! │ CF "default"        — __generation, __seq/{partition}        │
//! │ CF "updates-{ns}"   — update log, u64 big-endian keys        │
//! │ CF "custom-{ns}"    — key/value entries                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod handle;
pub mod manager;

pub use engine::{Database, Probe, Transaction, Upgrade};
pub use handle::{HandleCache, HandleState, StoreHandle};
pub use manager::StoreManager;
