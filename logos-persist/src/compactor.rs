//! Log compaction and its debounced trigger.
//!
//! ```text
//! before:  [1: snapshot] [2] [3] ... [k] │ [k+1] [k+2]      (cursor = k+1)
//! after:                                 │ [k+1] [k+2] [n: snapshot']
//! ```
//!
//! The new snapshot encodes the document after everything below the cursor
//! was applied, so those records can go. Records at or above the cursor,
//! including ones appended by other sessions meanwhile, are kept.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use yrs::Doc;

use crate::crdt;
use crate::error::Result;
use crate::store::StoreHandle;
use crate::update_log::UpdateLog;

/// Decides when to fold and performs the fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compactor {
    trim_size: u64,
}

impl Compactor {
    pub fn new(trim_size: u64) -> Self {
        Self { trim_size }
    }

    pub fn should_compact(&self, size: u64, force: bool) -> bool {
        force || size >= self.trim_size
    }

    /// Fold the full state of `doc` into one record and drop every record
    /// below `cursor`. Returns the record count afterwards.
    pub fn compact(
        &self,
        log: &UpdateLog,
        handle: &StoreHandle,
        doc: &Doc,
        cursor: u64,
    ) -> Result<u64> {
        let snapshot = crdt::encode_full_state(doc);
        log.fold(handle, &snapshot, cursor)
    }
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

struct Scheduled {
    phase: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

/// One cancellable deferred job at a time.
///
/// Scheduling replaces a job that is still waiting out its delay. A job that
/// has started running is left alone by both `schedule` and `cancel`.
pub struct Debouncer {
    delay: Duration,
    scheduled: Mutex<Option<Scheduled>>,
    /// Jobs scheduled but neither finished nor cancelled
    outstanding: Arc<watch::Sender<usize>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            delay,
            scheduled: Mutex::new(None),
            outstanding: Arc::new(outstanding),
        }
    }

    /// Run `job` after the delay unless it is cancelled or rescheduled
    /// first. Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut slot) = self.scheduled.lock() else {
            return;
        };
        if let Some(previous) = slot.take() {
            self.cancel_scheduled(previous);
        }

        let phase = Arc::new(AtomicU8::new(PENDING));
        self.outstanding.send_modify(|n| *n += 1);

        let task_phase = phase.clone();
        let outstanding = self.outstanding.clone();
        let delay = self.delay;
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if task_phase
                .compare_exchange(PENDING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            let _done = Finished(outstanding);
            job().await;
        });
        *slot = Some(Scheduled { phase, task });
    }

    /// Cancel the pending job, if any. Returns whether one was cancelled.
    pub fn cancel(&self) -> bool {
        let scheduled = match self.scheduled.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        scheduled.is_some_and(|s| self.cancel_scheduled(s))
    }

    /// Whether a job is waiting out its delay.
    pub fn is_pending(&self) -> bool {
        match self.scheduled.lock() {
            Ok(slot) => slot
                .as_ref()
                .is_some_and(|s| s.phase.load(Ordering::SeqCst) == PENDING),
            Err(_) => false,
        }
    }

    /// Wait until every scheduled job has finished or been cancelled.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn cancel_scheduled(&self, scheduled: Scheduled) -> bool {
        let cancelled = scheduled
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            scheduled.task.abort();
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
        cancelled
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("outstanding", &*self.outstanding.borrow())
            .finish()
    }
}

/// Marks a running job finished, even if it panicked.
struct Finished(Arc<watch::Sender<usize>>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}
