//! Append-only update log of one document namespace.
//!
//! ```text
//! updates-{ns}:  [1: snapshot] [2: δ] [3: δ] ... [n: δ]
//!                  ▲                     ▲
//!                  oldest needed         cursor (next unread)
//! ```
//!
//! Sequence numbers come from the store's key generator: strictly
//! increasing within a namespace and never reused, even after compaction
//! deleted the records that carried them. Payloads are opaque yrs updates,
//! LZ4-compressed at rest.

use crate::error::{PersistError, Result};
use crate::store::StoreHandle;

/// One persisted update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Store-assigned sequence number
    pub sequence: u64,
    /// Decompressed update bytes
    pub payload: Vec<u8>,
}

/// Result of a replay transaction.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    /// Records at or after the requested cursor, ascending
    pub records: Vec<LogRecord>,
    /// Sequence assigned to the seed record, if one was written
    pub seeded: Option<u64>,
    /// Highest sequence in the log after the transaction
    pub last_sequence: Option<u64>,
    /// Records stored after the transaction
    pub count: u64,
}

impl Fetched {
    /// Cursor position after applying this batch.
    pub fn next_cursor(&self) -> Option<u64> {
        self.last_sequence.map(|last| last + 1)
    }
}

/// Update log bound to one namespace.
#[derive(Debug, Clone)]
pub struct UpdateLog {
    namespace: String,
    partition: String,
}

impl UpdateLog {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let partition = Self::partition_name(&namespace);
        Self { namespace, partition }
    }

    /// Partition holding the log of `namespace`.
    pub fn partition_name(namespace: &str) -> String {
        format!("updates-{namespace}")
    }

    /// Append a record, returning its sequence number.
    pub fn append(&self, handle: &StoreHandle, record: &[u8]) -> Result<u64> {
        let compressed = compress(record);
        let seq = handle.transact(&self.partition, |txn| txn.add(&compressed))?;
        log::trace!("{}: appended #{seq} ({} bytes)", self.namespace, record.len());
        Ok(seq)
    }

    /// All records with sequence ≥ `from`, ascending.
    pub fn replay(&self, handle: &StoreHandle, from: u64) -> Result<Vec<LogRecord>> {
        let raw = handle.transact(&self.partition, |txn| txn.scan_from(from))?;
        decode_records(raw)
    }

    /// Delete every record with sequence < `upto`.
    pub fn delete_before(&self, handle: &StoreHandle, upto: u64) -> Result<()> {
        handle.transact(&self.partition, |txn| {
            txn.delete_below(upto);
            Ok(())
        })
    }

    pub fn last_sequence(&self, handle: &StoreHandle) -> Result<Option<u64>> {
        handle.transact(&self.partition, |txn| txn.last_key())
    }

    pub fn count(&self, handle: &StoreHandle) -> Result<u64> {
        handle.transact(&self.partition, |txn| txn.count())
    }

    /// Read everything from `from` and, optionally, append `seed`, in one
    /// transaction.
    ///
    /// No record can be appended between the scan and the last-sequence
    /// read, so `next_cursor` never skips an unapplied record.
    pub fn fetch(&self, handle: &StoreHandle, from: u64, seed: Option<&[u8]>) -> Result<Fetched> {
        let compressed_seed = seed.map(compress);
        let (raw, seeded, last, count) = handle.transact(&self.partition, |txn| {
            let raw = txn.scan_from(from)?;
            let stored_last = txn.last_key()?;
            let count = txn.count()?;
            match &compressed_seed {
                Some(bytes) => {
                    let seq = txn.add(bytes)?;
                    Ok((raw, Some(seq), Some(seq), count + 1))
                }
                None => Ok((raw, None, stored_last, count)),
            }
        })?;

        let records = decode_records(raw)?;
        log::debug!(
            "{}: fetched {} records from #{from} ({count} stored)",
            self.namespace,
            records.len()
        );
        Ok(Fetched {
            records,
            seeded,
            last_sequence: last,
            count,
        })
    }

    /// Append `snapshot` and delete every record below `cursor`, atomically.
    ///
    /// Returns the record count afterwards. Records at or above `cursor`,
    /// including ones appended by other sessions after the cursor was
    /// captured, survive.
    pub fn fold(&self, handle: &StoreHandle, snapshot: &[u8], cursor: u64) -> Result<u64> {
        let compressed = compress(snapshot);
        let (seq, count) = handle.transact(&self.partition, |txn| {
            let surviving = txn.count_from(cursor)?;
            let seq = txn.add(&compressed)?;
            txn.delete_below(cursor);
            Ok((seq, surviving + 1))
        })?;
        log::debug!(
            "{}: folded snapshot #{seq} ({} bytes), {count} records remain",
            self.namespace,
            snapshot.len()
        );
        Ok(count)
    }
}

fn compress(record: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(record)
}

fn decode_records(raw: Vec<(u64, Vec<u8>)>) -> Result<Vec<LogRecord>> {
    raw.into_iter()
        .map(|(sequence, bytes)| {
            let payload = lz4_flex::decompress_size_prepended(&bytes)
                .map_err(|e| PersistError::Compression(format!("record #{sequence}: {e}")))?;
            Ok(LogRecord { sequence, payload })
        })
        .collect()
}
