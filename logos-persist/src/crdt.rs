//! The small slice of yrs the engine relies on.

use yrs::updates::decoder::Decode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::error::{PersistError, Result};
use crate::update_log::LogRecord;

/// Full document state as a single v1 update.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Whether the document holds any content at all.
pub fn is_empty(doc: &Doc) -> bool {
    let txn = doc.transact();
    txn.state_vector().is_empty()
}

/// Apply `records` inside one transaction tagged with `origin`.
///
/// Observers see a single combined update carrying `origin`.
pub fn apply_records(doc: &Doc, records: &[LogRecord], origin: &Origin) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut txn = doc.transact_mut_with(origin.clone());
    for record in records {
        let update = Update::decode_v1(&record.payload).map_err(|e| {
            PersistError::Document(format!("record #{}: {e}", record.sequence))
        })?;
        txn.apply_update(update)
            .map_err(|e| PersistError::Document(format!("record #{}: {e}", record.sequence)))?;
    }
    Ok(())
}
