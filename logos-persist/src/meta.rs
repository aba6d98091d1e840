//! Namespaced key/value entries for document metadata.
//!
//! Lives in its own partition (`custom-{ns}`) next to the update log and
//! is not part of the CRDT state. Keys are bincode-encoded so equal keys
//! always map to the same bytes; values are JSON so any self-describing
//! value (including `serde_json::Value`) round-trips.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PersistError, Result};
use crate::store::StoreHandle;

/// Key/value table bound to one namespace.
#[derive(Debug, Clone)]
pub struct MetaTable {
    partition: String,
}

impl MetaTable {
    pub fn new(namespace: &str) -> Self {
        Self {
            partition: Self::partition_name(namespace),
        }
    }

    /// Partition holding the entries of `namespace`.
    pub fn partition_name(namespace: &str) -> String {
        format!("custom-{namespace}")
    }

    pub fn get<K, V>(&self, handle: &StoreHandle, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let key = encode_key(key)?;
        let bytes = handle.transact(&self.partition, |txn| txn.get(&key))?;
        bytes
            .map(|b| {
                serde_json::from_slice(&b).map_err(|e| PersistError::Deserialization(e.to_string()))
            })
            .transpose()
    }

    pub fn set<K, V>(&self, handle: &StoreHandle, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = encode_key(key)?;
        let value =
            serde_json::to_vec(value).map_err(|e| PersistError::Serialization(e.to_string()))?;
        handle.transact(&self.partition, |txn| {
            txn.put(&key, &value);
            Ok(())
        })
    }

    pub fn del<K>(&self, handle: &StoreHandle, key: &K) -> Result<()>
    where
        K: Serialize + ?Sized,
    {
        let key = encode_key(key)?;
        handle.transact(&self.partition, |txn| {
            txn.delete(&key);
            Ok(())
        })
    }
}

fn encode_key<K: Serialize + ?Sized>(key: &K) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(key, bincode::config::standard())
        .map_err(|e| PersistError::Serialization(e.to_string()))
}
