//! Document-store seam: the operations the migration needs from a target, and
//! an in-memory implementation.

use crate::error::StoreError;
use crate::indexes::{IndexOutcome, IndexSpec};
use crate::model::Collection;
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;

/// Mirrors the 16 MiB document ceiling of common document databases.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// One replace-on-conflict write: the serialized document under its natural key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsertIntent {
    pub key: String,
    pub json: String,
}

/// A keyed document store with upsert semantics.
///
/// Implementations must make `upsert_many` replace any existing document with
/// the same key (never insert-only), and `ensure_index` a no-op for an index
/// that already exists.
pub trait DocumentStore: Send + Sync {
    fn upsert_many(&self, collection: Collection, docs: &[UpsertIntent]) -> Result<(), StoreError>;

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError>;

    fn get_many(&self, collection: Collection, keys: &[&str]) -> Result<AHashMap<String, Value>, StoreError> {
        let mut out = AHashMap::with_capacity(keys.len());
        for k in keys {
            if let Some(v) = self.get(collection, k)? {
                out.insert((*k).to_string(), v);
            }
        }
        Ok(out)
    }

    /// The subset of `keys` present in `collection`.
    fn existing_keys(&self, collection: Collection, keys: &[&str]) -> Result<AHashSet<String>, StoreError>;

    fn count(&self, collection: Collection) -> Result<u64, StoreError>;

    /// Visit every document in key order.
    fn for_each(
        &self,
        collection: Collection,
        f: &mut dyn FnMut(&str, &Value) -> anyhow::Result<()>,
    ) -> anyhow::Result<()>;

    fn drop_collection(&self, collection: Collection) -> Result<(), StoreError>;

    fn ensure_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, StoreError>;

    fn max_document_bytes(&self) -> usize {
        DEFAULT_MAX_DOCUMENT_BYTES
    }
}

/// Process-local store; documents are kept as their JSON encoding.
pub struct MemoryStore {
    collections: RwLock<BTreeMap<Collection, BTreeMap<String, String>>>,
    indexes: Mutex<AHashSet<(Collection, String)>>,
    max_document_bytes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            indexes: Mutex::new(AHashSet::new()),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    pub fn with_max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = bytes.max(64);
        self
    }

    /// Names of indexes created so far on `collection`.
    pub fn index_names(&self, collection: Collection) -> Vec<String> {
        let mut v: Vec<String> = self
            .indexes
            .lock()
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, n)| n.clone())
            .collect();
        v.sort();
        v
    }
}

impl DocumentStore for MemoryStore {
    fn upsert_many(&self, collection: Collection, docs: &[UpsertIntent]) -> Result<(), StoreError> {
        if let Some(big) = docs.iter().find(|d| d.json.len() > self.max_document_bytes) {
            return Err(StoreError::Permanent(format!(
                "document `{}` is {} bytes, limit is {}",
                big.key,
                big.json.len(),
                self.max_document_bytes
            )));
        }
        let mut all = self.collections.write();
        let coll = all.entry(collection).or_default();
        for d in docs {
            coll.insert(d.key.clone(), d.json.clone());
        }
        Ok(())
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        let all = self.collections.read();
        match all.get(&collection).and_then(|c| c.get(key)) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn existing_keys(&self, collection: Collection, keys: &[&str]) -> Result<AHashSet<String>, StoreError> {
        let all = self.collections.read();
        let Some(coll) = all.get(&collection) else {
            return Ok(AHashSet::new());
        };
        Ok(keys
            .iter()
            .filter(|k| coll.contains_key(**k))
            .map(|k| (*k).to_string())
            .collect())
    }

    fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        Ok(self.collections.read().get(&collection).map(|c| c.len() as u64).unwrap_or(0))
    }

    fn for_each(
        &self,
        collection: Collection,
        f: &mut dyn FnMut(&str, &Value) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        // Snapshot so callbacks may write back into the store.
        let snapshot: Vec<(String, String)> = self
            .collections
            .read()
            .get(&collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        for (k, json) in snapshot {
            let v: Value = serde_json::from_str(&json)?;
            f(&k, &v)?;
        }
        Ok(())
    }

    fn drop_collection(&self, collection: Collection) -> Result<(), StoreError> {
        self.collections.write().remove(&collection);
        self.indexes.lock().retain(|(c, _)| *c != collection);
        Ok(())
    }

    fn ensure_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, StoreError> {
        let fresh = self.indexes.lock().insert((spec.collection, spec.name.to_string()));
        Ok(if fresh { IndexOutcome::Created } else { IndexOutcome::AlreadyExists })
    }

    fn max_document_bytes(&self) -> usize {
        self.max_document_bytes
    }
}
