//! SQLite-backed document store: one `(_id, doc)` table per collection, JSON
//! documents, expression indexes over `json_extract`.

use crate::error::StoreError;
use crate::indexes::{IndexOutcome, IndexSpec};
use crate::model::Collection;
use crate::store::{DocumentStore, UpsertIntent, DEFAULT_MAX_DOCUMENT_BYTES};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bound on `IN (...)` lists, well under SQLite's variable limit.
const LOOKUP_BATCH: usize = 500;
const SCAN_PAGE: usize = 1000;

pub struct SqliteDocStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    max_document_bytes: usize,
}

impl SqliteDocStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Permanent(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        tracing::info!("Opened document store {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        for c in Collection::ALL {
            create_table(&conn, c)?;
        }
        Ok(Self { conn: Mutex::new(conn), path, max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES })
    }

    pub fn with_max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = bytes.max(64);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn create_table(conn: &Connection, c: Collection) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (_id TEXT PRIMARY KEY NOT NULL, doc TEXT NOT NULL) WITHOUT ROWID;",
        c.name()
    ))?;
    Ok(())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl DocumentStore for SqliteDocStore {
    fn upsert_many(&self, collection: Collection, docs: &[UpsertIntent]) -> Result<(), StoreError> {
        if let Some(big) = docs.iter().find(|d| d.json.len() > self.max_document_bytes) {
            return Err(StoreError::Permanent(format!(
                "document `{}` is {} bytes, limit is {}",
                big.key,
                big.json.len(),
                self.max_document_bytes
            )));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO \"{}\" (_id, doc) VALUES (?1, ?2) \
                 ON CONFLICT(_id) DO UPDATE SET doc = excluded.doc",
                collection.name()
            ))?;
            for d in docs {
                stmt.execute(params![d.key, d.json])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                &format!("SELECT doc FROM \"{}\" WHERE _id = ?1", collection.name()),
                [key],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn get_many(&self, collection: Collection, keys: &[&str]) -> Result<AHashMap<String, Value>, StoreError> {
        let mut out = AHashMap::with_capacity(keys.len());
        let conn = self.conn.lock();
        for batch in keys.chunks(LOOKUP_BATCH) {
            let mut stmt = conn.prepare(&format!(
                "SELECT _id, doc FROM \"{}\" WHERE _id IN ({})",
                collection.name(),
                placeholders(batch.len())
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (k, json) = row?;
                out.insert(k, serde_json::from_str(&json)?);
            }
        }
        Ok(out)
    }

    fn existing_keys(&self, collection: Collection, keys: &[&str]) -> Result<AHashSet<String>, StoreError> {
        let mut out = AHashSet::with_capacity(keys.len());
        let conn = self.conn.lock();
        for batch in keys.chunks(LOOKUP_BATCH) {
            let mut stmt = conn.prepare(&format!(
                "SELECT _id FROM \"{}\" WHERE _id IN ({})",
                collection.name(),
                placeholders(batch.len())
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |r| r.get::<_, String>(0))?;
            for k in rows {
                out.insert(k?);
            }
        }
        Ok(out)
    }

    fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", collection.name()), [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Pages through the table so the connection lock is not held across callbacks.
    fn for_each(
        &self,
        collection: Collection,
        f: &mut dyn FnMut(&str, &Value) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut after: Option<String> = None;
        loop {
            let page: Vec<(String, String)> = {
                let conn = self.conn.lock();
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT _id, doc FROM \"{}\" WHERE ?1 IS NULL OR _id > ?1 ORDER BY _id LIMIT ?2",
                    collection.name()
                ))?;
                let rows = stmt.query_map(params![after, SCAN_PAGE as i64], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            if page.is_empty() {
                return Ok(());
            }
            for (k, json) in &page {
                let v: Value = serde_json::from_str(json)?;
                f(k, &v)?;
            }
            if page.len() < SCAN_PAGE {
                return Ok(());
            }
            after = page.last().map(|(k, _)| k.clone());
        }
    }

    fn drop_collection(&self, collection: Collection) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", collection.name()))?;
        create_table(&conn, collection)
    }

    fn ensure_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, StoreError> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1", [spec.name], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Ok(IndexOutcome::AlreadyExists);
        }
        conn.execute_batch(&format!(
            "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" (json_extract(doc, '$.{}'));",
            if spec.unique { "UNIQUE " } else { "" },
            spec.name,
            spec.collection.name(),
            spec.field
        ))?;
        Ok(IndexOutcome::Created)
    }

    fn max_document_bytes(&self) -> usize {
        self.max_document_bytes
    }
}
