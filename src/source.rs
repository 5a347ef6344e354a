//! Relational source reader: key-ordered, keyset-paged chunks per entity stream.
//!
//! Chunk windows are bounded by the last key of the previous window, never by
//! offset, so a failed window can be re-read from the same boundary and chunk
//! edges are identical across runs over an unchanged source.

use crate::error::FatalError;
use crate::layout::{EntityQuery, SourceLayout};
use crate::mem::maybe_throttle_low_memory;
use crate::model::EntityKind;
use ahash::AHashMap;
use anyhow::{Context, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags};
use std::cell::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use walkdir::WalkDir;

/// A single column value as read from the source.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl RawValue {
    fn from_ref(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => RawValue::Null,
            ValueRef::Integer(i) => RawValue::Integer(i),
            ValueRef::Real(f) => RawValue::Real(f),
            ValueRef::Text(t) => RawValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => RawValue::Text(String::from_utf8_lossy(b).into_owned()),
        }
    }

    fn to_sql_value(&self) -> Value {
        match self {
            RawValue::Null => Value::Null,
            RawValue::Integer(i) => Value::Integer(*i),
            RawValue::Real(f) => Value::Real(*f),
            RawValue::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        RawValue::Integer(i)
    }
}

/// One source row, addressable by canonical column name.
#[derive(Clone, Debug)]
pub struct RawRow {
    columns: Arc<[String]>,
    values: Vec<RawValue>,
}

static NULL: RawValue = RawValue::Null;

impl RawRow {
    /// Build a row by hand (fixtures, alternative sources).
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, RawValue)>,
        S: Into<String>,
    {
        let (cols, values): (Vec<String>, Vec<RawValue>) = pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self { columns: cols.into(), values }
    }

    /// Missing columns read as NULL.
    pub fn get(&self, column: &str) -> &RawValue {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
            .unwrap_or(&NULL)
    }
}

/// Upper boundary of a consumed window; the next window starts strictly after it.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkKey(pub Vec<RawValue>);

#[derive(Debug)]
pub struct Chunk {
    pub entity: EntityKind,
    /// 0-based position of this window in the stream.
    pub index: usize,
    pub rows: Vec<RawRow>,
    /// Boundary key of the last row, `None` when the window is empty.
    pub last_key: Option<ChunkKey>,
}

/// Read-only handle on the relational source.
pub struct SourceReader {
    conn: Connection,
    path: PathBuf,
    layout: SourceLayout,
    /// Comment id → `distinguished`, loaded on the first comment window.
    markers: OnceCell<AHashMap<String, String>>,
}

impl SourceReader {
    /// Open `path` read-only. A directory is searched for the first `*.sqlite` file.
    pub fn open(path: &Path, layout: SourceLayout) -> Result<Self, FatalError> {
        layout.validate()?;
        let resolved = resolve_sqlite_path(path)?;
        let conn = Connection::open_with_flags(
            &resolved,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| FatalError::SourceOpen { path: resolved.clone(), source })?;
        tracing::info!("Opened source {} (layout: {})", resolved.display(), layout);
        Ok(Self { conn, path: resolved, layout, markers: OnceCell::new() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    /// Verify every table/column the layout reads exists.
    pub fn check_schema(&self) -> Result<(), FatalError> {
        for (table, required) in self.layout.required_columns() {
            let present = self
                .table_columns(&table)
                .map_err(|source| FatalError::SourceOpen { path: self.path.clone(), source })?;
            if present.is_empty() {
                return Err(FatalError::SchemaMismatch(format!("table `{table}` not found")));
            }
            let missing: Vec<&str> = required
                .iter()
                .copied()
                .filter(|c| !present.iter().any(|p| p.eq_ignore_ascii_case(c)))
                .collect();
            if !missing.is_empty() {
                return Err(FatalError::SchemaMismatch(format!(
                    "table `{table}` is missing column(s): {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn table_columns(&self, table: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        let rows = stmt.query_map([table], |r| r.get::<_, String>(0))?;
        rows.collect()
    }

    /// Rows with a non-null key in an entity stream.
    pub fn count(&self, entity: EntityKind) -> Result<u64> {
        let q = self.layout.query(entity);
        let n: i64 = self
            .conn
            .query_row(&q.count_sql(), [], |r| r.get(0))
            .with_context(|| format!("count {entity}"))?;
        Ok(n.max(0) as u64)
    }

    /// Rows whose key is NULL; never read, reported as validation failures.
    pub fn null_key_rows(&self, entity: EntityKind) -> Result<u64> {
        let q = self.layout.query(entity);
        let n: i64 = self
            .conn
            .query_row(&q.null_key_sql(), [], |r| r.get(0))
            .with_context(|| format!("count null keys for {entity}"))?;
        Ok(n.max(0) as u64)
    }

    /// Rows that share their key with another row. Only one row per key is
    /// read, so these are collapsed and counted instead.
    pub fn duplicate_key_rows(&self, entity: EntityKind) -> Result<u64> {
        let q = self.layout.query(entity);
        let n: i64 = self
            .conn
            .query_row(&q.duplicate_key_sql(), [], |r| r.get(0))
            .with_context(|| format!("count duplicate keys for {entity}"))?;
        Ok(n.max(0) as u64)
    }

    /// `distinguished` markers for comments, read from the moderation table
    /// once and kept for the rest of the comment stream.
    fn comment_markers(&self) -> Result<Option<&AHashMap<String, String>>> {
        let Some(sql) = self.layout.comment_markers_sql() else {
            return Ok(None);
        };
        if self.markers.get().is_none() {
            let mut stmt = self.conn.prepare(sql).context("prepare comment marker query")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            let map = rows.collect::<rusqlite::Result<AHashMap<_, _>>>().context("read comment markers")?;
            tracing::debug!("Loaded {} comment marker(s)", map.len());
            let _ = self.markers.set(map);
        }
        Ok(self.markers.get())
    }

    /// Read one window of at most `limit` rows strictly after `after`.
    pub fn read_window(&self, entity: EntityKind, after: Option<&ChunkKey>, limit: usize) -> Result<(Vec<RawRow>, Option<ChunkKey>)> {
        let q = self.layout.query(entity);
        let (sql, mut params): (String, Vec<Value>) = match after {
            None => (q.first_page_sql(), Vec::with_capacity(1)),
            Some(k) => (q.next_page_sql(), k.0.iter().map(RawValue::to_sql_value).collect()),
        };
        params.push(Value::Integer(limit as i64));

        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .with_context(|| format!("prepare window query for {entity}"))?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let key_idx = key_indices(&q, &columns);
        let markers = match entity {
            EntityKind::Comment => self.comment_markers()?,
            _ => None,
        };
        let marker_slot = markers.and_then(|_| {
            Some((columns.iter().position(|c| c == "distinguished")?, columns.iter().position(|c| c == "id")?))
        });

        let mut rows = Vec::with_capacity(limit.min(64 * 1024));
        let mut cursor = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(r) = cursor.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(RawValue::from_ref(r.get_ref(i)?));
            }
            if let (Some(m), Some((d, id))) = (markers, marker_slot) {
                let mark = match (&values[d], &values[id]) {
                    (RawValue::Null, RawValue::Text(cid)) => m.get(cid).cloned(),
                    _ => None,
                };
                if let Some(mark) = mark {
                    values[d] = RawValue::Text(mark);
                }
            }
            rows.push(RawRow { columns: columns.clone(), values });
        }
        let last_key = rows
            .last()
            .map(|row| ChunkKey(key_idx.iter().map(|&i| row.values[i].clone()).collect()));
        Ok((rows, last_key))
    }

    /// Lazy chunk stream for one entity.
    pub fn chunks(&self, entity: EntityKind, chunk_size: usize) -> ChunkIter<'_> {
        ChunkIter {
            reader: self,
            entity,
            chunk_size: chunk_size.max(1),
            after: None,
            remaining: None,
            index: 0,
            done: false,
            read_attempts: 3,
            retry_delay_ms: 200,
        }
    }
}

fn key_indices(q: &EntityQuery, columns: &[String]) -> Vec<usize> {
    q.key_columns
        .iter()
        .filter_map(|k| columns.iter().position(|c| c == k))
        .collect()
}

fn resolve_sqlite_path(path: &Path) -> Result<PathBuf, FatalError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        let found = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .find(|e| {
                e.path()
                    .extension()
                    .map(|x| x.eq_ignore_ascii_case("sqlite"))
                    .unwrap_or(false)
            });
        if let Some(entry) = found {
            return Ok(entry.into_path());
        }
    }
    Err(FatalError::SourceMissing(path.to_path_buf()))
}

/// Iterator over the windows of one entity stream.
///
/// A failed window is re-read from the same boundary with linear backoff. When
/// the attempts are exhausted the error is yielded once and the stream ends.
pub struct ChunkIter<'a> {
    reader: &'a SourceReader,
    entity: EntityKind,
    chunk_size: usize,
    after: Option<ChunkKey>,
    remaining: Option<u64>,
    index: usize,
    done: bool,
    read_attempts: usize,
    retry_delay_ms: u64,
}

impl<'a> ChunkIter<'a> {
    /// Stop after `limit` rows in total (sample runs).
    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.remaining = limit;
        self
    }

    pub fn retries(mut self, attempts: usize, delay_ms: u64) -> Self {
        self.read_attempts = attempts.max(1);
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Resume strictly after a boundary recorded by an earlier run.
    pub fn resume_after(mut self, key: ChunkKey) -> Self {
        self.after = Some(key);
        self
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let want = match self.remaining {
            Some(0) => {
                self.done = true;
                return None;
            }
            Some(r) => (r as usize).min(self.chunk_size),
            None => self.chunk_size,
        };

        maybe_throttle_low_memory(0.10);

        let mut last_err = None;
        for attempt in 0..self.read_attempts {
            match self.reader.read_window(self.entity, self.after.as_ref(), want) {
                Ok((rows, last_key)) => {
                    if rows.is_empty() {
                        self.done = true;
                        return None;
                    }
                    if let Some(r) = self.remaining.as_mut() {
                        *r = r.saturating_sub(rows.len() as u64);
                    }
                    if rows.len() < want {
                        self.done = true;
                    }
                    self.after = last_key.clone();
                    let chunk = Chunk { entity: self.entity, index: self.index, rows, last_key };
                    self.index += 1;
                    return Some(Ok(chunk));
                }
                Err(e) => {
                    tracing::warn!(
                        "Read of {} window {} failed (attempt {}/{}): {:#}",
                        self.entity,
                        self.index,
                        attempt + 1,
                        self.read_attempts,
                        e
                    );
                    last_err = Some(e);
                    sleep(Duration::from_millis(self.retry_delay_ms.saturating_mul((attempt + 1) as u64)));
                }
            }
        }
        self.done = true;
        last_err.map(Err)
    }
}
