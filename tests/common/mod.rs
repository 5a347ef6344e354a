use reddit_hybrid::{
    Collection, DocumentStore, IndexOutcome, IndexSpec, MemoryStore, StoreError, UpsertIntent,
};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const NORMALIZED_SCHEMA: &str = "
    CREATE TABLE users (author TEXT, author_flair_text TEXT, author_flair_css_class TEXT);
    CREATE TABLE subreddit (subreddit_id TEXT, subreddit TEXT);
    CREATE TABLE post (link_id TEXT, subreddit_id TEXT, author TEXT, created_utc INTEGER,
                       archived INTEGER, gilded INTEGER, edited INTEGER);
    CREATE TABLE post_link (link_id TEXT, retrieved_on INTEGER);
    CREATE TABLE comment (id TEXT, body TEXT, author TEXT, link_id TEXT, parent_id TEXT,
                          created_utc INTEGER, retrieved_on INTEGER, score INTEGER, ups INTEGER,
                          downs INTEGER, score_hidden INTEGER, gilded INTEGER,
                          controversiality INTEGER, edited INTEGER);
    CREATE TABLE moderation (target_id TEXT, subreddit_id TEXT, target_type TEXT,
                             removal_reason TEXT, distinguished TEXT);
";

/// Empty normalized source at `<tmp>/reddit.sqlite`. Returns the file path.
pub fn new_normalized_db() -> (PathBuf, Connection) {
    let dir = tempfile::tempdir().unwrap().into_path();
    let path = dir.join("reddit.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(NORMALIZED_SCHEMA).unwrap();
    (path, conn)
}

pub fn add_user(conn: &Connection, author: &str, flair: Option<&str>) {
    conn.execute("INSERT INTO users VALUES (?1, ?2, NULL)", params![author, flair]).unwrap();
}

pub fn add_subreddit(conn: &Connection, id: &str, name: &str) {
    conn.execute("INSERT INTO subreddit VALUES (?1, ?2)", params![id, name]).unwrap();
}

pub fn add_post(conn: &Connection, link_id: &str, subreddit_id: &str, author: &str, created_utc: i64) {
    conn.execute(
        "INSERT INTO post VALUES (?1, ?2, ?3, ?4, 0, 0, 0)",
        params![link_id, subreddit_id, author, created_utc],
    )
    .unwrap();
    conn.execute("INSERT INTO post_link VALUES (?1, ?2)", params![link_id, created_utc + 3600]).unwrap();
}

/// `parent_id` NULL means top-level in the normalized schema.
pub fn add_comment(conn: &Connection, id: &str, link_id: &str, parent_id: Option<&str>, author: &str, body: &str, created_utc: i64) {
    conn.execute(
        "INSERT INTO comment VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 1, 0, 0, 0, 0, 0)",
        params![id, body, author, link_id, parent_id, created_utc, created_utc + 60],
    )
    .unwrap();
}

pub fn add_moderation(conn: &Connection, target_id: &str, subreddit_id: Option<&str>, target_type: Option<&str>, removal_reason: Option<&str>) {
    conn.execute(
        "INSERT INTO moderation VALUES (?1, ?2, ?3, ?4, NULL)",
        params![target_id, subreddit_id, target_type, removal_reason],
    )
    .unwrap();
}

/// The reference dataset used across tests:
/// - users alice, bob, carol and the pseudo author `[deleted]`
/// - subreddit t5_x (programming)
/// - post t3_p1 by bob with comments c1 (top), c2 (reply to c1), c3 (top, NULL parent)
/// - post t3_p2 by alice with no comments
/// - comment c9 on the nonexistent post t3_missing (orphan)
/// - moderation: c1 and t3_p1 resolve; c2 names an unknown subreddit; t1_zz names an unknown comment
pub fn make_source_basic() -> PathBuf {
    let (path, conn) = new_normalized_db();
    add_user(&conn, "alice", Some("rustacean"));
    add_user(&conn, "bob", None);
    add_user(&conn, "carol", None);
    add_user(&conn, "[deleted]", None);

    add_subreddit(&conn, "t5_x", "programming");

    add_post(&conn, "t3_p1", "t5_x", "bob", 1_430_438_400);
    add_post(&conn, "t3_p2", "t5_x", "alice", 1_430_438_500);

    add_comment(&conn, "c1", "t3_p1", Some("t3_p1"), "alice", "first", 1_430_438_600);
    add_comment(&conn, "c2", "t3_p1", Some("t1_c1"), "carol", "reply to alice", 1_430_438_700);
    add_comment(&conn, "c3", "t3_p1", None, "[deleted]", "[deleted]", 1_430_438_800);
    add_comment(&conn, "c9", "t3_missing", Some("t3_missing"), "bob", "lost", 1_430_438_900);

    add_moderation(&conn, "t1_c1", Some("t5_x"), Some("comment"), Some("spam"));
    add_moderation(&conn, "t3_p1", Some("t5_x"), None, Some("off-topic"));
    add_moderation(&conn, "t1_c2", Some("t5_missing"), Some("comment"), Some("rule 1"));
    add_moderation(&conn, "t1_zz", Some("t5_x"), Some("comment"), Some("rule 2"));
    path
}

/// Single-table dump (`May2015`) with the raw comment columns.
pub fn make_source_flat() -> PathBuf {
    let dir = tempfile::tempdir().unwrap().into_path();
    let path = dir.join("may2015.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE May2015 (
            created_utc INTEGER, ups INTEGER, subreddit_id TEXT, link_id TEXT, name TEXT,
            score_hidden INTEGER, author_flair_css_class TEXT, author_flair_text TEXT,
            subreddit TEXT, id TEXT, removal_reason TEXT, gilded INTEGER, downs INTEGER,
            archived INTEGER, author TEXT, score INTEGER, retrieved_on INTEGER, body TEXT,
            distinguished TEXT, edited INTEGER, controversiality INTEGER, parent_id TEXT
        );",
    )
    .unwrap();
    let mut insert = conn
        .prepare(
            "INSERT INTO May2015 (created_utc, ups, subreddit_id, link_id, name, score_hidden,
                author_flair_css_class, author_flair_text, subreddit, id, removal_reason, gilded, downs,
                archived, author, score, retrieved_on, body, distinguished, edited, controversiality, parent_id)
             VALUES (?1, ?2, 't5_2qh1i', ?3, 't1_' || ?4, 0, NULL, ?5, 'AskReddit', ?4, ?6, 0, 0,
                     0, ?7, ?2, ?8, ?9, ?10, ?11, 0, ?12)",
        )
        .unwrap();
    insert
        .execute(params![1_430_438_400i64, 5, "t3_a", "f1", "flair", None::<String>, "alice", 1_432_000_000i64, "hello", None::<String>, 0, "t3_a"])
        .unwrap();
    insert
        .execute(params![1_430_438_500i64, 2, "t3_a", "f2", None::<String>, None::<String>, "bob", 1_432_000_100i64, "mod note", Some("moderator"), 1_430_500_000i64, "t1_f1"])
        .unwrap();
    insert
        .execute(params![1_430_438_600i64, 0, "t3_b", "f3", None::<String>, Some("legal"), "[deleted]", 1_432_000_200i64, "[removed]", None::<String>, 0, "t3_b"])
        .unwrap();
    path
}

/// Every document of a collection keyed by `_id`.
pub fn snapshot(store: &dyn DocumentStore, collection: Collection) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    store
        .for_each(collection, &mut |k, v| {
            out.insert(k.to_string(), v.clone());
            Ok(())
        })
        .unwrap();
    out
}

/// Snapshot of all five collections.
pub fn snapshot_all(store: &dyn DocumentStore) -> BTreeMap<Collection, BTreeMap<String, Value>> {
    Collection::ALL.iter().map(|&c| (c, snapshot(store, c))).collect()
}

/// Ids of the comments embedded in a stored post, in embedded order.
pub fn embedded_ids(store: &dyn DocumentStore, post_id: &str) -> Vec<String> {
    let post = store.get(Collection::Posts, post_id).unwrap().unwrap();
    post["comments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["_id"].as_str().unwrap().to_string())
        .collect()
}

pub fn intent(key: &str, body: &str) -> UpsertIntent {
    UpsertIntent { key: key.to_string(), json: serde_json::json!({ "_id": key, "body": body }).to_string() }
}

/// Read a JSONL file into values (skips empty lines).
pub fn read_jsonl_values(path: &Path) -> Vec<Value> {
    let f = File::open(path).unwrap();
    BufReader::new(f)
        .lines()
        .map(|l| l.unwrap())
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s).unwrap())
        .collect()
}

/// Decompress a `.zst` file and collect its non-empty lines.
pub fn decompress_zst_lines(path: &Path) -> Vec<String> {
    let f = File::open(path).unwrap();
    let dec = zstd::stream::read::Decoder::new(f).unwrap();
    BufReader::new(dec).lines().map(|l| l.unwrap()).filter(|s| !s.is_empty()).collect()
}

/// Store wrapper that fails the first `transient_failures` upserts with a
/// transient error, and every upsert containing `poison_key` permanently.
/// `failing_splices(n)` also rejects the first `n` post upserts that carry
/// embedded comments.
pub struct FlakyStore {
    pub inner: MemoryStore,
    transient_left: AtomicUsize,
    poison_key: Option<String>,
    splices_left: AtomicUsize,
    pub upsert_calls: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl FlakyStore {
    pub fn new(transient_failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            transient_left: AtomicUsize::new(transient_failures),
            poison_key: None,
            splices_left: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn poisoned(mut self, key: &str) -> Self {
        self.poison_key = Some(key.to_string());
        self
    }

    pub fn failing_splices(self, n: usize) -> Self {
        self.splices_left.store(n, Ordering::SeqCst);
        self
    }
}

impl DocumentStore for FlakyStore {
    fn upsert_many(&self, collection: Collection, docs: &[UpsertIntent]) -> Result<(), StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(docs.len());
        if let Some(p) = &self.poison_key {
            if docs.iter().any(|d| &d.key == p) {
                return Err(StoreError::Permanent(format!("poisoned key {p}")));
            }
        }
        if collection == Collection::Posts && docs.iter().any(|d| d.json.contains("\"comments\":[{")) {
            let left = self.splices_left.load(Ordering::SeqCst);
            if left > 0 {
                self.splices_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Permanent("post rejected".into()));
            }
        }
        let left = self.transient_left.load(Ordering::SeqCst);
        if left > 0 {
            self.transient_left.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("database is locked".into()));
        }
        self.inner.upsert_many(collection, docs)
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(collection, key)
    }

    fn existing_keys(&self, collection: Collection, keys: &[&str]) -> Result<ahash::AHashSet<String>, StoreError> {
        self.inner.existing_keys(collection, keys)
    }

    fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        self.inner.count(collection)
    }

    fn for_each(&self, collection: Collection, f: &mut dyn FnMut(&str, &Value) -> anyhow::Result<()>) -> anyhow::Result<()> {
        self.inner.for_each(collection, f)
    }

    fn drop_collection(&self, collection: Collection) -> Result<(), StoreError> {
        self.inner.drop_collection(collection)
    }

    fn ensure_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, StoreError> {
        self.inner.ensure_index(spec)
    }
}
