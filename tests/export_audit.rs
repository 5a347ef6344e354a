#[path = "common/mod.rs"]
mod common;

use common::*;
use reddit_hybrid::{
    audit, export_all, export_collection, AuditViolation, Collection, DocumentStore, ExportFormat, MemoryStore,
    RedditMigration, SourceLayout, SourceReader, UpsertIntent,
};
use serde_json::{json, Value};

fn migrated() -> MemoryStore {
    let source = make_source_basic();
    let reader = SourceReader::open(&source, SourceLayout::Normalized).unwrap();
    let store = MemoryStore::new();
    RedditMigration::new().embed_cap(2).run(&reader, &store).unwrap();
    store
}

fn put(store: &MemoryStore, collection: Collection, doc: Value) {
    let key = doc["_id"].as_str().unwrap().to_string();
    store.upsert_many(collection, &[UpsertIntent { key, json: doc.to_string() }]).unwrap();
}

#[test]
fn jsonl_export_lists_documents_in_key_order() {
    let store = migrated();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("nested").join("comments.jsonl");

    let n = export_collection(&store, Collection::Comments, &out, ExportFormat::Jsonl).unwrap();
    assert_eq!(n, 4);
    let lines = read_jsonl_values(&out);
    let ids: Vec<&str> = lines.iter().map(|v| v["_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3", "c9"]);
    assert_eq!(lines[1]["parent_id"], "t1_c1");
    assert!(!out.with_extension("tmp").exists());
}

#[test]
fn zst_export_decompresses_to_the_same_documents() {
    let store = migrated();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("posts.jsonl.zst");

    assert_eq!(export_collection(&store, Collection::Posts, &out, ExportFormat::Zst).unwrap(), 2);
    let lines = decompress_zst_lines(&out);
    assert_eq!(lines.len(), 2);
    let p1: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(p1, store.get(Collection::Posts, "t3_p1").unwrap().unwrap());
    assert!(!out.with_extension("tmp").exists());
}

#[test]
fn export_all_writes_one_file_per_collection() {
    let store = migrated();
    let dir = tempfile::tempdir().unwrap();
    let written = export_all(&store, dir.path(), ExportFormat::Jsonl).unwrap();

    assert_eq!(written.len(), Collection::ALL.len());
    for (collection, path, n) in written {
        assert_eq!(path, dir.path().join(format!("{}.jsonl", collection.name())));
        assert_eq!(n, store.count(collection).unwrap());
        assert_eq!(read_jsonl_values(&path).len() as u64, n);
    }
    assert!("zstd".parse::<ExportFormat>().is_ok());
    assert!("csv".parse::<ExportFormat>().is_err());
}

#[test]
fn audit_passes_a_fresh_load() {
    let store = migrated();
    let report = audit(&store, 2).unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(report.posts_checked, 2);
    assert_eq!(report.embedded_checked, 2);
    assert_eq!(report.moderation_checked, 2);
    assert_eq!(report.orphan_comments, 1);

    let strict = audit(&store, 1).unwrap();
    assert_eq!(
        strict.violations,
        vec![AuditViolation::OverCap { post_id: "t3_p1".into(), embedded_len: 2, cap: 1 }]
    );
}

#[test]
fn audit_flags_tampered_documents() {
    let store = migrated();

    let mut post = store.get(Collection::Posts, "t3_p1").unwrap().unwrap();
    post["embedded_count"] = json!(5);
    put(&store, Collection::Posts, post);

    let mut c1 = store.get(Collection::Comments, "c1").unwrap().unwrap();
    c1["body"] = json!("edited after load");
    put(&store, Collection::Comments, c1);

    put(
        &store,
        Collection::Moderation,
        json!({
            "_id": "t1_c2_t5_gone",
            "target_type": "comment",
            "target_id": "c2",
            "subreddit_id": "t5_gone",
            "removal_reason": null,
            "distinguished": null,
            "action_utc": null,
        }),
    );

    let report = audit(&store, 2).unwrap();
    let v = &report.violations;
    assert!(v.contains(&AuditViolation::EmbeddedCount {
        post_id: "t3_p1".into(),
        embedded_count: 5,
        embedded_len: 2
    }));
    assert!(v.contains(&AuditViolation::CommentCount {
        post_id: "t3_p1".into(),
        comment_count: 3,
        embedded_count: 5
    }));
    assert!(v.contains(&AuditViolation::SnapshotMismatch { post_id: "t3_p1".into(), comment_id: "c1".into() }));
    assert!(v.contains(&AuditViolation::UnresolvedSubreddit {
        moderation_id: "t1_c2_t5_gone".into(),
        subreddit_id: "t5_gone".into()
    }));
    assert!(!v.iter().any(|x| matches!(x, AuditViolation::UnresolvedTarget { .. })));

    let as_json = serde_json::to_value(&v[0]).unwrap();
    assert!(as_json.get("kind").is_some());
}

#[test]
fn audit_reports_undecodable_posts() {
    let store = migrated();
    put(&store, Collection::Posts, json!({ "_id": "t3_bad", "comments": "not a list" }));
    let report = audit(&store, 2).unwrap();
    assert_eq!(
        report.violations,
        vec![AuditViolation::Malformed { collection: Collection::Posts, key: "t3_bad".into() }]
    );
}

#[test]
fn audit_flags_posts_embedding_fewer_than_the_cap_allows() {
    let store = migrated();
    let mut post = store.get(Collection::Posts, "t3_p1").unwrap().unwrap();
    post["comments"].as_array_mut().unwrap().pop();
    post["embedded_count"] = json!(1);
    put(&store, Collection::Posts, post.clone());

    let report = audit(&store, 2).unwrap();
    assert_eq!(
        report.violations,
        vec![AuditViolation::CapShortfall { post_id: "t3_p1".into(), embedded_count: 1, expected: 2 }]
    );

    // Sealed or shed posts legitimately hold fewer.
    post["embed_truncated"] = json!(true);
    put(&store, Collection::Posts, post);
    assert!(audit(&store, 2).unwrap().is_clean());
}
