#[path = "common/mod.rs"]
mod common;

use common::*;
use reddit_hybrid::{
    ChunkKey, EntityKind, ExportFormat, FatalError, MigrateOptions, RawValue, SourceLayout, SourceReader, TargetSpec,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn keys(reader: &SourceReader, entity: EntityKind, chunk: usize, column: &str) -> Vec<Vec<String>> {
    reader
        .chunks(entity, chunk)
        .map(|c| {
            c.unwrap()
                .rows
                .iter()
                .map(|r| match r.get(column) {
                    RawValue::Text(s) => s.clone(),
                    other => format!("{other:?}"),
                })
                .collect()
        })
        .collect()
}

#[test]
fn windows_follow_key_order() {
    let source = make_source_basic();
    let reader = SourceReader::open(&source, SourceLayout::Normalized).unwrap();
    reader.check_schema().unwrap();

    assert_eq!(
        keys(&reader, EntityKind::User, 3, "author"),
        vec![vec!["[deleted]", "alice", "bob"], vec!["carol"]]
    );
    assert_eq!(keys(&reader, EntityKind::Comment, 10, "id"), vec![vec!["c1", "c2", "c3", "c9"]]);
    assert_eq!(reader.count(EntityKind::Comment).unwrap(), 4);
}

#[test]
fn composite_keys_page_without_gaps() {
    let (path, conn) = new_normalized_db();
    add_moderation(&conn, "t1_a", Some("t5_y"), None, None);
    add_moderation(&conn, "t1_a", Some("t5_x"), None, None);
    add_moderation(&conn, "t1_a", None, None, None);
    add_moderation(&conn, "t1_b", Some("t5_x"), None, None);
    drop(conn);

    let reader = SourceReader::open(&path, SourceLayout::Normalized).unwrap();
    let chunks: Vec<_> = reader.chunks(EntityKind::Moderation, 1).map(|c| c.unwrap()).collect();
    let seen: Vec<(RawValue, RawValue)> = chunks
        .iter()
        .map(|c| (c.rows[0].get("target_id").clone(), c.rows[0].get("subreddit_id").clone()))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("t1_a".into(), RawValue::Null),
            ("t1_a".into(), "t5_x".into()),
            ("t1_a".into(), "t5_y".into()),
            ("t1_b".into(), "t5_x".into()),
        ]
    );
    assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(chunks[1].last_key, Some(ChunkKey(vec!["t1_a".into(), "t5_x".into()])));
}

#[test]
fn resume_and_limit_bound_the_stream() {
    let source = make_source_basic();
    let reader = SourceReader::open(&source, SourceLayout::Normalized).unwrap();

    let resumed: Vec<_> = reader
        .chunks(EntityKind::Comment, 10)
        .resume_after(ChunkKey(vec!["c2".into()]))
        .map(|c| c.unwrap().rows.len())
        .collect();
    assert_eq!(resumed, vec![2]);

    let limited: Vec<usize> = reader
        .chunks(EntityKind::User, 2)
        .limit(Some(3))
        .map(|c| c.unwrap().rows.len())
        .collect();
    assert_eq!(limited, vec![2, 1]);

    assert_eq!(reader.chunks(EntityKind::User, 2).limit(Some(0)).count(), 0);
}

#[test]
fn null_keys_are_counted_not_read() {
    let (path, conn) = new_normalized_db();
    add_comment(&conn, "c1", "t3_p", Some("t3_p"), "alice", "x", 1);
    conn.execute("INSERT INTO comment (id, body) VALUES (NULL, 'keyless')", []).unwrap();
    drop(conn);

    let reader = SourceReader::open(&path, SourceLayout::Normalized).unwrap();
    assert_eq!(reader.null_key_rows(EntityKind::Comment).unwrap(), 1);
    assert_eq!(reader.count(EntityKind::Comment).unwrap(), 1);
    assert_eq!(keys(&reader, EntityKind::Comment, 5, "id"), vec![vec!["c1"]]);
}

#[test]
fn opening_a_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = SourceReader::open(dir.path(), SourceLayout::Normalized).err().unwrap();
    assert!(matches!(err, FatalError::SourceMissing(_)), "{err}");

    let err = SourceReader::open(&dir.path().join("nope.sqlite"), SourceLayout::Normalized).err().unwrap();
    assert!(matches!(err, FatalError::SourceMissing(_)));
}

#[test]
fn directories_resolve_to_their_sqlite_file() {
    let source = make_source_basic();
    let reader = SourceReader::open(source.parent().unwrap(), SourceLayout::Normalized).unwrap();
    assert_eq!(reader.path(), source.as_path());
}

#[test]
fn options_load_from_variables() {
    let vars: HashMap<&str, &str> = [
        ("MIGRATE_SOURCE", "/data/reddit.sqlite"),
        ("MIGRATE_LAYOUT", "flat:May2015"),
        ("MIGRATE_TARGET", "sqlite:/tmp/out.sqlite"),
        ("MIGRATE_CHUNK_SIZE", "500"),
        ("MIGRATE_EMBED_CAP", "0"),
        ("MIGRATE_RESET", "yes"),
        ("MIGRATE_LIMIT", "10"),
        ("MIGRATE_AUDIT", "true"),
        ("MIGRATE_EXPORT_DIR", "/tmp/export"),
        ("MIGRATE_EXPORT_FORMAT", "jsonl"),
        ("MIGRATE_PROGRESS", " "),
    ]
    .into_iter()
    .collect();
    let o = MigrateOptions::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

    assert_eq!(o.source, PathBuf::from("/data/reddit.sqlite"));
    assert_eq!(o.layout, SourceLayout::Flat { table: "May2015".into() });
    assert_eq!(o.target, TargetSpec::Sqlite("/tmp/out.sqlite".into()));
    assert_eq!((o.chunk_size, o.embed_cap, o.limit), (500, 0, Some(10)));
    assert!(o.reset && o.audit && !o.progress);
    assert_eq!(o.export_dir, Some(PathBuf::from("/tmp/export")));
    assert_eq!(o.export_format, ExportFormat::Jsonl);
    assert_eq!(o.batch_size, 1000);
    o.validate().unwrap();
}

#[test]
fn bad_options_are_rejected() {
    let bad = |k: &'static str, v: &'static str| {
        MigrateOptions::from_lookup(move |q| (q == k).then(|| v.to_string())).unwrap_err()
    };
    assert!(matches!(bad("MIGRATE_CHUNK_SIZE", "-5"), FatalError::InvalidOption(_)));
    assert!(matches!(bad("MIGRATE_RESET", "maybe"), FatalError::InvalidOption(_)));
    assert!(matches!(bad("MIGRATE_LAYOUT", "columnar"), FatalError::InvalidOption(_)));

    assert!(MigrateOptions::default().with_chunk_size(0).validate().is_err());
    assert!(MigrateOptions::default().with_batch_size(0).validate().is_err());
    assert!(MigrateOptions::default().with_max_document_bytes(10).validate().is_err());
    assert!(MigrateOptions::default().validate().is_ok());
}

#[test]
fn target_descriptors_parse() {
    assert_eq!("memory".parse::<TargetSpec>().unwrap(), TargetSpec::Memory);
    assert_eq!("docs.sqlite".parse::<TargetSpec>().unwrap(), TargetSpec::Sqlite("docs.sqlite".into()));
    assert!("sqlite:".parse::<TargetSpec>().is_err());
    assert!("".parse::<TargetSpec>().is_err());
}

#[test]
fn duplicate_keys_are_counted() {
    let (path, conn) = new_normalized_db();
    add_moderation(&conn, "t1_a", Some("t5_x"), None, None);
    add_moderation(&conn, "t1_a", Some("t5_x"), None, Some("spam"));
    add_moderation(&conn, "t1_a", None, None, None);
    add_comment(&conn, "c1", "t3_p", None, "alice", "x", 1);
    drop(conn);

    let reader = SourceReader::open(&path, SourceLayout::Normalized).unwrap();
    assert_eq!(reader.duplicate_key_rows(EntityKind::Moderation).unwrap(), 1);
    assert_eq!(reader.duplicate_key_rows(EntityKind::Comment).unwrap(), 0);
    assert_eq!(reader.chunks(EntityKind::Moderation, 1).count(), 2);
}

/// Comment markers and moderation timestamps come from joins, so reading a
/// large source stays linear in its size.
#[test]
fn large_sources_stream_without_per_row_lookups() {
    const N: usize = 20_000;
    let (path, mut conn) = new_normalized_db();
    let tx = conn.transaction().unwrap();
    for i in 0..N {
        let id = format!("c{i:06}");
        add_comment(&tx, &id, "t3_p", None, "alice", "body", 1_430_438_400 + i as i64);
        let mark = if i % 100 == 0 { Some("moderator") } else { None };
        tx.execute(
            "INSERT INTO moderation VALUES (?1, 't5_x', 'comment', NULL, ?2)",
            rusqlite::params![format!("t1_{id}"), mark],
        )
        .unwrap();
    }
    tx.commit().unwrap();
    drop(conn);

    let reader = SourceReader::open(&path, SourceLayout::Normalized).unwrap();
    let started = Instant::now();
    let mut comments = 0;
    let mut marked = 0;
    for chunk in reader.chunks(EntityKind::Comment, 5000) {
        for row in chunk.unwrap().rows {
            comments += 1;
            if row.get("distinguished") == &RawValue::from("moderator") {
                marked += 1;
            }
        }
    }
    let mut actions = 0;
    for chunk in reader.chunks(EntityKind::Moderation, 5000) {
        for row in chunk.unwrap().rows {
            assert!(matches!(row.get("action_utc"), RawValue::Integer(_)));
            actions += 1;
        }
    }
    let elapsed = started.elapsed();

    assert_eq!((comments, actions), (N, N));
    assert_eq!(marked, N / 100);
    assert!(elapsed < Duration::from_secs(15), "reading took {elapsed:?}");
}
