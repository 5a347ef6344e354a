//! Post-load verification of the hybrid model's invariants against any store.
//!
//! Checks: per-post embedded bookkeeping against the cap (a post holds exactly
//! `min(cap, comment_count)` snapshots unless it was truncated), embedded snapshots
//! against their canonical comments, and moderation references. Orphan
//! comments are counted, not flagged; they are expected.

use crate::model::{Collection, PostDoc};
use crate::store::DocumentStore;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

const LOOKUP_BATCH: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditViolation {
    /// `embedded_count` disagrees with the embedded list, or exceeds the cap.
    EmbeddedCount { post_id: String, embedded_count: u64, embedded_len: u64 },
    OverCap { post_id: String, embedded_len: u64, cap: u64 },
    /// Fewer comments counted than embedded.
    CommentCount { post_id: String, comment_count: u64, embedded_count: u64 },
    /// Fewer embedded than `min(cap, comment_count)` on a post not marked truncated.
    CapShortfall { post_id: String, embedded_count: u64, expected: u64 },
    /// Embedded snapshot with no canonical counterpart.
    MissingCanonical { post_id: String, comment_id: String },
    /// Embedded snapshot whose fields differ from the canonical comment.
    SnapshotMismatch { post_id: String, comment_id: String },
    /// Embedded under a post it does not belong to.
    ForeignComment { post_id: String, comment_id: String },
    UnresolvedSubreddit { moderation_id: String, subreddit_id: String },
    UnresolvedTarget { moderation_id: String, target_id: String },
    /// Document that does not decode as its collection's shape.
    Malformed { collection: Collection, key: String },
}

impl fmt::Display for AuditViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditViolation::EmbeddedCount { post_id, embedded_count, embedded_len } => {
                write!(f, "post {post_id}: embedded_count={embedded_count} but {embedded_len} embedded")
            }
            AuditViolation::OverCap { post_id, embedded_len, cap } => {
                write!(f, "post {post_id}: {embedded_len} embedded exceeds cap {cap}")
            }
            AuditViolation::CommentCount { post_id, comment_count, embedded_count } => {
                write!(f, "post {post_id}: comment_count={comment_count} < embedded_count={embedded_count}")
            }
            AuditViolation::CapShortfall { post_id, embedded_count, expected } => {
                write!(f, "post {post_id}: {embedded_count} embedded, expected {expected}")
            }
            AuditViolation::MissingCanonical { post_id, comment_id } => {
                write!(f, "post {post_id}: embedded comment {comment_id} has no canonical document")
            }
            AuditViolation::SnapshotMismatch { post_id, comment_id } => {
                write!(f, "post {post_id}: embedded comment {comment_id} differs from canonical")
            }
            AuditViolation::ForeignComment { post_id, comment_id } => {
                write!(f, "post {post_id}: embedded comment {comment_id} belongs to another post")
            }
            AuditViolation::UnresolvedSubreddit { moderation_id, subreddit_id } => {
                write!(f, "moderation {moderation_id}: subreddit {subreddit_id} not found")
            }
            AuditViolation::UnresolvedTarget { moderation_id, target_id } => {
                write!(f, "moderation {moderation_id}: target {target_id} not found")
            }
            AuditViolation::Malformed { collection, key } => write!(f, "{collection} `{key}` is malformed"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditReport {
    pub posts_checked: u64,
    pub embedded_checked: u64,
    pub moderation_checked: u64,
    pub orphan_comments: u64,
    pub violations: Vec<AuditViolation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Verify `store` against an embed cap.
pub fn audit(store: &dyn DocumentStore, cap: usize) -> Result<AuditReport> {
    let mut report = AuditReport::default();
    audit_posts(store, cap as u64, &mut report)?;
    report.orphan_comments = count_orphans(store)?;
    audit_moderation(store, &mut report)?;

    if report.is_clean() {
        tracing::info!(
            "Audit clean: {} posts, {} embedded, {} moderation, {} orphan comment(s)",
            report.posts_checked,
            report.embedded_checked,
            report.moderation_checked,
            report.orphan_comments
        );
    } else {
        for v in report.violations.iter().take(20) {
            tracing::warn!("Audit: {}", v);
        }
        tracing::warn!("Audit found {} violation(s)", report.violations.len());
    }
    Ok(report)
}

fn audit_posts(store: &dyn DocumentStore, cap: u64, report: &mut AuditReport) -> Result<()> {
    store.for_each(Collection::Posts, &mut |key, doc| {
        report.posts_checked += 1;
        let Ok(post) = serde_json::from_value::<PostDoc>(doc.clone()) else {
            report.violations.push(AuditViolation::Malformed { collection: Collection::Posts, key: key.to_string() });
            return Ok(());
        };
        let len = post.comments.len() as u64;
        if post.embedded_count != len {
            report.violations.push(AuditViolation::EmbeddedCount {
                post_id: post.id.clone(),
                embedded_count: post.embedded_count,
                embedded_len: len,
            });
        }
        if len > cap {
            report.violations.push(AuditViolation::OverCap { post_id: post.id.clone(), embedded_len: len, cap });
        }
        if post.comment_count < post.embedded_count {
            report.violations.push(AuditViolation::CommentCount {
                post_id: post.id.clone(),
                comment_count: post.comment_count,
                embedded_count: post.embedded_count,
            });
        }
        let expected = cap.min(post.comment_count);
        if !post.embed_truncated && len < expected {
            report.violations.push(AuditViolation::CapShortfall {
                post_id: post.id.clone(),
                embedded_count: len,
                expected,
            });
        }
        if post.comments.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = post.comments.iter().map(|c| c.id.as_str()).collect();
        let canonical = store.get_many(Collection::Comments, &ids)?;
        let embedded = doc.get("comments").and_then(Value::as_array).cloned().unwrap_or_default();
        for (snapshot, raw) in post.comments.iter().zip(embedded.iter()) {
            report.embedded_checked += 1;
            if snapshot.post_id.as_deref() != Some(post.id.as_str()) {
                report.violations.push(AuditViolation::ForeignComment {
                    post_id: post.id.clone(),
                    comment_id: snapshot.id.clone(),
                });
            }
            match canonical.get(&snapshot.id) {
                None => report.violations.push(AuditViolation::MissingCanonical {
                    post_id: post.id.clone(),
                    comment_id: snapshot.id.clone(),
                }),
                Some(c) if c != raw => report.violations.push(AuditViolation::SnapshotMismatch {
                    post_id: post.id.clone(),
                    comment_id: snapshot.id.clone(),
                }),
                Some(_) => {}
            }
        }
        Ok(())
    })
}

fn count_orphans(store: &dyn DocumentStore) -> Result<u64> {
    let mut pending: Vec<String> = Vec::with_capacity(LOOKUP_BATCH);
    let mut orphans = 0u64;
    let flush = |pending: &mut Vec<String>| -> Result<u64> {
        let refs: Vec<&str> = pending.iter().map(String::as_str).collect();
        let found = store.existing_keys(Collection::Posts, &refs)?;
        let missing = pending.iter().filter(|p| !found.contains(p.as_str())).count() as u64;
        pending.clear();
        Ok(missing)
    };
    store.for_each(Collection::Comments, &mut |_, doc| {
        match doc.get("post_id").and_then(Value::as_str) {
            Some(p) => pending.push(p.to_string()),
            None => orphans += 1,
        }
        if pending.len() >= LOOKUP_BATCH {
            orphans += flush(&mut pending)?;
        }
        Ok(())
    })?;
    if !pending.is_empty() {
        orphans += flush(&mut pending)?;
    }
    Ok(orphans)
}

fn audit_moderation(store: &dyn DocumentStore, report: &mut AuditReport) -> Result<()> {
    let mut rows: Vec<(String, String, String, String)> = Vec::new();
    store.for_each(Collection::Moderation, &mut |key, doc| {
        let field = |f: &str| doc.get(f).and_then(Value::as_str).unwrap_or_default().to_string();
        rows.push((key.to_string(), field("subreddit_id"), field("target_type"), field("target_id")));
        Ok(())
    })?;
    report.moderation_checked = rows.len() as u64;

    for batch in rows.chunks(LOOKUP_BATCH) {
        let subs: Vec<&str> = batch.iter().map(|r| r.1.as_str()).collect();
        let found_subs = store.existing_keys(Collection::Subreddits, &subs)?;
        let posts: Vec<&str> = batch.iter().filter(|r| r.2 == "post").map(|r| r.3.as_str()).collect();
        let found_posts = store.existing_keys(Collection::Posts, &posts)?;
        let comments: Vec<&str> = batch.iter().filter(|r| r.2 == "comment").map(|r| r.3.as_str()).collect();
        let found_comments = store.existing_keys(Collection::Comments, &comments)?;

        for (id, sub, kind, target) in batch {
            if !found_subs.contains(sub) {
                report.violations.push(AuditViolation::UnresolvedSubreddit {
                    moderation_id: id.clone(),
                    subreddit_id: sub.clone(),
                });
            }
            let resolved = match kind.as_str() {
                "post" => found_posts.contains(target),
                "comment" => found_comments.contains(target),
                _ => false,
            };
            if !resolved {
                report.violations.push(AuditViolation::UnresolvedTarget {
                    moderation_id: id.clone(),
                    target_id: target.clone(),
                });
            }
        }
    }
    Ok(())
}
