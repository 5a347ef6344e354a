//! Post-load index set. Creation is idempotent, so this runs on every load.

use crate::model::Collection;
use crate::store::DocumentStore;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub collection: Collection,
    pub name: &'static str,
    /// Dotted path into the document (`subreddit.id`).
    pub field: &'static str,
    pub unique: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    Created,
    AlreadyExists,
}

/// `_id` is unique and indexed by every store, so it is not listed.
pub const STANDARD_INDEXES: &[IndexSpec] = &[
    IndexSpec { collection: Collection::Posts, name: "posts_subreddit_id", field: "subreddit.id", unique: false },
    IndexSpec { collection: Collection::Posts, name: "posts_author", field: "author", unique: false },
    IndexSpec { collection: Collection::Comments, name: "comments_post_id", field: "post_id", unique: false },
    IndexSpec { collection: Collection::Comments, name: "comments_author", field: "author", unique: false },
    IndexSpec {
        collection: Collection::Moderation,
        name: "moderation_subreddit_id",
        field: "subreddit_id",
        unique: false,
    },
    IndexSpec { collection: Collection::Moderation, name: "moderation_target_id", field: "target_id", unique: false },
];

#[derive(Clone, Debug, Serialize)]
pub struct IndexReport {
    pub name: &'static str,
    pub collection: Collection,
    /// `None` when creation failed; the failure is logged.
    pub outcome: Option<IndexOutcome>,
}

/// Issue every standard index. Failures are reported, never fatal.
pub fn ensure_standard_indexes(store: &dyn DocumentStore) -> Vec<IndexReport> {
    STANDARD_INDEXES
        .iter()
        .map(|spec| {
            let outcome = match store.ensure_index(spec) {
                Ok(o) => {
                    tracing::debug!("Index {} on {}.{}: {:?}", spec.name, spec.collection, spec.field, o);
                    Some(o)
                }
                Err(e) => {
                    tracing::warn!("Index {} on {} failed: {}", spec.name, spec.collection, e);
                    None
                }
            };
            IndexReport { name: spec.name, collection: spec.collection, outcome }
        })
        .collect()
}
