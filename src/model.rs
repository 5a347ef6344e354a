//! Document shapes produced by the migration, plus the entity/collection vocabulary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target collections in the document store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Users,
    Subreddits,
    Posts,
    Comments,
    Moderation,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Users,
        Collection::Subreddits,
        Collection::Posts,
        Collection::Comments,
        Collection::Moderation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Subreddits => "subreddits",
            Collection::Posts => "posts",
            Collection::Comments => "comments",
            Collection::Moderation => "moderation",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source entity streams, declared in dependency order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Subreddit,
    Post,
    Comment,
    Moderation,
}

impl EntityKind {
    /// Parents strictly before the children that reference them.
    pub const DEPENDENCY_ORDER: [EntityKind; 5] = [
        EntityKind::User,
        EntityKind::Subreddit,
        EntityKind::Post,
        EntityKind::Comment,
        EntityKind::Moderation,
    ];

    pub fn collection(self) -> Collection {
        match self {
            EntityKind::User => Collection::Users,
            EntityKind::Subreddit => Collection::Subreddits,
            EntityKind::Post => Collection::Posts,
            EntityKind::Comment => Collection::Comments,
            EntityKind::Moderation => Collection::Moderation,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Subreddit => "subreddits",
            EntityKind::Post => "posts",
            EntityKind::Comment => "comments",
            EntityKind::Moderation => "moderation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A document that lives in exactly one collection under its natural key.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;

    fn key(&self) -> &str;

    /// Drop the last embedded child. Returns false when there is nothing left
    /// to shed (documents without embedded children never shrink).
    fn shed_embedded(&mut self) -> bool {
        false
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserDoc {
    #[serde(rename = "_id")]
    pub author: String,
    pub author_flair_text: Option<String>,
    pub author_flair_css_class: Option<String>,
}

impl Document for UserDoc {
    const COLLECTION: Collection = Collection::Users;
    fn key(&self) -> &str {
        &self.author
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubredditDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: Option<String>,
}

impl Document for SubredditDoc {
    const COLLECTION: Collection = Collection::Subreddits;
    fn key(&self) -> &str {
        &self.id
    }
}

/// Subreddit snapshot carried on each post.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubredditRef {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub subreddit: SubredditRef,
    pub author: Option<String>,
    pub created_utc: Option<i64>,
    pub archived: bool,
    pub gilded: Option<i64>,
    pub edited: bool,
    pub edited_utc: Option<i64>,
    pub retrieved_on: Option<i64>,
    pub comment_count: u64,
    pub embedded_count: u64,
    /// Fewer than `min(cap, comment_count)` comments are embedded because the
    /// byte budget sealed the post or the writer shed snapshots to fit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub embed_truncated: bool,
    /// Bounded snapshot cache of canonical comments; never authoritative.
    #[serde(default)]
    pub comments: Vec<CommentDoc>,
}

impl Document for PostDoc {
    const COLLECTION: Collection = Collection::Posts;
    fn key(&self) -> &str {
        &self.id
    }
    fn shed_embedded(&mut self) -> bool {
        if self.comments.pop().is_some() {
            self.embedded_count = self.comments.len() as u64;
            self.embed_truncated = true;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommentDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub post_id: Option<String>,
    /// Raw parent fullname as found in the source (`t3_…`, `t1_…`, or absent).
    pub parent_id: Option<String>,
    pub author: Option<String>,
    pub body: Option<String>,
    pub created_utc: Option<i64>,
    pub retrieved_on: Option<i64>,
    pub score: Option<i64>,
    pub ups: Option<i64>,
    pub downs: Option<i64>,
    pub score_hidden: bool,
    pub gilded: Option<i64>,
    pub controversiality: Option<i64>,
    pub edited: bool,
    pub edited_utc: Option<i64>,
    pub distinguished: Option<String>,
}

impl Document for CommentDoc {
    const COLLECTION: Collection = Collection::Comments;
    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Post,
    Comment,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModerationDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub target_type: TargetKind,
    pub target_id: String,
    pub subreddit_id: String,
    pub removal_reason: Option<String>,
    pub distinguished: Option<String>,
    pub action_utc: Option<i64>,
}

impl ModerationDoc {
    pub fn composite_key(target_id: &str, subreddit_id: &str) -> String {
        format!("{target_id}_{subreddit_id}")
    }
}

impl Document for ModerationDoc {
    const COLLECTION: Collection = Collection::Moderation;
    fn key(&self) -> &str {
        &self.id
    }
}
