//! SQL for each entity stream, per source layout.
//!
//! Every query aliases its columns to the canonical names the mapper reads,
//! so the mapper never needs to know which layout produced a row.

use crate::error::FatalError;
use crate::model::EntityKind;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// How the relational source is laid out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SourceLayout {
    #[default]
    /// `users`, `subreddit`, `post`, `post_link`, `comment`, `moderation`.
    Normalized,
    /// The raw single-table dump (one row per comment).
    Flat { table: String },
}

impl fmt::Display for SourceLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLayout::Normalized => f.write_str("normalized"),
            SourceLayout::Flat { table } => write!(f, "flat:{table}"),
        }
    }
}

impl FromStr for SourceLayout {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "normalized" | "" => Ok(SourceLayout::Normalized),
            "flat" => Ok(SourceLayout::Flat { table: "May2015".to_string() }),
            _ => match s.strip_prefix("flat:") {
                Some(t) if !t.is_empty() => Ok(SourceLayout::Flat { table: t.to_string() }),
                _ => Err(format!("unknown source layout `{s}` (expected normalized, flat or flat:<table>)")),
            },
        }
    }
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Keyset-paged query set for one entity stream.
#[derive(Clone, Debug)]
pub struct EntityQuery {
    pub entity: EntityKind,
    /// Canonical names of the ordering key columns (1 or 2).
    pub key_columns: &'static [&'static str],
    inner: String,
}

impl EntityQuery {
    fn key_list(&self) -> String {
        self.key_columns.join(", ")
    }

    /// First window: no lower bound. Binds `?1` = limit.
    pub fn first_page_sql(&self) -> String {
        format!(
            "SELECT * FROM ({}) AS src WHERE {} IS NOT NULL ORDER BY {} LIMIT ?1",
            self.inner,
            self.key_columns[0],
            self.key_list()
        )
    }

    /// Subsequent windows: binds the boundary key values, then the limit.
    pub fn next_page_sql(&self) -> String {
        let n = self.key_columns.len();
        let bound = if n == 1 {
            format!("{} > ?1", self.key_columns[0])
        } else {
            let ph: Vec<String> = (1..=n).map(|i| format!("?{i}")).collect();
            format!("({}) > ({})", self.key_list(), ph.join(", "))
        };
        format!(
            "SELECT * FROM ({}) AS src WHERE {} IS NOT NULL AND {} ORDER BY {} LIMIT ?{}",
            self.inner,
            self.key_columns[0],
            bound,
            self.key_list(),
            n + 1
        )
    }

    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM ({}) AS src WHERE {} IS NOT NULL", self.inner, self.key_columns[0])
    }

    pub fn null_key_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM ({}) AS src WHERE {} IS NULL", self.inner, self.key_columns[0])
    }

    /// Rows sharing a key with an earlier row. Keyset paging reads one row per key.
    pub fn duplicate_key_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) - COUNT(DISTINCT {}) FROM ({}) AS src WHERE {} IS NOT NULL",
            self.key_columns.join(" || char(0) || "),
            self.inner,
            self.key_columns[0]
        )
    }
}

/// Comment id → `distinguished` marker, collected from the moderation table in
/// one pass. Targets may be stored bare or as `t1_` fullnames.
const COMMENT_MARKERS_SQL: &str = "SELECT \
     CASE WHEN substr(target_id, 1, 3) = 't1_' THEN substr(target_id, 4) ELSE target_id END AS comment_id, \
     MAX(distinguished) FROM moderation \
     WHERE target_id IS NOT NULL AND distinguished IS NOT NULL GROUP BY comment_id";

const NORMALIZED_TABLES: &[(&str, &[&str])] = &[
    ("users", &["author", "author_flair_text", "author_flair_css_class"]),
    ("subreddit", &["subreddit_id", "subreddit"]),
    ("post", &["link_id", "subreddit_id", "author", "created_utc", "archived", "gilded", "edited"]),
    ("post_link", &["link_id", "retrieved_on"]),
    (
        "comment",
        &[
            "id", "body", "author", "link_id", "parent_id", "created_utc", "retrieved_on", "score", "ups",
            "downs", "score_hidden", "gilded", "controversiality", "edited",
        ],
    ),
    ("moderation", &["target_id", "subreddit_id", "target_type", "removal_reason", "distinguished"]),
];

const FLAT_COLUMNS: &[&str] = &[
    "author", "author_flair_text", "author_flair_css_class", "subreddit_id", "subreddit", "link_id", "id",
    "parent_id", "body", "created_utc", "retrieved_on", "score", "ups", "downs", "score_hidden", "gilded",
    "distinguished", "edited", "controversiality", "archived", "removal_reason",
];

impl SourceLayout {
    /// Reject table names that would need escaping; they are spliced into SQL.
    pub fn validate(&self) -> Result<(), FatalError> {
        if let SourceLayout::Flat { table } = self {
            if !ident_re().is_match(table) {
                return Err(FatalError::InvalidOption(format!("flat table name `{table}` is not a plain identifier")));
            }
        }
        Ok(())
    }

    /// Tables and the columns each must expose.
    pub fn required_columns(&self) -> Vec<(String, Vec<&'static str>)> {
        match self {
            SourceLayout::Normalized => NORMALIZED_TABLES
                .iter()
                .map(|(t, cols)| (t.to_string(), cols.to_vec()))
                .collect(),
            SourceLayout::Flat { table } => vec![(table.clone(), FLAT_COLUMNS.to_vec())],
        }
    }

    /// Query for the comment markers kept outside the comment rows, if any.
    pub fn comment_markers_sql(&self) -> Option<&'static str> {
        match self {
            SourceLayout::Normalized => Some(COMMENT_MARKERS_SQL),
            SourceLayout::Flat { .. } => None,
        }
    }

    pub fn query(&self, entity: EntityKind) -> EntityQuery {
        let (key_columns, inner): (&'static [&'static str], String) = match self {
            SourceLayout::Normalized => normalized_inner(entity),
            SourceLayout::Flat { table } => flat_inner(entity, table),
        };
        EntityQuery { entity, key_columns, inner }
    }
}

const MODERATION_KEYS: &[&str] = &["target_id", "subreddit_key"];

fn normalized_inner(entity: EntityKind) -> (&'static [&'static str], String) {
    match entity {
        EntityKind::User => (
            &["author"],
            "SELECT author, author_flair_text, author_flair_css_class FROM users".to_string(),
        ),
        EntityKind::Subreddit => (
            &["subreddit_id"],
            "SELECT subreddit_id, subreddit AS name FROM subreddit".to_string(),
        ),
        EntityKind::Post => (
            &["link_id"],
            "SELECT p.link_id AS link_id, p.subreddit_id AS subreddit_id, s.subreddit AS subreddit_name, \
             p.author AS author, p.created_utc AS created_utc, p.archived AS archived, p.gilded AS gilded, \
             p.edited AS edited, pl.retrieved_on AS retrieved_on \
             FROM post p LEFT JOIN subreddit s ON s.subreddit_id = p.subreddit_id \
             LEFT JOIN (SELECT link_id, MAX(retrieved_on) AS retrieved_on FROM post_link GROUP BY link_id) pl \
               ON pl.link_id = p.link_id"
                .to_string(),
        ),
        EntityKind::Comment => (
            &["id"],
            "SELECT c.id AS id, c.link_id AS link_id, c.parent_id AS parent_id, c.author AS author, \
             c.body AS body, c.created_utc AS created_utc, c.retrieved_on AS retrieved_on, c.score AS score, \
             c.ups AS ups, c.downs AS downs, c.score_hidden AS score_hidden, c.gilded AS gilded, \
             c.controversiality AS controversiality, c.edited AS edited, NULL AS distinguished \
             FROM comment c"
                .to_string(),
        ),
        EntityKind::Moderation => (
            MODERATION_KEYS,
            "SELECT m.target_id AS target_id, m.subreddit_id AS subreddit_id, \
             COALESCE(m.subreddit_id, '') AS subreddit_key, m.target_type AS target_type, \
             m.removal_reason AS removal_reason, m.distinguished AS distinguished, c.retrieved_on AS action_utc \
             FROM moderation m LEFT JOIN comment c ON c.id = \
               CASE WHEN substr(m.target_id, 1, 3) = 't1_' THEN substr(m.target_id, 4) ELSE m.target_id END"
                .to_string(),
        ),
    }
}

fn flat_inner(entity: EntityKind, table: &str) -> (&'static [&'static str], String) {
    let t = format!("\"{table}\"");
    match entity {
        EntityKind::User => (
            &["author"],
            format!(
                "SELECT author, MAX(author_flair_text) AS author_flair_text, \
                 MAX(author_flair_css_class) AS author_flair_css_class FROM {t} GROUP BY author"
            ),
        ),
        EntityKind::Subreddit => (
            &["subreddit_id"],
            format!("SELECT subreddit_id, MAX(subreddit) AS name FROM {t} GROUP BY subreddit_id"),
        ),
        // The dump has no submission rows: a post is the group of its comments.
        EntityKind::Post => (
            &["link_id"],
            format!(
                "SELECT link_id, MIN(subreddit_id) AS subreddit_id, MIN(subreddit) AS subreddit_name, \
                 NULL AS author, MIN(created_utc) AS created_utc, MAX(archived) AS archived, \
                 NULL AS gilded, 0 AS edited, MAX(retrieved_on) AS retrieved_on FROM {t} GROUP BY link_id"
            ),
        ),
        EntityKind::Comment => (
            &["id"],
            format!(
                "SELECT id, link_id, parent_id, author, body, created_utc, retrieved_on, score, ups, downs, \
                 score_hidden, gilded, controversiality, edited, distinguished FROM {t}"
            ),
        ),
        EntityKind::Moderation => (
            MODERATION_KEYS,
            format!(
                "SELECT id AS target_id, subreddit_id, COALESCE(subreddit_id, '') AS subreddit_key, \
                 'comment' AS target_type, removal_reason, distinguished, retrieved_on AS action_utc \
                 FROM {t} WHERE removal_reason IS NOT NULL OR distinguished IS NOT NULL"
            ),
        ),
    }
}
