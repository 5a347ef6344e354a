//! Raw source row → normalized record, with the dataset's type coercions.
//!
//! Every function here is pure: no I/O, no lookups. Reference checks belong to
//! the orchestrator.

use crate::error::RowValidationError;
use crate::model::{CommentDoc, ModerationDoc, PostDoc, SubredditDoc, SubredditRef, TargetKind, UserDoc};
use crate::source::{RawRow, RawValue};
use crate::thing::{split_fullname, ThingKind};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Authors that mark removed accounts rather than real users.
pub const PSEUDO_AUTHORS: &[&str] = &["[deleted]", "[removed]"];

/// Epoch values at or above this are taken to be milliseconds.
const MILLIS_THRESHOLD: u64 = 100_000_000_000;

/// Moderation row before reference resolution; the composite key needs a
/// resolved subreddit, so the document is only built afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct ModerationRecord {
    pub target_id: String,
    pub declared_type: Option<TargetKind>,
    pub subreddit_id: Option<String>,
    pub removal_reason: Option<String>,
    pub distinguished: Option<String>,
    pub action_utc: Option<i64>,
}

impl ModerationRecord {
    pub fn into_doc(self, target_type: TargetKind, target_key: String, subreddit_id: String) -> ModerationDoc {
        ModerationDoc {
            id: ModerationDoc::composite_key(&self.target_id, &subreddit_id),
            target_type,
            target_id: target_key,
            subreddit_id,
            removal_reason: self.removal_reason,
            distinguished: self.distinguished,
            action_utc: self.action_utc,
        }
    }
}

// ----------------------------- Coercions ------------------------------------

fn scale_epoch(v: i64) -> i64 {
    if v.unsigned_abs() >= MILLIS_THRESHOLD {
        v / 1000
    } else {
        v
    }
}

fn parse_epoch_text(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(scale_epoch(i));
    }
    if let Ok(f) = s.parse::<f64>() {
        return f.is_finite().then(|| scale_epoch(f.trunc() as i64));
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(dt.unix_timestamp());
    }
    let sql_fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(s, sql_fmt)
        .ok()
        .map(|dt| dt.assume_utc().unix_timestamp())
}

/// Normalize an epoch-like value to integer seconds; anything unparseable is unset.
pub fn coerce_epoch(v: &RawValue) -> Option<i64> {
    match v {
        RawValue::Null => None,
        RawValue::Integer(i) => Some(scale_epoch(*i)),
        RawValue::Real(f) => f.is_finite().then(|| scale_epoch(f.trunc() as i64)),
        RawValue::Text(s) => parse_epoch_text(s),
    }
}

/// 0/1 (or "true"/"false") flag to bool; NULL and junk are false.
pub fn coerce_bool(v: &RawValue) -> bool {
    match v {
        RawValue::Null => false,
        RawValue::Integer(i) => *i != 0,
        RawValue::Real(f) => *f != 0.0,
        RawValue::Text(s) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("true") || s.parse::<f64>().map(|f| f != 0.0).unwrap_or(false)
        }
    }
}

/// `edited` is 0/1 in most rows but an edit timestamp in some.
/// Returns (edited, edited_utc).
pub fn coerce_edited(v: &RawValue) -> (bool, Option<i64>) {
    let numeric = match v {
        RawValue::Integer(i) => Some(*i),
        RawValue::Real(f) if f.is_finite() => Some(f.trunc() as i64),
        RawValue::Text(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("true") {
                return (true, None);
            }
            s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)
        }
        _ => None,
    };
    match numeric {
        None | Some(0) => (false, None),
        Some(1) => (true, None),
        Some(ts) if ts > 1 => (true, Some(scale_epoch(ts))),
        Some(_) => (false, None),
    }
}

pub fn coerce_int(v: &RawValue) -> Option<i64> {
    match v {
        RawValue::Integer(i) => Some(*i),
        RawValue::Real(f) if f.is_finite() => Some(f.trunc() as i64),
        RawValue::Text(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

/// Trimmed, non-empty text. Integers are rendered (some dumps store ids as numbers).
pub fn coerce_text(v: &RawValue) -> Option<String> {
    match v {
        RawValue::Text(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        RawValue::Integer(i) => Some(i.to_string()),
        RawValue::Real(f) if f.is_finite() => Some(f.to_string()),
        _ => None,
    }
}

/// Free text (comment bodies) is kept verbatim apart from NULL handling.
fn raw_text(v: &RawValue) -> Option<String> {
    match v {
        RawValue::Text(s) => Some(s.clone()),
        RawValue::Null => None,
        other => coerce_text(other),
    }
}

fn required(row: &RawRow, column: &'static str) -> Result<String, RowValidationError> {
    coerce_text(row.get(column)).ok_or(RowValidationError::MissingKey(column))
}

// ----------------------------- Entity mappers ------------------------------------

pub fn map_user(row: &RawRow) -> Result<UserDoc, RowValidationError> {
    let author = required(row, "author")?;
    if PSEUDO_AUTHORS.contains(&author.as_str()) {
        return Err(RowValidationError::PseudoAuthor(author));
    }
    Ok(UserDoc {
        author,
        author_flair_text: coerce_text(row.get("author_flair_text")),
        author_flair_css_class: coerce_text(row.get("author_flair_css_class")),
    })
}

pub fn map_subreddit(row: &RawRow) -> Result<SubredditDoc, RowValidationError> {
    Ok(SubredditDoc {
        id: required(row, "subreddit_id")?,
        name: coerce_text(row.get("name")),
    })
}

/// Posts always start with an empty embedded set; comments are attached later.
pub fn map_post(row: &RawRow) -> Result<PostDoc, RowValidationError> {
    let id = required(row, "link_id")?;
    let (edited, edited_utc) = coerce_edited(row.get("edited"));
    Ok(PostDoc {
        id,
        subreddit: SubredditRef {
            id: coerce_text(row.get("subreddit_id")),
            name: coerce_text(row.get("subreddit_name")),
        },
        author: coerce_text(row.get("author")),
        created_utc: coerce_epoch(row.get("created_utc")),
        archived: coerce_bool(row.get("archived")),
        gilded: coerce_int(row.get("gilded")),
        edited,
        edited_utc,
        retrieved_on: coerce_epoch(row.get("retrieved_on")),
        comment_count: 0,
        embedded_count: 0,
        embed_truncated: false,
        comments: Vec::new(),
    })
}

/// The parent reference is kept raw; its type is not checked here.
pub fn map_comment(row: &RawRow) -> Result<CommentDoc, RowValidationError> {
    let id = required(row, "id")?;
    let (edited, edited_utc) = coerce_edited(row.get("edited"));
    Ok(CommentDoc {
        id,
        post_id: coerce_text(row.get("link_id")),
        parent_id: coerce_text(row.get("parent_id")),
        author: coerce_text(row.get("author")),
        body: raw_text(row.get("body")),
        created_utc: coerce_epoch(row.get("created_utc")),
        retrieved_on: coerce_epoch(row.get("retrieved_on")),
        score: coerce_int(row.get("score")),
        ups: coerce_int(row.get("ups")),
        downs: coerce_int(row.get("downs")),
        score_hidden: coerce_bool(row.get("score_hidden")),
        gilded: coerce_int(row.get("gilded")),
        controversiality: coerce_int(row.get("controversiality")),
        edited,
        edited_utc,
        distinguished: coerce_text(row.get("distinguished")),
    })
}

fn parse_target_type(v: &RawValue) -> Option<TargetKind> {
    match coerce_text(v)?.to_ascii_lowercase().as_str() {
        "post" | "link" | "submission" => Some(TargetKind::Post),
        "comment" => Some(TargetKind::Comment),
        _ => None,
    }
}

pub fn map_moderation(row: &RawRow) -> Result<ModerationRecord, RowValidationError> {
    let target_id = required(row, "target_id")?;
    let declared_type = parse_target_type(row.get("target_type")).or_else(|| match split_fullname(&target_id) {
        Some((ThingKind::Comment, _)) => Some(TargetKind::Comment),
        Some((ThingKind::Link, _)) => Some(TargetKind::Post),
        _ => None,
    });
    Ok(ModerationRecord {
        target_id,
        declared_type,
        subreddit_id: coerce_text(row.get("subreddit_id")),
        removal_reason: coerce_text(row.get("removal_reason")),
        distinguished: coerce_text(row.get("distinguished")),
        action_utc: coerce_epoch(row.get("action_utc")),
    })
}
