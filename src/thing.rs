//! Reddit "fullname" handling (`t1_abc`, `t3_xyz`, …) and typed parent/target references.

use crate::model::TargetKind;
use regex::Regex;
use std::sync::OnceLock;

/// Type prefix of a Reddit fullname.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThingKind {
    Comment,   // t1
    Account,   // t2
    Link,      // t3
    Message,   // t4
    Subreddit, // t5
    Award,     // t6
}

fn fullname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^t([1-6])_([0-9a-z]+)$").expect("static regex"))
}

/// Split a fullname into its kind and base36 id. Returns `None` for bare ids
/// and anything else that is not a well-formed fullname.
pub fn split_fullname(s: &str) -> Option<(ThingKind, &str)> {
    let caps = fullname_re().captures(s.trim())?;
    let kind = match caps.get(1)?.as_str() {
        "1" => ThingKind::Comment,
        "2" => ThingKind::Account,
        "3" => ThingKind::Link,
        "4" => ThingKind::Message,
        "5" => ThingKind::Subreddit,
        _ => ThingKind::Award,
    };
    Some((kind, caps.get(2)?.as_str()))
}

/// A comment's parent, typed once during orchestration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentRef {
    /// Top-level comment; carries the post fullname.
    Post(String),
    /// Reply; carries the parent comment's bare id (the comments collection key).
    Comment(String),
    /// Present but not a post or comment fullname.
    Unknown(String),
}

impl ParentRef {
    /// Type the raw parent string. The normalized source stores top-level
    /// parents as NULL, so an absent parent falls back to the post reference.
    pub fn resolve(raw_parent: Option<&str>, post_id: Option<&str>) -> Option<ParentRef> {
        match raw_parent.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(match split_fullname(raw) {
                Some((ThingKind::Link, _)) => ParentRef::Post(raw.to_string()),
                Some((ThingKind::Comment, id)) => ParentRef::Comment(id.to_string()),
                _ => ParentRef::Unknown(raw.to_string()),
            }),
            None => post_id.map(|p| ParentRef::Post(p.to_string())),
        }
    }

    pub fn is_top_level(&self) -> bool {
        matches!(self, ParentRef::Post(_))
    }
}

/// Where a moderation target should be looked up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetRef {
    Known { kind: TargetKind, key: String },
    /// Neither a declared type nor a recognizable prefix; try comments, then posts.
    Ambiguous(String),
}

impl TargetRef {
    /// Comments are keyed by bare id and posts by `t3_` fullname, so a
    /// `t1_` target is stripped while a `t3_` target is kept whole.
    pub fn resolve(target_id: &str, declared: Option<TargetKind>) -> TargetRef {
        let target_id = target_id.trim();
        match (split_fullname(target_id), declared) {
            (Some((ThingKind::Comment, id)), None | Some(TargetKind::Comment)) => TargetRef::Known {
                kind: TargetKind::Comment,
                key: id.to_string(),
            },
            (Some((ThingKind::Link, _)), None | Some(TargetKind::Post)) => TargetRef::Known {
                kind: TargetKind::Post,
                key: target_id.to_string(),
            },
            (None, Some(TargetKind::Comment)) => TargetRef::Known {
                kind: TargetKind::Comment,
                key: target_id.to_string(),
            },
            (None, Some(TargetKind::Post)) => TargetRef::Known {
                kind: TargetKind::Post,
                key: format!("t3_{target_id}"),
            },
            _ => TargetRef::Ambiguous(target_id.to_string()),
        }
    }
}
