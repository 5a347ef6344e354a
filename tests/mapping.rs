use reddit_hybrid::{
    coerce_bool, coerce_edited, coerce_epoch, coerce_int, coerce_text, map_comment, map_moderation, map_post,
    map_user, split_fullname, ParentRef, RawRow, RawValue, RowValidationError, TargetKind, TargetRef, ThingKind,
};

fn row(pairs: &[(&str, RawValue)]) -> RawRow {
    RawRow::from_pairs(pairs.iter().cloned())
}

#[test]
fn epochs_are_normalized_to_seconds() {
    assert_eq!(coerce_epoch(&RawValue::Integer(1_430_438_400)), Some(1_430_438_400));
    assert_eq!(coerce_epoch(&RawValue::Integer(1_430_438_400_123)), Some(1_430_438_400));
    assert_eq!(coerce_epoch(&RawValue::Real(1_430_438_400.9)), Some(1_430_438_400));
    assert_eq!(coerce_epoch(&"1430438400".into()), Some(1_430_438_400));
    assert_eq!(coerce_epoch(&"2015-05-01T00:00:00Z".into()), Some(1_430_438_400));
    assert_eq!(coerce_epoch(&"2015-05-01 00:00:00".into()), Some(1_430_438_400));
    assert_eq!(coerce_epoch(&"yesterday".into()), None);
    assert_eq!(coerce_epoch(&RawValue::Null), None);
}

#[test]
fn extreme_epochs_do_not_overflow() {
    assert_eq!(coerce_epoch(&RawValue::Integer(i64::MIN)), Some(i64::MIN / 1000));
    assert_eq!(coerce_epoch(&RawValue::Integer(i64::MAX)), Some(i64::MAX / 1000));
    assert_eq!(coerce_epoch(&RawValue::Real(-9.3e18)), Some(i64::MIN / 1000));
    assert_eq!(coerce_epoch(&"-9223372036854775808".into()), Some(i64::MIN / 1000));
}

#[test]
fn edited_is_flag_or_timestamp() {
    assert_eq!(coerce_edited(&RawValue::Integer(0)), (false, None));
    assert_eq!(coerce_edited(&RawValue::Integer(1)), (true, None));
    assert_eq!(coerce_edited(&RawValue::Integer(1_430_500_000)), (true, Some(1_430_500_000)));
    assert_eq!(coerce_edited(&"false".into()), (false, None));
    assert_eq!(coerce_edited(&RawValue::Null), (false, None));
}

#[test]
fn flags_ints_and_text() {
    assert!(coerce_bool(&RawValue::Integer(1)));
    assert!(coerce_bool(&"true".into()));
    assert!(!coerce_bool(&"0".into()));
    assert!(!coerce_bool(&RawValue::Null));

    assert_eq!(coerce_int(&"42".into()), Some(42));
    assert_eq!(coerce_int(&RawValue::Real(3.7)), Some(3));
    assert_eq!(coerce_int(&"n/a".into()), None);

    assert_eq!(coerce_text(&"  spaced  ".into()), Some("spaced".to_string()));
    assert_eq!(coerce_text(&"   ".into()), None);
    assert_eq!(coerce_text(&RawValue::Integer(7)), Some("7".to_string()));
}

#[test]
fn user_rows_need_a_real_author() {
    let ok = map_user(&row(&[("author", "alice".into()), ("author_flair_text", "x".into())])).unwrap();
    assert_eq!(ok.author, "alice");
    assert_eq!(ok.author_flair_text.as_deref(), Some("x"));
    assert_eq!(ok.author_flair_css_class, None);

    assert_eq!(
        map_user(&row(&[("author", "[deleted]".into())])).unwrap_err(),
        RowValidationError::PseudoAuthor("[deleted]".into())
    );
    assert_eq!(map_user(&row(&[("author", RawValue::Null)])).unwrap_err(), RowValidationError::MissingKey("author"));
}

#[test]
fn posts_start_without_comments() {
    let p = map_post(&row(&[
        ("link_id", "t3_p1".into()),
        ("subreddit_id", "t5_x".into()),
        ("subreddit_name", "programming".into()),
        ("archived", RawValue::Integer(1)),
        ("edited", RawValue::Integer(0)),
    ]))
    .unwrap();
    assert_eq!(p.id, "t3_p1");
    assert_eq!(p.subreddit.id.as_deref(), Some("t5_x"));
    assert!(p.archived);
    assert_eq!((p.comment_count, p.embedded_count), (0, 0));
    assert!(p.comments.is_empty());

    assert!(map_post(&row(&[("subreddit_id", "t5_x".into())])).is_err());
}

#[test]
fn comments_keep_raw_parent_and_body() {
    let c = map_comment(&row(&[
        ("id", "c2".into()),
        ("link_id", "t3_p1".into()),
        ("parent_id", "t1_c1".into()),
        ("body", "  indented\n".into()),
        ("score_hidden", RawValue::Integer(0)),
        ("score", "12".into()),
    ]))
    .unwrap();
    assert_eq!(c.parent_id.as_deref(), Some("t1_c1"));
    assert_eq!(c.body.as_deref(), Some("  indented\n"));
    assert_eq!(c.score, Some(12));
    assert!(!c.score_hidden);
}

#[test]
fn moderation_type_falls_back_to_prefix() {
    let declared = map_moderation(&row(&[("target_id", "abc".into()), ("target_type", "Comment".into())])).unwrap();
    assert_eq!(declared.declared_type, Some(TargetKind::Comment));

    let inferred = map_moderation(&row(&[("target_id", "t3_p1".into())])).unwrap();
    assert_eq!(inferred.declared_type, Some(TargetKind::Post));

    let unknown = map_moderation(&row(&[("target_id", "abc".into())])).unwrap();
    assert_eq!(unknown.declared_type, None);

    let doc = inferred.clone().into_doc(TargetKind::Post, "t3_p1".into(), "t5_x".into());
    assert_eq!(doc.id, "t3_p1_t5_x");
}

#[test]
fn fullnames_split_into_kind_and_id() {
    assert_eq!(split_fullname("t1_c1"), Some((ThingKind::Comment, "c1")));
    assert_eq!(split_fullname("t3_36ug3b"), Some((ThingKind::Link, "36ug3b")));
    assert_eq!(split_fullname("t5_2qh1i"), Some((ThingKind::Subreddit, "2qh1i")));
    assert_eq!(split_fullname("c1"), None);
    assert_eq!(split_fullname("t9_x"), None);
}

#[test]
fn parent_references_are_typed_once() {
    assert_eq!(ParentRef::resolve(Some("t3_p1"), Some("t3_p1")), Some(ParentRef::Post("t3_p1".into())));
    assert_eq!(ParentRef::resolve(Some("t1_c1"), Some("t3_p1")), Some(ParentRef::Comment("c1".into())));
    assert_eq!(ParentRef::resolve(None, Some("t3_p1")), Some(ParentRef::Post("t3_p1".into())));
    assert_eq!(ParentRef::resolve(Some("t2_bob"), None), Some(ParentRef::Unknown("t2_bob".into())));
    assert_eq!(ParentRef::resolve(None, None), None);
    assert!(ParentRef::Post("t3_p1".into()).is_top_level());
}

#[test]
fn moderation_targets_map_to_collection_keys() {
    assert_eq!(
        TargetRef::resolve("t1_c1", Some(TargetKind::Comment)),
        TargetRef::Known { kind: TargetKind::Comment, key: "c1".into() }
    );
    assert_eq!(
        TargetRef::resolve("t3_p1", None),
        TargetRef::Known { kind: TargetKind::Post, key: "t3_p1".into() }
    );
    assert_eq!(
        TargetRef::resolve("p1", Some(TargetKind::Post)),
        TargetRef::Known { kind: TargetKind::Post, key: "t3_p1".into() }
    );
    assert_eq!(TargetRef::resolve("p1", None), TargetRef::Ambiguous("p1".into()));
}
