//! Put, put-n and change.

use crate::model::*;

fn with_bucket(name: &[u8]) -> ReferenceModel {
    let mut model = ReferenceModel::new();
    model.create_bucket(name);
    model
}

#[test]
fn put_inserts_and_overwrites() {
    let mut model = with_bucket(b"A");
    model.put(b"A", b"x", b"1").unwrap();
    model.put(b"A", b"x", b"2").unwrap();

    assert_eq!(model.working()[b"A".as_slice()][b"x".as_slice()], b"2");
    assert_eq!(model.keys(b"A").len(), 1);
}

#[test]
fn put_accepts_empty_key_and_value() {
    let mut model = with_bucket(b"A");
    model.put(b"A", b"", b"").unwrap();
    assert!(model.has_key(b"A", b""));
}

#[test]
fn put_into_missing_bucket_is_an_error() {
    let mut model = ReferenceModel::new();
    assert!(matches!(
        model.put(b"A", b"x", b"1"),
        Err(ModelError::MissingBucket { .. })
    ));
    assert!(model.working().is_empty());
}

#[test]
fn put_n_writes_numbered_pairs() {
    let mut model = with_bucket(b"A");
    model.put_n(b"A", b"k", b"v", 3).unwrap();

    let kvs = &model.working()[b"A".as_slice()];
    assert_eq!(kvs.len(), 3);
    for i in 0u8..3 {
        assert_eq!(kvs[&numbered(b"k", i)], numbered(b"v", i));
    }
}

#[test]
fn put_n_zero_writes_nothing() {
    let mut model = with_bucket(b"A");
    model.put_n(b"A", b"k", b"v", 0).unwrap();
    model.put_n_rev(b"A", b"k", b"v", 0).unwrap();
    assert!(model.keys(b"A").is_empty());
}

#[test]
fn put_n_max_count_writes_255_keys() {
    let mut model = with_bucket(b"A");
    model.put_n(b"A", b"", b"", u8::MAX).unwrap();

    let keys = model.keys(b"A");
    assert_eq!(keys.len(), 255);
    assert_eq!(keys.first().unwrap(), &vec![0x00]);
    assert_eq!(keys.last().unwrap(), &vec![0xFE]);
}

#[test]
fn put_n_and_put_n_rev_agree_for_every_count() {
    for n in 0..=u8::MAX {
        let mut forward = with_bucket(b"A");
        forward.put(b"A", b"p\x01", b"old").unwrap();
        let mut backward = forward.clone();

        forward.put_n(b"A", b"p", b"\x00", n).unwrap();
        backward.put_n_rev(b"A", b"p", b"\x00", n).unwrap();

        assert_eq!(forward, backward, "n = {n}");
    }
}

#[test]
fn change_overwrites_existing_key() {
    let mut model = with_bucket(b"A");
    model.put(b"A", b"x", b"1").unwrap();
    model.change(b"A", b"x", b"").unwrap();
    assert_eq!(model.working()[b"A".as_slice()][b"x".as_slice()], b"");
}

#[test]
fn change_requires_existing_key() {
    let mut model = with_bucket(b"A");
    let err = model.change(b"A", b"x", b"1").unwrap_err();
    assert_eq!(
        err,
        ModelError::MissingKey {
            bucket: "41".into(),
            key: "78".into()
        }
    );
    assert!(!model.has_key(b"A", b"x"));
}

#[test]
fn writes_leave_committed_state_alone() {
    let mut model = with_bucket(b"A");
    model.put(b"A", b"x", b"1").unwrap();
    assert!(model.committed().is_empty());
    assert_ne!(model.working_digest(), model.committed_digest());
}
