//! Commit, rollback, readers and kill.

use crate::model::*;

fn committed_x(value: &[u8]) -> ReferenceModel {
    let mut model = ReferenceModel::new();
    model.create_bucket(b"A");
    model.put(b"A", b"x", value).unwrap();
    model.commit(false);
    model
}

#[test]
fn commit_copies_working_to_committed() {
    let model = committed_x(b"1");
    assert_eq!(model.working(), model.committed());
}

#[test]
fn rollback_discards_uncommitted_writes() {
    let mut model = committed_x(b"1");
    model.put(b"A", b"x", b"2").unwrap();
    model.create_bucket(b"B");

    model.rollback(false);
    assert_eq!(model.working(), model.committed());
    assert!(!model.has_bucket(b"B"));
}

#[test]
fn commit_then_rollback_is_noop_on_working() {
    let mut model = committed_x(b"1");
    model.put(b"A", b"y", b"2").unwrap();
    let before = model.working().clone();

    model.commit(false);
    model.rollback(false);
    assert_eq!(model.working(), &before);
}

#[test]
fn rollback_is_idempotent() {
    let mut model = committed_x(b"1");
    model.put(b"A", b"x", b"2").unwrap();

    model.rollback(false);
    let once = model.clone();
    model.rollback(false);
    assert_eq!(model, once);
}

#[test]
fn reader_sees_committed_state_not_working() {
    let mut model = committed_x(b"1");
    model.put(b"A", b"x", b"2").unwrap();
    model.create_reader();

    assert_eq!(model.readers().len(), 1);
    assert_eq!(&model.readers()[0], model.committed());
    assert_ne!(model.reader_digests()[0], model.working_digest());
}

#[test]
fn reader_is_frozen_by_later_commits() {
    let mut model = committed_x(b"1");
    model.create_reader();
    let frozen = model.reader_digests();

    model.put(b"A", b"x", b"2").unwrap();
    model.commit(false);

    assert_eq!(model.reader_digests(), frozen);
    assert_ne!(model.committed_digest(), frozen[0]);
}

#[test]
fn readers_keep_creation_order() {
    let mut model = committed_x(b"1");
    model.create_reader();
    model.put(b"A", b"x", b"2").unwrap();
    model.commit(false);
    model.create_reader();

    let readers = model.readers();
    assert_eq!(readers[0][b"A".as_slice()][b"x".as_slice()], b"1");
    assert_eq!(readers[1][b"A".as_slice()][b"x".as_slice()], b"2");
}

#[test]
fn reset_flag_clears_readers() {
    let mut model = committed_x(b"1");
    model.create_reader();
    model.commit(true);
    assert!(model.readers().is_empty());

    model.create_reader();
    model.create_reader();
    model.rollback(true);
    assert!(model.readers().is_empty());
}

#[test]
fn plain_commit_and_rollback_keep_readers() {
    let mut model = committed_x(b"1");
    model.create_reader();
    model.commit(false);
    model.rollback(false);
    assert_eq!(model.readers().len(), 1);
}

#[test]
fn kill_restores_committed_state_and_drops_readers() {
    let mut model = committed_x(b"1");
    model.create_reader();
    model.put(b"A", b"x", b"2").unwrap();
    model.create_bucket(b"B");

    model.kill();
    assert_eq!(model.working(), model.committed());
    assert!(model.readers().is_empty());
    assert_eq!(model.working()[b"A".as_slice()][b"x".as_slice()], b"1");
}

#[test]
fn example_scenario_digests() {
    let mut model = committed_x(b"1");
    model.create_reader();
    model.put(b"A", b"x", b"2").unwrap();

    let mut expect_2 = Store::new();
    expect_2.insert(b"A".to_vec(), [(b"x".to_vec(), b"2".to_vec())].into());
    let mut expect_1 = Store::new();
    expect_1.insert(b"A".to_vec(), [(b"x".to_vec(), b"1".to_vec())].into());

    assert_eq!(model.working_digest(), crate::canonical::store_digest(&expect_2));
    assert_eq!(model.reader_digests(), vec![crate::canonical::store_digest(&expect_1)]);

    model.rollback(false);
    assert_eq!(model.working_digest(), model.reader_digests()[0]);
}
