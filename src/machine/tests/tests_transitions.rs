//! Generated transitions stay legal and reach every operation.

use std::collections::HashSet;

use proptest::strategy::{Strategy, ValueTree};
use proptest::test_runner::TestRunner;
use proptest_state_machine::ReferenceStateMachine;

use crate::machine::strategies::*;
use crate::machine::*;
use crate::model::ReferenceModel;

fn op_kind(op: &Op) -> &'static str {
    match op {
        Op::Kill => "kill",
        Op::CreateBucket { .. } => "create-bucket",
        Op::DropBucket { .. } => "drop-bucket",
        Op::Commit { .. } => "commit",
        Op::Rollback { .. } => "rollback",
        Op::CreateReader => "create-reader",
        Op::Put { .. } => "put",
        Op::PutN { .. } => "put-n",
        Op::PutNRev { .. } => "put-n-rev",
        Op::Change { .. } => "change",
        Op::Del { .. } => "del",
        Op::DelN { .. } => "del-n",
        Op::DelNRev { .. } => "del-n-rev",
    }
}

#[test]
fn random_walk_only_offers_legal_operations() {
    let mut runner = TestRunner::deterministic();
    let mut model = ReferenceModel::new();
    let mut seen = HashSet::new();

    for _ in 0..2_000 {
        let op = ModelMachine::transitions(&model)
            .new_tree(&mut runner)
            .unwrap()
            .current();
        assert!(op.is_legal(&model), "illegal transition {op:?}");
        seen.insert(op_kind(&op));
        model = ModelMachine::apply(model, &op);
    }

    for kind in [
        "kill",
        "create-bucket",
        "drop-bucket",
        "commit",
        "rollback",
        "create-reader",
        "put",
        "put-n",
        "put-n-rev",
        "change",
        "del",
        "del-n",
        "del-n-rev",
    ] {
        assert!(seen.contains(kind), "{kind} never generated");
    }
}

#[test]
fn empty_model_offers_no_bucket_operations() {
    let mut runner = TestRunner::deterministic();
    let model = ReferenceModel::new();
    for _ in 0..200 {
        let op = ModelMachine::transitions(&model)
            .new_tree(&mut runner)
            .unwrap()
            .current();
        assert!(
            matches!(
                op,
                Op::Kill
                    | Op::CreateBucket { .. }
                    | Op::Commit { .. }
                    | Op::Rollback { .. }
                    | Op::CreateReader
            ),
            "{op:?}"
        );
    }
}

#[test]
fn argument_strategies_respect_limits() {
    let mut runner = TestRunner::deterministic();
    for _ in 0..500 {
        assert!(bucket_name().new_tree(&mut runner).unwrap().current().len() <= MAX_BUCKET_LEN);
        assert!(key().new_tree(&mut runner).unwrap().current().len() <= MAX_KEY_LEN);
        assert!(key_prefix().new_tree(&mut runner).unwrap().current().len() < MAX_KEY_LEN);
        assert!(value().new_tree(&mut runner).unwrap().current().len() <= MAX_VALUE_LEN);
    }
}

#[test]
fn counts_hit_both_boundaries() {
    let mut runner = TestRunner::deterministic();
    let counts: HashSet<u8> = (0..500)
        .map(|_| count().new_tree(&mut runner).unwrap().current())
        .collect();
    assert!(counts.contains(&0));
    assert!(counts.contains(&u8::MAX));
}

#[test]
fn located_key_reports_rank() {
    let mut runner = TestRunner::deterministic();
    let keys: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i]).collect();
    let strategy = located_key(vec![(b"A".to_vec(), keys.clone())]);
    for _ in 0..100 {
        let (bucket, key, rank) = strategy.new_tree(&mut runner).unwrap().current();
        assert_eq!(bucket, b"A");
        assert_eq!(keys[rank], key);
    }
}
