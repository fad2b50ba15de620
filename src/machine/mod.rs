//! # Stateful Operation Generator & Invariant Runner
//!
//! Drives the [`ReferenceModel`] and an engine in lockstep with
//! `proptest-state-machine`.
//!
//! - [`ModelMachine`] is the reference side: it offers only operations whose
//!   preconditions hold in the current model state and applies them to the
//!   model.
//! - [`Differential`] is the system under test: it owns an [`EngineSession`],
//!   replays each operation on the engine and then checks both standing
//!   invariants with [`verify`].
//!
//! A failing step panics with the operation and the error. `proptest` treats
//! that as a failure and shrinks the sequence, re-checking preconditions so
//! that every shrunk candidate is still a legal sequence.
//!
//! ## Invariants
//!
//! After `init_test` and after every step:
//!
//! 1. `ensure-hash` with the digest of the model's working state;
//! 2. if readers are open, `ensure-reader-hashes` with one digest per reader
//!    in creation order.

#[cfg(test)]
mod tests;

pub mod strategies;

use std::fmt;
use std::marker::PhantomData;

use proptest::prelude::*;
use proptest::sample::select;
use proptest::strategy::Union;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest};
use tracing::debug;

use crate::model::{ModelError, ReferenceModel};
use crate::process::{EngineSession, ProcessError};
use crate::protocol::Command;
use crate::{HarnessConfig, HarnessError};

use strategies::{bucket_name, count, key, key_prefix, located_key, value};

// ------------------------------------------------------------------------------------------------
// Operations
// ------------------------------------------------------------------------------------------------

/// One generated store operation.
#[derive(Clone, PartialEq, Eq)]
pub enum Op {
    /// Crash the engine and restart it on the same database.
    Kill,
    CreateBucket {
        bucket: Vec<u8>,
    },
    DropBucket {
        bucket: Vec<u8>,
    },
    Commit {
        reset: bool,
    },
    Rollback {
        reset: bool,
    },
    CreateReader,
    Put {
        bucket: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    PutN {
        bucket: Vec<u8>,
        key_prefix: Vec<u8>,
        value_prefix: Vec<u8>,
        n: u8,
    },
    PutNRev {
        bucket: Vec<u8>,
        key_prefix: Vec<u8>,
        value_prefix: Vec<u8>,
        n: u8,
    },
    /// Overwrite an existing key.
    Change {
        bucket: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Delete an existing key, through the cursor path when `cursor` is set.
    Del {
        bucket: Vec<u8>,
        key: Vec<u8>,
        cursor: bool,
    },
    DelN {
        bucket: Vec<u8>,
        start_key: Vec<u8>,
        n: u8,
    },
    /// Reverse range delete. `n` never exceeds the rank of `start_key` + 1.
    DelNRev {
        bucket: Vec<u8>,
        start_key: Vec<u8>,
        n: u8,
    },
}

// Byte strings are shown as hex so shrunk failures can be replayed by hand.
impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode;
        match self {
            Self::Kill => write!(f, "Kill"),
            Self::CreateBucket { bucket } => write!(f, "CreateBucket({})", h(bucket)),
            Self::DropBucket { bucket } => write!(f, "DropBucket({})", h(bucket)),
            Self::Commit { reset } => write!(f, "Commit {{ reset: {reset} }}"),
            Self::Rollback { reset } => write!(f, "Rollback {{ reset: {reset} }}"),
            Self::CreateReader => write!(f, "CreateReader"),
            Self::Put { bucket, key, value } => {
                write!(f, "Put({}, {}, {})", h(bucket), h(key), h(value))
            }
            Self::PutN {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => write!(
                f,
                "PutN({}, {}, {}, {n})",
                h(bucket),
                h(key_prefix),
                h(value_prefix)
            ),
            Self::PutNRev {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => write!(
                f,
                "PutNRev({}, {}, {}, {n})",
                h(bucket),
                h(key_prefix),
                h(value_prefix)
            ),
            Self::Change { bucket, key, value } => {
                write!(f, "Change({}, {}, {})", h(bucket), h(key), h(value))
            }
            Self::Del {
                bucket,
                key,
                cursor,
            } => write!(f, "Del({}, {}, cursor: {cursor})", h(bucket), h(key)),
            Self::DelN {
                bucket,
                start_key,
                n,
            } => write!(f, "DelN({}, {}, {n})", h(bucket), h(start_key)),
            Self::DelNRev {
                bucket,
                start_key,
                n,
            } => write!(f, "DelNRev({}, {}, {n})", h(bucket), h(start_key)),
        }
    }
}

impl Op {
    /// Wire command that performs this operation on the engine.
    ///
    /// `Change` travels as a plain `put`; `Kill` is handled by the session.
    pub fn command(&self) -> Command {
        match self.clone() {
            Self::Kill => Command::Kill,
            Self::CreateBucket { bucket } => Command::CreateBucket { bucket },
            Self::DropBucket { bucket } => Command::DropBucket { bucket },
            Self::Commit { reset } => Command::Commit { reset },
            Self::Rollback { reset } => Command::Rollback { reset },
            Self::CreateReader => Command::CreateReader,
            Self::Put { bucket, key, value } | Self::Change { bucket, key, value } => {
                Command::Put { bucket, key, value }
            }
            Self::PutN {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => Command::PutN {
                bucket,
                key_prefix,
                value_prefix,
                n,
            },
            Self::PutNRev {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => Command::PutNRev {
                bucket,
                key_prefix,
                value_prefix,
                n,
            },
            Self::Del {
                bucket,
                key,
                cursor: false,
            } => Command::Del { bucket, key },
            Self::Del {
                bucket,
                key,
                cursor: true,
            } => Command::DelCursor { bucket, key },
            Self::DelN {
                bucket,
                start_key,
                n,
            } => Command::DelN {
                bucket,
                start_key,
                n,
            },
            Self::DelNRev {
                bucket,
                start_key,
                n,
            } => Command::DelNRev {
                bucket,
                start_key,
                n,
            },
        }
    }

    /// Whether the operation's preconditions hold in `model`.
    pub fn is_legal(&self, model: &ReferenceModel) -> bool {
        match self {
            Self::Kill | Self::Commit { .. } | Self::Rollback { .. } | Self::CreateReader => true,
            Self::CreateBucket { bucket } => !model.has_bucket(bucket),
            Self::DropBucket { bucket }
            | Self::Put { bucket, .. }
            | Self::PutN { bucket, .. }
            | Self::PutNRev { bucket, .. } => model.has_bucket(bucket),
            Self::Change { bucket, key, .. } | Self::Del { bucket, key, .. } => {
                model.has_key(bucket, key)
            }
            Self::DelN {
                bucket, start_key, ..
            } => model.has_key(bucket, start_key),
            Self::DelNRev {
                bucket,
                start_key,
                n,
            } => model.clamp_rev_count(bucket, start_key, *n) == Ok(*n),
        }
    }

    /// Applies the operation to `model`.
    pub fn apply_to(&self, model: &mut ReferenceModel) -> Result<(), ModelError> {
        match self {
            Self::Kill => model.kill(),
            Self::CreateBucket { bucket } => {
                model.create_bucket(bucket);
            }
            Self::DropBucket { bucket } => model.drop_bucket(bucket)?,
            Self::Commit { reset } => model.commit(*reset),
            Self::Rollback { reset } => model.rollback(*reset),
            Self::CreateReader => model.create_reader(),
            Self::Put { bucket, key, value } => model.put(bucket, key, value)?,
            Self::PutN {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => model.put_n(bucket, key_prefix, value_prefix, *n)?,
            Self::PutNRev {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => model.put_n_rev(bucket, key_prefix, value_prefix, *n)?,
            Self::Change { bucket, key, value } => model.change(bucket, key, value)?,
            Self::Del {
                bucket,
                key,
                cursor: false,
            } => model.del(bucket, key)?,
            Self::Del {
                bucket,
                key,
                cursor: true,
            } => model.del_cursor(bucket, key)?,
            Self::DelN {
                bucket,
                start_key,
                n,
            } => {
                model.del_n(bucket, start_key, *n)?;
            }
            Self::DelNRev {
                bucket,
                start_key,
                n,
            } => {
                model.del_n_rev(bucket, start_key, *n)?;
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reference state machine
// ------------------------------------------------------------------------------------------------

/// Generates legal operations from the current model state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelMachine;

impl ReferenceStateMachine for ModelMachine {
    type State = ReferenceModel;
    type Transition = Op;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(ReferenceModel::new()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let existing = state.bucket_names();
        let taken = existing.clone();

        let mut choices: Vec<(u32, BoxedStrategy<Op>)> = vec![
            (1, Just(Op::Kill).boxed()),
            (
                3,
                bucket_name()
                    .prop_filter("bucket already exists", move |b| !taken.contains(b))
                    .prop_map(|bucket| Op::CreateBucket { bucket })
                    .boxed(),
            ),
            (2, any::<bool>().prop_map(|reset| Op::Commit { reset }).boxed()),
            (1, any::<bool>().prop_map(|reset| Op::Rollback { reset }).boxed()),
            (1, Just(Op::CreateReader).boxed()),
        ];

        if !existing.is_empty() {
            choices.extend([
                (
                    1,
                    select(existing.clone())
                        .prop_map(|bucket| Op::DropBucket { bucket })
                        .boxed(),
                ),
                (
                    5,
                    (select(existing.clone()), key(), value())
                        .prop_map(|(bucket, key, value)| Op::Put { bucket, key, value })
                        .boxed(),
                ),
                (
                    2,
                    (select(existing.clone()), key_prefix(), value(), count())
                        .prop_map(|(bucket, key_prefix, value_prefix, n)| Op::PutN {
                            bucket,
                            key_prefix,
                            value_prefix,
                            n,
                        })
                        .boxed(),
                ),
                (
                    2,
                    (select(existing), key_prefix(), value(), count())
                        .prop_map(|(bucket, key_prefix, value_prefix, n)| Op::PutNRev {
                            bucket,
                            key_prefix,
                            value_prefix,
                            n,
                        })
                        .boxed(),
                ),
            ]);
        }

        let entries: Vec<(Vec<u8>, Vec<Vec<u8>>)> = state
            .non_empty_buckets()
            .into_iter()
            .map(|bucket| {
                let keys = state.keys(&bucket);
                (bucket, keys)
            })
            .collect();

        if !entries.is_empty() {
            choices.extend([
                (
                    3,
                    (located_key(entries.clone()), value())
                        .prop_map(|((bucket, key, _), value)| Op::Change { bucket, key, value })
                        .boxed(),
                ),
                (
                    3,
                    (located_key(entries.clone()), any::<bool>())
                        .prop_map(|((bucket, key, _), cursor)| Op::Del {
                            bucket,
                            key,
                            cursor,
                        })
                        .boxed(),
                ),
                (
                    2,
                    (located_key(entries.clone()), count())
                        .prop_map(|((bucket, start_key, _), n)| Op::DelN {
                            bucket,
                            start_key,
                            n,
                        })
                        .boxed(),
                ),
                (
                    2,
                    (located_key(entries), count())
                        .prop_map(|((bucket, start_key, rank), n)| Op::DelNRev {
                            bucket,
                            start_key,
                            n: n.min(u8::try_from(rank + 1).unwrap_or(u8::MAX)),
                        })
                        .boxed(),
                ),
            ]);
        }

        Union::new_weighted(choices).boxed()
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        transition.is_legal(state)
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        if let Err(e) = transition.apply_to(&mut state) {
            panic!("generator produced an illegal operation {transition:?}: {e}");
        }
        state
    }
}

// ------------------------------------------------------------------------------------------------
// Engine side
// ------------------------------------------------------------------------------------------------

/// Supplies the engine under test to [`Differential`].
pub trait EngineTarget {
    fn config() -> Result<HarnessConfig, HarnessError>;
}

/// Engine named by the `KVORACLE_ENGINE` environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvEngine;

impl EngineTarget for EnvEngine {
    fn config() -> Result<HarnessConfig, HarnessError> {
        HarnessConfig::from_env()
    }
}

/// Replays generated operations against the engine named by `T`.
///
/// `proptest_state_machine::prop_state_machine!` expects a plain identifier,
/// so bind a concrete target with a type alias first:
///
/// ```rust,ignore
/// type EnvDifferential = Differential<EnvEngine>;
/// ```
pub struct Differential<T>(PhantomData<T>);

impl<T: EngineTarget> StateMachineTest for Differential<T> {
    type SystemUnderTest = EngineSession;
    type Reference = ModelMachine;

    fn init_test(ref_state: &ReferenceModel) -> Self::SystemUnderTest {
        let mut session = match T::config().and_then(EngineSession::start) {
            Ok(session) => session,
            Err(e) => panic!("failed to start engine session: {e}"),
        };
        if let Err(e) = verify(&mut session, ref_state) {
            panic!("fresh engine diverges from the empty model: {e}");
        }
        session
    }

    fn apply(
        mut session: Self::SystemUnderTest,
        ref_state: &ReferenceModel,
        transition: Op,
    ) -> Self::SystemUnderTest {
        debug!(op = ?transition, "step");
        let outcome = match &transition {
            Op::Kill => session.kill(),
            op => session.send(&op.command()).map(drop),
        }
        .and_then(|()| verify(&mut session, ref_state));

        if let Err(e) = outcome {
            panic!("{transition:?} failed: {e}");
        }
        session
    }
}

/// Checks both standing invariants of `session` against `model`.
pub fn verify(session: &mut EngineSession, model: &ReferenceModel) -> Result<(), ProcessError> {
    session.ensure_hash(model.working_digest())?;
    if !model.readers().is_empty() {
        session.ensure_reader_hashes(&model.reader_digests())?;
    }
    Ok(())
}
