//! Differential run against an external engine.
//!
//! Ignored by default. Point `KVORACLE_ENGINE` at the engine binary (and
//! optionally `KVORACLE_ENGINE_ARGS` at extra arguments), then run:
//!
//! ```text
//! KVORACLE_ENGINE=./bin/engine cargo test --test external_engine -- --ignored
//! ```

use kvoracle::Differential;
use kvoracle::machine::EnvEngine;
use proptest::prelude::ProptestConfig;
use proptest_state_machine::prop_state_machine;

type EnvDifferential = Differential<EnvEngine>;

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    #[ignore = "needs KVORACLE_ENGINE"]
    fn external_engine_matches_model(sequential 1..100 => EnvDifferential);
}
