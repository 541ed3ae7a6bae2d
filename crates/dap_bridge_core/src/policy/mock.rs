//! Policy for the deterministic mock backend used by conformance tests.
//! Deliberately permissive: the mock accepts nearly any transition so test
//! scenarios can jump straight into interesting states.

use crate::policy::{AdapterPolicy, TransitionStrictness};
use crate::session::state::SessionState;

pub struct MockPolicy;

impl AdapterPolicy for MockPolicy {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn matches_adapter(&self, command: &str, args: &[String]) -> bool {
        command.to_lowercase().contains("mock") || args.join(" ").to_lowercase().contains("mock-adapter")
    }

    fn transition_strictness(&self) -> TransitionStrictness {
        TransitionStrictness::Permissive
    }

    fn valid_transition(&self, _from: SessionState, _to: SessionState) -> bool {
        true
    }
}
