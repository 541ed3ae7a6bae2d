//! Session lifecycle state machine with an explicit transition log.
//!
//! Observers subscribe to a stream of transitions carrying both the
//! previous and the new state, so edges are detectable without reentrant
//! callbacks into the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::BridgeError;
use crate::policy::{AdapterPolicy, TransitionStrictness};
use crate::Result;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Connected,
    Debugging,
    Disconnected,
    Error,
}

/// One observed edge of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub previous: SessionState,
    pub next: SessionState,
    pub cause: String,
}

pub struct StateTracker {
    current: SessionState,
    log: Vec<Transition>,
    tx: broadcast::Sender<Transition>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            current: SessionState::Uninitialized,
            log: Vec::new(),
            tx,
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.tx.subscribe()
    }

    /// Handle for subscribing without holding the tracker's lock.
    pub fn sender(&self) -> broadcast::Sender<Transition> {
        self.tx.clone()
    }

    pub fn history(&self) -> &[Transition] {
        &self.log
    }

    /// Apply a transition under the policy's validity rules. A strict
    /// policy turns an invalid edge into a fatal protocol error; a
    /// permissive one tolerates and records it.
    pub fn transition(
        &mut self,
        to: SessionState,
        cause: impl Into<String>,
        policy: &dyn AdapterPolicy,
    ) -> Result<()> {
        let cause = cause.into();
        if !policy.valid_transition(self.current, to) {
            match policy.transition_strictness() {
                TransitionStrictness::Strict => {
                    return Err(BridgeError::InvalidTransition {
                        from: self.current,
                        to,
                    });
                }
                TransitionStrictness::Permissive => {
                    tracing::warn!(
                        from = ?self.current,
                        to = ?to,
                        %cause,
                        "tolerating out-of-spec state transition"
                    );
                }
            }
        }
        self.apply(to, cause);
        Ok(())
    }

    /// Unconditional transition, used for dispose/reset and error edges
    /// which are reachable from every state.
    pub fn force(&mut self, to: SessionState, cause: impl Into<String>) {
        self.apply(to, cause.into());
    }

    fn apply(&mut self, to: SessionState, cause: String) {
        let transition = Transition {
            previous: self.current,
            next: to,
            cause,
        };
        tracing::debug!(from = ?transition.previous, to = ?transition.next, cause = %transition.cause, "session transition");
        self.current = to;
        self.log.push(transition.clone());
        let _ = self.tx.send(transition);
    }
}
