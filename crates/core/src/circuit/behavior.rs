use super::relay::RelayCell;
use super::types::{CircuitId, CircuitState};
use onioncell_common::TruncatePolicy;

/// What the engine should do with a relay cell after a behavior saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Run the built-in handling
    Continue,

    /// The behavior consumed the cell
    Handled,
}

/// Hooks for circuits that need non-standard handling.
///
/// Every method has a default, so an empty impl behaves like
/// [`DefaultBehavior`]. Hooks run with the circuit locked and must not call
/// back into the circuit.
pub trait CircuitBehavior: Send + Sync {
    fn name(&self) -> &'static str {
        "default"
    }

    /// Called for every recognised inbound relay cell before dispatch
    fn intercept_relay(&self, _circuit: CircuitId, _from_hop: usize, _cell: &RelayCell) -> Disposition {
        Disposition::Continue
    }

    /// Called after every state transition
    fn on_state_change(&self, _circuit: CircuitId, _old: CircuitState, _new: CircuitState) {}

    /// Overrides the configured truncate policy for this circuit
    fn truncate_policy(&self) -> Option<TruncatePolicy> {
        None
    }
}

/// Standard client circuit
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBehavior;

impl CircuitBehavior for DefaultBehavior {}
