//! The state machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// Implementations mutate internal state and return actions; they never
/// perform I/O. The runner sets the current time before each `handle`
/// call, so identical event sequences at identical times replay to
/// identical states.
pub trait StateMachine {
    /// Inject the current monotonic time. Called by the runner before
    /// every `handle`.
    fn set_now(&mut self, now: Duration);

    /// Process one event, returning the actions to execute.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}
