//! Environment lifecycle state machine
//!
//! ```text
//! Pending -> Creating -> Running <-> Degraded
//!               |                       |
//!               +-------> Error <-------+
//! any non-terminal -> Deleting -> Deleted
//! ```
//!
//! `Deleted` is terminal. `Error` only leaves on a delete request and is
//! never entered from `Running`; a failing running environment degrades
//! first.

use crds::EnvironmentState;

/// What a reconcile pass observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First observation of a new environment
    Observed,
    /// The translator rejected the spec
    SpecRejected,
    /// Every desired object was applied; `healthy` reports workload and
    /// service health
    Applied { healthy: bool },
    /// Retryable failures exhausted the retry budget
    RetryExhausted,
    /// A failure that retrying cannot fix (permission denied, invalid manifest)
    StructuralFailure,
    /// Explicit delete, TTL expiry or idle timeout
    DeleteRequested,
    /// Every derived object is confirmed absent
    TeardownConfirmed,
}

/// Next state for `current` under `trigger`
pub fn next_state(current: EnvironmentState, trigger: Trigger) -> EnvironmentState {
    use EnvironmentState::*;

    match (current, trigger) {
        (Deleted, _) => Deleted,

        (Deleting, Trigger::TeardownConfirmed) => Deleted,
        (Deleting, _) => Deleting,
        (_, Trigger::DeleteRequested) => Deleting,

        (Error, _) => Error,

        (Pending, Trigger::Observed) => Creating,
        (state, Trigger::Observed) => state,

        (Running, Trigger::SpecRejected | Trigger::StructuralFailure) => Degraded,
        (_, Trigger::SpecRejected | Trigger::StructuralFailure) => Error,

        (Pending | Creating, Trigger::Applied { healthy: true }) => Running,
        (Pending | Creating, Trigger::Applied { healthy: false }) => Creating,
        (Running | Degraded, Trigger::Applied { healthy: true }) => Running,
        (Running | Degraded, Trigger::Applied { healthy: false }) => Degraded,

        (Running, Trigger::RetryExhausted) => Degraded,
        (Pending | Creating | Degraded, Trigger::RetryExhausted) => Error,

        // Teardown is only confirmed while deleting
        (state, Trigger::TeardownConfirmed) => state,
    }
}

/// Metric label for a transition, if it is one that is counted
pub fn transition_label(from: EnvironmentState, to: EnvironmentState) -> Option<&'static str> {
    use EnvironmentState::*;

    if from == to {
        return None;
    }
    match (from, to) {
        (Pending | Creating, Running) => Some("created"),
        (_, Deleted) => Some("deleted"),
        (_, Error) => Some("errored"),
        (Running, Degraded) => Some("degraded"),
        _ => None,
    }
}
