//! # Algorithms Module
//!
//! Propagation rules and the two-phase-commit coordinator.

pub mod propagation;
pub mod two_phase_commit;

pub use propagation::{decide_begin, BeginDecision};
pub use two_phase_commit::{
    decide_outcome, CompletionReport, Decision, TwoPhaseCoordinator, TwoPhaseOutcome,
};
