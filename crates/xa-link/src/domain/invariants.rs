//! # Domain Invariants
//!
//! Rules that must always hold for RPC-propagated transactions.

use super::entities::{Branch, TransactionContext};
use super::errors::XaError;
use super::value_objects::{BranchState, Vote};

/// Grace added to a transaction's timeout before a propagated context expires.
pub const DEFAULT_TIMEOUT_GRACE_MS: u64 = 10_000;

/// Default global transaction timeout.
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 10_000;

/// Invariant: at most one active context per call scope.
pub fn invariant_single_active_context(bound: Option<&TransactionContext>) -> Result<(), XaError> {
    match bound {
        Some(current) if current.active => {
            Err(XaError::ContextAlreadyBound(current.transaction_id.clone()))
        }
        _ => Ok(()),
    }
}

/// Invariant: phase 2 never starts before every branch answered phase 1,
/// except the one-phase shortcut with a single branch.
pub fn invariant_phase_ordering(branch_count: usize, votes: &[Vote]) -> Result<(), XaError> {
    if branch_count <= 1 {
        return Ok(());
    }
    if votes.len() != branch_count {
        return Err(XaError::System(format!(
            "phase 2 requested with {} of {} votes",
            votes.len(),
            branch_count
        )));
    }
    Ok(())
}

/// Invariant: a completed transaction's branches are all committed or all
/// rolled back, unless a heuristic outcome was recorded.
pub fn invariant_atomic_outcome(branches: &[Branch]) -> Result<(), XaError> {
    if branches.iter().any(|b| b.state.is_heuristic()) {
        return Ok(());
    }

    let committed = branches
        .iter()
        .filter(|b| b.state == BranchState::Committed)
        .count();
    let rolled_back = branches
        .iter()
        .filter(|b| b.state == BranchState::RolledBack)
        .count();

    if committed > 0 && rolled_back > 0 {
        return Err(XaError::System(format!(
            "partial outcome: {} committed, {} rolled back",
            committed, rolled_back
        )));
    }
    Ok(())
}
