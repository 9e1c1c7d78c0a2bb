//! # Propagation Rules
//!
//! Decides what a `begin` does given the context bound to the call scope.
//! Runs before any network activity, so protocol violations never reach a
//! remote peer.

use crate::domain::{Propagation, TransactionContext, TransactionDefinition, XaError};

/// What `begin` should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeginDecision {
    /// Start a new global transaction as initiator.
    Initiate,
    /// Escalate the bound dormant context to an initiator.
    Promote,
    /// Join the bound global transaction.
    Join,
    /// Plain local transaction.
    Local {
        /// Leave a dormant context bound for later escalation.
        dormant: bool,
    },
}

/// Apply the propagation rules.
pub fn decide_begin(
    bound: Option<&TransactionContext>,
    definition: &TransactionDefinition,
) -> Result<BeginDecision, XaError> {
    let Some(context) = bound else {
        if definition.propagation == Propagation::Mandatory {
            return Err(XaError::IllegalTransactionState(
                "no existing transaction found for propagation MANDATORY".to_string(),
            ));
        }
        return Ok(match (definition.distributed, definition.read_only) {
            (true, false) => BeginDecision::Initiate,
            (true, true) => BeginDecision::Local { dormant: true },
            (false, _) => BeginDecision::Local { dormant: false },
        });
    };

    if !context.active {
        return Ok(if definition.read_only {
            BeginDecision::Local { dormant: false }
        } else {
            BeginDecision::Promote
        });
    }

    if definition.read_only {
        return Err(XaError::UnsupportedPropagation(format!(
            "read-only transaction inside active global transaction {}",
            context.transaction_id
        )));
    }

    match definition.propagation {
        Propagation::Nested | Propagation::RequiresNew => {
            Err(XaError::NestedTransactionNotSupported(format!(
                "{:?} inside global transaction {}",
                definition.propagation, context.transaction_id
            )))
        }
        Propagation::Never => Err(XaError::UnsupportedPropagation(format!(
            "existing transaction {} found for propagation NEVER",
            context.transaction_id
        ))),
        _ => Ok(BeginDecision::Join),
    }
}
