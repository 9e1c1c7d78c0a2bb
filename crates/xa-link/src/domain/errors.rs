//! # Domain Errors
//!
//! Error types for RPC-propagated XA transactions.

use super::value_objects::{BranchId, HeuristicState, TransactionId};
use thiserror::Error;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Transaction error types.
#[derive(Debug, Error)]
pub enum XaError {
    // =========================================================================
    // Protocol violations (rejected before any network activity)
    // =========================================================================
    /// Propagation behaviour cannot run inside an active global transaction.
    #[error("Unsupported propagation: {0}")]
    UnsupportedPropagation(String),

    /// Nested global transactions are not part of the protocol.
    #[error("Nested transaction not supported: {0}")]
    NestedTransactionNotSupported(String),

    /// A new transaction could not be started.
    #[error("Cannot create transaction: {0}")]
    CannotCreateTransaction(String),

    /// A call scope already carries an active context.
    #[error("Transaction context already bound: {0}")]
    ContextAlreadyBound(TransactionId),

    /// Propagation requirements are not met by the current scope.
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    // =========================================================================
    // Enlistment
    // =========================================================================
    /// Transaction unknown to the coordinator or past phase 1.
    #[error("System error: {0}")]
    System(String),

    /// Transaction was already marked rollback-only.
    #[error("Rollback already requested for transaction {0}")]
    RollbackAlreadyRequested(TransactionId),

    /// Branch not known at this node.
    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),

    // =========================================================================
    // Completion
    // =========================================================================
    /// The global transaction rolled back while a commit was requested.
    #[error("Transaction unexpectedly rolled back: {0}")]
    UnexpectedRollback(String),

    /// A participant completed its branch outside the protocol.
    #[error("Heuristic completion ({state:?}): {reason}")]
    HeuristicCompletion {
        /// Outcome reported by the participant(s)
        state: HeuristicState,
        /// Detail
        reason: String,
    },

    /// The transaction manager failed or reported an impossible state.
    #[error("Transaction system failure: {0}")]
    TransactionSystem(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Attempted state
        to: String,
    },

    // =========================================================================
    // Resources and messaging
    // =========================================================================
    /// Resource driver failure.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Outbound buffer is being flushed.
    #[error("Message buffer already sealed for flush")]
    BufferSealed,

    /// Broker rejected or failed to deliver a message.
    #[error("Broker error: {0}")]
    Broker(String),

    // =========================================================================
    // Transport
    // =========================================================================
    /// RPC transport failure.
    #[error("Transport error calling {address}: {reason}")]
    Transport {
        /// Remote peer
        address: String,
        /// Detail
        reason: String,
    },

    /// RPC deadline exceeded.
    #[error("Call to {address} timed out after {millis}ms")]
    Timeout {
        /// Remote peer
        address: String,
        /// Deadline
        millis: u64,
    },

    /// Propagated context headers could not be parsed.
    #[error("Malformed transaction context: {0}")]
    MalformedContext(String),

    /// Wire encoding failure.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl XaError {
    /// Whether this error was raised synchronously by the propagation rules.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedPropagation(_)
                | Self::NestedTransactionNotSupported(_)
                | Self::CannotCreateTransaction(_)
                | Self::ContextAlreadyBound(_)
                | Self::IllegalTransactionState(_)
        )
    }

    /// Whether this error came from the transport rather than the peer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Errors reported by the transaction manager port.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionManagerError {
    /// No transaction with that id is active.
    #[error("No transaction")]
    NoTransaction,

    /// The transaction rolled back instead of committing.
    #[error("Rolled back: {0}")]
    RolledBack(String),

    /// Some branches committed, some rolled back.
    #[error("Heuristic mixed: {0}")]
    HeuristicMixed(String),

    /// All branches rolled back heuristically.
    #[error("Heuristic rollback: {0}")]
    HeuristicRollback(String),

    /// Operation is not valid in the current status.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Operation not supported (e.g. nested begin).
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal manager failure.
    #[error("System failure: {0}")]
    System(String),
}
