//! # Enlistment Wire Messages
//!
//! Request/response types carried by the RPC transport for the enlistment
//! protocol. Every payload travels inside a [`WireFrame`] so both sides can
//! correlate calls in their logs.

use crate::domain::{BranchId, HeuristicState, RecoverFlag, TransactionId, Vote, XaError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for one request or response on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame<T> {
    /// Correlation ID matching request and response.
    pub correlation_id: Uuid,
    /// The payload.
    pub payload: T,
}

impl<T> WireFrame<T> {
    /// Wrap a payload with a fresh correlation ID.
    pub fn new(payload: T) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            payload,
        }
    }

    /// Wrap a reply that answers `correlation_id`.
    pub fn reply(correlation_id: Uuid, payload: T) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }
}

/// Enlistment protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EnlistmentRequest {
    /// Participant asks the coordinator for a new branch.
    EnlistResource {
        /// Global transaction.
        transaction_id: TransactionId,
        /// Address of the participant hosting the resource.
        local_address: String,
        /// Resource name.
        resource_name: String,
    },
    /// Phase 1.
    Prepare {
        /// Target branch.
        branch: BranchId,
    },
    /// Phase 2 commit.
    Commit {
        /// Target branch.
        branch: BranchId,
        /// Skip phase 1 (single-branch transaction).
        one_phase: bool,
    },
    /// Phase 2 rollback.
    Rollback {
        /// Target branch.
        branch: BranchId,
    },
    /// Enumerate in-doubt branches.
    Recover {
        /// Scan flag.
        flag: RecoverFlag,
    },
}

impl EnlistmentRequest {
    /// Operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::EnlistResource { .. } => "enlist_resource",
            Self::Prepare { .. } => "prepare",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
            Self::Recover { .. } => "recover",
        }
    }
}

/// Category of a remote failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown transaction or past phase 1.
    System,
    /// Transaction already marked rollback-only.
    RollbackAlreadyRequested(TransactionId),
    /// Branch unknown at the peer.
    UnknownBranch(BranchId),
    /// Branch completed outside the protocol.
    Heuristic(HeuristicState),
    /// Resource driver failure.
    Resource,
    /// Anything else.
    Internal,
}

/// Enlistment protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnlistmentResponse {
    /// Branch registered.
    Enlisted {
        /// New branch.
        branch: BranchId,
    },
    /// Phase-1 vote.
    Voted {
        /// The vote.
        vote: Vote,
    },
    /// Commit or rollback applied.
    Done,
    /// In-doubt branches.
    Recovered {
        /// Prepared branches.
        branches: Vec<BranchId>,
    },
    /// The peer rejected the call.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Detail.
        message: String,
    },
}

impl EnlistmentResponse {
    /// Encode a failure for the wire.
    pub fn from_error(error: &XaError) -> Self {
        let (kind, message) = match error {
            XaError::System(message) => (ErrorKind::System, message.clone()),
            XaError::RollbackAlreadyRequested(tid) => (
                ErrorKind::RollbackAlreadyRequested(tid.clone()),
                error.to_string(),
            ),
            XaError::UnknownBranch(branch) => {
                (ErrorKind::UnknownBranch(branch.clone()), error.to_string())
            }
            XaError::HeuristicCompletion { state, reason } => {
                (ErrorKind::Heuristic(*state), reason.clone())
            }
            XaError::Resource(message) => (ErrorKind::Resource, message.clone()),
            other => (ErrorKind::Internal, other.to_string()),
        };
        Self::Error { kind, message }
    }

    /// Turn an `Error` response back into the matching `XaError`.
    pub fn into_result(self) -> Result<Self, XaError> {
        match self {
            Self::Error { kind, message } => Err(match kind {
                ErrorKind::System => XaError::System(message),
                ErrorKind::RollbackAlreadyRequested(tid) => XaError::RollbackAlreadyRequested(tid),
                ErrorKind::UnknownBranch(branch) => XaError::UnknownBranch(branch),
                ErrorKind::Heuristic(state) => XaError::HeuristicCompletion {
                    state,
                    reason: message,
                },
                ErrorKind::Resource => XaError::Resource(message),
                ErrorKind::Internal => XaError::TransactionSystem(message),
            }),
            other => Ok(other),
        }
    }

    /// Error for a response that does not answer the request.
    pub fn unexpected(self, op: &str) -> XaError {
        XaError::TransactionSystem(format!("unexpected response to {}: {:?}", op, self))
    }
}
