//! # Domain Value Objects
//!
//! Immutable value types for XA transactions propagated over RPC.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Global transaction identifier (opaque string).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// XA branch identifier: global transaction id plus branch qualifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId {
    /// Owning global transaction.
    pub transaction_id: TransactionId,
    /// Branch qualifier, unique within the transaction.
    pub qualifier: String,
}

impl BranchId {
    /// Create a branch id.
    pub fn new(transaction_id: TransactionId, qualifier: impl Into<String>) -> Self {
        Self {
            transaction_id,
            qualifier: qualifier.into(),
        }
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.qualifier)
    }
}

/// Role of a call scope in a global transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    /// Started the global transaction and owns its outcome.
    Initiator,
    /// Joined an existing global transaction.
    Participant,
    /// No role assigned (dormant context).
    #[default]
    None,
}

/// Requested propagation behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Propagation {
    /// Join the current transaction or start one.
    #[default]
    Required,
    /// Join if present, run non-transactionally otherwise.
    Supports,
    /// A transaction must already exist.
    Mandatory,
    /// Always start an independent transaction.
    RequiresNew,
    /// Run without a transaction.
    NotSupported,
    /// Fail if a transaction exists.
    Never,
    /// Savepoint-style nested transaction.
    Nested,
}

/// What a caller asks for when beginning a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionDefinition {
    /// Propagation behaviour.
    pub propagation: Propagation,
    /// Read-only hint.
    pub read_only: bool,
    /// Whether a global (XA) transaction is wanted when none is bound.
    pub distributed: bool,
    /// Timeout override for a new global transaction.
    pub timeout: Option<Duration>,
    /// Descriptive name for logs.
    pub name: Option<String>,
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self {
            propagation: Propagation::Required,
            read_only: false,
            distributed: true,
            timeout: None,
            name: None,
        }
    }
}

impl TransactionDefinition {
    /// REQUIRED, distributed, read-write.
    pub fn required() -> Self {
        Self::default()
    }

    /// REQUIRED, plain local transaction when nothing is bound.
    pub fn local() -> Self {
        Self {
            distributed: false,
            ..Self::default()
        }
    }

    /// Builder: set propagation.
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Builder: mark read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Builder: set timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: set name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// State of one resource-manager branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BranchState {
    /// Enlisted, work in progress.
    #[default]
    Active,
    /// Phase 1 complete, durably ready.
    Prepared,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// Partially committed outside the protocol.
    HeuristicMixed,
    /// Rolled back outside the protocol.
    HeuristicRollback,
}

impl BranchState {
    /// Check if transition to next state is valid.
    pub fn can_transition_to(&self, next: BranchState) -> bool {
        match (self, next) {
            (Self::Active, Self::Prepared) => true,
            (Self::Active, Self::RolledBack) => true,
            // one-phase commit
            (Self::Active, Self::Committed) => true,
            (Self::Active, Self::HeuristicRollback) => true,
            (Self::Prepared, Self::Committed) => true,
            (Self::Prepared, Self::RolledBack) => true,
            (Self::Prepared, Self::HeuristicMixed) => true,
            (Self::Prepared, Self::HeuristicRollback) => true,
            // idempotent completion
            (Self::Committed, Self::Committed) => true,
            (Self::RolledBack, Self::RolledBack) => true,
            _ => false,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active | Self::Prepared)
    }

    /// Check if this is a heuristic state.
    pub fn is_heuristic(&self) -> bool {
        matches!(self, Self::HeuristicMixed | Self::HeuristicRollback)
    }
}

/// Phase-1 vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// Branch did no writes; already complete.
    ReadOnly,
    /// Branch is prepared.
    Ok,
    /// Branch cannot commit.
    Rollback,
}

/// XA return code for a read-only vote.
pub const XA_RDONLY: i32 = 3;
/// XA return code for a positive vote.
pub const XA_OK: i32 = 0;
/// XA base rollback code.
pub const XA_RBROLLBACK: i32 = 100;

impl Vote {
    /// Numeric XA vote code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ReadOnly => XA_RDONLY,
            Self::Ok => XA_OK,
            Self::Rollback => XA_RBROLLBACK,
        }
    }

    /// Parse an XA vote code. Anything unrecognised is a rollback vote.
    pub fn from_code(code: i32) -> Self {
        match code {
            XA_OK => Self::Ok,
            XA_RDONLY => Self::ReadOnly,
            _ => Self::Rollback,
        }
    }

    /// Whether this vote allows the transaction to commit.
    pub fn allows_commit(&self) -> bool {
        matches!(self, Self::Ok | Self::ReadOnly)
    }
}

/// Outcome reported by a heuristic completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeuristicState {
    /// Branch committed on its own.
    Committed,
    /// Branch rolled back on its own.
    RolledBack,
    /// Some work committed, some rolled back.
    Mixed,
}

/// Coordinator-side phase of a global transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GlobalPhase {
    /// Accepting enlistments.
    #[default]
    Active,
    /// Phase 1 in progress.
    Preparing,
    /// Phase 2 commit in progress.
    Committing,
    /// Committed.
    Committed,
    /// Phase 2 rollback in progress.
    RollingBack,
    /// Rolled back.
    RolledBack,
    /// Finished with a heuristic outcome.
    Heuristic,
}

impl GlobalPhase {
    /// Check if transition to next phase is valid.
    pub fn can_transition_to(&self, next: GlobalPhase) -> bool {
        match (self, next) {
            (Self::Active, Self::Preparing) => true,
            (Self::Active, Self::Committing) => true, // one-phase
            (Self::Active, Self::RollingBack) => true,
            (Self::Preparing, Self::Committing) => true,
            (Self::Preparing, Self::RollingBack) => true,
            (Self::Committing, Self::Committed) => true,
            (Self::Committing, Self::RolledBack) => true, // one-phase failure
            (Self::Committing, Self::Heuristic) => true,
            (Self::RollingBack, Self::RolledBack) => true,
            (Self::RollingBack, Self::Heuristic) => true,
            _ => false,
        }
    }

    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Heuristic)
    }
}

/// Status reported by the transaction manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// No such transaction.
    NoTransaction,
    /// Active.
    Active,
    /// Marked rollback-only.
    MarkedRollback,
    /// Phase 1 running.
    Preparing,
    /// Phase 2 commit running.
    Committing,
    /// Committed.
    Committed,
    /// Phase 2 rollback running.
    RollingBack,
    /// Rolled back.
    RolledBack,
    /// Unknown (heuristic).
    Unknown,
}

/// Outcome delivered to completion listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionOutcome {
    /// Transaction committed.
    Committed,
    /// Transaction rolled back.
    RolledBack,
    /// Outcome could not be determined (heuristic or system failure).
    Unknown,
}

/// Delivery mode of a pending message batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    /// Block on the broker; batch when several.
    #[default]
    Sync,
    /// One independent send per message.
    Async,
}

impl DeliveryMode {
    /// Map an `async_mode` flag.
    pub fn from_async(async_mode: bool) -> Self {
        if async_mode {
            Self::Async
        } else {
            Self::Sync
        }
    }
}

/// Recovery scan flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverFlag {
    /// Start a recovery scan.
    StartScan,
    /// End a recovery scan.
    EndScan,
    /// No flags.
    NoFlags,
}

/// XA start-scan flag.
pub const XA_TMSTARTRSCAN: i32 = 0x0100_0000;
/// XA end-scan flag.
pub const XA_TMENDRSCAN: i32 = 0x0080_0000;
/// XA no flags.
pub const XA_TMNOFLAGS: i32 = 0;

impl RecoverFlag {
    /// Numeric XA flag.
    pub fn code(&self) -> i32 {
        match self {
            Self::StartScan => XA_TMSTARTRSCAN,
            Self::EndScan => XA_TMENDRSCAN,
            Self::NoFlags => XA_TMNOFLAGS,
        }
    }
}

/// Per-call-scope adapter state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// No transaction.
    #[default]
    Idle,
    /// Plain local transaction.
    LocalActive,
    /// This scope initiated the global transaction.
    GlobalInitiatorActive,
    /// This scope participates in someone else's global transaction.
    GlobalParticipantActive,
}
