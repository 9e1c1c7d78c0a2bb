//! # xa-link
//!
//! Two-phase-commit transactions propagated across RPC boundaries.
//!
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Make one logical unit of work span several independently deployed
//! services so that it commits everywhere or rolls back everywhere:
//! - Transaction context propagated in RPC call metadata
//! - Enlistment protocol (enlist, prepare, commit, rollback, recover)
//! - Per-call adapter choosing a global or a plain local transaction
//! - Outbound broker messages buffered until the outcome is known
//!
//! ## Roles
//!
//! | Role | Begins with | Completes |
//! |------|-------------|-----------|
//! | Initiator | no bound context | drives 2PC through the transaction manager |
//! | Participant | propagated context | ends its branch; the coordinator finishes it |
//! | Local | non-distributed begin | native commit/rollback |
//!
//! ## Module Structure
//!
//! ```text
//! xa-link/
//! ├── domain/          # Context, branches, global transaction, message batch
//! ├── algorithms/      # Propagation rules, 2PC coordinator
//! ├── ports/           # Enlistment API + transaction manager, resource, broker traits
//! ├── ipc/             # Context headers and enlistment wire messages
//! ├── adapters/        # Enlistment node and in-memory port implementations
//! ├── application/     # Call scope, local transaction adapter, outbox
//! └── config.rs        # Timeouts, deadlines, addresses
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod application;
pub mod config;
pub mod domain;
pub mod ipc;
pub mod ports;

// Re-exports
pub use adapters::{
    EnlistmentNode, GlobalTransactionTable, InMemoryBroker, InMemoryResourceDriver,
    InMemorySendLog, InMemoryTransport, RecordedDecision, RecoveredBranch,
    SynchronizationResource, XaTransactionManager,
};
pub use algorithms::{decide_begin, decide_outcome, BeginDecision, TwoPhaseCoordinator};
pub use application::{
    CallScope, LocalTransactionAdapter, MessageBuffer, ResumeError, SuspendedResources,
    TransactionHandle, TransactionalOutbox,
};
pub use config::XaConfig;
pub use domain::{
    AdapterState, Branch, BranchId, BranchState, CompletionOutcome, DeliveryMode,
    GlobalTransaction, HeuristicState, Message, Propagation, RecoverFlag, Role, SendLogEntry,
    SendOutcome, SendReceipt, TransactionContext, TransactionDefinition, TransactionId,
    TransactionManagerError, TransactionStatus, Vote, XaError,
};
pub use ipc::{EnlistmentRequest, EnlistmentResponse, RpcMetadata};
pub use ports::{
    BranchRegistry, CompletionListener, EnlistmentService, MessageProducer, MockTimeSource,
    ResourceDriver, ResourceHandle, RpcTransport, SendLog, SystemTimeSource, TimeSource,
    TransactionManager, XaResource,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
