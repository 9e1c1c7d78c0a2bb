//! # Adapters Layer (Hexagonal Architecture)
//!
//! In-memory implementations of the outbound ports plus the node that
//! serves the enlistment protocol.

mod enlistment_node;
mod history;
mod in_memory_broker;
mod in_memory_resource;
mod in_memory_transport;
mod send_log;
mod transaction_manager;
mod transaction_table;

pub use enlistment_node::{
    EnlistmentNode, SynchronizationResource, DEFAULT_COMPLETED_HISTORY, SYNCHRONIZATION_RESOURCE,
};
pub use in_memory_broker::InMemoryBroker;
pub use in_memory_resource::{InMemoryResourceDriver, InMemoryXaSession};
pub use in_memory_transport::{CallRecord, InMemoryTransport};
pub use send_log::InMemorySendLog;
pub use transaction_manager::{RecordedDecision, RecoveredBranch, XaTransactionManager};
pub use transaction_table::{GlobalTransactionTable, TransactionEntry};
