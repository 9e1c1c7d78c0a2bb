//! # Application Module
//!
//! Call-scoped transaction handling: the per-call scope, the local
//! transaction adapter and the transactional outbox.

pub mod adapter;
pub mod outbox;
pub mod scope;

pub use adapter::{LocalTransactionAdapter, TransactionHandle};
pub use outbox::{MessageBuffer, TransactionalOutbox};
pub use scope::{CallScope, ResourceBindings, ResumeError, SuspendedResources};
