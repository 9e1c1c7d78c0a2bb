//! # Ports Module
//!
//! Inbound API and outbound dependency traits.

pub mod inbound;
pub mod outbound;

pub use inbound::EnlistmentService;
pub use outbound::{
    BranchRegistry, CompletionListener, LocalTxHandle, MessageProducer, MockTimeSource,
    ResourceDriver, ResourceHandle, RpcTransport, SendCallback, SendLog, SystemTimeSource,
    TimeSource, TransactionManager, XaResource,
};
