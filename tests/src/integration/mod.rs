//! # Integration Scenarios
//!
//! Every scenario wires real nodes (transaction manager, enlistment node,
//! resource, adapter, outbox) and talks across them only through
//! propagated metadata and the enlistment protocol.

pub mod cluster;

mod flows;
mod properties;
mod recovery;
