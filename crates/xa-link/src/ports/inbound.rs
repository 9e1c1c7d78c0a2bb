//! # Inbound Ports
//!
//! The RPC-exposed enlistment contract. A participant's node calls the
//! coordinator to enlist branches; the coordinator calls participants to
//! prepare, complete and recover them.

use crate::domain::{BranchId, RecoverFlag, TransactionId, Vote, XaError};
use async_trait::async_trait;

/// Enlistment service - inbound port.
///
/// Every operation names the peer it is addressed to. A node serves calls
/// addressed to itself and forwards the rest over the transport.
#[async_trait]
pub trait EnlistmentService: Send + Sync {
    /// Register a branch for `resource_name` at `local_address` with the
    /// coordinator at `remote_address`.
    async fn enlist_resource(
        &self,
        remote_address: &str,
        transaction_id: &TransactionId,
        local_address: &str,
        resource_name: &str,
    ) -> Result<BranchId, XaError>;

    /// Phase 1 for one branch.
    async fn prepare(&self, remote_address: &str, branch: &BranchId) -> Result<Vote, XaError>;

    /// Phase 2 commit. Idempotent on a committed branch.
    async fn commit(
        &self,
        remote_address: &str,
        branch: &BranchId,
        one_phase: bool,
    ) -> Result<(), XaError>;

    /// Phase 2 rollback. Idempotent on a rolled-back branch.
    async fn rollback(&self, remote_address: &str, branch: &BranchId) -> Result<(), XaError>;

    /// Branches left prepared at `remote_address`.
    async fn recover(
        &self,
        remote_address: &str,
        flag: RecoverFlag,
    ) -> Result<Vec<BranchId>, XaError>;
}
