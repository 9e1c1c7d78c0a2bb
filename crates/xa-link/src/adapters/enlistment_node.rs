//! Enlistment Node
//!
//! Implements `EnlistmentService` for one node. Calls addressed to the node
//! itself are served locally: enlistment against the coordinator's
//! transaction table, prepare/commit/rollback/recover against the branches
//! this node hosts. Everything else is forwarded over the RPC transport.
//!
//! The node is also the participant-side `BranchRegistry`: local branches
//! registered here are what the coordinator's phase-2 calls reach, and
//! completion listeners deferred here fire when those calls arrive.
//!
//! A branch leaves the live map once it completes. Its final state stays in
//! a bounded history so repeated phase-2 calls keep their answers.

use super::history::History;
use super::transaction_table::GlobalTransactionTable;
use crate::domain::{
    BranchId, BranchState, CompletionOutcome, HeuristicState, RecoverFlag, TransactionId, Vote,
    XaError,
};
use crate::ipc::{EnlistmentRequest, EnlistmentResponse};
use crate::ports::{BranchRegistry, CompletionListener, EnlistmentService, RpcTransport, XaResource};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resource name used for branches that only carry completion listeners.
pub const SYNCHRONIZATION_RESOURCE: &str = "xa-link-synchronization";

/// Completed branches remembered unless `with_completed_history` says otherwise.
pub const DEFAULT_COMPLETED_HISTORY: usize = 1_024;

struct LocalBranch {
    resource: Arc<dyn XaResource>,
    state: BranchState,
    /// Resource finished at prepare; phase 2 only settles listeners.
    read_only: bool,
}

/// One node's enlistment endpoint.
pub struct EnlistmentNode {
    local_address: String,
    table: Arc<GlobalTransactionTable>,
    transport: Arc<dyn RpcTransport>,
    call_deadline: Duration,
    branches: RwLock<HashMap<BranchId, LocalBranch>>,
    completed: Mutex<History<BranchId, BranchState>>,
    recoverable: RwLock<HashMap<String, Arc<dyn XaResource>>>,
    // lock order: deferred, branches, completed
    deferred: Mutex<HashMap<BranchId, Vec<Box<dyn CompletionListener>>>>,
}

impl EnlistmentNode {
    /// Create a node reachable at `local_address`.
    pub fn new(
        local_address: impl Into<String>,
        table: Arc<GlobalTransactionTable>,
        transport: Arc<dyn RpcTransport>,
        call_deadline: Duration,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            table,
            transport,
            call_deadline,
            branches: RwLock::new(HashMap::new()),
            completed: Mutex::new(History::new(DEFAULT_COMPLETED_HISTORY)),
            recoverable: RwLock::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
        }
    }

    /// Remember at most `capacity` completed branches.
    pub fn with_completed_history(self, capacity: usize) -> Self {
        *self.completed.lock() = History::new(capacity);
        self
    }

    /// This node's address.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Make a resource's prepared branches visible to recovery scans.
    pub fn register_recoverable(&self, resource: Arc<dyn XaResource>) {
        self.recoverable
            .write()
            .entry(resource.resource_name().to_string())
            .or_insert(resource);
    }

    /// State of a branch hosted here, live or recently completed.
    pub fn branch_state(&self, branch: &BranchId) -> Option<BranchState> {
        if let Some(local) = self.branches.read().get(branch) {
            return Some(local.state);
        }
        self.completed.lock().get(branch).copied()
    }

    /// Branches hosted here that have not completed.
    pub fn live_branch_count(&self) -> usize {
        self.branches.read().len()
    }

    /// Branches with listeners still waiting for an outcome.
    pub fn deferred_branch_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Completed branches still remembered.
    pub fn completed_branch_count(&self) -> usize {
        self.completed.lock().len()
    }

    /// Forget every hosted branch and deferred listener, as after a restart.
    ///
    /// Resources registered for recovery are kept.
    pub fn simulate_restart(&self) {
        let mut deferred = self.deferred.lock();
        self.branches.write().clear();
        self.completed.lock().clear();
        deferred.clear();
        info!(node = %self.local_address, "Participant state cleared");
    }

    /// Serve one inbound request.
    pub async fn handle(&self, request: EnlistmentRequest) -> EnlistmentResponse {
        let op = request.op_name();
        let result = match request {
            EnlistmentRequest::EnlistResource {
                transaction_id,
                local_address,
                resource_name,
            } => self
                .serve_enlist(&transaction_id, &local_address, &resource_name)
                .await
                .map(|branch| EnlistmentResponse::Enlisted { branch }),
            EnlistmentRequest::Prepare { branch } => self
                .serve_prepare(&branch)
                .await
                .map(|vote| EnlistmentResponse::Voted { vote }),
            EnlistmentRequest::Commit { branch, one_phase } => self
                .serve_commit(&branch, one_phase)
                .await
                .map(|_| EnlistmentResponse::Done),
            EnlistmentRequest::Rollback { branch } => self
                .serve_rollback(&branch)
                .await
                .map(|_| EnlistmentResponse::Done),
            EnlistmentRequest::Recover { flag } => self
                .serve_recover(flag)
                .await
                .map(|branches| EnlistmentResponse::Recovered { branches }),
        };

        result.unwrap_or_else(|e| {
            debug!(node = %self.local_address, op, error = %e, "Request rejected");
            EnlistmentResponse::from_error(&e)
        })
    }

    fn is_local(&self, remote_address: &str) -> bool {
        remote_address == self.local_address
    }

    async fn call(
        &self,
        remote_address: &str,
        request: EnlistmentRequest,
    ) -> Result<EnlistmentResponse, XaError> {
        let op = request.op_name();
        debug!(from = %self.local_address, to = remote_address, op, "Enlistment call");
        let response = tokio::time::timeout(
            self.call_deadline,
            self.transport.call(remote_address, request),
        )
        .await
        .map_err(|_| XaError::Timeout {
            address: remote_address.to_string(),
            millis: self.call_deadline.as_millis() as u64,
        })??;
        response.into_result()
    }

    // =========================================================================
    // Local serving
    // =========================================================================

    async fn serve_enlist(
        &self,
        transaction_id: &TransactionId,
        participant_address: &str,
        resource_name: &str,
    ) -> Result<BranchId, XaError> {
        self.table
            .enlist(transaction_id, participant_address, resource_name)
            .await
    }

    fn known_state(&self, branch: &BranchId) -> Result<BranchState, XaError> {
        self.branch_state(branch)
            .ok_or_else(|| XaError::UnknownBranch(branch.clone()))
    }

    /// Resource of a branch that has not completed.
    fn live(&self, branch: &BranchId) -> Result<(Arc<dyn XaResource>, bool), XaError> {
        self.branches
            .read()
            .get(branch)
            .map(|b| (b.resource.clone(), b.read_only))
            .ok_or_else(|| XaError::UnknownBranch(branch.clone()))
    }

    fn set_state(&self, branch: &BranchId, state: BranchState) {
        if let Some(local) = self.branches.write().get_mut(branch) {
            local.state = state;
        }
    }

    /// Retire a completed branch and hand its deferred listeners `outcome`.
    fn finish(&self, branch: &BranchId, state: BranchState, outcome: CompletionOutcome) {
        let listeners = {
            let mut deferred = self.deferred.lock();
            self.branches.write().remove(branch);
            self.completed.lock().insert(branch.clone(), state);
            deferred.remove(branch)
        };
        if let Some(listeners) = listeners {
            debug!(branch = %branch, ?outcome, listeners = listeners.len(), "Settling deferred listeners");
            run_listeners(listeners, outcome);
        }
    }

    async fn serve_prepare(&self, branch: &BranchId) -> Result<Vote, XaError> {
        let state = self.known_state(branch)?;
        match state {
            BranchState::Active => {}
            BranchState::Prepared => return Ok(Vote::Ok),
            other => {
                return Err(XaError::InvalidTransition {
                    from: format!("{:?}", other),
                    to: "Prepared".to_string(),
                })
            }
        }

        let (resource, _) = self.live(branch)?;
        match resource.prepare(branch).await {
            Ok(Vote::Ok) => {
                self.set_state(branch, BranchState::Prepared);
                Ok(Vote::Ok)
            }
            Ok(Vote::ReadOnly) => {
                let deferred = self.deferred.lock();
                if deferred.contains_key(branch) {
                    // listeners still need to hear the outcome
                    if let Some(local) = self.branches.write().get_mut(branch) {
                        local.state = BranchState::Prepared;
                        local.read_only = true;
                    }
                    Ok(Vote::Ok)
                } else {
                    drop(deferred);
                    self.finish(branch, BranchState::Committed, CompletionOutcome::Committed);
                    Ok(Vote::ReadOnly)
                }
            }
            Ok(Vote::Rollback) => {
                self.finish(branch, BranchState::RolledBack, CompletionOutcome::RolledBack);
                Ok(Vote::Rollback)
            }
            Err(e) => {
                warn!(branch = %branch, error = %e, "Prepare failed at participant");
                if let Err(rollback) = resource.rollback(branch).await {
                    debug!(branch = %branch, error = %rollback, "Rollback after failed prepare");
                }
                self.finish(branch, BranchState::RolledBack, CompletionOutcome::RolledBack);
                Err(e)
            }
        }
    }

    async fn serve_commit(&self, branch: &BranchId, one_phase: bool) -> Result<(), XaError> {
        let state = self.known_state(branch)?;
        match state {
            BranchState::Committed => return Ok(()),
            BranchState::RolledBack | BranchState::HeuristicRollback => {
                return Err(XaError::HeuristicCompletion {
                    state: HeuristicState::RolledBack,
                    reason: format!("branch {} already rolled back", branch),
                })
            }
            BranchState::HeuristicMixed => {
                return Err(XaError::HeuristicCompletion {
                    state: HeuristicState::Mixed,
                    reason: format!("branch {} completed heuristically", branch),
                })
            }
            BranchState::Active if !one_phase => {
                return Err(XaError::InvalidTransition {
                    from: "Active".to_string(),
                    to: "Committed".to_string(),
                })
            }
            BranchState::Active | BranchState::Prepared => {}
        }

        let (resource, read_only) = self.live(branch)?;
        let result = if read_only {
            Ok(())
        } else {
            resource.commit(branch, one_phase).await
        };

        match result {
            Ok(()) => {
                self.finish(branch, BranchState::Committed, CompletionOutcome::Committed);
                debug!(branch = %branch, one_phase, "Branch committed");
                Ok(())
            }
            Err(XaError::HeuristicCompletion { state, reason }) => {
                let (branch_state, outcome) = match state {
                    HeuristicState::Committed => {
                        (BranchState::Committed, CompletionOutcome::Committed)
                    }
                    HeuristicState::RolledBack => {
                        (BranchState::HeuristicRollback, CompletionOutcome::RolledBack)
                    }
                    HeuristicState::Mixed => (BranchState::HeuristicMixed, CompletionOutcome::Unknown),
                };
                self.finish(branch, branch_state, outcome);
                Err(XaError::HeuristicCompletion { state, reason })
            }
            Err(e) => {
                if one_phase {
                    self.finish(branch, BranchState::RolledBack, CompletionOutcome::RolledBack);
                }
                Err(e)
            }
        }
    }

    async fn serve_rollback(&self, branch: &BranchId) -> Result<(), XaError> {
        let state = self.known_state(branch)?;
        match state {
            BranchState::RolledBack | BranchState::HeuristicRollback => return Ok(()),
            BranchState::Committed => {
                return Err(XaError::HeuristicCompletion {
                    state: HeuristicState::Committed,
                    reason: format!("branch {} already committed", branch),
                })
            }
            BranchState::HeuristicMixed => {
                return Err(XaError::HeuristicCompletion {
                    state: HeuristicState::Mixed,
                    reason: format!("branch {} completed heuristically", branch),
                })
            }
            BranchState::Active | BranchState::Prepared => {}
        }

        let (resource, read_only) = self.live(branch)?;
        if !read_only {
            resource.rollback(branch).await?;
        }
        self.finish(branch, BranchState::RolledBack, CompletionOutcome::RolledBack);
        debug!(branch = %branch, "Branch rolled back");
        Ok(())
    }

    async fn serve_recover(&self, flag: RecoverFlag) -> Result<Vec<BranchId>, XaError> {
        if flag == RecoverFlag::EndScan {
            return Ok(Vec::new());
        }

        if flag == RecoverFlag::StartScan {
            let resources: Vec<_> = self.recoverable.read().values().cloned().collect();
            for resource in resources {
                for branch in resource.recover().await? {
                    self.branches
                        .write()
                        .entry(branch)
                        .or_insert_with(|| LocalBranch {
                            resource: resource.clone(),
                            state: BranchState::Prepared,
                            read_only: false,
                        });
                }
            }
        }

        let mut prepared: Vec<BranchId> = self
            .branches
            .read()
            .iter()
            .filter(|(_, b)| b.state == BranchState::Prepared)
            .map(|(id, _)| id.clone())
            .collect();
        prepared.sort();
        debug!(node = %self.local_address, count = prepared.len(), "Recovery scan");
        Ok(prepared)
    }
}

fn run_listeners(listeners: Vec<Box<dyn CompletionListener>>, outcome: CompletionOutcome) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                for listener in listeners {
                    listener.after_completion(outcome).await;
                }
            });
        }
        Err(e) => warn!(error = %e, "No runtime for completion listeners; dropping them"),
    }
}

#[async_trait]
impl EnlistmentService for EnlistmentNode {
    async fn enlist_resource(
        &self,
        remote_address: &str,
        transaction_id: &TransactionId,
        local_address: &str,
        resource_name: &str,
    ) -> Result<BranchId, XaError> {
        if self.is_local(remote_address) {
            return self
                .serve_enlist(transaction_id, local_address, resource_name)
                .await;
        }
        let request = EnlistmentRequest::EnlistResource {
            transaction_id: transaction_id.clone(),
            local_address: local_address.to_string(),
            resource_name: resource_name.to_string(),
        };
        match self.call(remote_address, request).await? {
            EnlistmentResponse::Enlisted { branch } => Ok(branch),
            other => Err(other.unexpected("enlist_resource")),
        }
    }

    async fn prepare(&self, remote_address: &str, branch: &BranchId) -> Result<Vote, XaError> {
        if self.is_local(remote_address) {
            return self.serve_prepare(branch).await;
        }
        let request = EnlistmentRequest::Prepare {
            branch: branch.clone(),
        };
        match self.call(remote_address, request).await? {
            EnlistmentResponse::Voted { vote } => Ok(vote),
            other => Err(other.unexpected("prepare")),
        }
    }

    async fn commit(
        &self,
        remote_address: &str,
        branch: &BranchId,
        one_phase: bool,
    ) -> Result<(), XaError> {
        if self.is_local(remote_address) {
            return self.serve_commit(branch, one_phase).await;
        }
        let request = EnlistmentRequest::Commit {
            branch: branch.clone(),
            one_phase,
        };
        match self.call(remote_address, request).await? {
            EnlistmentResponse::Done => Ok(()),
            other => Err(other.unexpected("commit")),
        }
    }

    async fn rollback(&self, remote_address: &str, branch: &BranchId) -> Result<(), XaError> {
        if self.is_local(remote_address) {
            return self.serve_rollback(branch).await;
        }
        let request = EnlistmentRequest::Rollback {
            branch: branch.clone(),
        };
        match self.call(remote_address, request).await? {
            EnlistmentResponse::Done => Ok(()),
            other => Err(other.unexpected("rollback")),
        }
    }

    async fn recover(
        &self,
        remote_address: &str,
        flag: RecoverFlag,
    ) -> Result<Vec<BranchId>, XaError> {
        if self.is_local(remote_address) {
            return self.serve_recover(flag).await;
        }
        match self
            .call(remote_address, EnlistmentRequest::Recover { flag })
            .await?
        {
            EnlistmentResponse::Recovered { branches } => Ok(branches),
            other => Err(other.unexpected("recover")),
        }
    }
}

impl BranchRegistry for EnlistmentNode {
    fn register_local_branch(&self, branch: BranchId, resource: Arc<dyn XaResource>) {
        debug!(node = %self.local_address, branch = %branch, resource = resource.resource_name(),
            "Registered local branch");
        if resource.resource_name() != SYNCHRONIZATION_RESOURCE {
            self.register_recoverable(resource.clone());
        }
        self.branches.write().insert(
            branch,
            LocalBranch {
                resource,
                state: BranchState::Active,
                read_only: false,
            },
        );
    }

    fn defer_completion(&self, branch: &BranchId, listeners: Vec<Box<dyn CompletionListener>>) {
        if listeners.is_empty() {
            return;
        }
        // the state is read under the same lock `finish` settles under
        let mut deferred = self.deferred.lock();
        let settled = match self.branch_state(branch) {
            Some(BranchState::Committed) => Some(CompletionOutcome::Committed),
            Some(BranchState::RolledBack) | Some(BranchState::HeuristicRollback) => {
                Some(CompletionOutcome::RolledBack)
            }
            Some(BranchState::HeuristicMixed) => Some(CompletionOutcome::Unknown),
            Some(_) => None,
            None => Some(CompletionOutcome::Unknown),
        };

        match settled {
            Some(outcome) => {
                drop(deferred);
                run_listeners(listeners, outcome);
            }
            None => deferred.entry(branch.clone()).or_default().extend(listeners),
        }
    }
}

/// XA resource standing in for a participant that touched no resource but
/// still needs to hear the transaction outcome.
///
/// Ending it unsuccessfully dooms the branch, so its prepare votes
/// `Rollback`.
#[derive(Debug, Default)]
pub struct SynchronizationResource {
    doomed: AtomicBool,
}

impl SynchronizationResource {
    /// Create an undoomed synchronization branch resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the branch was ended unsuccessfully.
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl XaResource for SynchronizationResource {
    fn resource_name(&self) -> &str {
        SYNCHRONIZATION_RESOURCE
    }

    async fn start(&self, _branch: &BranchId) -> Result<(), XaError> {
        Ok(())
    }

    async fn end(&self, _branch: &BranchId, success: bool) -> Result<(), XaError> {
        if !success {
            self.doomed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn prepare(&self, _branch: &BranchId) -> Result<Vote, XaError> {
        if self.is_doomed() {
            Ok(Vote::Rollback)
        } else {
            Ok(Vote::ReadOnly)
        }
    }

    async fn commit(&self, branch: &BranchId, _one_phase: bool) -> Result<(), XaError> {
        if self.is_doomed() {
            return Err(XaError::Resource(format!(
                "synchronization branch {} was ended with failure",
                branch
            )));
        }
        Ok(())
    }

    async fn rollback(&self, _branch: &BranchId) -> Result<(), XaError> {
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<BranchId>, XaError> {
        Ok(Vec::new())
    }
}
