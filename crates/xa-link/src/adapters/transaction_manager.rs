//! XA Transaction Manager
//!
//! In-memory implementation of the `TransactionManager` port. Global
//! transactions live in the shared `GlobalTransactionTable`; completion is
//! driven by the `TwoPhaseCoordinator`. A commit or heuristic decision that
//! left branches in doubt is pinned until recovery resolves them; every
//! other decision goes to a bounded history for status queries.

use super::history::History;
use super::transaction_table::GlobalTransactionTable;
use crate::algorithms::{CompletionReport, TwoPhaseCoordinator, TwoPhaseOutcome};
use crate::config::XaConfig;
use crate::domain::{
    BranchId, CompletionOutcome, CompositeTransaction, GlobalPhase, GlobalTransaction,
    HeuristicState, RecoverFlag, TransactionId, TransactionManagerError, TransactionStatus,
    XaError,
};
use crate::ports::{EnlistmentService, TimeSource, TransactionManager};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decision recorded once a transaction completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordedDecision {
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// Completed heuristically; never auto-resolved.
    Heuristic,
}

/// How recovery resolved one in-doubt branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredBranch {
    /// The branch.
    pub branch: BranchId,
    /// Outcome applied to it.
    pub outcome: CompletionOutcome,
}

/// In-memory XA transaction manager.
pub struct XaTransactionManager {
    coordinator_address: String,
    table: Arc<GlobalTransactionTable>,
    service: Arc<dyn EnlistmentService>,
    coordinator: TwoPhaseCoordinator,
    time: Arc<dyn TimeSource>,
    default_timeout: RwLock<Duration>,
    decisions: RwLock<History<TransactionId, RecordedDecision>>,
    in_doubt: RwLock<HashMap<TransactionId, InDoubt>>,
}

/// A decision some branches have not heard yet.
struct InDoubt {
    decision: RecordedDecision,
    branches: HashSet<BranchId>,
}

impl XaTransactionManager {
    /// Create a manager coordinating from `config.local_address`.
    pub fn new(
        config: &XaConfig,
        table: Arc<GlobalTransactionTable>,
        service: Arc<dyn EnlistmentService>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let coordinator = TwoPhaseCoordinator::new(
            service.clone(),
            time.clone(),
            config.prepare_timeout(),
            config.completion_timeout(),
        );
        Self {
            coordinator_address: config.local_address.clone(),
            table,
            service,
            coordinator,
            time,
            default_timeout: RwLock::new(config.default_timeout()),
            decisions: RwLock::new(History::new(config.completed_history)),
            in_doubt: RwLock::new(HashMap::new()),
        }
    }

    /// Decision recorded for a completed transaction.
    pub fn decision(&self, transaction_id: &TransactionId) -> Option<RecordedDecision> {
        if let Some(pinned) = self.in_doubt.read().get(transaction_id) {
            return Some(pinned.decision);
        }
        self.decisions.read().get(transaction_id).copied()
    }

    /// Decisions kept because some branch has not heard them.
    pub fn in_doubt_count(&self) -> usize {
        self.in_doubt.read().len()
    }

    /// Decisions kept in the bounded history.
    pub fn decision_count(&self) -> usize {
        self.decisions.read().len()
    }

    /// Roll back every running transaction whose deadline has passed.
    ///
    /// Returns the ids rolled back.
    pub async fn reap_expired(&self) -> Vec<TransactionId> {
        let now = self.time.now();
        let mut reaped = Vec::new();
        for tid in self.table.transaction_ids() {
            let Some(entry) = self.table.get(&tid) else {
                continue;
            };
            let mut tx = entry.lock().await;
            if tx.phase != GlobalPhase::Active || !tx.is_expired(now) {
                continue;
            }
            info!(tid = %tid, "Rolling back expired transaction");
            let result = self.coordinator.rollback(&mut tx, "transaction timed out").await;
            drop(tx);
            if let Err(e) = self.finish(&tid, result) {
                debug!(tid = %tid, outcome = %e, "Expired transaction completed");
            }
            reaped.push(tid);
        }
        reaped
    }

    /// Resolve branches left prepared at `participant_address`.
    ///
    /// Branches of transactions decided committed are committed; everything
    /// else without a decision is rolled back (presumed abort). Transactions
    /// still running here and heuristic outcomes are left alone.
    pub async fn recover_participant(
        &self,
        participant_address: &str,
    ) -> Result<Vec<RecoveredBranch>, XaError> {
        let in_doubt = self
            .service
            .recover(participant_address, RecoverFlag::StartScan)
            .await?;
        let mut resolved = Vec::new();

        for branch in in_doubt {
            if self.table.get(&branch.transaction_id).is_some() {
                debug!(branch = %branch, "Transaction still running, skipping");
                continue;
            }
            let outcome = match self.decision(&branch.transaction_id) {
                Some(RecordedDecision::Committed) => {
                    self.service
                        .commit(participant_address, &branch, false)
                        .await?;
                    CompletionOutcome::Committed
                }
                Some(RecordedDecision::Heuristic) => {
                    warn!(branch = %branch, "Heuristic transaction left for manual resolution");
                    continue;
                }
                Some(RecordedDecision::RolledBack) | None => {
                    self.service.rollback(participant_address, &branch).await?;
                    CompletionOutcome::RolledBack
                }
            };
            info!(branch = %branch, ?outcome, "Recovered in-doubt branch");
            self.branch_resolved(&branch);
            resolved.push(RecoveredBranch { branch, outcome });
        }

        self.service
            .recover(participant_address, RecoverFlag::EndScan)
            .await?;
        Ok(resolved)
    }

    fn finish(
        &self,
        transaction_id: &TransactionId,
        result: Result<CompletionReport, XaError>,
    ) -> Result<(), TransactionManagerError> {
        self.table.remove(transaction_id);
        let report = result.map_err(|e| {
            warn!(tid = %transaction_id, error = %e, "Completion failed");
            TransactionManagerError::System(e.to_string())
        });
        let (decision, unresolved) = match &report {
            Ok(report) => (
                match report.outcome {
                    TwoPhaseOutcome::Committed => RecordedDecision::Committed,
                    TwoPhaseOutcome::RolledBack(_) => RecordedDecision::RolledBack,
                    TwoPhaseOutcome::Heuristic { .. } => RecordedDecision::Heuristic,
                },
                report.unresolved.as_slice(),
            ),
            Err(_) => (RecordedDecision::RolledBack, &[] as &[BranchId]),
        };
        self.record(transaction_id, decision, unresolved);

        match report?.outcome {
            TwoPhaseOutcome::Committed => Ok(()),
            TwoPhaseOutcome::RolledBack(reason) => Err(TransactionManagerError::RolledBack(reason)),
            TwoPhaseOutcome::Heuristic {
                state: HeuristicState::RolledBack,
                reason,
            } => Err(TransactionManagerError::HeuristicRollback(reason)),
            TwoPhaseOutcome::Heuristic {
                state: HeuristicState::Committed,
                ..
            } => Ok(()),
            TwoPhaseOutcome::Heuristic { reason, .. } => {
                Err(TransactionManagerError::HeuristicMixed(reason))
            }
        }
    }

    /// Keep `decision` for as long as someone may ask for it. Rolled-back
    /// branches need no record: recovery presumes abort.
    fn record(
        &self,
        transaction_id: &TransactionId,
        decision: RecordedDecision,
        unresolved: &[BranchId],
    ) {
        if unresolved.is_empty() || decision == RecordedDecision::RolledBack {
            self.decisions
                .write()
                .insert(transaction_id.clone(), decision);
            return;
        }
        debug!(tid = %transaction_id, ?decision, branches = unresolved.len(), "Decision pinned for recovery");
        self.in_doubt.write().insert(
            transaction_id.clone(),
            InDoubt {
                decision,
                branches: unresolved.iter().cloned().collect(),
            },
        );
    }

    /// Unpin a decision once its last in-doubt branch is resolved.
    fn branch_resolved(&self, branch: &BranchId) {
        let mut in_doubt = self.in_doubt.write();
        let Some(pinned) = in_doubt.get_mut(&branch.transaction_id) else {
            return;
        };
        pinned.branches.remove(branch);
        if pinned.branches.is_empty() {
            let decision = pinned.decision;
            in_doubt.remove(&branch.transaction_id);
            drop(in_doubt);
            self.decisions
                .write()
                .insert(branch.transaction_id.clone(), decision);
        }
    }

    fn no_transaction(&self, transaction_id: &TransactionId) -> TransactionManagerError {
        match self.decision(transaction_id) {
            Some(decision) => TransactionManagerError::IllegalState(format!(
                "transaction {} already completed ({:?})",
                transaction_id, decision
            )),
            None => TransactionManagerError::IllegalState(format!(
                "no transaction {}",
                transaction_id
            )),
        }
    }
}

#[async_trait]
impl TransactionManager for XaTransactionManager {
    async fn begin(
        &self,
        timeout: Option<Duration>,
    ) -> Result<CompositeTransaction, TransactionManagerError> {
        let timeout = timeout.unwrap_or(*self.default_timeout.read());
        let tid = TransactionId::generate();
        self.table.insert(GlobalTransaction::new(
            tid.clone(),
            self.coordinator_address.clone(),
            timeout,
            self.time.now(),
        ));
        info!(tid = %tid, timeout_ms = timeout.as_millis() as u64, "Global transaction begun");
        Ok(CompositeTransaction {
            transaction_id: tid,
            timeout,
        })
    }

    async fn commit(&self, transaction_id: &TransactionId) -> Result<(), TransactionManagerError> {
        let entry = self
            .table
            .get(transaction_id)
            .ok_or_else(|| self.no_transaction(transaction_id))?;
        let mut tx = entry.lock().await;
        if tx.phase != GlobalPhase::Active {
            return Err(TransactionManagerError::IllegalState(format!(
                "transaction {} is {:?}",
                transaction_id, tx.phase
            )));
        }

        let result = self.coordinator.commit(&mut tx).await;
        drop(tx);
        if let Ok(report) = &result {
            for branch in &report.unresolved {
                warn!(tid = %transaction_id, branch = %branch, "Branch awaiting recovery");
            }
        }
        self.finish(transaction_id, result)
    }

    async fn rollback(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<(), TransactionManagerError> {
        let entry = self
            .table
            .get(transaction_id)
            .ok_or_else(|| self.no_transaction(transaction_id))?;
        let mut tx = entry.lock().await;
        if tx.phase != GlobalPhase::Active {
            return Err(TransactionManagerError::IllegalState(format!(
                "transaction {} is {:?}",
                transaction_id, tx.phase
            )));
        }

        let result = self.coordinator.rollback(&mut tx, "rollback requested").await;
        drop(tx);
        match self.finish(transaction_id, result) {
            Err(TransactionManagerError::RolledBack(_)) => Ok(()),
            other => other,
        }
    }

    async fn status(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<TransactionStatus, TransactionManagerError> {
        if let Some(entry) = self.table.get(transaction_id) {
            let tx = entry.lock().await;
            return Ok(match tx.phase {
                GlobalPhase::Active if tx.rollback_only => TransactionStatus::MarkedRollback,
                GlobalPhase::Active => TransactionStatus::Active,
                GlobalPhase::Preparing => TransactionStatus::Preparing,
                GlobalPhase::Committing => TransactionStatus::Committing,
                GlobalPhase::Committed => TransactionStatus::Committed,
                GlobalPhase::RollingBack => TransactionStatus::RollingBack,
                GlobalPhase::RolledBack => TransactionStatus::RolledBack,
                GlobalPhase::Heuristic => TransactionStatus::Unknown,
            });
        }
        Ok(match self.decision(transaction_id) {
            Some(RecordedDecision::Committed) => TransactionStatus::Committed,
            Some(RecordedDecision::RolledBack) => TransactionStatus::RolledBack,
            Some(RecordedDecision::Heuristic) => TransactionStatus::Unknown,
            None => TransactionStatus::NoTransaction,
        })
    }

    fn set_transaction_timeout(&self, timeout: Duration) {
        *self.default_timeout.write() = timeout;
    }

    async fn set_rollback_only(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<(), TransactionManagerError> {
        let entry = self
            .table
            .get(transaction_id)
            .ok_or_else(|| self.no_transaction(transaction_id))?;
        entry.lock().await.rollback_only = true;
        debug!(tid = %transaction_id, "Marked rollback-only");
        Ok(())
    }

    async fn composite_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Option<CompositeTransaction> {
        let entry = self.table.get(transaction_id)?;
        let tx = entry.lock().await;
        Some(CompositeTransaction {
            transaction_id: tx.transaction_id.clone(),
            timeout: tx.timeout,
        })
    }
}
