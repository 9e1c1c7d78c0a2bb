//! # Two-Phase Commit Protocol
//!
//! 2PC coordinator for a global transaction whose branches live on remote
//! participants. Phase 1 fans out `prepare` concurrently, phase 2 fans out
//! `commit` or `rollback` to every branch that still has work to complete.

use crate::domain::{
    invariant_atomic_outcome, invariant_phase_ordering, BranchId, BranchState, GlobalPhase,
    GlobalTransaction, HeuristicState, XaError, Vote,
};
use crate::ports::{EnlistmentService, TimeSource};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Phase-2 decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Commit every prepared branch.
    Commit,
    /// Roll back every branch that did not vote read-only.
    Rollback,
}

/// Final outcome of a coordinated completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TwoPhaseOutcome {
    /// All work committed.
    Committed,
    /// All work rolled back.
    RolledBack(String),
    /// Participants completed outside the protocol.
    Heuristic {
        /// Aggregated heuristic state.
        state: HeuristicState,
        /// Detail.
        reason: String,
    },
}

/// Result of driving a transaction to completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionReport {
    /// Outcome reported to the initiator.
    pub outcome: TwoPhaseOutcome,
    /// Branches whose phase-2 call could not be delivered; left for recovery.
    pub unresolved: Vec<BranchId>,
}

/// 2PC coordinator.
pub struct TwoPhaseCoordinator {
    service: Arc<dyn EnlistmentService>,
    time: Arc<dyn TimeSource>,
    prepare_timeout: Duration,
    completion_timeout: Duration,
}

impl TwoPhaseCoordinator {
    /// Create a new 2PC coordinator.
    pub fn new(
        service: Arc<dyn EnlistmentService>,
        time: Arc<dyn TimeSource>,
        prepare_timeout: Duration,
        completion_timeout: Duration,
    ) -> Self {
        Self {
            service,
            time,
            prepare_timeout,
            completion_timeout,
        }
    }

    /// Drive `tx` to completion, committing when every branch agrees.
    pub async fn commit(&self, tx: &mut GlobalTransaction) -> Result<CompletionReport, XaError> {
        if tx.rollback_only {
            return self.rollback_all(tx, "transaction marked rollback-only").await;
        }
        if tx.is_expired(self.time.now()) {
            return self.rollback_all(tx, "transaction timed out").await;
        }

        match tx.branches.len() {
            0 => {
                tx.transition_to(GlobalPhase::Committing)?;
                tx.transition_to(GlobalPhase::Committed)?;
                info!(tid = %tx.transaction_id, "Committed transaction without branches");
                Ok(CompletionReport {
                    outcome: TwoPhaseOutcome::Committed,
                    unresolved: Vec::new(),
                })
            }
            1 => self.commit_one_phase(tx).await,
            _ => self.commit_two_phase(tx).await,
        }
    }

    /// Roll back every branch of `tx`.
    pub async fn rollback(
        &self,
        tx: &mut GlobalTransaction,
        reason: &str,
    ) -> Result<CompletionReport, XaError> {
        self.rollback_all(tx, reason).await
    }

    async fn commit_one_phase(
        &self,
        tx: &mut GlobalTransaction,
    ) -> Result<CompletionReport, XaError> {
        tx.transition_to(GlobalPhase::Committing)?;
        let (address, branch_id) = {
            let branch = &tx.branches[0];
            (branch.participant_address.clone(), branch.branch_id.clone())
        };
        debug!(tid = %tx.transaction_id, branch = %branch_id, "One-phase commit");

        let result = tokio::time::timeout(
            self.completion_timeout,
            self.service.commit(&address, &branch_id, true),
        )
        .await
        .unwrap_or_else(|_| Err(self.timeout_error(&address, self.completion_timeout)));

        match result {
            Ok(()) => {
                tx.branches[0].transition_to(BranchState::Committed)?;
                tx.transition_to(GlobalPhase::Committed)?;
                info!(tid = %tx.transaction_id, "Committed transaction (one phase)");
                Ok(CompletionReport {
                    outcome: TwoPhaseOutcome::Committed,
                    unresolved: Vec::new(),
                })
            }
            Err(XaError::HeuristicCompletion { state, reason }) => {
                let branch_state = heuristic_branch_state(Decision::Commit, state);
                tx.branches[0].state = branch_state;
                let phase = if branch_state == BranchState::Committed {
                    GlobalPhase::Committed
                } else {
                    GlobalPhase::Heuristic
                };
                tx.transition_to(phase)?;
                warn!(tid = %tx.transaction_id, ?state, %reason, "Heuristic one-phase commit");
                Ok(CompletionReport {
                    outcome: match state {
                        HeuristicState::Committed => TwoPhaseOutcome::Committed,
                        other => TwoPhaseOutcome::Heuristic {
                            state: other,
                            reason,
                        },
                    },
                    unresolved: Vec::new(),
                })
            }
            Err(e) => {
                warn!(tid = %tx.transaction_id, error = %e, "One-phase commit failed, rolling back");
                let unresolved = match self.deliver_rollback(&address, &branch_id).await {
                    Ok(()) => Vec::new(),
                    Err(XaError::HeuristicCompletion { state, reason }) => {
                        return self.one_phase_rollback_heuristic(tx, state, reason);
                    }
                    Err(_) => vec![branch_id],
                };
                if unresolved.is_empty() {
                    tx.branches[0].state = BranchState::RolledBack;
                }
                tx.transition_to(GlobalPhase::RolledBack)?;
                Ok(CompletionReport {
                    outcome: TwoPhaseOutcome::RolledBack(format!("one-phase commit failed: {}", e)),
                    unresolved,
                })
            }
        }
    }

    /// The participant answered the rollback that followed a failed
    /// one-phase commit with a heuristic outcome. A lone branch that
    /// committed anyway means the transaction committed.
    fn one_phase_rollback_heuristic(
        &self,
        tx: &mut GlobalTransaction,
        state: HeuristicState,
        reason: String,
    ) -> Result<CompletionReport, XaError> {
        warn!(tid = %tx.transaction_id, ?state, %reason, "Heuristic outcome rolling back one-phase commit");
        let (branch_state, phase, outcome) = match state {
            HeuristicState::Committed => (
                BranchState::Committed,
                GlobalPhase::Committed,
                TwoPhaseOutcome::Committed,
            ),
            HeuristicState::RolledBack => (
                BranchState::RolledBack,
                GlobalPhase::RolledBack,
                TwoPhaseOutcome::RolledBack(format!("one-phase commit failed: {}", reason)),
            ),
            HeuristicState::Mixed => (
                BranchState::HeuristicMixed,
                GlobalPhase::Heuristic,
                TwoPhaseOutcome::Heuristic { state, reason },
            ),
        };
        tx.branches[0].state = branch_state;
        tx.transition_to(phase)?;
        Ok(CompletionReport {
            outcome,
            unresolved: Vec::new(),
        })
    }

    async fn commit_two_phase(
        &self,
        tx: &mut GlobalTransaction,
    ) -> Result<CompletionReport, XaError> {
        tx.transition_to(GlobalPhase::Preparing)?;
        let targets = targets(tx);
        debug!(tid = %tx.transaction_id, branches = targets.len(), "Phase 1: prepare");

        let prepares = targets.iter().map(|(address, branch_id)| async move {
            match tokio::time::timeout(
                self.prepare_timeout,
                self.service.prepare(address, branch_id),
            )
            .await
            {
                Ok(Ok(vote)) => vote,
                Ok(Err(e)) => {
                    warn!(branch = %branch_id, error = %e, "Prepare failed, counting as rollback vote");
                    Vote::Rollback
                }
                Err(_) => {
                    warn!(branch = %branch_id, timeout_ms = self.prepare_timeout.as_millis() as u64,
                        "Prepare timed out, counting as rollback vote");
                    Vote::Rollback
                }
            }
        });
        let votes = join_all(prepares).await;
        invariant_phase_ordering(tx.branches.len(), &votes)?;

        for (branch, vote) in tx.branches.iter_mut().zip(&votes) {
            if *vote == Vote::Ok {
                branch.transition_to(BranchState::Prepared)?;
            }
        }

        let mut decision = decide_outcome(&votes);
        let mut reason = "participant voted rollback".to_string();
        if decision == Decision::Commit && tx.is_expired(self.time.now()) {
            decision = Decision::Rollback;
            reason = "transaction timed out during prepare".to_string();
        }

        self.complete(tx, &votes, decision, reason).await
    }

    async fn rollback_all(
        &self,
        tx: &mut GlobalTransaction,
        reason: &str,
    ) -> Result<CompletionReport, XaError> {
        let votes = vec![Vote::Rollback; tx.branches.len()];
        self.complete(tx, &votes, Decision::Rollback, reason.to_string())
            .await
    }

    /// Phase 2. Branches that voted read-only are skipped.
    async fn complete(
        &self,
        tx: &mut GlobalTransaction,
        votes: &[Vote],
        decision: Decision,
        reason: String,
    ) -> Result<CompletionReport, XaError> {
        tx.transition_to(match decision {
            Decision::Commit => GlobalPhase::Committing,
            Decision::Rollback => GlobalPhase::RollingBack,
        })?;

        let completed_state = match decision {
            Decision::Commit => BranchState::Committed,
            Decision::Rollback => BranchState::RolledBack,
        };
        let mut pending = Vec::with_capacity(votes.len());
        for (i, vote) in votes.iter().enumerate() {
            if *vote == Vote::ReadOnly {
                // released its resources at prepare
                tx.branches[i].state = completed_state;
            } else {
                pending.push(i);
            }
        }
        let targets = targets(tx);
        debug!(tid = %tx.transaction_id, ?decision, branches = pending.len(), "Phase 2");

        let calls = pending.iter().map(|&i| {
            let (address, branch_id) = &targets[i];
            async move {
                match decision {
                    Decision::Commit => self.deliver_commit(address, branch_id).await,
                    Decision::Rollback => self.deliver_rollback(address, branch_id).await,
                }
            }
        });
        let results = join_all(calls).await;

        let mut unresolved = Vec::new();
        let mut heuristics = Vec::new();
        for (&i, result) in pending.iter().zip(results) {
            let branch = &mut tx.branches[i];
            match result {
                Ok(()) => branch.state = completed_state,
                Err(XaError::HeuristicCompletion { state, reason }) => {
                    let branch_state = heuristic_branch_state(decision, state);
                    warn!(branch = %branch.branch_id, ?state, %reason, "Heuristic outcome");
                    branch.state = branch_state;
                    if branch_state.is_heuristic() {
                        heuristics.push((branch.branch_id.clone(), branch_state, reason));
                    }
                }
                Err(e) => {
                    warn!(branch = %branch.branch_id, error = %e,
                        "Phase-2 delivery failed, branch left for recovery");
                    unresolved.push(branch.branch_id.clone());
                }
            }
        }

        if !heuristics.is_empty() {
            tx.transition_to(GlobalPhase::Heuristic)?;
            let state = aggregate_heuristics(decision, pending.len(), &heuristics);
            let reason = heuristics
                .iter()
                .map(|(b, s, r)| format!("{} {:?}: {}", b, s, r))
                .collect::<Vec<_>>()
                .join("; ");
            warn!(tid = %tx.transaction_id, ?state, "Transaction completed heuristically");
            return Ok(CompletionReport {
                outcome: TwoPhaseOutcome::Heuristic { state, reason },
                unresolved,
            });
        }

        if unresolved.is_empty() {
            invariant_atomic_outcome(&tx.branches)?;
        }
        match decision {
            Decision::Commit => {
                tx.transition_to(GlobalPhase::Committed)?;
                info!(tid = %tx.transaction_id, branches = tx.branches.len(), "Committed transaction");
                Ok(CompletionReport {
                    outcome: TwoPhaseOutcome::Committed,
                    unresolved,
                })
            }
            Decision::Rollback => {
                tx.transition_to(GlobalPhase::RolledBack)?;
                info!(tid = %tx.transaction_id, %reason, "Rolled back transaction");
                Ok(CompletionReport {
                    outcome: TwoPhaseOutcome::RolledBack(reason),
                    unresolved,
                })
            }
        }
    }

    async fn deliver_commit(&self, address: &str, branch_id: &BranchId) -> Result<(), XaError> {
        tokio::time::timeout(
            self.completion_timeout,
            self.service.commit(address, branch_id, false),
        )
        .await
        .unwrap_or_else(|_| Err(self.timeout_error(address, self.completion_timeout)))
    }

    async fn deliver_rollback(&self, address: &str, branch_id: &BranchId) -> Result<(), XaError> {
        let result = tokio::time::timeout(
            self.completion_timeout,
            self.service.rollback(address, branch_id),
        )
        .await
        .unwrap_or_else(|_| Err(self.timeout_error(address, self.completion_timeout)));

        match result {
            // never reached the participant's resource; nothing to undo
            Err(XaError::UnknownBranch(_)) => Ok(()),
            other => other,
        }
    }

    fn timeout_error(&self, address: &str, timeout: Duration) -> XaError {
        XaError::Timeout {
            address: address.to_string(),
            millis: timeout.as_millis() as u64,
        }
    }
}

fn targets(tx: &GlobalTransaction) -> Vec<(String, BranchId)> {
    tx.branches
        .iter()
        .map(|b| (b.participant_address.clone(), b.branch_id.clone()))
        .collect()
}

/// Determine the phase-2 decision from the phase-1 votes.
pub fn decide_outcome(votes: &[Vote]) -> Decision {
    if votes.iter().all(Vote::allows_commit) {
        Decision::Commit
    } else {
        Decision::Rollback
    }
}

/// Branch state recorded for a heuristic report received during phase 2.
fn heuristic_branch_state(decision: Decision, state: HeuristicState) -> BranchState {
    match (decision, state) {
        (Decision::Commit, HeuristicState::Committed) => BranchState::Committed,
        (Decision::Commit, HeuristicState::RolledBack) => BranchState::HeuristicRollback,
        (Decision::Rollback, HeuristicState::RolledBack) => BranchState::RolledBack,
        (_, _) => BranchState::HeuristicMixed,
    }
}

fn aggregate_heuristics(
    decision: Decision,
    completed: usize,
    heuristics: &[(BranchId, BranchState, String)],
) -> HeuristicState {
    let all_rolled_back = heuristics.len() == completed
        && heuristics
            .iter()
            .all(|(_, s, _)| *s == BranchState::HeuristicRollback);
    if decision == Decision::Commit && all_rolled_back {
        HeuristicState::RolledBack
    } else {
        HeuristicState::Mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecoverFlag, TransactionId};
    use crate::ports::MockTimeSource;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted participants keyed by address.
    #[derive(Default)]
    struct ScriptedService {
        votes: HashMap<String, Vote>,
        slow_prepare: Vec<String>,
        commit_heuristic: HashMap<String, HeuristicState>,
        rollback_heuristic: HashMap<String, HeuristicState>,
        unreachable_completion: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl EnlistmentService for ScriptedService {
        async fn enlist_resource(
            &self,
            _remote: &str,
            _tid: &TransactionId,
            _local: &str,
            _resource: &str,
        ) -> Result<BranchId, XaError> {
            unreachable!()
        }

        async fn prepare(&self, remote: &str, _branch: &BranchId) -> Result<Vote, XaError> {
            self.calls.lock().push(format!("prepare {}", remote));
            if self.slow_prepare.iter().any(|a| a == remote) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(*self.votes.get(remote).unwrap_or(&Vote::Ok))
        }

        async fn commit(
            &self,
            remote: &str,
            _branch: &BranchId,
            one_phase: bool,
        ) -> Result<(), XaError> {
            self.calls
                .lock()
                .push(format!("commit {} {}", remote, one_phase));
            if self.unreachable_completion.iter().any(|a| a == remote) {
                return Err(XaError::Transport {
                    address: remote.to_string(),
                    reason: "connection refused".into(),
                });
            }
            if let Some(state) = self.commit_heuristic.get(remote) {
                return Err(XaError::HeuristicCompletion {
                    state: *state,
                    reason: "operator".into(),
                });
            }
            Ok(())
        }

        async fn rollback(&self, remote: &str, _branch: &BranchId) -> Result<(), XaError> {
            self.calls.lock().push(format!("rollback {}", remote));
            if let Some(state) = self.rollback_heuristic.get(remote) {
                return Err(XaError::HeuristicCompletion {
                    state: *state,
                    reason: "operator".into(),
                });
            }
            Ok(())
        }

        async fn recover(
            &self,
            _remote: &str,
            _flag: RecoverFlag,
        ) -> Result<Vec<BranchId>, XaError> {
            Ok(Vec::new())
        }
    }

    fn transaction(participants: &[&str]) -> GlobalTransaction {
        let mut tx = GlobalTransaction::new(
            TransactionId::new("tx1"),
            "coord",
            Duration::from_secs(30),
            1_000,
        );
        for p in participants {
            tx.enlist(p, "db").unwrap();
        }
        tx
    }

    fn coordinator(service: Arc<ScriptedService>) -> TwoPhaseCoordinator {
        TwoPhaseCoordinator::new(
            service,
            Arc::new(MockTimeSource::new(1_000)),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_decide_outcome() {
        assert_eq!(decide_outcome(&[Vote::Ok, Vote::ReadOnly]), Decision::Commit);
        assert_eq!(decide_outcome(&[Vote::Ok, Vote::Rollback]), Decision::Rollback);
        assert_eq!(decide_outcome(&[]), Decision::Commit);
    }

    #[tokio::test]
    async fn test_no_branches_commits_trivially() {
        let service = Arc::new(ScriptedService::default());
        let mut tx = transaction(&[]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();
        assert_eq!(report.outcome, TwoPhaseOutcome::Committed);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_single_branch_uses_one_phase() {
        let service = Arc::new(ScriptedService::default());
        let mut tx = transaction(&["a"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();
        assert_eq!(report.outcome, TwoPhaseOutcome::Committed);
        assert_eq!(service.calls(), vec!["commit a true"]);
        assert_eq!(tx.phase, GlobalPhase::Committed);
    }

    #[tokio::test]
    async fn test_all_ok_commits_every_branch() {
        let service = Arc::new(ScriptedService::default());
        let mut tx = transaction(&["a", "b", "c"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert_eq!(report.outcome, TwoPhaseOutcome::Committed);
        assert!(tx.branches.iter().all(|b| b.state == BranchState::Committed));
        let calls = service.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("prepare")).count(), 3);
        assert_eq!(calls.iter().filter(|c| c.ends_with("false")).count(), 3);
    }

    #[tokio::test]
    async fn test_read_only_branch_skips_phase_two() {
        let mut service = ScriptedService::default();
        service.votes.insert("b".into(), Vote::ReadOnly);
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b"]);
        coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert!(!service.calls().contains(&"commit b false".to_string()));
        assert_eq!(tx.branches[1].state, BranchState::Committed);
    }

    #[tokio::test]
    async fn test_rollback_vote_rolls_back_others() {
        let mut service = ScriptedService::default();
        service.votes.insert("b".into(), Vote::Rollback);
        service.votes.insert("c".into(), Vote::ReadOnly);
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b", "c"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert!(matches!(report.outcome, TwoPhaseOutcome::RolledBack(_)));
        let calls = service.calls();
        assert!(calls.contains(&"rollback a".to_string()));
        assert!(calls.contains(&"rollback b".to_string()));
        assert!(!calls.contains(&"rollback c".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("commit")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_timeout_counts_as_rollback() {
        let mut service = ScriptedService::default();
        service.slow_prepare.push("b".into());
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert!(matches!(report.outcome, TwoPhaseOutcome::RolledBack(_)));
        assert_eq!(tx.branches[0].state, BranchState::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_only_never_prepares() {
        let service = Arc::new(ScriptedService::default());
        let mut tx = transaction(&["a", "b"]);
        tx.rollback_only = true;
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert!(matches!(report.outcome, TwoPhaseOutcome::RolledBack(_)));
        assert!(!service.calls().iter().any(|c| c.starts_with("prepare")));
    }

    #[tokio::test]
    async fn test_expired_transaction_rolls_back() {
        let service = Arc::new(ScriptedService::default());
        let mut tx = transaction(&["a", "b"]);
        let time = Arc::new(MockTimeSource::new(1_000 + 31_000));
        let coordinator = TwoPhaseCoordinator::new(
            service.clone(),
            time,
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        let report = coordinator.commit(&mut tx).await.unwrap();
        assert!(matches!(report.outcome, TwoPhaseOutcome::RolledBack(r) if r.contains("timed out")));
    }

    #[tokio::test]
    async fn test_heuristic_is_surfaced_without_stopping_phase_two() {
        let mut service = ScriptedService::default();
        service
            .commit_heuristic
            .insert("a".into(), HeuristicState::RolledBack);
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert!(matches!(
            report.outcome,
            TwoPhaseOutcome::Heuristic {
                state: HeuristicState::Mixed,
                ..
            }
        ));
        assert!(service.calls().contains(&"commit b false".to_string()));
        assert_eq!(tx.branches[0].state, BranchState::HeuristicRollback);
        assert_eq!(tx.branches[1].state, BranchState::Committed);
        assert_eq!(tx.phase, GlobalPhase::Heuristic);
    }

    #[tokio::test]
    async fn test_delivery_failure_leaves_branch_prepared() {
        let mut service = ScriptedService::default();
        service.unreachable_completion.push("b".into());
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b"]);
        let report = coordinator(service).commit(&mut tx).await.unwrap();

        assert_eq!(report.outcome, TwoPhaseOutcome::Committed);
        assert_eq!(report.unresolved, vec![tx.branches[1].branch_id.clone()]);
        assert_eq!(tx.branches[1].state, BranchState::Prepared);
    }

    #[tokio::test]
    async fn test_one_phase_failure_with_heuristic_commit_reports_committed() {
        let mut service = ScriptedService::default();
        service.unreachable_completion.push("a".into());
        service
            .rollback_heuristic
            .insert("a".into(), HeuristicState::Committed);
        let service = Arc::new(service);
        let mut tx = transaction(&["a"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert_eq!(report.outcome, TwoPhaseOutcome::Committed);
        assert!(report.unresolved.is_empty());
        assert_eq!(tx.branches[0].state, BranchState::Committed);
        assert_eq!(tx.phase, GlobalPhase::Committed);
        assert_eq!(service.calls(), vec!["commit a true", "rollback a"]);
    }

    #[tokio::test]
    async fn test_one_phase_failure_with_heuristic_mixed_is_surfaced() {
        let mut service = ScriptedService::default();
        service.unreachable_completion.push("a".into());
        service
            .rollback_heuristic
            .insert("a".into(), HeuristicState::Mixed);
        let service = Arc::new(service);
        let mut tx = transaction(&["a"]);
        let report = coordinator(service).commit(&mut tx).await.unwrap();

        assert!(matches!(
            report.outcome,
            TwoPhaseOutcome::Heuristic {
                state: HeuristicState::Mixed,
                ..
            }
        ));
        assert!(report.unresolved.is_empty());
        assert_eq!(tx.branches[0].state, BranchState::HeuristicMixed);
        assert_eq!(tx.phase, GlobalPhase::Heuristic);
    }

    #[tokio::test]
    async fn test_one_phase_failure_with_heuristic_rollback_rolls_back() {
        let mut service = ScriptedService::default();
        service.unreachable_completion.push("a".into());
        service
            .rollback_heuristic
            .insert("a".into(), HeuristicState::RolledBack);
        let service = Arc::new(service);
        let mut tx = transaction(&["a"]);
        let report = coordinator(service).commit(&mut tx).await.unwrap();

        assert!(matches!(report.outcome, TwoPhaseOutcome::RolledBack(_)));
        assert!(report.unresolved.is_empty());
        assert_eq!(tx.branches[0].state, BranchState::RolledBack);
        assert_eq!(tx.phase, GlobalPhase::RolledBack);
    }

    #[tokio::test]
    async fn test_heuristic_commit_during_phase_two_rollback_is_mixed() {
        let mut service = ScriptedService::default();
        service.votes.insert("b".into(), Vote::Rollback);
        service
            .rollback_heuristic
            .insert("a".into(), HeuristicState::Committed);
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b"]);
        let report = coordinator(service.clone()).commit(&mut tx).await.unwrap();

        assert!(matches!(
            report.outcome,
            TwoPhaseOutcome::Heuristic {
                state: HeuristicState::Mixed,
                ..
            }
        ));
        assert!(service.calls().contains(&"rollback b".to_string()));
        assert_eq!(tx.branches[0].state, BranchState::HeuristicMixed);
        assert_eq!(tx.branches[1].state, BranchState::RolledBack);
        assert_eq!(tx.phase, GlobalPhase::Heuristic);
    }

    #[tokio::test]
    async fn test_heuristic_rollback_during_phase_two_rollback_is_clean() {
        let mut service = ScriptedService::default();
        service.votes.insert("b".into(), Vote::Rollback);
        service
            .rollback_heuristic
            .insert("a".into(), HeuristicState::RolledBack);
        let service = Arc::new(service);
        let mut tx = transaction(&["a", "b"]);
        let report = coordinator(service).commit(&mut tx).await.unwrap();

        assert!(matches!(report.outcome, TwoPhaseOutcome::RolledBack(_)));
        assert_eq!(tx.branches[0].state, BranchState::RolledBack);
        assert_eq!(tx.phase, GlobalPhase::RolledBack);
    }
}
