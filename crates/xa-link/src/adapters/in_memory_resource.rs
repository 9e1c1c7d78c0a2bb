//! In-Memory Resource Driver
//!
//! A key/value store that supports both plain local transactions and XA
//! branches. Prepared branches survive session loss so recovery can find
//! them. Votes, failures and heuristics can be scripted for tests.

use crate::domain::{BranchId, BranchState, HeuristicState, Vote, XaError};
use crate::ports::{LocalTxHandle, ResourceDriver, ResourceHandle, XaResource};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Pending writes of one unit of work.
type Writes = Vec<(String, String)>;

#[derive(Debug, Clone)]
struct BranchRecord {
    state: BranchState,
    writes: Writes,
    failed: bool,
}

/// Scripted behaviour.
#[derive(Debug, Clone, Default)]
struct Script {
    vote: Option<Vote>,
    fail_prepare: bool,
    prepare_delay: Option<Duration>,
    commit_heuristic: Option<HeuristicState>,
    fail_commit: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    committed: RwLock<HashMap<String, String>>,
    branches: RwLock<HashMap<BranchId, BranchRecord>>,
    locals: RwLock<HashMap<u64, Writes>>,
    next_local: AtomicU64,
    local_commits: AtomicU64,
    script: RwLock<Script>,
}

impl Ledger {
    fn apply(&self, writes: Writes) {
        let mut committed = self.committed.write();
        for (key, value) in writes {
            committed.insert(key, value);
        }
    }
}

/// In-memory resource driver.
#[derive(Clone)]
pub struct InMemoryResourceDriver {
    name: String,
    ledger: Arc<Ledger>,
}

impl InMemoryResourceDriver {
    /// Create an empty resource.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ledger: Arc::new(Ledger::default()),
        }
    }

    /// Buffer a write in the unit of work behind `handle`.
    pub fn put(
        &self,
        handle: &ResourceHandle,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), XaError> {
        let write = (key.into(), value.into());
        match handle {
            ResourceHandle::Local(local) => {
                let mut locals = self.ledger.locals.write();
                let writes = locals.get_mut(&local.0).ok_or_else(|| {
                    XaError::Resource(format!("local transaction {} not active", local.0))
                })?;
                writes.push(write);
            }
            ResourceHandle::Xa { branch, .. } => {
                let mut branches = self.ledger.branches.write();
                let record = branches
                    .get_mut(branch)
                    .filter(|r| r.state == BranchState::Active)
                    .ok_or_else(|| XaError::UnknownBranch(branch.clone()))?;
                record.writes.push(write);
            }
        }
        Ok(())
    }

    /// Committed value for `key`.
    pub fn committed(&self, key: &str) -> Option<String> {
        self.ledger.committed.read().get(key).cloned()
    }

    /// State of a branch this resource has seen.
    pub fn branch_state(&self, branch: &BranchId) -> Option<BranchState> {
        self.ledger.branches.read().get(branch).map(|r| r.state)
    }

    /// Branches currently prepared.
    pub fn prepared_branches(&self) -> Vec<BranchId> {
        self.ledger
            .branches
            .read()
            .iter()
            .filter(|(_, r)| r.state == BranchState::Prepared)
            .map(|(b, _)| b.clone())
            .collect()
    }

    /// Number of local transactions committed.
    pub fn local_commits(&self) -> u64 {
        self.ledger.local_commits.load(Ordering::SeqCst)
    }

    /// Force the next prepares to return `vote`.
    pub fn script_vote(&self, vote: Vote) {
        self.ledger.script.write().vote = Some(vote);
    }

    /// Make prepare fail with a resource error.
    pub fn fail_prepare(&self, fail: bool) {
        self.ledger.script.write().fail_prepare = fail;
    }

    /// Delay every prepare.
    pub fn delay_prepare(&self, delay: Duration) {
        self.ledger.script.write().prepare_delay = Some(delay);
    }

    /// Report a heuristic outcome on commit.
    pub fn heuristic_on_commit(&self, state: HeuristicState) {
        self.ledger.script.write().commit_heuristic = Some(state);
    }

    /// Make phase-2 commit fail with a resource error.
    pub fn fail_commit(&self, fail: bool) {
        self.ledger.script.write().fail_commit = fail;
    }

    fn session(&self) -> InMemoryXaSession {
        InMemoryXaSession {
            name: self.name.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

#[async_trait]
impl ResourceDriver for InMemoryResourceDriver {
    fn resource_name(&self) -> &str {
        &self.name
    }

    async fn begin_local(&self) -> Result<LocalTxHandle, XaError> {
        let id = self.ledger.next_local.fetch_add(1, Ordering::SeqCst);
        self.ledger.locals.write().insert(id, Vec::new());
        debug!(resource = %self.name, local = id, "Local transaction begun");
        Ok(LocalTxHandle(id))
    }

    async fn commit_local(&self, handle: LocalTxHandle) -> Result<(), XaError> {
        let writes = self
            .ledger
            .locals
            .write()
            .remove(&handle.0)
            .ok_or_else(|| XaError::Resource(format!("local transaction {} not active", handle.0)))?;
        self.ledger.apply(writes);
        self.ledger.local_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_local(&self, handle: LocalTxHandle) -> Result<(), XaError> {
        self.ledger.locals.write().remove(&handle.0);
        Ok(())
    }

    async fn create_xa_session(&self) -> Result<Arc<dyn XaResource>, XaError> {
        Ok(Arc::new(self.session()))
    }
}

/// XA session over the in-memory store.
pub struct InMemoryXaSession {
    name: String,
    ledger: Arc<Ledger>,
}

impl InMemoryXaSession {
    fn state(&self, branch: &BranchId) -> Result<BranchState, XaError> {
        self.ledger
            .branches
            .read()
            .get(branch)
            .map(|r| r.state)
            .ok_or_else(|| XaError::UnknownBranch(branch.clone()))
    }

    fn finish(&self, branch: &BranchId, state: BranchState) -> Writes {
        let mut branches = self.ledger.branches.write();
        match branches.get_mut(branch) {
            Some(record) => {
                record.state = state;
                std::mem::take(&mut record.writes)
            }
            None => Vec::new(),
        }
    }

    fn finish_prepared(&self, branch: &BranchId) {
        if let Some(record) = self.ledger.branches.write().get_mut(branch) {
            record.state = BranchState::Prepared;
        }
    }
}

#[async_trait]
impl XaResource for InMemoryXaSession {
    fn resource_name(&self) -> &str {
        &self.name
    }

    async fn start(&self, branch: &BranchId) -> Result<(), XaError> {
        let mut branches = self.ledger.branches.write();
        match branches.get(branch) {
            Some(record) if record.state != BranchState::Active => Err(XaError::Resource(
                format!("branch {} already {:?}", branch, record.state),
            )),
            Some(_) => Ok(()),
            None => {
                branches.insert(
                    branch.clone(),
                    BranchRecord {
                        state: BranchState::Active,
                        writes: Vec::new(),
                        failed: false,
                    },
                );
                Ok(())
            }
        }
    }

    async fn end(&self, branch: &BranchId, success: bool) -> Result<(), XaError> {
        let mut branches = self.ledger.branches.write();
        let record = branches
            .get_mut(branch)
            .ok_or_else(|| XaError::UnknownBranch(branch.clone()))?;
        if !success {
            record.failed = true;
        }
        Ok(())
    }

    async fn prepare(&self, branch: &BranchId) -> Result<Vote, XaError> {
        let script = self.ledger.script.read().clone();
        if let Some(delay) = script.prepare_delay {
            tokio::time::sleep(delay).await;
        }
        if self.state(branch)? != BranchState::Active {
            return Err(XaError::Resource(format!("branch {} not active", branch)));
        }
        if script.fail_prepare {
            self.finish(branch, BranchState::RolledBack);
            return Err(XaError::Resource(format!("prepare failed for {}", branch)));
        }

        let (failed, has_writes) = {
            let branches = self.ledger.branches.read();
            branches
                .get(branch)
                .map(|r| (r.failed, !r.writes.is_empty()))
                .unwrap_or((true, false))
        };
        let vote = match script.vote {
            Some(vote) => vote,
            None if failed => Vote::Rollback,
            None if has_writes => Vote::Ok,
            None => Vote::ReadOnly,
        };

        match vote {
            Vote::Ok => {
                self.finish_prepared(branch);
            }
            Vote::ReadOnly => {
                self.finish(branch, BranchState::Committed);
            }
            Vote::Rollback => {
                self.finish(branch, BranchState::RolledBack);
            }
        }
        debug!(resource = %self.name, branch = %branch, ?vote, "Prepared branch");
        Ok(vote)
    }

    async fn commit(&self, branch: &BranchId, one_phase: bool) -> Result<(), XaError> {
        let script = self.ledger.script.read().clone();
        let state = self.state(branch)?;
        match state {
            BranchState::Committed => return Ok(()),
            BranchState::Active if !one_phase => {
                return Err(XaError::Resource(format!("branch {} not prepared", branch)))
            }
            BranchState::Active | BranchState::Prepared => {}
            other => {
                return Err(XaError::Resource(format!(
                    "branch {} already {:?}",
                    branch, other
                )))
            }
        }

        if script.fail_commit {
            return Err(XaError::Resource(format!("commit failed for {}", branch)));
        }
        if one_phase {
            let failed = self
                .ledger
                .branches
                .read()
                .get(branch)
                .map(|r| r.failed)
                .unwrap_or(false);
            if failed {
                self.finish(branch, BranchState::RolledBack);
                return Err(XaError::Resource(format!(
                    "branch {} marked failed, rolled back",
                    branch
                )));
            }
        }

        match script.commit_heuristic {
            Some(HeuristicState::RolledBack) => {
                self.finish(branch, BranchState::HeuristicRollback);
                Err(XaError::HeuristicCompletion {
                    state: HeuristicState::RolledBack,
                    reason: format!("{} rolled back by resource", branch),
                })
            }
            Some(HeuristicState::Mixed) => {
                let mut writes = self.finish(branch, BranchState::HeuristicMixed);
                writes.truncate(writes.len() / 2);
                self.ledger.apply(writes);
                Err(XaError::HeuristicCompletion {
                    state: HeuristicState::Mixed,
                    reason: format!("{} partially committed", branch),
                })
            }
            Some(HeuristicState::Committed) | None => {
                let writes = self.finish(branch, BranchState::Committed);
                self.ledger.apply(writes);
                Ok(())
            }
        }
    }

    async fn rollback(&self, branch: &BranchId) -> Result<(), XaError> {
        match self.state(branch)? {
            BranchState::Committed => Err(XaError::HeuristicCompletion {
                state: HeuristicState::Committed,
                reason: format!("{} already committed", branch),
            }),
            BranchState::RolledBack | BranchState::HeuristicRollback => Ok(()),
            _ => {
                self.finish(branch, BranchState::RolledBack);
                Ok(())
            }
        }
    }

    async fn recover(&self) -> Result<Vec<BranchId>, XaError> {
        Ok(self
            .ledger
            .branches
            .read()
            .iter()
            .filter(|(_, r)| r.state == BranchState::Prepared)
            .map(|(b, _)| b.clone())
            .collect())
    }
}
