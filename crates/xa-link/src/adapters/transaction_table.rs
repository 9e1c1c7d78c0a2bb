//! Global Transaction Table
//!
//! Coordinator-side record of running global transactions. Each transaction
//! sits behind its own async mutex so work on one transaction id is
//! serialised while unrelated transactions proceed in parallel.

use crate::domain::{BranchId, GlobalTransaction, TransactionId, XaError};
use crate::ports::TimeSource;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Shared handle to one transaction record.
pub type TransactionEntry = Arc<Mutex<GlobalTransaction>>;

/// Running global transactions keyed by id.
pub struct GlobalTransactionTable {
    transactions: RwLock<HashMap<TransactionId, TransactionEntry>>,
    time: Arc<dyn TimeSource>,
}

impl GlobalTransactionTable {
    /// Create an empty table.
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            time,
        }
    }

    /// Track a new transaction.
    pub fn insert(&self, tx: GlobalTransaction) -> TransactionEntry {
        let tid = tx.transaction_id.clone();
        let entry = Arc::new(Mutex::new(tx));
        self.transactions.write().insert(tid, entry.clone());
        entry
    }

    /// Look up a running transaction.
    pub fn get(&self, transaction_id: &TransactionId) -> Option<TransactionEntry> {
        self.transactions.read().get(transaction_id).cloned()
    }

    /// Stop tracking a transaction.
    pub fn remove(&self, transaction_id: &TransactionId) -> Option<TransactionEntry> {
        self.transactions.write().remove(transaction_id)
    }

    /// Ids of all tracked transactions.
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.read().keys().cloned().collect()
    }

    /// Number of tracked transactions.
    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }

    /// Register a branch for `resource_name` hosted at `participant_address`.
    ///
    /// Any failure against a known transaction dooms it.
    pub async fn enlist(
        &self,
        transaction_id: &TransactionId,
        participant_address: &str,
        resource_name: &str,
    ) -> Result<BranchId, XaError> {
        let entry = self.get(transaction_id).ok_or_else(|| {
            XaError::System(format!("unknown transaction {}", transaction_id))
        })?;
        let mut tx = entry.lock().await;

        let result = if tx.is_expired(self.time.now()) {
            Err(XaError::System(format!(
                "transaction {} timed out",
                transaction_id
            )))
        } else {
            tx.enlist(participant_address, resource_name)
        };

        match result {
            Ok(branch) => {
                debug!(tid = %transaction_id, branch = %branch, participant = participant_address,
                    "Enlisted branch");
                Ok(branch)
            }
            Err(e) => {
                tx.rollback_only = true;
                warn!(tid = %transaction_id, error = %e, "Enlistment failed, transaction marked rollback-only");
                Err(e)
            }
        }
    }
}
