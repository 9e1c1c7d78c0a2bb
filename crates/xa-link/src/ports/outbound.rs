//! # Outbound Ports
//!
//! Traits for external collaborators: the transaction manager, resource
//! drivers, the RPC transport, the message broker and the send log.

use crate::domain::{
    BranchId, CompletionOutcome, CompositeTransaction, Message, SendReceipt, Timestamp,
    TransactionId, TransactionManagerError, TransactionStatus, Vote, XaError,
};
use crate::ipc::{EnlistmentRequest, EnlistmentResponse};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// XA-style transaction manager.
///
/// Owns prepare/commit durability and drives the enlisted branches; this
/// crate only calls it.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Begin a global transaction. `None` uses the manager's default timeout.
    async fn begin(
        &self,
        timeout: Option<Duration>,
    ) -> Result<CompositeTransaction, TransactionManagerError>;

    /// Drive the transaction to completion (2PC across all branches).
    async fn commit(&self, transaction_id: &TransactionId) -> Result<(), TransactionManagerError>;

    /// Roll the transaction back on every branch.
    async fn rollback(&self, transaction_id: &TransactionId)
        -> Result<(), TransactionManagerError>;

    /// Current status.
    async fn status(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<TransactionStatus, TransactionManagerError>;

    /// Default timeout for subsequent `begin` calls.
    fn set_transaction_timeout(&self, timeout: Duration);

    /// Doom the transaction; a later commit rolls it back.
    async fn set_rollback_only(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<(), TransactionManagerError>;

    /// Identifier and timeout of a running transaction.
    async fn composite_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Option<CompositeTransaction>;

    /// Whether commit is still requested for rollback-only transactions.
    fn should_commit_on_global_rollback_only(&self) -> bool {
        true
    }
}

/// Handle of a plain local resource transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocalTxHandle(pub u64);

/// Resource handle bound to a call scope for the life of a transaction.
#[derive(Clone)]
pub enum ResourceHandle {
    /// Plain local transaction.
    Local(LocalTxHandle),
    /// XA session associated with a branch.
    Xa {
        /// The branch the session works on.
        branch: BranchId,
        /// The session.
        session: Arc<dyn XaResource>,
    },
}

impl ResourceHandle {
    /// Branch, for XA handles.
    pub fn branch(&self) -> Option<&BranchId> {
        match self {
            Self::Local(_) => None,
            Self::Xa { branch, .. } => Some(branch),
        }
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(handle) => f.debug_tuple("Local").field(handle).finish(),
            Self::Xa { branch, session } => f
                .debug_struct("Xa")
                .field("branch", branch)
                .field("resource", &session.resource_name())
                .finish(),
        }
    }
}

/// Resource driver capability, resolved once when the adapter is wired.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Unique resource name used for enlistment.
    fn resource_name(&self) -> &str;

    /// Begin a native local transaction.
    async fn begin_local(&self) -> Result<LocalTxHandle, XaError>;

    /// Commit a native local transaction.
    async fn commit_local(&self, handle: LocalTxHandle) -> Result<(), XaError>;

    /// Roll back a native local transaction.
    async fn rollback_local(&self, handle: LocalTxHandle) -> Result<(), XaError>;

    /// Create an XA-capable session.
    async fn create_xa_session(&self) -> Result<Arc<dyn XaResource>, XaError>;
}

/// XA resource branch operations.
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Resource name.
    fn resource_name(&self) -> &str;

    /// Associate the session with a branch.
    async fn start(&self, branch: &BranchId) -> Result<(), XaError>;

    /// Dissociate; `success = false` dooms the branch.
    async fn end(&self, branch: &BranchId, success: bool) -> Result<(), XaError>;

    /// Phase 1.
    async fn prepare(&self, branch: &BranchId) -> Result<Vote, XaError>;

    /// Phase 2 commit (or one-phase commit).
    async fn commit(&self, branch: &BranchId, one_phase: bool) -> Result<(), XaError>;

    /// Phase 2 rollback.
    async fn rollback(&self, branch: &BranchId) -> Result<(), XaError>;

    /// Branches left prepared.
    async fn recover(&self) -> Result<Vec<BranchId>, XaError>;
}

/// RPC transport carrying enlistment calls.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Deliver a request to `remote_address` and wait for the response.
    async fn call(
        &self,
        remote_address: &str,
        request: EnlistmentRequest,
    ) -> Result<EnlistmentResponse, XaError>;
}

/// Callback for asynchronous sends.
pub type SendCallback = Box<dyn FnOnce(Result<SendReceipt, XaError>) + Send + 'static>;

/// Message broker client.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Send one message.
    async fn send(&self, message: &Message) -> Result<SendReceipt, XaError>;

    /// Send several messages as one batch.
    async fn send_batch(&self, messages: &[Message]) -> Result<SendReceipt, XaError>;

    /// Send without waiting; the callback receives the outcome.
    ///
    /// An `Err` return means the send was never issued and the callback
    /// will not run.
    fn send_async(&self, message: Message, callback: SendCallback) -> Result<(), XaError>;
}

/// Observational record of delivery outcomes.
pub trait SendLog: Send + Sync {
    /// Broker accepted the message.
    fn record_success(&self, message: &Message, receipt: &SendReceipt);

    /// Delivery failed.
    fn record_failure(&self, message: &Message, cause: &str);
}

/// Listener invoked exactly once when a transaction completes.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    /// The owning transaction was suspended.
    fn on_suspend(&mut self) {}

    /// The owning transaction was resumed.
    fn on_resume(&mut self) {}

    /// Consume the listener with the final outcome.
    async fn after_completion(self: Box<Self>, outcome: CompletionOutcome);
}

/// Participant-side registry of local branches.
pub trait BranchRegistry: Send + Sync {
    /// Make a local branch reachable by the coordinator's phase-2 calls.
    fn register_local_branch(&self, branch: BranchId, resource: Arc<dyn XaResource>);

    /// Hold listeners until the coordinator completes `branch`.
    fn defer_completion(&self, branch: &BranchId, listeners: Vec<Box<dyn CompletionListener>>);
}

/// Time source for deadlines.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Default system time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Manually advanced time source for testing.
#[derive(Debug, Default)]
pub struct MockTimeSource {
    time: AtomicU64,
}

impl MockTimeSource {
    /// Start at `initial`.
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    /// Move forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.time.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `time`.
    pub fn set(&self, time: Timestamp) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}
