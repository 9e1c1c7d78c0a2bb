//! # Domain Entities
//!
//! Transaction context, branches, the coordinator's record of a global
//! transaction, and the outbound message batch.

use super::errors::{Timestamp, XaError};
use super::value_objects::{
    BranchId, BranchState, DeliveryMode, GlobalPhase, Role, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Call-scoped description of the current global transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    /// Global transaction id.
    pub transaction_id: TransactionId,
    /// Role of the owning call scope.
    pub role: Role,
    /// Address of the coordinating node.
    pub coordinator_address: String,
    /// Deadline (unix millis) after which the transaction is doomed.
    pub timeout_at: Timestamp,
    /// False while dormant (begun read-only, not yet escalated).
    pub active: bool,
}

impl TransactionContext {
    /// Context for a call scope that started a global transaction.
    pub fn initiator(
        transaction_id: TransactionId,
        coordinator_address: impl Into<String>,
        timeout_at: Timestamp,
    ) -> Self {
        Self {
            transaction_id,
            role: Role::Initiator,
            coordinator_address: coordinator_address.into(),
            timeout_at,
            active: true,
        }
    }

    /// Context rebuilt on the receiving side of an RPC call.
    pub fn participant(
        transaction_id: TransactionId,
        coordinator_address: impl Into<String>,
        timeout_at: Timestamp,
        active: bool,
    ) -> Self {
        Self {
            transaction_id,
            role: Role::Participant,
            coordinator_address: coordinator_address.into(),
            timeout_at,
            active,
        }
    }

    /// Placeholder left by a read-only distributed begin.
    pub fn dormant(coordinator_address: impl Into<String>) -> Self {
        Self {
            transaction_id: TransactionId::generate(),
            role: Role::None,
            coordinator_address: coordinator_address.into(),
            timeout_at: 0,
            active: false,
        }
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.timeout_at != 0 && now > self.timeout_at
    }
}

/// Handle returned by the transaction manager's `begin`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeTransaction {
    /// Global transaction id.
    pub transaction_id: TransactionId,
    /// Timeout the manager applied.
    pub timeout: Duration,
}

/// One resource manager's unit of work within a global transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch identifier.
    pub branch_id: BranchId,
    /// Resource that owns the branch.
    pub resource_name: String,
    /// Node hosting the resource.
    pub participant_address: String,
    /// Current state.
    pub state: BranchState,
}

impl Branch {
    /// Create an active branch.
    pub fn new(
        branch_id: BranchId,
        resource_name: impl Into<String>,
        participant_address: impl Into<String>,
    ) -> Self {
        Self {
            branch_id,
            resource_name: resource_name.into(),
            participant_address: participant_address.into(),
            state: BranchState::Active,
        }
    }

    /// Owning transaction.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.branch_id.transaction_id
    }

    /// Transition to new state.
    pub fn transition_to(&mut self, next: BranchState) -> Result<(), XaError> {
        if !self.state.can_transition_to(next) {
            return Err(XaError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", next),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Coordinator's record of a global transaction.
#[derive(Clone, Debug)]
pub struct GlobalTransaction {
    /// Global transaction id.
    pub transaction_id: TransactionId,
    /// Coordinating node.
    pub coordinator_address: String,
    /// Deadline (unix millis).
    pub timeout_at: Timestamp,
    /// Timeout the transaction was begun with.
    pub timeout: Duration,
    /// Current phase.
    pub phase: GlobalPhase,
    /// Marked rollback-only.
    pub rollback_only: bool,
    /// Enlisted branches.
    pub branches: Vec<Branch>,
    next_branch: u32,
}

impl GlobalTransaction {
    /// Create an active transaction.
    pub fn new(
        transaction_id: TransactionId,
        coordinator_address: impl Into<String>,
        timeout: Duration,
        now: Timestamp,
    ) -> Self {
        Self {
            transaction_id,
            coordinator_address: coordinator_address.into(),
            timeout_at: now + timeout.as_millis() as Timestamp,
            timeout,
            phase: GlobalPhase::Active,
            rollback_only: false,
            branches: Vec::new(),
            next_branch: 0,
        }
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.timeout_at
    }

    /// Enlist a new branch and return its id.
    pub fn enlist(
        &mut self,
        participant_address: &str,
        resource_name: &str,
    ) -> Result<BranchId, XaError> {
        if self.phase != GlobalPhase::Active {
            return Err(XaError::System(format!(
                "transaction {} already past phase 1 ({:?})",
                self.transaction_id, self.phase
            )));
        }
        if self.rollback_only {
            return Err(XaError::RollbackAlreadyRequested(self.transaction_id.clone()));
        }

        self.next_branch += 1;
        let branch_id = BranchId::new(
            self.transaction_id.clone(),
            format!("{}-{}", resource_name, self.next_branch),
        );
        self.branches.push(Branch::new(
            branch_id.clone(),
            resource_name,
            participant_address,
        ));
        Ok(branch_id)
    }

    /// Transition to new phase.
    pub fn transition_to(&mut self, next: GlobalPhase) -> Result<(), XaError> {
        if !self.phase.can_transition_to(next) {
            return Err(XaError::InvalidTransition {
                from: format!("{:?}", self.phase),
                to: format!("{:?}", next),
            });
        }
        self.phase = next;
        Ok(())
    }
}

/// Message produced inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identity (send-log key).
    pub id: Uuid,
    /// Destination topic.
    pub topic: String,
    /// Optional routing key.
    pub key: Option<String>,
    /// Payload.
    pub body: Vec<u8>,
    /// User properties.
    pub properties: BTreeMap<String, String>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            key: None,
            body: body.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder: set routing key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Builder: add a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Broker acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Broker-assigned id.
    pub receipt_id: String,
    /// Queue/partition offset, when the broker reports one.
    pub offset: Option<u64>,
}

/// Messages held back until the owning transaction completes.
#[derive(Clone, Debug, Default)]
pub struct PendingMessageBatch {
    messages: Vec<Message>,
    delivery_mode: DeliveryMode,
    sealed: bool,
}

impl PendingMessageBatch {
    /// Create an empty batch.
    pub fn new(delivery_mode: DeliveryMode) -> Self {
        Self {
            messages: Vec::new(),
            delivery_mode,
            sealed: false,
        }
    }

    /// Append preserving insertion order.
    pub fn push(&mut self, message: Message) -> Result<(), XaError> {
        if self.sealed {
            return Err(XaError::BufferSealed);
        }
        self.messages.push(message);
        Ok(())
    }

    /// Seal the batch and take its messages for delivery.
    pub fn seal_and_take(&mut self) -> Vec<Message> {
        self.sealed = true;
        std::mem::take(&mut self.messages)
    }

    /// Empty the batch and reopen it.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.sealed = false;
    }

    /// Delivery mode.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Pending messages.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a flush has started.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

/// Result of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Broker accepted the message.
    Success(SendReceipt),
    /// Delivery failed.
    Failure(String),
}

/// Send-log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLogEntry {
    /// The message.
    pub message: Message,
    /// Delivery outcome.
    pub outcome: SendOutcome,
    /// When the outcome was recorded.
    pub recorded_at: Timestamp,
}

impl SendLogEntry {
    /// Whether delivery succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SendOutcome::Success(_))
    }
}
