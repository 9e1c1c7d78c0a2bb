//! In-Memory Message Broker
//!
//! Implements `MessageProducer` over an in-process topic log. Individual
//! message keys can be rejected and the whole broker taken offline to
//! exercise delivery failures.

use crate::domain::{Message, SendReceipt, XaError};
use crate::ports::{MessageProducer, SendCallback};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct BrokerState {
    delivered: RwLock<Vec<Message>>,
    rejected_keys: RwLock<HashSet<String>>,
    offline: AtomicBool,
    batches: AtomicU64,
    single_sends: AtomicU64,
}

impl BrokerState {
    fn check(&self, message: &Message) -> Result<(), XaError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(XaError::Broker("broker unavailable".into()));
        }
        if let Some(key) = &message.key {
            if self.rejected_keys.read().contains(key) {
                return Err(XaError::Broker(format!("message key {} rejected", key)));
            }
        }
        Ok(())
    }

    fn append(&self, messages: &[Message]) -> SendReceipt {
        let mut delivered = self.delivered.write();
        let offset = delivered.len() as u64;
        delivered.extend_from_slice(messages);
        SendReceipt {
            receipt_id: format!("{}", messages.first().map(|m| m.id).unwrap_or_default()),
            offset: Some(offset),
        }
    }

    fn send_one(&self, message: &Message) -> Result<SendReceipt, XaError> {
        self.check(message)?;
        self.single_sends.fetch_add(1, Ordering::SeqCst);
        let receipt = self.append(std::slice::from_ref(message));
        debug!(topic = %message.topic, id = %message.id, "Message delivered");
        Ok(receipt)
    }
}

/// In-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message the broker accepted, in arrival order.
    pub fn delivered(&self) -> Vec<Message> {
        self.state.delivered.read().clone()
    }

    /// Accepted messages on `topic`.
    pub fn delivered_to(&self, topic: &str) -> Vec<Message> {
        self.state
            .delivered
            .read()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Reject messages carrying `key`.
    pub fn reject_key(&self, key: impl Into<String>) {
        self.state.rejected_keys.write().insert(key.into());
    }

    /// Take the broker offline or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of batch sends accepted.
    pub fn batch_count(&self) -> u64 {
        self.state.batches.load(Ordering::SeqCst)
    }

    /// Number of single-message sends accepted.
    pub fn single_send_count(&self) -> u64 {
        self.state.single_sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProducer for InMemoryBroker {
    async fn send(&self, message: &Message) -> Result<SendReceipt, XaError> {
        self.state.send_one(message)
    }

    async fn send_batch(&self, messages: &[Message]) -> Result<SendReceipt, XaError> {
        for message in messages {
            self.state.check(message)?;
        }
        self.state.batches.fetch_add(1, Ordering::SeqCst);
        let receipt = self.state.append(messages);
        debug!(count = messages.len(), "Batch delivered");
        Ok(receipt)
    }

    fn send_async(&self, message: Message, callback: SendCallback) -> Result<(), XaError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| XaError::Broker(format!("no async runtime: {}", e)))?;
        let state = self.state.clone();
        runtime.spawn(async move {
            let result = state.send_one(&message);
            callback(result);
        });
        Ok(())
    }
}
