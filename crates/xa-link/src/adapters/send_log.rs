//! In-Memory Send Log
//!
//! Append-only record of message delivery outcomes, with queries for
//! operator tooling and tests.

use crate::domain::{Message, SendLogEntry, SendOutcome, SendReceipt};
use crate::ports::{SendLog, SystemTimeSource, TimeSource};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// In-memory send log.
pub struct InMemorySendLog {
    entries: RwLock<Vec<SendLogEntry>>,
    appended: Notify,
    time: Arc<dyn TimeSource>,
}

impl InMemorySendLog {
    /// Create an empty log stamped with system time.
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Create an empty log with a custom clock.
    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            appended: Notify::new(),
            time,
        }
    }

    /// All entries in recording order.
    pub fn entries(&self) -> Vec<SendLogEntry> {
        self.entries.read().clone()
    }

    /// Successful deliveries.
    pub fn successes(&self) -> Vec<SendLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_success())
            .cloned()
            .collect()
    }

    /// Failed deliveries.
    pub fn failures(&self) -> Vec<SendLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| !e.is_success())
            .cloned()
            .collect()
    }

    /// Latest entry for a message.
    pub fn entry_for(&self, message_id: Uuid) -> Option<SendLogEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|e| e.message.id == message_id)
            .cloned()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Wait until at least `count` entries exist. Returns `false` on timeout.
    pub async fn wait_for_entries(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let appended = self.appended.notified();
                if self.len() >= count {
                    return;
                }
                appended.await;
            }
        })
        .await
        .is_ok()
    }

    fn append(&self, message: &Message, outcome: SendOutcome) {
        self.entries.write().push(SendLogEntry {
            message: message.clone(),
            outcome,
            recorded_at: self.time.now(),
        });
        self.appended.notify_waiters();
    }
}

impl Default for InMemorySendLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SendLog for InMemorySendLog {
    fn record_success(&self, message: &Message, receipt: &SendReceipt) {
        debug!(id = %message.id, topic = %message.topic, receipt = %receipt.receipt_id,
            "Message send succeeded");
        self.append(message, SendOutcome::Success(receipt.clone()));
    }

    fn record_failure(&self, message: &Message, cause: &str) {
        warn!(id = %message.id, topic = %message.topic, cause, "Message send failed");
        self.append(message, SendOutcome::Failure(cause.to_string()));
    }
}
