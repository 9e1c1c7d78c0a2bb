//! # Transactional Outbox
//!
//! Buffers outbound broker messages per (transaction, producer) and hands
//! them to the broker only after the transaction committed. A rolled-back
//! or undetermined transaction discards its messages. Delivery failures go
//! to the send log and never reach the transaction outcome.
//!
//! ## Delivery
//!
//! | Mode | Messages | Broker calls |
//! |------|----------|--------------|
//! | Sync | 1 | one `send` |
//! | Sync | n | one `send_batch`, aggregate result logged per message |
//! | Async | n | n spawned `send_async`, each logged independently |

use super::scope::CallScope;
use crate::domain::{CompletionOutcome, DeliveryMode, Message, PendingMessageBatch, XaError};
use crate::ports::{CompletionListener, MessageProducer, SendCallback, SendLog};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const BINDING_PREFIX: &str = "xa-link.outbox.";

type SharedBatch = Mutex<PendingMessageBatch>;

/// Handle on the pending batch of one producer.
#[derive(Clone)]
pub struct MessageBuffer {
    batch: Arc<SharedBatch>,
    producer_key: String,
    deferred: bool,
}

impl MessageBuffer {
    /// Whether the buffer is tied to a transaction and flushed on commit.
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Producer this buffer belongs to.
    pub fn producer_key(&self) -> &str {
        &self.producer_key
    }

    /// Queue a message. Insertion order is delivery order.
    pub fn append(&self, message: Message) -> Result<(), XaError> {
        self.batch.lock().push(message)
    }

    /// Messages waiting for delivery.
    pub fn len(&self) -> usize {
        self.batch.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.batch.lock().is_empty()
    }

    /// Delivery mode chosen when the buffer was created.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.batch.lock().delivery_mode()
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("producer_key", &self.producer_key)
            .field("deferred", &self.deferred)
            .field("pending", &self.len())
            .finish()
    }
}

/// Outbound message buffer bound to transaction completion.
#[derive(Clone)]
pub struct TransactionalOutbox {
    producer: Arc<dyn MessageProducer>,
    log: Arc<dyn SendLog>,
}

impl TransactionalOutbox {
    /// Create an outbox over a broker client and a send log.
    pub fn new(producer: Arc<dyn MessageProducer>, log: Arc<dyn SendLog>) -> Self {
        Self { producer, log }
    }

    /// Buffer for `producer_key` in the scope's current transaction.
    ///
    /// The first acquisition inside a transaction binds the buffer and
    /// registers its flush listener; later ones return the same buffer
    /// whatever `async_mode` they ask for. Without a transaction a fresh
    /// unbound buffer is returned for the caller to `flush_now`.
    pub fn acquire_buffer(
        &self,
        scope: &mut CallScope,
        producer_key: &str,
        async_mode: bool,
    ) -> Result<MessageBuffer, XaError> {
        let binding = format!("{}{}", BINDING_PREFIX, producer_key);
        if let Some(bound) = scope.resource(&binding) {
            let batch = bound.downcast::<SharedBatch>().map_err(|_| {
                XaError::IllegalTransactionState(format!(
                    "{} is bound to something other than a message buffer",
                    binding
                ))
            })?;
            return Ok(MessageBuffer {
                batch,
                producer_key: producer_key.to_string(),
                deferred: true,
            });
        }

        let batch = Arc::new(Mutex::new(PendingMessageBatch::new(DeliveryMode::from_async(
            async_mode,
        ))));
        if !scope.has_transaction() {
            return Ok(MessageBuffer {
                batch,
                producer_key: producer_key.to_string(),
                deferred: false,
            });
        }

        scope.register_listener(Box::new(FlushListener {
            batch: batch.clone(),
            producer_key: producer_key.to_string(),
            producer: self.producer.clone(),
            log: self.log.clone(),
            suspended: false,
        }))?;
        scope.bind_resource(binding, batch.clone())?;
        debug!(producer = producer_key, async_mode, "Message buffer bound to transaction");
        Ok(MessageBuffer {
            batch,
            producer_key: producer_key.to_string(),
            deferred: true,
        })
    }

    /// Queue a message on `buffer`.
    pub fn append(&self, buffer: &MessageBuffer, message: Message) -> Result<(), XaError> {
        buffer.append(message)
    }

    /// Send `message` with the current transaction, or right away when
    /// there is none.
    pub async fn send(
        &self,
        scope: &mut CallScope,
        producer_key: &str,
        async_mode: bool,
        message: Message,
    ) -> Result<(), XaError> {
        let buffer = self.acquire_buffer(scope, producer_key, async_mode)?;
        buffer.append(message)?;
        if buffer.is_deferred() {
            trace!(producer = producer_key, pending = buffer.len(), "Message deferred");
            Ok(())
        } else {
            self.flush_now(&buffer).await
        }
    }

    /// Deliver an unbound buffer immediately.
    ///
    /// Every outcome is recorded in the send log. In sync mode a broker
    /// failure is also returned, since no transaction outcome depends on it.
    pub async fn flush_now(&self, buffer: &MessageBuffer) -> Result<(), XaError> {
        if buffer.is_deferred() {
            return Err(XaError::IllegalTransactionState(format!(
                "buffer for {} is flushed by its transaction",
                buffer.producer_key
            )));
        }
        let (mode, messages) = {
            let mut batch = buffer.batch.lock();
            (batch.delivery_mode(), batch.seal_and_take())
        };
        let result = deliver(self.producer.as_ref(), &self.log, mode, messages).await;
        buffer.batch.lock().reset();
        result
    }
}

/// Flushes or discards one producer's batch when the transaction completes.
struct FlushListener {
    batch: Arc<SharedBatch>,
    producer_key: String,
    producer: Arc<dyn MessageProducer>,
    log: Arc<dyn SendLog>,
    suspended: bool,
}

#[async_trait]
impl CompletionListener for FlushListener {
    fn on_suspend(&mut self) {
        self.suspended = true;
        trace!(producer = %self.producer_key, "Message buffer suspended");
    }

    fn on_resume(&mut self) {
        self.suspended = false;
        trace!(producer = %self.producer_key, "Message buffer resumed");
    }

    async fn after_completion(self: Box<Self>, outcome: CompletionOutcome) {
        if self.suspended {
            warn!(producer = %self.producer_key, "Transaction completed while buffer suspended");
        }
        match outcome {
            CompletionOutcome::Committed => {
                let (mode, messages) = {
                    let mut batch = self.batch.lock();
                    (batch.delivery_mode(), batch.seal_and_take())
                };
                debug!(producer = %self.producer_key, count = messages.len(), ?mode,
                    "Flushing messages after commit");
                // failures are already in the send log
                let _ = deliver(self.producer.as_ref(), &self.log, mode, messages).await;
            }
            CompletionOutcome::RolledBack | CompletionOutcome::Unknown => {
                let discarded = self.batch.lock().len();
                if discarded > 0 {
                    debug!(producer = %self.producer_key, discarded, ?outcome,
                        "Discarding messages of uncommitted transaction");
                }
            }
        }
        self.batch.lock().reset();
    }
}

async fn deliver(
    producer: &dyn MessageProducer,
    log: &Arc<dyn SendLog>,
    mode: DeliveryMode,
    messages: Vec<Message>,
) -> Result<(), XaError> {
    if messages.is_empty() {
        return Ok(());
    }

    match mode {
        DeliveryMode::Async => {
            for message in messages {
                let log_for_callback = log.clone();
                let sent = message.clone();
                let callback: SendCallback = Box::new(move |result| match result {
                    Ok(receipt) => log_for_callback.record_success(&sent, &receipt),
                    Err(e) => log_for_callback.record_failure(&sent, &e.to_string()),
                });
                if let Err(e) = producer.send_async(message.clone(), callback) {
                    log.record_failure(&message, &e.to_string());
                }
            }
            Ok(())
        }
        DeliveryMode::Sync => {
            let result = if let [single] = messages.as_slice() {
                producer.send(single).await
            } else {
                producer.send_batch(&messages).await
            };
            match &result {
                Ok(receipt) => {
                    for message in &messages {
                        log.record_success(message, receipt);
                    }
                }
                Err(e) => {
                    let cause = e.to_string();
                    for message in &messages {
                        log.record_failure(message, &cause);
                    }
                }
            }
            result.map(|_| ())
        }
    }
}
