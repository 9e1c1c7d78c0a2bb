//! # Cross-Node Transaction Flows
//!
//! ```text
//! [order-svc]  begin ──metadata──→ [stock-svc]  begin (join)
//!      │                                │  write, send
//!      │ write, send                    │  commit (branch ended, outcome deferred)
//!      ↓                                │
//!   commit ──enlist/prepare/commit──────┘
//!      │
//!      ↓
//! messages delivered on every node that took part
//! ```
//!
//! ## Test Categories
//!
//! 1. **Happy Path**: one and two branches, buffered messages
//! 2. **Timeouts**: a branch that answers too late dooms the transaction
//! 3. **Propagation Rules**: rejected begins never reach the network
//! 4. **Participant Messaging**: deferred until the coordinator decides

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use xa_link::{
        AdapterState, EnlistmentService, Message, Propagation, TransactionDefinition, XaConfig,
        XaError,
    };

    use crate::integration::cluster::TestCluster;

    const ORDER: &str = "order-svc";
    const STOCK: &str = "stock-svc";

    // =========================================================================
    // HAPPY PATH
    // =========================================================================

    /// A single-branch transaction commits its write and releases its one
    /// buffered message once, with a batch of one sent synchronously.
    #[tokio::test]
    async fn test_single_branch_with_one_message() {
        let cluster = TestCluster::new(&[ORDER]);
        let order = cluster.node(ORDER);
        let mut scope = order.scope();

        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(&mut scope, "order-1", "placed").await.unwrap();
        order
            .outbox
            .send(&mut scope, "orders", false, Message::new("orders", "order-1 placed"))
            .await
            .unwrap();
        assert!(order.broker.delivered().is_empty(), "held until commit");

        order.adapter.commit(&mut scope, tx).await.unwrap();

        assert_eq!(order.committed("order-1").as_deref(), Some("placed"));
        assert_eq!(order.broker.delivered_to("orders").len(), 1);
        assert_eq!(order.broker.single_send_count(), 1);
        assert_eq!(order.log.successes().len(), 1);
        assert_eq!(scope.state(), AdapterState::Idle);
        assert_eq!(cluster.transport.call_count(), 0);
    }

    /// Work on two services commits on both once the initiator commits.
    #[tokio::test]
    async fn test_two_branches_commit_together() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(&mut scope, "order-1", "placed").await.unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        assert!(joined.is_new());
        stock.write(&mut inbound, "sku-9", "reserved").await.unwrap();
        stock.adapter.commit(&mut inbound, joined).await.unwrap();
        assert!(stock.committed("sku-9").is_none());

        order.adapter.commit(&mut scope, tx).await.unwrap();

        assert_eq!(order.committed("order-1").as_deref(), Some("placed"));
        assert_eq!(stock.committed("sku-9").as_deref(), Some("reserved"));
        assert_eq!(cluster.ops(), vec!["enlist_resource", "prepare", "commit"]);

        // completed transactions leave nothing live behind
        for node in cluster.nodes() {
            assert_eq!(node.node.live_branch_count(), 0, "{}", node.address);
            assert_eq!(node.node.deferred_branch_count(), 0, "{}", node.address);
        }
        assert_eq!(order.manager.in_doubt_count(), 0);
    }

    /// Messages buffered across several sends go out as one batch.
    #[tokio::test]
    async fn test_buffered_messages_flush_as_one_batch() {
        let cluster = TestCluster::new(&[ORDER]);
        let order = cluster.node(ORDER);
        let mut scope = order.scope();

        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        for i in 0..3 {
            order
                .outbox
                .send(&mut scope, "orders", false, Message::new("orders", format!("m{}", i)))
                .await
                .unwrap();
        }
        order.adapter.commit(&mut scope, tx).await.unwrap();

        assert_eq!(order.broker.batch_count(), 1);
        assert_eq!(order.broker.delivered().len(), 3);
        assert_eq!(order.log.successes().len(), 3);
    }

    /// Async delivery sends each message on its own; a rejected one is
    /// logged as a failure without affecting the committed transaction.
    #[tokio::test]
    async fn test_async_messages_logged_individually() {
        let cluster = TestCluster::new(&[ORDER]);
        let order = cluster.node(ORDER);
        order.broker.reject_key("poison");
        let mut scope = order.scope();

        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(&mut scope, "order-1", "placed").await.unwrap();
        for key in ["a", "poison", "b"] {
            order
                .outbox
                .send(
                    &mut scope,
                    "orders",
                    true,
                    Message::new("orders", key).with_key(key),
                )
                .await
                .unwrap();
        }
        order.adapter.commit(&mut scope, tx).await.unwrap();

        assert!(order.log.wait_for_entries(3, Duration::from_secs(2)).await);
        assert_eq!(order.log.successes().len(), 2);
        assert_eq!(order.log.failures().len(), 1);
        assert_eq!(order.committed("order-1").as_deref(), Some("placed"));
    }

    // =========================================================================
    // ROLLBACK AND TIMEOUTS
    // =========================================================================

    /// A rolled-back transaction leaves no writes and sends nothing.
    #[tokio::test]
    async fn test_rollback_discards_writes_and_messages() {
        let cluster = TestCluster::new(&[ORDER]);
        let order = cluster.node(ORDER);
        let mut scope = order.scope();

        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(&mut scope, "order-1", "placed").await.unwrap();
        order
            .outbox
            .send(&mut scope, "orders", false, Message::new("orders", "placed"))
            .await
            .unwrap();
        order.adapter.rollback(&mut scope, tx).await.unwrap();

        assert!(order.committed("order-1").is_none());
        assert!(order.broker.delivered().is_empty());
        assert!(order.log.is_empty());
    }

    /// A branch whose prepare outlives the prepare timeout is treated as a
    /// rollback vote: the initiator's commit reports an unexpected rollback
    /// and the branch that did answer is rolled back.
    #[tokio::test]
    async fn test_slow_prepare_rolls_back_every_branch() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));
        cluster
            .transport
            .set_op_latency(STOCK, "prepare", Duration::from_millis(1_000));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(&mut scope, "order-1", "placed").await.unwrap();
        order
            .outbox
            .send(&mut scope, "orders", false, Message::new("orders", "placed"))
            .await
            .unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        stock.write(&mut inbound, "sku-9", "reserved").await.unwrap();
        stock.adapter.commit(&mut inbound, joined).await.unwrap();

        let err = order.adapter.commit(&mut scope, tx).await.unwrap_err();
        assert!(matches!(err, XaError::UnexpectedRollback(_)), "{}", err);

        assert!(order.committed("order-1").is_none());
        assert!(stock.committed("sku-9").is_none());
        assert!(order.driver.prepared_branches().is_empty());
        assert!(order.broker.delivered().is_empty());
        assert!(cluster.ops().contains(&"rollback"));
    }

    /// An initiator whose deadline passed is rolled back by the reaper and
    /// its commit reports the timeout.
    #[tokio::test]
    async fn test_expired_initiator_cannot_commit() {
        let cluster = TestCluster::with_config(&[ORDER], |address| XaConfig {
            default_timeout_ms: 1_000,
            ..XaConfig::for_testing(address)
        });
        let order = cluster.node(ORDER);
        let mut scope = order.scope();

        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(&mut scope, "order-1", "placed").await.unwrap();

        cluster.time.advance(5_000);
        assert_eq!(order.manager.reap_expired().await.len(), 1);

        let err = order.adapter.commit(&mut scope, tx).await.unwrap_err();
        assert!(matches!(err, XaError::UnexpectedRollback(ref m) if m.contains("timeout")));
        assert!(order.committed("order-1").is_none());
    }

    /// A propagated context past its deadline is refused at begin.
    #[tokio::test]
    async fn test_expired_context_refused_by_participant() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        let metadata = scope.outbound_metadata().unwrap();
        cluster.time.advance(60_000);

        let mut inbound = stock.inbound(&metadata).unwrap();
        let err = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap_err();
        assert!(matches!(err, XaError::System(_)));
        assert_eq!(cluster.transport.call_count(), 0);

        order.adapter.rollback(&mut scope, tx).await.unwrap();
    }

    // =========================================================================
    // PROPAGATION RULES
    // =========================================================================

    /// REQUIRES_NEW inside a propagated transaction fails before any
    /// enlistment call is made.
    #[tokio::test]
    async fn test_requires_new_inside_global_issues_no_rpc() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let definition = TransactionDefinition::required().with_propagation(Propagation::RequiresNew);
        let err = stock.adapter.begin(&mut inbound, &definition).await.unwrap_err();

        assert!(matches!(err, XaError::NestedTransactionNotSupported(_)));
        assert_eq!(cluster.transport.call_count(), 0);
        assert_eq!(inbound.depth(), 0);

        order.adapter.commit(&mut scope, tx).await.unwrap();
    }

    /// MANDATORY without a propagated context is refused.
    #[tokio::test]
    async fn test_mandatory_without_context_refused() {
        let cluster = TestCluster::new(&[STOCK]);
        let stock = cluster.node(STOCK);
        let mut scope = stock.scope();

        let definition = TransactionDefinition::required().with_propagation(Propagation::Mandatory);
        assert!(stock.adapter.begin(&mut scope, &definition).await.is_err());
        assert_eq!(scope.state(), AdapterState::Idle);
    }

    /// Repeating a commit for an already committed branch succeeds.
    #[tokio::test]
    async fn test_commit_delivery_is_idempotent() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        let handle = stock.adapter.connection(&mut inbound).await.unwrap();
        stock.driver.put(&handle, "sku-9", "reserved").unwrap();
        let branch = handle.branch().cloned().unwrap();
        stock.adapter.commit(&mut inbound, joined).await.unwrap();
        order.adapter.commit(&mut scope, tx).await.unwrap();

        order.node.commit(STOCK, &branch, false).await.unwrap();
        order.node.commit(STOCK, &branch, false).await.unwrap();
        assert_eq!(stock.committed("sku-9").as_deref(), Some("reserved"));
    }

    // =========================================================================
    // PARTICIPANT MESSAGING
    // =========================================================================

    /// Messages sent by a participant wait for the coordinator's decision
    /// and go out when it commits.
    #[tokio::test]
    async fn test_participant_messages_follow_coordinator_commit() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        stock
            .outbox
            .send(&mut inbound, "stock", false, Message::new("stock", "sku-9 reserved"))
            .await
            .unwrap();
        stock.adapter.commit(&mut inbound, joined).await.unwrap();
        drop(inbound);
        assert!(stock.broker.delivered().is_empty());

        order.adapter.commit(&mut scope, tx).await.unwrap();

        assert!(stock.log.wait_for_entries(1, Duration::from_secs(2)).await);
        assert_eq!(stock.broker.delivered_to("stock").len(), 1);
        assert_eq!(stock.log.successes().len(), 1);
    }

    /// Participant messages are dropped when the coordinator rolls back.
    #[tokio::test]
    async fn test_participant_messages_dropped_on_coordinator_rollback() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        stock
            .outbox
            .send(&mut inbound, "stock", false, Message::new("stock", "sku-9 reserved"))
            .await
            .unwrap();
        stock.adapter.commit(&mut inbound, joined).await.unwrap();

        order.adapter.rollback(&mut scope, tx).await.unwrap();

        assert!(!stock.log.wait_for_entries(1, Duration::from_millis(100)).await);
        assert!(stock.broker.delivered().is_empty());
    }

    /// A participant that rolls back dooms the transaction; nothing it or
    /// the initiator buffered is sent.
    #[tokio::test]
    async fn test_participant_rollback_dooms_initiator() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));

        let mut scope = order.scope();
        let tx = order
            .adapter
            .begin(&mut scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order
            .outbox
            .send(&mut scope, "orders", false, Message::new("orders", "placed"))
            .await
            .unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        stock.adapter.rollback(&mut inbound, joined).await.unwrap();

        let err = order.adapter.commit(&mut scope, tx).await.unwrap_err();
        assert!(matches!(err, XaError::UnexpectedRollback(_)));
        assert!(order.broker.delivered().is_empty());
    }
}
