//! # Recovery and Heuristic Outcomes
//!
//! Phase-2 deliveries that never arrive leave prepared branches behind.
//! The coordinator resolves them from its decision log once the
//! participant is reachable again: committed decisions are replayed,
//! anything else is presumed aborted.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use xa_link::{
        CompletionOutcome, HeuristicState, RecordedDecision, ResourceDriver, TransactionDefinition,
        TransactionHandle, Vote, XaError,
    };

    use crate::integration::cluster::{TestCluster, TestNode};

    const ORDER: &str = "order-svc";
    const STOCK: &str = "stock-svc";

    /// Begin on `order`, write on both nodes, and finish the participant
    /// side. Returns the initiator's handle.
    async fn two_branch_transaction(
        order: &TestNode,
        stock: &TestNode,
        scope: &mut xa_link::CallScope,
    ) -> TransactionHandle {
        let tx = order
            .adapter
            .begin(scope, &TransactionDefinition::required())
            .await
            .unwrap();
        order.write(scope, "order-1", "placed").await.unwrap();

        let mut inbound = stock.inbound(&scope.outbound_metadata().unwrap()).unwrap();
        let joined = stock
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        stock.write(&mut inbound, "sku-9", "reserved").await.unwrap();
        stock.adapter.commit(&mut inbound, joined).await.unwrap();
        tx
    }

    async fn restart(node: &TestNode) {
        let session = node.driver.create_xa_session().await.unwrap();
        node.node.register_recoverable(session);
        node.node.simulate_restart();
    }

    // =========================================================================
    // IN-DOUBT BRANCHES
    // =========================================================================

    /// A commit that never reached the participant is replayed by recovery
    /// after the participant restarts.
    #[tokio::test]
    async fn test_lost_commit_replayed_by_recovery() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));
        cluster
            .transport
            .set_op_latency(STOCK, "commit", Duration::from_millis(1_000));

        let mut scope = order.scope();
        let tx = two_branch_transaction(order, stock, &mut scope).await;
        let tid = tx.transaction_id().cloned().unwrap();

        // the decision stands even though one delivery was lost
        order.adapter.commit(&mut scope, tx).await.unwrap();
        assert_eq!(order.manager.decision(&tid), Some(RecordedDecision::Committed));
        assert_eq!(order.manager.in_doubt_count(), 1);
        assert_eq!(order.committed("order-1").as_deref(), Some("placed"));
        assert!(stock.committed("sku-9").is_none());
        assert_eq!(stock.driver.prepared_branches().len(), 1);

        restart(stock).await;
        cluster
            .transport
            .set_op_latency(STOCK, "commit", Duration::ZERO);

        let resolved = order.manager.recover_participant(STOCK).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].outcome, CompletionOutcome::Committed);
        assert_eq!(stock.committed("sku-9").as_deref(), Some("reserved"));
        assert_eq!(order.manager.in_doubt_count(), 0);
        assert_eq!(order.manager.decision(&tid), Some(RecordedDecision::Committed));
        assert_eq!(stock.node.live_branch_count(), 0);

        // a second scan finds nothing left
        assert!(order.manager.recover_participant(STOCK).await.unwrap().is_empty());
    }

    /// A lost rollback leaves the branch prepared; recovery rolls it back.
    #[tokio::test]
    async fn test_lost_rollback_presumed_abort() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));
        order.driver.script_vote(Vote::Rollback);
        cluster
            .transport
            .set_op_latency(STOCK, "rollback", Duration::from_millis(1_000));

        let mut scope = order.scope();
        let tx = two_branch_transaction(order, stock, &mut scope).await;
        let err = order.adapter.commit(&mut scope, tx).await.unwrap_err();
        assert!(matches!(err, XaError::UnexpectedRollback(_)));
        assert_eq!(stock.driver.prepared_branches().len(), 1);

        restart(stock).await;
        cluster
            .transport
            .set_op_latency(STOCK, "rollback", Duration::ZERO);

        let resolved = order.manager.recover_participant(STOCK).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].outcome, CompletionOutcome::RolledBack);
        assert!(stock.committed("sku-9").is_none());
        assert!(stock.driver.prepared_branches().is_empty());
    }

    /// Recovery against an unreachable participant reports the failure.
    #[tokio::test]
    async fn test_recovery_needs_reachable_participant() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let order = cluster.node(ORDER);
        cluster.transport.set_unreachable(STOCK, true);

        assert!(order.manager.recover_participant(STOCK).await.is_err());
    }

    // =========================================================================
    // HEURISTICS
    // =========================================================================

    /// A participant that rolled back on its own after preparing is
    /// reported to the initiator as a heuristic outcome.
    #[tokio::test]
    async fn test_heuristic_outcome_surfaced_to_initiator() {
        let cluster = TestCluster::new(&[ORDER, STOCK]);
        let (order, stock) = (cluster.node(ORDER), cluster.node(STOCK));
        stock.driver.heuristic_on_commit(HeuristicState::RolledBack);

        let mut scope = order.scope();
        let tx = two_branch_transaction(order, stock, &mut scope).await;
        let tid = tx.transaction_id().cloned().unwrap();

        let err = order.adapter.commit(&mut scope, tx).await.unwrap_err();
        assert!(matches!(err, XaError::HeuristicCompletion { .. }), "{}", err);
        assert_eq!(order.manager.decision(&tid), Some(RecordedDecision::Heuristic));
        assert!(stock.committed("sku-9").is_none());

        // heuristic branches are left for manual resolution
        assert!(order.manager.recover_participant(STOCK).await.unwrap().is_empty());
    }
}
