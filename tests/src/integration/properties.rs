//! # Randomized Atomicity Checks
//!
//! Random fan-outs of participants, some of which roll back or vote no.
//! Whatever the mix, every node ends with the same outcome: all writes
//! committed or none.

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use rand::Rng;

    use xa_link::{RpcMetadata, TransactionDefinition, Vote, XaError};
    use xa_telemetry::{init_telemetry, transaction_span, TelemetryConfig};

    use crate::integration::cluster::{TestCluster, TestNode};

    const ROUNDS: usize = 25;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Behaviour {
        Commit,
        Rollback,
        VoteNo,
    }

    async fn participate(node: &TestNode, metadata: &RpcMetadata, behaviour: Behaviour) {
        let mut inbound = node.inbound(metadata).unwrap();
        let joined = node
            .adapter
            .begin(&mut inbound, &TransactionDefinition::required())
            .await
            .unwrap();
        node.write(&mut inbound, "k", &node.address).await.unwrap();
        if behaviour == Behaviour::VoteNo {
            node.driver.script_vote(Vote::Rollback);
        }
        match behaviour {
            Behaviour::Rollback => node.adapter.rollback(&mut inbound, joined).await.unwrap(),
            _ => node.adapter.commit(&mut inbound, joined).await.unwrap(),
        }
    }

    /// N participants that all commit are all committed.
    #[tokio::test]
    async fn test_all_participants_commit() {
        let _guard = init_telemetry(&TelemetryConfig {
            console_output: false,
            ..TelemetryConfig::for_node("coord")
        });
        let mut rng = rand::thread_rng();

        for round in 0..ROUNDS {
            let fan_out = rng.gen_range(1..=5);
            let addresses: Vec<String> = std::iter::once("coord".to_string())
                .chain((0..fan_out).map(|i| format!("p{}", i)))
                .collect();
            let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
            let cluster = TestCluster::new(&refs);
            let coord = cluster.node("coord");

            let mut scope = coord.scope();
            let tx = coord
                .adapter
                .begin(&mut scope, &TransactionDefinition::required())
                .await
                .unwrap();
            let tid = tx.transaction_id().cloned();
            coord.write(&mut scope, "k", "coord").await.unwrap();

            let metadata = scope.outbound_metadata().unwrap();
            join_all(
                cluster.nodes()[1..]
                    .iter()
                    .map(|node| participate(node, &metadata, Behaviour::Commit)),
            )
            .await;
            coord.adapter.commit(&mut scope, tx).await.unwrap();

            let _span = transaction_span!("verify", round, tid = ?tid).entered();
            for node in cluster.nodes() {
                assert_eq!(
                    node.committed("k").as_deref(),
                    Some(node.address.as_str()),
                    "round {} node {}",
                    round,
                    node.address
                );
            }
        }
    }

    /// Any participant rolling back or voting no means nothing commits.
    #[tokio::test]
    async fn test_outcome_is_all_or_nothing() {
        let mut rng = rand::thread_rng();

        for round in 0..ROUNDS {
            let fan_out = rng.gen_range(1..=4);
            let behaviours: Vec<Behaviour> = (0..fan_out)
                .map(|_| match rng.gen_range(0..6) {
                    0 => Behaviour::Rollback,
                    1 => Behaviour::VoteNo,
                    _ => Behaviour::Commit,
                })
                .collect();
            let addresses: Vec<String> = std::iter::once("coord".to_string())
                .chain((0..fan_out).map(|i| format!("p{}", i)))
                .collect();
            let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
            let cluster = TestCluster::new(&refs);
            let coord = cluster.node("coord");

            let mut scope = coord.scope();
            let tx = coord
                .adapter
                .begin(&mut scope, &TransactionDefinition::required())
                .await
                .unwrap();
            coord.write(&mut scope, "k", "coord").await.unwrap();

            let metadata = scope.outbound_metadata().unwrap();
            join_all(
                cluster.nodes()[1..]
                    .iter()
                    .zip(&behaviours)
                    .map(|(node, behaviour)| participate(node, &metadata, *behaviour)),
            )
            .await;
            let result = coord.adapter.commit(&mut scope, tx).await;

            let should_commit = behaviours.iter().all(|b| *b == Behaviour::Commit);
            if should_commit {
                assert!(result.is_ok(), "round {}: {:?}", round, result);
            } else {
                assert!(
                    matches!(result, Err(XaError::UnexpectedRollback(_))),
                    "round {} {:?}: {:?}",
                    round,
                    behaviours,
                    result
                );
            }
            for node in cluster.nodes() {
                assert_eq!(
                    node.committed("k").is_some(),
                    should_commit,
                    "round {} node {} {:?}",
                    round,
                    node.address,
                    behaviours
                );
            }
        }
    }
}
