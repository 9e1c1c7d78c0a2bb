//! # Commit Benchmarks
//!
//! Cost of completing a transaction over the in-memory transport:
//!
//! | Case | Protocol |
//! |------|----------|
//! | local | native commit, no coordinator |
//! | single branch | one-phase commit, no RPC |
//! | N participants | enlist + prepare + commit per participant |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use tokio::runtime::Runtime;

use xa_link::{Message, TransactionDefinition};
use xa_tests::integration::cluster::TestCluster;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Single node
// ============================================================================

fn bench_single_node(c: &mut Criterion) {
    let rt = runtime();
    let cluster = TestCluster::new(&["coord"]);
    let coord = cluster.node("coord");

    let mut group = c.benchmark_group("single-node");
    group.measurement_time(Duration::from_secs(5));

    for (name, definition) in [
        ("local", TransactionDefinition::local()),
        ("single_branch", TransactionDefinition::required()),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let mut scope = coord.scope();
                    let tx = coord.adapter.begin(&mut scope, &definition).await.unwrap();
                    coord.write(&mut scope, "k", "v").await.unwrap();
                    black_box(coord.adapter.commit(&mut scope, tx).await.is_ok())
                })
            })
        });
    }

    group.bench_function("single_branch_with_message", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut scope = coord.scope();
                let tx = coord
                    .adapter
                    .begin(&mut scope, &TransactionDefinition::required())
                    .await
                    .unwrap();
                coord
                    .outbox
                    .send(&mut scope, "orders", false, Message::new("orders", "m"))
                    .await
                    .unwrap();
                black_box(coord.adapter.commit(&mut scope, tx).await.is_ok())
            })
        })
    });

    group.finish();
}

// ============================================================================
// Two-phase commit fan-out
// ============================================================================

fn bench_two_phase_fan_out(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("two-phase-commit");
    group.measurement_time(Duration::from_secs(10));

    for participants in [1usize, 2, 4, 8] {
        let addresses: Vec<String> = std::iter::once("coord".to_string())
            .chain((0..participants).map(|i| format!("p{}", i)))
            .collect();
        let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
        let cluster = TestCluster::new(&refs);
        let coord = cluster.node("coord");

        group.throughput(Throughput::Elements(participants as u64));
        group.bench_with_input(
            BenchmarkId::new("participants", participants),
            &cluster,
            |b, cluster| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut scope = coord.scope();
                        let tx = coord
                            .adapter
                            .begin(&mut scope, &TransactionDefinition::required())
                            .await
                            .unwrap();
                        let metadata = scope.outbound_metadata().unwrap();
                        for node in &cluster.nodes()[1..] {
                            let mut inbound = node.inbound(&metadata).unwrap();
                            let joined = node
                                .adapter
                                .begin(&mut inbound, &TransactionDefinition::required())
                                .await
                                .unwrap();
                            node.write(&mut inbound, "k", "v").await.unwrap();
                            node.adapter.commit(&mut inbound, joined).await.unwrap();
                        }
                        black_box(coord.adapter.commit(&mut scope, tx).await.is_ok())
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_single_node, bench_two_phase_fan_out);
criterion_main!(benches);
