//! # Test Cluster
//!
//! Nodes sharing one [`InMemoryTransport`] and one mock clock. Each node
//! owns its resource, broker and send log, and serves enlistment calls
//! addressed to it.

use std::sync::Arc;

use xa_link::{
    CallScope, EnlistmentNode, GlobalTransactionTable, InMemoryBroker, InMemoryResourceDriver,
    InMemorySendLog, InMemoryTransport, LocalTransactionAdapter, MockTimeSource, RpcMetadata,
    TimeSource, TransactionalOutbox, XaConfig, XaError, XaTransactionManager,
};

/// One service process.
pub struct TestNode {
    /// Address peers reach this node at.
    pub address: String,
    /// Enlistment service and branch registry.
    pub node: Arc<EnlistmentNode>,
    /// Coordinator for transactions begun here.
    pub manager: Arc<XaTransactionManager>,
    /// The node's database.
    pub driver: InMemoryResourceDriver,
    /// Per-call transaction adapter.
    pub adapter: LocalTransactionAdapter,
    /// Transactional message sender.
    pub outbox: TransactionalOutbox,
    /// Broker the outbox delivers to.
    pub broker: Arc<InMemoryBroker>,
    /// Delivery outcomes.
    pub log: Arc<InMemorySendLog>,
}

impl TestNode {
    fn build(
        config: &XaConfig,
        transport: &Arc<InMemoryTransport>,
        time: &Arc<MockTimeSource>,
    ) -> Self {
        let clock: Arc<dyn TimeSource> = time.clone();
        let table = Arc::new(GlobalTransactionTable::new(clock.clone()));
        let node = Arc::new(
            EnlistmentNode::new(
                config.local_address.clone(),
                table.clone(),
                transport.clone(),
                config.call_deadline(),
            )
            .with_completed_history(config.completed_history),
        );
        transport.register(config.local_address.clone(), &node);

        let manager = Arc::new(XaTransactionManager::new(
            config,
            table,
            node.clone(),
            clock.clone(),
        ));
        let driver = InMemoryResourceDriver::new(format!("{}-db", config.local_address));
        let adapter = LocalTransactionAdapter::new(
            config,
            Arc::new(driver.clone()),
            manager.clone(),
            node.clone(),
            node.clone(),
            clock.clone(),
        );
        let broker = Arc::new(InMemoryBroker::new());
        let log = Arc::new(InMemorySendLog::with_time_source(clock));
        let outbox = TransactionalOutbox::new(broker.clone(), log.clone());

        Self {
            address: config.local_address.clone(),
            node,
            manager,
            driver,
            adapter,
            outbox,
            broker,
            log,
        }
    }

    /// Fresh scope for a call originating here.
    pub fn scope(&self) -> CallScope {
        CallScope::new(self.address.clone())
    }

    /// Scope for a call received with `metadata`.
    pub fn inbound(&self, metadata: &RpcMetadata) -> Result<CallScope, XaError> {
        CallScope::inbound(self.address.clone(), metadata)
    }

    /// Write `key` through the scope's current connection.
    pub async fn write(&self, scope: &mut CallScope, key: &str, value: &str) -> Result<(), XaError> {
        let handle = self.adapter.connection(scope).await?;
        self.driver.put(&handle, key, value)
    }

    /// Committed value of `key` in this node's database.
    pub fn committed(&self, key: &str) -> Option<String> {
        self.driver.committed(key)
    }
}

/// A set of nodes on one transport.
pub struct TestCluster {
    /// Shared transport; inject latency and partitions here.
    pub transport: Arc<InMemoryTransport>,
    /// Shared clock.
    pub time: Arc<MockTimeSource>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Nodes with [`XaConfig::for_testing`] settings.
    pub fn new(addresses: &[&str]) -> Self {
        Self::with_config(addresses, |address: &str| XaConfig::for_testing(address))
    }

    /// Nodes configured by `configure`.
    pub fn with_config(addresses: &[&str], configure: impl Fn(&str) -> XaConfig) -> Self {
        let transport = Arc::new(InMemoryTransport::new());
        let time = Arc::new(MockTimeSource::new(1_000));
        let nodes = addresses
            .iter()
            .map(|address| TestNode::build(&configure(address), &transport, &time))
            .collect();
        Self {
            transport,
            time,
            nodes,
        }
    }

    /// Node at `address`.
    ///
    /// # Panics
    ///
    /// When no node was built for `address`.
    pub fn node(&self, address: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.address == address)
            .unwrap_or_else(|| panic!("no node at {}", address))
    }

    /// Every node, in construction order.
    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// Enlistment operations issued so far, in order.
    pub fn ops(&self) -> Vec<&'static str> {
        self.transport.calls().into_iter().map(|c| c.op).collect()
    }
}
