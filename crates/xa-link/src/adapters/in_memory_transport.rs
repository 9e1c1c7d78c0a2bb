//! In-Memory RPC Transport
//!
//! Routes enlistment calls between nodes in the same process. Every request
//! and response is serialised to JSON and back so the wire types are
//! exercised exactly as a network transport would. Peers can be made
//! unreachable or slow.

use super::enlistment_node::EnlistmentNode;
use crate::domain::XaError;
use crate::ipc::{EnlistmentRequest, EnlistmentResponse, WireFrame};
use crate::ports::RpcTransport;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// One call observed by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    /// Destination.
    pub address: String,
    /// Operation name.
    pub op: &'static str,
}

/// In-process transport.
#[derive(Default)]
pub struct InMemoryTransport {
    nodes: RwLock<HashMap<String, Weak<EnlistmentNode>>>,
    unreachable: RwLock<HashSet<String>>,
    latency: RwLock<HashMap<(String, Option<String>), Duration>>,
    calls: RwLock<Vec<CallRecord>>,
}

impl InMemoryTransport {
    /// Create a transport with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `address` to `node`.
    pub fn register(&self, address: impl Into<String>, node: &Arc<EnlistmentNode>) {
        self.nodes
            .write()
            .insert(address.into(), Arc::downgrade(node));
    }

    /// Make `address` refuse connections.
    pub fn set_unreachable(&self, address: impl Into<String>, unreachable: bool) {
        let address = address.into();
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }

    /// Delay every call to `address`.
    pub fn set_latency(&self, address: impl Into<String>, delay: Duration) {
        self.latency.write().insert((address.into(), None), delay);
    }

    /// Delay one operation (`"prepare"`, `"commit"`, ...) to `address`.
    pub fn set_op_latency(&self, address: impl Into<String>, op: &str, delay: Duration) {
        self.latency
            .write()
            .insert((address.into(), Some(op.to_string())), delay);
    }

    /// Calls issued so far.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.read().clone()
    }

    /// Number of calls issued so far.
    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }

    fn delay_for(&self, address: &str, op: &str) -> Option<Duration> {
        let latency = self.latency.read();
        latency
            .get(&(address.to_string(), Some(op.to_string())))
            .or_else(|| latency.get(&(address.to_string(), None)))
            .copied()
    }
}

#[async_trait]
impl RpcTransport for InMemoryTransport {
    async fn call(
        &self,
        remote_address: &str,
        request: EnlistmentRequest,
    ) -> Result<EnlistmentResponse, XaError> {
        let op = request.op_name();
        self.calls.write().push(CallRecord {
            address: remote_address.to_string(),
            op,
        });

        if self.unreachable.read().contains(remote_address) {
            return Err(XaError::Transport {
                address: remote_address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(delay) = self.delay_for(remote_address, op) {
            tokio::time::sleep(delay).await;
        }

        let node = self
            .nodes
            .read()
            .get(remote_address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| XaError::Transport {
                address: remote_address.to_string(),
                reason: "no such peer".to_string(),
            })?;

        let outbound = serde_json::to_vec(&WireFrame::new(request))?;
        let inbound: WireFrame<EnlistmentRequest> = serde_json::from_slice(&outbound)?;
        trace!(to = remote_address, op, correlation_id = %inbound.correlation_id, "Delivering request");

        let response = node.handle(inbound.payload).await;

        let reply = serde_json::to_vec(&WireFrame::reply(inbound.correlation_id, response))?;
        let reply: WireFrame<EnlistmentResponse> = serde_json::from_slice(&reply)?;
        Ok(reply.payload)
    }
}
