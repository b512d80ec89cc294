//! Node health monitoring
//!
//! Polls the control plane for compute nodes and picks out the ones that are
//! down. Failures never propagate: a failed listing skips the cycle and a
//! failed detail lookup skips the node.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::cluster::{ClusterApi, ComputeNode, NodeDetail};

/// Health monitor for compute nodes
pub struct HealthMonitor {
    api: Arc<dyn ClusterApi>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// List the nodes that are currently down.
    ///
    /// Returns an empty list if the control plane cannot be queried.
    pub async fn poll(&self) -> Vec<ComputeNode> {
        match self.api.list_nodes().await {
            Ok(nodes) => {
                let total = nodes.len();
                let down = down_nodes(nodes);
                debug!(total = total, down = down.len(), "Node health polled");
                down
            }
            Err(e) => {
                error!(error = %e, "Unable to retrieve node list");
                Vec::new()
            }
        }
    }

    /// Fetch resident VMs and service registration for a node.
    ///
    /// `None` means no detail is available this cycle.
    pub async fn detail(&self, node_id: &str, hostname: &str) -> Option<NodeDetail> {
        match self.api.node_detail(node_id, hostname).await {
            Ok(detail) => Some(detail),
            Err(e) if e.is_not_found() => {
                warn!(node = hostname, id = node_id, "No detail found for node, skipping");
                None
            }
            Err(e) => {
                error!(node = hostname, id = node_id, error = %e, "Unable to fetch node detail");
                None
            }
        }
    }
}

/// Keep only the nodes whose state is not exactly `up`
pub fn down_nodes(nodes: Vec<ComputeNode>) -> Vec<ComputeNode> {
    nodes
        .into_iter()
        .filter(|node| {
            if node.state.is_down() {
                warn!(node = %node.hostname, state = %node.state, "Node is down");
                true
            } else {
                debug!(node = %node.hostname, "Node is up");
                false
            }
        })
        .collect()
}
