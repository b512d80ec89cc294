//! Mock cluster implementation for testing

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ApiError, ClusterApi, ComputeNode, MigrationRecord, NodeDetail, ServerRef, ServiceRecord};

/// In-memory, scriptable control plane
///
/// Migration listings are scripted per host as a queue of snapshots: each
/// `list_migrations` call consumes the front snapshot, and the last one is
/// repeated once the queue is down to a single entry.
#[derive(Default)]
pub struct MockCluster {
    nodes: RwLock<Vec<ComputeNode>>,
    details: RwLock<HashMap<String, NodeDetail>>,
    migrations: RwLock<HashMap<String, VecDeque<Vec<MigrationRecord>>>>,
    evacuate_failures: RwLock<HashSet<String>>,
    start_failures: RwLock<HashMap<String, u32>>,
    detail_failures: RwLock<HashSet<String>>,
    /// Fail `list_nodes` calls
    pub fail_list_nodes: AtomicBool,
    /// Fail `ensure_session` calls
    pub fail_session: AtomicBool,
    /// Number of upcoming `list_migrations` calls that fail
    pub failing_migration_polls: AtomicU32,
    evacuate_calls: RwLock<Vec<String>>,
    start_calls: RwLock<Vec<String>>,
    migration_polls: AtomicU32,
    node_polls: AtomicU32,
}

impl MockCluster {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and the detail record returned for it.
    ///
    /// `servers` and `service_host` map directly onto the optional
    /// fields of [`NodeDetail`].
    pub async fn add_node(
        &self,
        node: ComputeNode,
        servers: Option<Vec<ServerRef>>,
        service_host: Option<&str>,
    ) {
        let detail = NodeDetail {
            id: node.id.clone(),
            hostname: node.hostname.clone(),
            state: node.state.clone(),
            servers,
            service: service_host.map(|host| ServiceRecord {
                host: host.to_string(),
            }),
        };
        self.details.write().await.insert(node.id.clone(), detail);
        self.nodes.write().await.push(node);
    }

    /// Register a node without a detail record (detail lookup yields not found)
    pub async fn add_node_without_detail(&self, node: ComputeNode) {
        self.nodes.write().await.push(node);
    }

    /// Replace the reported state of a node
    pub async fn set_node_state(&self, node_id: &str, state: &str) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.iter_mut().filter(|n| n.id == node_id) {
            node.state = super::NodeState::from_reported(state);
        }
    }

    /// Queue a migration listing snapshot for a host
    pub async fn push_migrations(&self, host: &str, records: Vec<MigrationRecord>) {
        self.migrations
            .write()
            .await
            .entry(host.to_string())
            .or_default()
            .push_back(records);
    }

    /// Make evacuate calls for a server fail
    pub async fn fail_evacuate(&self, server_id: &str) {
        self.evacuate_failures.write().await.insert(server_id.to_string());
    }

    /// Make start calls for a server fail
    pub async fn fail_start(&self, server_id: &str) {
        self.start_failures
            .write()
            .await
            .insert(server_id.to_string(), u32::MAX);
    }

    /// Make the next start call for a server fail
    pub async fn fail_start_once(&self, server_id: &str) {
        self.start_failures
            .write()
            .await
            .insert(server_id.to_string(), 1);
    }

    /// Let start calls for a server succeed again
    pub async fn clear_start_failure(&self, server_id: &str) {
        self.start_failures.write().await.remove(server_id);
    }

    /// Make detail lookups for a node fail with a transport error
    pub async fn fail_detail(&self, node_id: &str) {
        self.detail_failures.write().await.insert(node_id.to_string());
    }

    /// Server ids passed to `evacuate`, in call order
    pub async fn evacuate_calls(&self) -> Vec<String> {
        self.evacuate_calls.read().await.clone()
    }

    /// Server ids passed to `start_server`, in call order
    pub async fn start_calls(&self) -> Vec<String> {
        self.start_calls.read().await.clone()
    }

    /// Number of `list_migrations` calls made
    pub fn migration_polls(&self) -> u32 {
        self.migration_polls.load(Ordering::SeqCst)
    }

    /// Number of `list_nodes` calls made
    pub fn node_polls(&self) -> u32 {
        self.node_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn ensure_session(&self) -> Result<(), ApiError> {
        if self.fail_session.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized("mock credentials rejected".to_string()));
        }
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, ApiError> {
        self.node_polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list_nodes.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("mock connection refused".to_string()));
        }
        Ok(self.nodes.read().await.clone())
    }

    async fn node_detail(&self, node_id: &str, hostname: &str) -> Result<NodeDetail, ApiError> {
        if self.detail_failures.read().await.contains(node_id) {
            return Err(ApiError::Transport(format!("mock detail failure for {}", hostname)));
        }
        self.details
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("hypervisor {}", hostname)))
    }

    async fn evacuate(&self, server_id: &str) -> Result<(), ApiError> {
        self.evacuate_calls.write().await.push(server_id.to_string());
        if self.evacuate_failures.read().await.contains(server_id) {
            return Err(ApiError::Status {
                status: 409,
                body: format!("cannot evacuate {}", server_id),
            });
        }
        Ok(())
    }

    async fn list_migrations(&self, host: &str) -> Result<Vec<MigrationRecord>, ApiError> {
        self.migration_polls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_migration_polls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_migration_polls.store(failing - 1, Ordering::SeqCst);
            return Err(ApiError::Transport("mock migration listing failed".to_string()));
        }

        let mut migrations = self.migrations.write().await;
        let Some(queue) = migrations.get_mut(host) else {
            return Ok(Vec::new());
        };
        let snapshot = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(snapshot.unwrap_or_default())
    }

    async fn start_server(&self, server_id: &str) -> Result<(), ApiError> {
        self.start_calls.write().await.push(server_id.to_string());

        let mut failures = self.start_failures.write().await;
        if let Some(remaining) = failures.get_mut(server_id) {
            if *remaining != u32::MAX {
                *remaining -= 1;
            }
            if *remaining == 0 {
                failures.remove(server_id);
            }
            return Err(ApiError::Status {
                status: 409,
                body: format!("cannot start {}", server_id),
            });
        }
        Ok(())
    }
}
