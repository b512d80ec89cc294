//! Cluster API trait and common types
//!
//! Defines the abstraction over the control plane the watcher drives.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Health state reported for a compute node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Node reported exactly `up`
    Up,
    /// Any other reported value (down, maintenance, unknown, ...)
    Down {
        /// Raw state string as reported by the control plane
        reported: String,
    },
}

impl NodeState {
    /// Classify a reported state string.
    ///
    /// Only the exact string `up` counts as healthy.
    pub fn from_reported(state: &str) -> Self {
        if state == "up" {
            NodeState::Up
        } else {
            NodeState::Down {
                reported: state.to_string(),
            }
        }
    }

    /// Whether the node should be treated as down
    pub fn is_down(&self) -> bool {
        !matches!(self, NodeState::Up)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Up => write!(f, "up"),
            NodeState::Down { reported } => write!(f, "{}", reported),
        }
    }
}

/// A compute node (hypervisor) as listed by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNode {
    /// Control plane identifier (integer or UUID, kept as text)
    pub id: String,
    /// Hypervisor hostname
    pub hostname: String,
    /// Reported health state
    pub state: NodeState,
}

impl ComputeNode {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, state: &str) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            state: NodeState::from_reported(state),
        }
    }
}

impl fmt::Display for ComputeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.id)
    }
}

/// Reference to a VM resident on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerRef {
    /// Stable unique VM identifier
    pub id: String,
    /// Display name
    pub name: String,
}

impl ServerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Compute service registration of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service host name; migrations are listed by this name
    pub host: String,
}

/// A compute node enriched with its resident VMs and service registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetail {
    pub id: String,
    pub hostname: String,
    pub state: NodeState,
    /// Resident VMs. `None` means the node reports no VMs at all.
    pub servers: Option<Vec<ServerRef>>,
    /// Service registration. `None` means the node is not registered
    /// with the control plane.
    pub service: Option<ServiceRecord>,
}

/// Migration record produced by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// VM the migration belongs to
    pub instance_id: String,
    /// Raw status string
    pub status: String,
    /// Creation time of the record
    pub created_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(instance_id: impl Into<String>, status: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            status: status.into(),
            created_at,
        }
    }
}

/// Errors returned by a single cluster API call
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials were rejected or no session could be established
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unexpected HTTP status
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection, timeout or other transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Whether the error means "resource does not exist"
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Whether the error is an authentication failure
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

/// Cluster API trait
///
/// The small set of control plane operations the watcher needs.
/// Implementations should be thread-safe and async-compatible.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Make sure an authenticated session is available.
    ///
    /// Called once at the start of every reconciliation cycle. A failure
    /// skips the cycle.
    async fn ensure_session(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// List all compute nodes
    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, ApiError>;

    /// Fetch resident VMs and service registration for one node
    async fn node_detail(&self, node_id: &str, hostname: &str) -> Result<NodeDetail, ApiError>;

    /// Ask the control plane to evacuate a VM off its current host
    async fn evacuate(&self, server_id: &str) -> Result<(), ApiError>;

    /// List migration records for a service host
    async fn list_migrations(&self, host: &str) -> Result<Vec<MigrationRecord>, ApiError>;

    /// Power on a VM
    async fn start_server(&self, server_id: &str) -> Result<(), ApiError>;
}
