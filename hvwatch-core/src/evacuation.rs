//! Evacuation of VMs off a down node
//!
//! Every resident VM gets its own evacuate call. A failure for one VM is
//! logged and recorded but never stops the rest of the batch, and nothing is
//! rolled back.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use tracing::{error, info};

use crate::clock::Clock;
use crate::cluster::{ClusterApi, NodeDetail, ServerRef};

/// Outcome of one evacuate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvacuationResult {
    /// The VM that was targeted
    pub server: ServerRef,
    /// Whether the control plane accepted the request
    pub success: bool,
    /// Error detail or dry-run note
    pub message: Option<String>,
}

impl EvacuationResult {
    pub fn success(server: ServerRef) -> Self {
        Self {
            server,
            success: true,
            message: None,
        }
    }

    pub fn success_with_message(server: ServerRef, message: String) -> Self {
        Self {
            server,
            success: true,
            message: Some(message),
        }
    }

    pub fn failure(server: ServerRef, message: String) -> Self {
        Self {
            server,
            success: false,
            message: Some(message),
        }
    }
}

/// Batch report for one node
#[derive(Debug, Clone)]
pub struct EvacuationReport {
    /// Hypervisor hostname
    pub hostname: String,
    /// Service host the node is registered under
    pub service_host: String,
    /// Captured before the first evacuate call, truncated to whole seconds
    pub started_at: DateTime<Utc>,
    /// One entry per resident VM
    pub results: Vec<EvacuationResult>,
    /// Whether calls were only logged
    pub dry_run: bool,
}

impl EvacuationReport {
    /// Every VM id that was targeted, regardless of outcome
    pub fn targeted(&self) -> BTreeSet<String> {
        self.results.iter().map(|r| r.server.id.clone()).collect()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &EvacuationResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &EvacuationResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Whether at least one evacuate call failed
    pub fn is_partial_failure(&self) -> bool {
        self.results.iter().any(|r| !r.success)
    }
}

/// Precondition violations for [`EvacuationController::evacuate`]
#[derive(Debug, Error)]
pub enum EvacuationError {
    /// Node is not registered with the control plane
    #[error("Node {0} has no service registration")]
    MissingService(String),

    /// Node reported no VM list
    #[error("Node {0} reported no servers")]
    MissingServers(String),
}

/// Issues evacuate calls for the VMs of a down node
pub struct EvacuationController {
    api: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
    dry_run: bool,
}

impl EvacuationController {
    pub fn new(api: Arc<dyn ClusterApi>, clock: Arc<dyn Clock>, dry_run: bool) -> Self {
        Self {
            api,
            clock,
            dry_run,
        }
    }

    /// Evacuate every VM resident on the node.
    ///
    /// The node must carry both a service record and a VM list.
    pub async fn evacuate(&self, detail: &NodeDetail) -> Result<EvacuationReport, EvacuationError> {
        let service = detail
            .service
            .as_ref()
            .ok_or_else(|| EvacuationError::MissingService(detail.hostname.clone()))?;
        let servers = detail
            .servers
            .as_ref()
            .ok_or_else(|| EvacuationError::MissingServers(detail.hostname.clone()))?;

        let started_at = self.clock.now().trunc_subsecs(0);

        error!(node = %detail.hostname, state = %detail.state, "Hypervisor is down");
        error!(
            node = %detail.hostname,
            host = %service.host,
            count = servers.len(),
            "Evacuating VMs from host"
        );

        let mut results = Vec::with_capacity(servers.len());
        for server in servers {
            results.push(self.evacuate_server(server, &detail.hostname).await);
        }

        let report = EvacuationReport {
            hostname: detail.hostname.clone(),
            service_host: service.host.clone(),
            started_at,
            results,
            dry_run: self.dry_run,
        };

        info!(
            node = %report.hostname,
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "Evacuation requests issued"
        );

        Ok(report)
    }

    async fn evacuate_server(&self, server: &ServerRef, hostname: &str) -> EvacuationResult {
        if self.dry_run {
            info!(
                server = %server.id,
                name = %server.name,
                node = hostname,
                "[DRY-RUN] Would evacuate server"
            );
            return EvacuationResult::success_with_message(
                server.clone(),
                "Dry run - evacuate not issued".to_string(),
            );
        }

        info!(server = %server.id, name = %server.name, node = hostname, "Evacuating server");

        match self.api.evacuate(&server.id).await {
            Ok(()) => EvacuationResult::success(server.clone()),
            Err(e) => {
                error!(
                    server = %server.id,
                    node = hostname,
                    error = %e,
                    "Unable to evacuate server"
                );
                EvacuationResult::failure(server.clone(), e.to_string())
            }
        }
    }
}
