//! Reconciliation Loop
//!
//! Drives health polling, evacuation and migration tracking on a fixed
//! interval. Every failure is absorbed where it happens; the loop only stops
//! on shutdown.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::cluster::{ClusterApi, ComputeNode, ServerRef};
use crate::evacuation::{EvacuationController, EvacuationError, EvacuationReport};
use crate::health::HealthMonitor;
use crate::metrics::MetricsRegistry;
use crate::migration::{MigrationTracker, TrackingReport};
use crate::retry::RetryPolicy;

/// Reconciliation settings, fixed for the lifetime of the process
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Delay between cycles
    pub poll_interval: Duration,
    /// Wait between evacuation and the first tracking poll
    pub settle_delay: Duration,
    /// Tracking poll schedule and budget
    pub tracking: RetryPolicy,
    /// Down nodes processed at once (1 = strictly sequential)
    pub max_concurrent_nodes: usize,
    /// Log evacuations instead of issuing them
    pub dry_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(5),
            tracking: RetryPolicy::default(),
            max_concurrent_nodes: 1,
            dry_run: false,
        }
    }
}

/// Why a down node was not evacuated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Detail lookup failed or found nothing
    DetailUnavailable,
    /// Node has no service registration
    NotRegistered,
    /// Node reported no VM list
    NoServers,
}

impl SkipReason {
    /// Metric label
    pub fn as_label(&self) -> &'static str {
        match self {
            SkipReason::DetailUnavailable => "detail_unavailable",
            SkipReason::NotRegistered => "not_registered",
            SkipReason::NoServers => "no_servers",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// What happened to one down node
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Not evacuated this cycle
    Skipped {
        reason: SkipReason,
        /// VMs known to be resident, if the detail was available
        servers: Vec<ServerRef>,
    },
    /// Evacuation issued; tracking is absent in dry-run mode
    Evacuated {
        evacuation: EvacuationReport,
        tracking: Option<TrackingReport>,
    },
}

/// Report for one down node
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: ComputeNode,
    pub outcome: NodeOutcome,
}

/// Report for one reconciliation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// No session could be established; nothing was polled
    pub session_failed: bool,
    /// One entry per down node, in listing order
    pub nodes: Vec<NodeReport>,
}

impl CycleReport {
    /// Nodes that were evacuated
    pub fn evacuated(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Evacuated { .. }))
    }

    /// Nodes that were skipped
    pub fn skipped(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Skipped { .. }))
    }

    /// VMs whose migration was never confirmed, across all nodes
    pub fn stuck_servers(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.outcome {
                NodeOutcome::Evacuated {
                    tracking: Some(tracking),
                    ..
                } => Some(tracking.pending.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Reconciliation loop
pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
    health: HealthMonitor,
    evacuation: EvacuationController,
    tracker: MigrationTracker,
    metrics: Arc<MetricsRegistry>,
    config: ReconcileConfig,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        api: Arc<dyn ClusterApi>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            health: HealthMonitor::new(api.clone()),
            evacuation: EvacuationController::new(api.clone(), clock.clone(), config.dry_run),
            tracker: MigrationTracker::new(api.clone(), clock.clone(), config.tracking),
            api,
            clock,
            metrics,
            config,
        }
    }

    /// Run cycles until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval = %humantime::format_duration(self.config.poll_interval),
            settle_delay = %humantime::format_duration(self.config.settle_delay),
            max_retries = self.config.tracking.max_attempts,
            dry_run = self.config.dry_run,
            "Starting reconciliation loop"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // A started cycle always runs to completion; shutdown is only
            // observed between cycles
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping reconciliation loop");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Run a single reconciliation cycle
    pub async fn run_once(&self) -> CycleReport {
        let start = Instant::now();
        debug!("Checking hypervisor status");

        if let Err(e) = self.api.ensure_session().await {
            error!(error = %e, "Unable to establish cluster API session, skipping cycle");
            self.metrics.inc_session_failure();
            return CycleReport {
                session_failed: true,
                nodes: Vec::new(),
            };
        }

        let down = self.health.poll().await;
        self.metrics.set_nodes_down(down.len() as i64);

        let limit = self.config.max_concurrent_nodes.max(1);
        let nodes: Vec<NodeReport> = futures::stream::iter(down)
            .map(|node| self.reconcile_node(node))
            .buffered(limit)
            .collect()
            .await;

        let report = CycleReport {
            session_failed: false,
            nodes,
        };

        let duration = start.elapsed();
        self.metrics.observe_cycle_duration(duration.as_secs_f64());

        if report.nodes.is_empty() {
            debug!(duration = ?duration, "Reconciliation cycle complete, all nodes up");
        } else {
            info!(
                down = report.nodes.len(),
                evacuated = report.evacuated().count(),
                skipped = report.skipped().count(),
                stuck = report.stuck_servers().len(),
                duration = ?duration,
                "Reconciliation cycle complete"
            );
        }

        report
    }

    /// Evacuate one down node and track its migrations
    async fn reconcile_node(&self, node: ComputeNode) -> NodeReport {
        let Some(detail) = self.health.detail(&node.id, &node.hostname).await else {
            return self.skip(node, SkipReason::DetailUnavailable, Vec::new());
        };

        let evacuation = match self.evacuation.evacuate(&detail).await {
            Ok(report) => report,
            Err(EvacuationError::MissingService(_)) => {
                warn!(node = %node.hostname, "Node is not registered with the control plane");
                let servers = detail.servers.unwrap_or_default();
                return self.skip(node, SkipReason::NotRegistered, servers);
            }
            Err(EvacuationError::MissingServers(_)) => {
                info!(node = %node.hostname, "Node is not running any servers");
                return self.skip(node, SkipReason::NoServers, Vec::new());
            }
        };

        if evacuation.dry_run {
            info!(node = %node.hostname, "[DRY-RUN] Skipping migration tracking");
            return NodeReport {
                node,
                outcome: NodeOutcome::Evacuated {
                    evacuation,
                    tracking: None,
                },
            };
        }

        for result in &evacuation.results {
            self.metrics.inc_evacuation(result.success);
        }

        let pending = evacuation.targeted();
        if !pending.is_empty() {
            // Give the control plane time to start the migrations
            self.clock.sleep(self.config.settle_delay).await;
        }

        let tracking = self
            .tracker
            .track(&evacuation.service_host, evacuation.started_at, pending)
            .await;

        for _ in &tracking.restarted {
            self.metrics.inc_restart(true);
        }
        for _ in &tracking.restart_failures {
            self.metrics.inc_restart(false);
        }
        self.metrics.inc_tracking_outcome(tracking.outcome);
        self.metrics.inc_stuck_servers(tracking.pending.len() as u64);

        NodeReport {
            node,
            outcome: NodeOutcome::Evacuated {
                evacuation,
                tracking: Some(tracking),
            },
        }
    }

    fn skip(&self, node: ComputeNode, reason: SkipReason, servers: Vec<ServerRef>) -> NodeReport {
        self.metrics.inc_node_skipped(reason.as_label());
        NodeReport {
            node,
            outcome: NodeOutcome::Skipped { reason, servers },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::{MigrationRecord, MockCluster};
    use crate::migration::TrackerState;
    use std::sync::atomic::Ordering;

    fn reconciler(mock: Arc<MockCluster>, clock: Arc<ManualClock>, config: ReconcileConfig) -> Reconciler {
        Reconciler::new(mock, clock, Arc::new(MetricsRegistry::new()), config)
    }

    fn servers(ids: &[&str]) -> Vec<ServerRef> {
        ids.iter().map(|id| ServerRef::new(*id, format!("vm-{}", id))).collect()
    }

    #[tokio::test]
    async fn test_up_node_not_touched() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "up"), Some(servers(&["v1"])), Some("hv1"))
            .await;
        let clock = Arc::new(ManualClock::default());

        let report = reconciler(mock.clone(), clock.clone(), ReconcileConfig::default())
            .run_once()
            .await;

        assert!(report.nodes.is_empty());
        assert!(mock.evacuate_calls().await.is_empty());
        assert_eq!(mock.migration_polls(), 0);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_partial_evacuation_then_stalled_tracking() {
        let mock = Arc::new(MockCluster::new());
        let clock = Arc::new(ManualClock::default());
        mock.add_node(
            ComputeNode::new("1", "hv1", "down"),
            Some(servers(&["v1", "v2"])),
            Some("hv1"),
        )
        .await;
        mock.fail_evacuate("v2").await;

        // Records appear after the settle delay
        let after = clock.now() + chrono::Duration::seconds(6);
        mock.push_migrations("hv1", vec![MigrationRecord::new("v1", "migrating", after)])
            .await;
        mock.push_migrations("hv1", vec![MigrationRecord::new("v1", "completed", after)])
            .await;

        let report = reconciler(mock.clone(), clock.clone(), ReconcileConfig::default())
            .run_once()
            .await;

        assert_eq!(report.nodes.len(), 1);
        let NodeOutcome::Evacuated {
            evacuation,
            tracking: Some(tracking),
        } = &report.nodes[0].outcome
        else {
            panic!("expected evacuation with tracking");
        };

        assert_eq!(mock.evacuate_calls().await, vec!["v1", "v2"]);
        let failed: Vec<_> = evacuation.failed().map(|r| r.server.id.as_str()).collect();
        assert_eq!(failed, vec!["v2"]);

        assert_eq!(tracking.outcome, TrackerState::Stalled);
        assert_eq!(tracking.retries, 1);
        assert_eq!(tracking.restarted, vec!["v1"]);
        assert_eq!(mock.start_calls().await, vec!["v1"]);
        assert_eq!(
            report.stuck_servers().into_iter().collect::<Vec<_>>(),
            vec!["v2"]
        );

        // Settle delay, then one poll interval
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[tokio::test]
    async fn test_missing_detail_skipped_and_retried_next_cycle() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node_without_detail(ComputeNode::new("1", "hv1", "down"))
            .await;
        let clock = Arc::new(ManualClock::default());
        let reconciler = reconciler(mock.clone(), clock, ReconcileConfig::default());

        for _ in 0..2 {
            let report = reconciler.run_once().await;
            assert_eq!(report.skipped().count(), 1);
            assert!(matches!(
                report.nodes[0].outcome,
                NodeOutcome::Skipped {
                    reason: SkipReason::DetailUnavailable,
                    ..
                }
            ));
        }
        assert_eq!(mock.node_polls(), 2);
        assert!(mock.evacuate_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_skip_reasons() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "down"), Some(servers(&["v1"])), None)
            .await;
        mock.add_node(ComputeNode::new("2", "hv2", "down"), None, Some("hv2"))
            .await;
        let clock = Arc::new(ManualClock::default());

        let report = reconciler(mock.clone(), clock, ReconcileConfig::default())
            .run_once()
            .await;

        let reasons: Vec<_> = report
            .nodes
            .iter()
            .map(|n| match &n.outcome {
                NodeOutcome::Skipped { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![Some(SkipReason::NotRegistered), Some(SkipReason::NoServers)]
        );
        assert!(mock.evacuate_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_every_vm_accounted_for_once() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(
            ComputeNode::new("1", "hv1", "down"),
            Some(servers(&["a1", "a2", "a3"])),
            Some("hv1"),
        )
        .await;
        mock.add_node(ComputeNode::new("2", "hv2", "down"), Some(servers(&["b1"])), None)
            .await;
        mock.add_node(ComputeNode::new("3", "hv3", "up"), Some(servers(&["c1"])), Some("hv3"))
            .await;
        mock.fail_evacuate("a2").await;
        let clock = Arc::new(ManualClock::default());

        let report = reconciler(mock.clone(), clock, ReconcileConfig::default())
            .run_once()
            .await;

        let mut seen: Vec<String> = Vec::new();
        for node in &report.nodes {
            match &node.outcome {
                NodeOutcome::Skipped { servers, .. } => {
                    seen.extend(servers.iter().map(|s| s.id.clone()))
                }
                NodeOutcome::Evacuated { evacuation, .. } => {
                    seen.extend(evacuation.succeeded().map(|r| r.server.id.clone()));
                    seen.extend(evacuation.failed().map(|r| r.server.id.clone()));
                }
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["a1", "a2", "a3", "b1"]);
    }

    #[tokio::test]
    async fn test_session_failure_skips_cycle() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "down"), Some(servers(&["v1"])), Some("hv1"))
            .await;
        mock.fail_session.store(true, Ordering::SeqCst);
        let clock = Arc::new(ManualClock::default());
        let reconciler = reconciler(mock.clone(), clock, ReconcileConfig::default());

        let report = reconciler.run_once().await;
        assert!(report.session_failed);
        assert_eq!(mock.node_polls(), 0);

        // Next cycle recovers
        mock.fail_session.store(false, Ordering::SeqCst);
        let report = reconciler.run_once().await;
        assert!(!report.session_failed);
        assert_eq!(report.evacuated().count(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_tracking() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "down"), Some(servers(&["v1"])), Some("hv1"))
            .await;
        let clock = Arc::new(ManualClock::default());
        let config = ReconcileConfig {
            dry_run: true,
            ..Default::default()
        };

        let report = reconciler(mock.clone(), clock.clone(), config).run_once().await;

        assert!(matches!(
            report.nodes[0].outcome,
            NodeOutcome::Evacuated { tracking: None, .. }
        ));
        assert!(mock.evacuate_calls().await.is_empty());
        assert_eq!(mock.migration_polls(), 0);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_empty_server_list_needs_no_settle_delay() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "down"), Some(Vec::new()), Some("hv1"))
            .await;
        let clock = Arc::new(ManualClock::default());

        let report = reconciler(mock.clone(), clock.clone(), ReconcileConfig::default())
            .run_once()
            .await;

        let NodeOutcome::Evacuated {
            tracking: Some(tracking),
            ..
        } = &report.nodes[0].outcome
        else {
            panic!("expected evacuation with tracking");
        };
        assert_eq!(tracking.outcome, TrackerState::Done);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_concurrency_preserves_order() {
        let mock = Arc::new(MockCluster::new());
        for i in 0..4 {
            let host = format!("hv{}", i);
            let vm = format!("v{}", i);
            mock.add_node(
                ComputeNode::new(i.to_string(), host.as_str(), "down"),
                Some(servers(&[vm.as_str()])),
                Some(host.as_str()),
            )
            .await;
        }
        let clock = Arc::new(ManualClock::default());
        let config = ReconcileConfig {
            max_concurrent_nodes: 3,
            ..Default::default()
        };

        let report = reconciler(mock.clone(), clock, config).run_once().await;

        let hosts: Vec<_> = report.nodes.iter().map(|n| n.node.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["hv0", "hv1", "hv2", "hv3"]);
        assert_eq!(mock.evacuate_calls().await.len(), 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mock = Arc::new(MockCluster::new());
        let clock = Arc::new(ManualClock::default());
        let reconciler = reconciler(mock.clone(), clock, ReconcileConfig::default());
        let (tx, rx) = watch::channel(false);

        let stop = async {
            while mock.node_polls() == 0 {
                tokio::task::yield_now().await;
            }
            tx.send(true).unwrap();
        };

        let (result, _) = tokio::join!(reconciler.run(rx), stop);
        tokio_test::assert_ok!(result);
        assert_eq!(mock.node_polls(), 1);
    }

    #[tokio::test]
    async fn test_node_going_down_between_cycles_is_evacuated() {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "up"), Some(servers(&["v1"])), Some("hv1"))
            .await;
        let clock = Arc::new(ManualClock::default());
        let reconciler = reconciler(mock.clone(), clock, ReconcileConfig::default());

        let report = reconciler.run_once().await;
        assert!(report.nodes.is_empty());
        assert!(mock.evacuate_calls().await.is_empty());

        mock.set_node_state("1", "down").await;
        let report = reconciler.run_once().await;
        assert_eq!(report.evacuated().count(), 1);
        assert_eq!(mock.evacuate_calls().await, vec!["v1"]);
    }

    /// Publishes queued shutdown values the next time the cycle sleeps
    struct SignallingClock {
        inner: ManualClock,
        shutdown: Arc<watch::Sender<bool>>,
        queued: std::sync::Mutex<Vec<bool>>,
    }

    impl SignallingClock {
        fn new(shutdown: Arc<watch::Sender<bool>>, value: bool) -> Self {
            Self {
                inner: ManualClock::default(),
                shutdown,
                queued: std::sync::Mutex::new(vec![value]),
            }
        }
    }

    #[async_trait::async_trait]
    impl Clock for SignallingClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            self.inner.now()
        }

        async fn sleep(&self, duration: Duration) {
            let queued: Vec<bool> = self.queued.lock().unwrap().drain(..).collect();
            for value in queued {
                self.shutdown.send(value).unwrap();
            }
            tokio::task::yield_now().await;
            self.inner.sleep(duration).await;
        }
    }

    async fn down_node_with_completed_migration(clock: &SignallingClock) -> Arc<MockCluster> {
        let mock = Arc::new(MockCluster::new());
        mock.add_node(ComputeNode::new("1", "hv1", "down"), Some(servers(&["v1"])), Some("hv1"))
            .await;
        let after = clock.now() + chrono::Duration::seconds(6);
        mock.push_migrations("hv1", vec![MigrationRecord::new("v1", "completed", after)])
            .await;
        mock
    }

    #[tokio::test]
    async fn test_shutdown_during_settle_delay_finishes_cycle() {
        let (tx, rx) = watch::channel(false);
        let clock = Arc::new(SignallingClock::new(Arc::new(tx), true));
        let mock = down_node_with_completed_migration(&clock).await;
        let reconciler = Reconciler::new(
            mock.clone(),
            clock.clone(),
            Arc::new(MetricsRegistry::new()),
            ReconcileConfig::default(),
        );

        tokio_test::assert_ok!(reconciler.run(rx).await);

        // Evacuated VMs are still tracked and restarted before stopping
        assert_eq!(mock.evacuate_calls().await, vec!["v1"]);
        assert_eq!(mock.migration_polls(), 1);
        assert_eq!(mock.start_calls().await, vec!["v1"]);
        assert_eq!(mock.node_polls(), 1);
    }

    #[tokio::test]
    async fn test_non_shutdown_change_does_not_restart_cycle() {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let clock = Arc::new(SignallingClock::new(tx.clone(), false));
        let mock = down_node_with_completed_migration(&clock).await;
        let reconciler = Reconciler::new(
            mock.clone(),
            clock.clone(),
            Arc::new(MetricsRegistry::new()),
            ReconcileConfig::default(),
        );

        let stop = async {
            while mock.start_calls().await.is_empty() {
                tokio::task::yield_now().await;
            }
            tx.send(true).unwrap();
        };

        let (result, _) = tokio::join!(reconciler.run(rx), stop);
        tokio_test::assert_ok!(result);

        // Each VM evacuated exactly once
        assert_eq!(mock.evacuate_calls().await, vec!["v1"]);
        assert_eq!(mock.start_calls().await, vec!["v1"]);
        assert_eq!(mock.node_polls(), 1);
    }
}
