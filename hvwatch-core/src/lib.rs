//! HVWatch Core Library
//!
//! Failure detection and evacuation logic for compute hypervisors.
//! This crate provides the cluster API abstraction, evacuation, migration
//! tracking and the reconciliation loop that ties them together.

pub mod clock;
pub mod cluster;
pub mod evacuation;
pub mod health;
pub mod metrics;
pub mod migration;
pub mod reconciler;
pub mod retry;

// Re-export common types
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{
    ApiError, ClusterApi, ComputeNode, MigrationRecord, MockCluster, NodeDetail, NodeState,
    ServerRef, ServiceRecord,
};
pub use evacuation::{EvacuationController, EvacuationReport, EvacuationResult};
pub use health::HealthMonitor;
pub use migration::{MigrationTracker, TrackerState, TrackingReport};
pub use reconciler::{CycleReport, NodeOutcome, ReconcileConfig, Reconciler, SkipReason};
pub use retry::{Backoff, RetryPolicy};
