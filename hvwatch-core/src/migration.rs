//! Migration Tracking State Machine
//!
//! Follows the migrations started by an evacuation and restarts each VM once
//! its migration has completed:
//! PENDING → POLLING → PENDING (loop) | DONE | EXHAUSTED | STALLED
//!
//! State transitions:
//! - PENDING → POLLING: VMs still pending and retry budget left
//! - POLLING → DONE: pending set emptied
//! - POLLING → STALLED: no ACTIVE migration observed in the poll
//! - POLLING → EXHAUSTED: retry budget consumed
//! - POLLING → PENDING: at least one ACTIVE migration, budget left
//!
//! Migration records created before the evacuation started are ignored, so
//! records of earlier unrelated migrations never match a pending VM.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::cluster::{ClusterApi, MigrationRecord};
use crate::retry::RetryPolicy;

/// Statuses of a migration that is still in flight
pub const ACTIVE_STATUSES: [&str; 4] = ["accepted", "migrating", "pre-migrating", "running"];

/// Statuses of a finished migration
pub const COMPLETED_STATUSES: [&str; 3] = ["completed", "done", "finished"];

/// Classification of a migration record status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Active,
    Completed,
    /// Neither active nor completed (error, failed, cancelled, ...)
    Unrecognized,
}

impl MigrationPhase {
    pub fn classify(status: &str) -> Self {
        if ACTIVE_STATUSES.contains(&status) {
            MigrationPhase::Active
        } else if COMPLETED_STATUSES.contains(&status) {
            MigrationPhase::Completed
        } else {
            MigrationPhase::Unrecognized
        }
    }
}

/// Tracker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// VMs pending, waiting for the next poll
    Pending,
    /// Fetching and evaluating migration records
    Polling,
    /// Every pending VM was restarted
    Done,
    /// Retry budget consumed with VMs still pending
    Exhausted,
    /// No migration in flight with VMs still pending
    Stalled,
}

impl TrackerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackerState::Done | TrackerState::Exhausted | TrackerState::Stalled
        )
    }
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerState::Pending => write!(f, "PENDING"),
            TrackerState::Polling => write!(f, "POLLING"),
            TrackerState::Done => write!(f, "DONE"),
            TrackerState::Exhausted => write!(f, "EXHAUSTED"),
            TrackerState::Stalled => write!(f, "STALLED"),
        }
    }
}

/// What a single poll observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Migration listing failed, nothing was observed
    pub fetch_failed: bool,
    /// Records older than the evacuation start
    pub stale: usize,
    pub active: usize,
    pub completed: usize,
    pub unrecognized: usize,
    /// Pending set size after the poll
    pub pending_after: usize,
}

/// Restart call that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartFailure {
    pub server_id: String,
    pub error: String,
}

/// Result of one tracking run
#[derive(Debug, Clone)]
pub struct TrackingReport {
    /// Service host the migrations were listed for
    pub host: String,
    /// Terminal state
    pub outcome: TrackerState,
    /// One entry per poll, in order
    pub polls: Vec<PollSummary>,
    /// Retry budget consumed
    pub retries: u32,
    /// VMs restarted after their migration completed
    pub restarted: Vec<String>,
    /// Every failed restart call
    pub restart_failures: Vec<RestartFailure>,
    /// VMs never confirmed
    pub pending: BTreeSet<String>,
    /// Pending VMs whose most recent record in the last successful poll
    /// carried an unrecognized status
    pub unrecognized: BTreeMap<String, String>,
}

impl TrackingReport {
    /// Whether every VM was confirmed and restarted
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Mutable state of one tracking run
struct Run {
    pending: BTreeSet<String>,
    restarted: Vec<String>,
    restart_failures: Vec<RestartFailure>,
    unrecognized: BTreeMap<String, String>,
    polls: Vec<PollSummary>,
}

/// Migration tracker
///
/// Polls migration records for a host until every evacuated VM has been
/// restarted, the retry budget runs out, or nothing is in flight anymore.
pub struct MigrationTracker {
    api: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl MigrationTracker {
    pub fn new(api: Arc<dyn ClusterApi>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self { api, clock, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Track migrations for `host` until a terminal state is reached
    pub async fn track(
        &self,
        host: &str,
        started_at: DateTime<Utc>,
        pending: BTreeSet<String>,
    ) -> TrackingReport {
        let mut run = Run {
            pending,
            restarted: Vec::new(),
            restart_failures: Vec::new(),
            unrecognized: BTreeMap::new(),
            polls: Vec::new(),
        };
        let mut budget = self.policy.budget();
        let mut state = TrackerState::Pending;

        info!(
            host = host,
            pending = run.pending.len(),
            since = %started_at,
            "Tracking migrations"
        );

        let outcome = loop {
            if run.pending.is_empty() {
                break TrackerState::Done;
            }
            if budget.is_exhausted() {
                break TrackerState::Exhausted;
            }

            state = self.enter(host, state, TrackerState::Polling);
            let summary = match self.api.list_migrations(host).await {
                Ok(records) => self.evaluate(host, records, started_at, &mut run).await,
                Err(e) => {
                    warn!(host = host, error = %e, "Unable to list migrations");
                    PollSummary {
                        fetch_failed: true,
                        pending_after: run.pending.len(),
                        ..Default::default()
                    }
                }
            };
            debug!(host = host, summary = ?summary, "Migration poll evaluated");
            let fetch_failed = summary.fetch_failed;
            let active = summary.active;
            run.polls.push(summary);

            if run.pending.is_empty() {
                break TrackerState::Done;
            }
            if !fetch_failed && active == 0 {
                break TrackerState::Stalled;
            }

            let attempt = budget.consume();
            if budget.is_exhausted() {
                break TrackerState::Exhausted;
            }

            let delay = self.policy.delay(attempt);
            debug!(
                host = host,
                attempt = attempt,
                max = budget.max(),
                delay = %humantime::format_duration(delay),
                "Migrations still in flight"
            );
            state = self.enter(host, state, TrackerState::Pending);
            self.clock.sleep(delay).await;
        };
        self.enter(host, state, outcome);

        let report = TrackingReport {
            host: host.to_string(),
            outcome,
            polls: run.polls,
            retries: budget.used(),
            restarted: run.restarted,
            restart_failures: run.restart_failures,
            pending: run.pending,
            unrecognized: run.unrecognized,
        };
        self.log_outcome(&report);
        report
    }

    fn enter(&self, host: &str, from: TrackerState, to: TrackerState) -> TrackerState {
        if from != to {
            trace!(host = host, from = %from, to = %to, "Tracker state changed");
        }
        to
    }

    /// Evaluate one migration listing against the pending set
    async fn evaluate(
        &self,
        host: &str,
        records: Vec<MigrationRecord>,
        started_at: DateTime<Utc>,
        run: &mut Run,
    ) -> PollSummary {
        let mut summary = PollSummary::default();
        // Each VM is acted on at most once per poll
        let mut acted: HashSet<String> = HashSet::new();
        // Most recent record per VM; later entries win ties
        let mut latest: HashMap<&str, &MigrationRecord> = HashMap::new();

        for record in &records {
            if record.created_at < started_at {
                trace!(
                    server = %record.instance_id,
                    created_at = %record.created_at,
                    "Ignoring migration created before evacuation"
                );
                summary.stale += 1;
                continue;
            }

            match MigrationPhase::classify(&record.status) {
                MigrationPhase::Active => summary.active += 1,
                MigrationPhase::Completed => {
                    summary.completed += 1;
                    if run.pending.contains(&record.instance_id)
                        && acted.insert(record.instance_id.clone())
                    {
                        self.restart(host, &record.instance_id, run).await;
                    }
                }
                MigrationPhase::Unrecognized => summary.unrecognized += 1,
            }

            let newer = latest
                .get(record.instance_id.as_str())
                .map_or(true, |prev| record.created_at >= prev.created_at);
            if newer {
                latest.insert(record.instance_id.as_str(), record);
            }
        }

        let unrecognized: BTreeMap<String, String> = latest
            .into_values()
            .filter(|record| {
                run.pending.contains(&record.instance_id)
                    && MigrationPhase::classify(&record.status) == MigrationPhase::Unrecognized
            })
            .map(|record| (record.instance_id.clone(), record.status.clone()))
            .collect();
        run.unrecognized = unrecognized;

        summary.pending_after = run.pending.len();
        summary
    }

    async fn restart(&self, host: &str, server_id: &str, run: &mut Run) {
        match self.api.start_server(server_id).await {
            Ok(()) => {
                info!(server = server_id, host = host, "Migration completed, server started");
                run.pending.remove(server_id);
                run.restarted.push(server_id.to_string());
            }
            Err(e) => {
                error!(server = server_id, host = host, error = %e, "Unable to start server");
                run.restart_failures.push(RestartFailure {
                    server_id: server_id.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn log_outcome(&self, report: &TrackingReport) {
        if report.is_complete() {
            info!(
                host = %report.host,
                restarted = report.restarted.len(),
                polls = report.polls.len(),
                "All evacuated servers migrated"
            );
            return;
        }

        for (server, status) in &report.unrecognized {
            warn!(
                server = %server,
                host = %report.host,
                status = %status,
                "Migration in unrecognized status"
            );
        }

        let stuck: Vec<&str> = report.pending.iter().map(String::as_str).collect();
        error!(
            host = %report.host,
            outcome = %report.outcome,
            servers = %stuck.join(", "),
            "Failed migrating instances"
        );
    }
}
