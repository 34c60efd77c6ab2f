//! Job Tracker
//!
//! Accepts replication requests, hands back a job id at once, and answers
//! status polls. While a job runs on this process its progress lives in a
//! [`LiveJob`]; everything else is read from the [`JobStore`].

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::store::JobStore;
use super::worker;
use super::{JobKind, JobLookup, JobRecord, JobSnapshot, ReplicationRequest, StartedJob};
use crate::engine::{ProgressSink, ReplicationEngine, UnitPlan};
use crate::fanout::{FanoutCoordinator, FanoutMode, TargetObserver, TargetResult, TargetStatus};
use crate::ledger::FailureLedger;
use crate::quota::CredentialPool;
use crate::selection::SelectionState;
use crate::strategy::StrategyKind;
use crate::templates::TemplateSource;
use crate::types::{ReplicatorError, Result};

/// Rough wall-clock cost of one platform call, for estimates
const SECONDS_PER_CALL: u64 = 2;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Lease owner identity of this process
    pub worker_id: String,
    pub worker_count: usize,
    pub fanout_concurrency: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    /// How long a finished job stays in the live map
    pub retention: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            worker_count: 2,
            fanout_concurrency: 3,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            retention: Duration::from_secs(300),
        }
    }
}

/// Shared services the tracker runs jobs with
pub struct TrackerParts {
    pub store: Arc<dyn JobStore>,
    pub engine: Arc<ReplicationEngine>,
    pub pool: Arc<CredentialPool>,
    pub templates: Arc<dyn TemplateSource>,
    pub selection: Arc<SelectionState>,
    pub ledger: FailureLedger,
}

pub struct JobTracker {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) engine: Arc<ReplicationEngine>,
    pub(super) fanout: FanoutCoordinator,
    pub(super) pool: Arc<CredentialPool>,
    pub(super) templates: Arc<dyn TemplateSource>,
    pub(super) selection: Arc<SelectionState>,
    pub(super) ledger: FailureLedger,
    pub(super) live: DashMap<String, Arc<LiveJob>>,
    pub(super) wake: Notify,
    pub(super) config: TrackerConfig,
}

impl JobTracker {
    pub fn new(parts: TrackerParts, config: TrackerConfig) -> Self {
        let fanout = FanoutCoordinator::new(
            Arc::clone(&parts.engine),
            Arc::clone(&parts.pool),
            parts.ledger.clone(),
            config.fanout_concurrency,
        );
        Self {
            store: parts.store,
            engine: parts.engine,
            fanout,
            pool: parts.pool,
            templates: parts.templates,
            selection: parts.selection,
            ledger: parts.ledger,
            live: DashMap::new(),
            wake: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Accept a request. Returns as soon as the job row is written.
    pub async fn start(&self, request: ReplicationRequest) -> Result<StartedJob> {
        request.validate()?;
        // unknown templates never become jobs
        self.templates.load(&request.template_ref).await?;

        let estimated_seconds = self.estimate_seconds(&request);
        let job = JobRecord::new(request, estimated_seconds);
        self.store.insert(&job).await?;
        self.wake.notify_one();

        info!(
            job_id = %job.job_id,
            kind = ?job.kind,
            template = %job.request.template_ref,
            estimated_seconds = estimated_seconds,
            "Replication job accepted"
        );
        Ok(StartedJob {
            job_id: job.job_id,
            status: job.status,
            estimated_seconds,
        })
    }

    pub async fn status(&self, job_id: &str) -> Result<JobLookup> {
        let now = Utc::now();
        let live = self.live.get(job_id).map(|entry| Arc::clone(entry.value()));
        if let Some(live) = live {
            return Ok(JobLookup::Found(Box::new(live.read(|job| job.snapshot(now)))));
        }

        Ok(match self.store.get(job_id).await? {
            Some(job) => JobLookup::Found(Box::new(job.snapshot(now))),
            None => JobLookup::NotFound {
                job_id: job_id.to_string(),
            },
        })
    }

    /// Ask a job to stop. Work already done stays recorded on the job.
    pub async fn cancel(&self, job_id: &str) -> Result<JobLookup> {
        let Some(status) = self.store.request_cancel(job_id).await? else {
            return Ok(JobLookup::NotFound {
                job_id: job_id.to_string(),
            });
        };

        if !status.is_terminal() {
            info!(job_id = %job_id, status = %status, "Cancellation requested");
            let live = self.live.get(job_id).map(|entry| Arc::clone(entry.value()));
            if let Some(live) = live {
                live.cancel.cancel();
            }
        }
        self.status(job_id).await
    }

    pub async fn list(&self, active_only: bool, limit: usize) -> Result<Vec<JobSnapshot>> {
        let now = Utc::now();
        let jobs = self.store.list(active_only, limit).await?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                match self.live.get(&job.job_id) {
                    Some(live) => live.read(|job| job.snapshot(now)),
                    None => job.snapshot(now),
                }
            })
            .collect())
    }

    pub async fn list_active(&self, limit: usize) -> Result<Vec<JobSnapshot>> {
        self.list(true, limit).await
    }

    /// Claim and run one job. Returns whether a job was found.
    pub async fn run_next(self: &Arc<Self>) -> Result<bool> {
        match self
            .store
            .claim(&self.config.worker_id, self.config.lease, Utc::now())
            .await?
        {
            Some(job) => {
                worker::execute(self, job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start `worker_count` workers that run until `shutdown` fires
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            worker_id = %self.config.worker_id,
            workers = self.config.worker_count,
            "Starting job workers"
        );
        (0..self.config.worker_count)
            .map(|index| {
                let tracker = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker::worker_loop(tracker, index, shutdown).await })
            })
            .collect()
    }

    fn estimate_seconds(&self, request: &ReplicationRequest) -> u64 {
        let config = self.engine.config();
        let copies = request.replica_count().value() as u64;
        let pairs_per_call = (config.max_ops_per_call / 2).max(1) as u64;
        let delay = config.sequential_delay.as_secs().max(1);

        // two counts around every unit
        let mut per_unit = 2 * SECONDS_PER_CALL;
        per_unit += match request.strategy {
            StrategyKind::Sequential => copies * (2 * SECONDS_PER_CALL + delay),
            StrategyKind::Batch | StrategyKind::Adaptive => {
                copies.div_ceil(pairs_per_call) * SECONDS_PER_CALL
            }
        };

        match request.kind() {
            JobKind::Duplicate | JobKind::Multiply => per_unit,
            JobKind::Deploy => {
                let targets = request.targets.len() as u64;
                let waves = match request.mode {
                    FanoutMode::Sequential => targets,
                    FanoutMode::Parallel => {
                        targets.div_ceil(self.config.fanout_concurrency.max(1) as u64)
                    }
                };
                waves * (per_unit + SECONDS_PER_CALL)
            }
        }
    }
}

// ===== Live progress =====

/// Where a live job writes its checkpoints
pub(crate) struct LeaseHandle {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) worker_id: String,
    pub(crate) lease: ChronoDuration,
}

/// In-memory state of a job running on this process
pub(crate) struct LiveJob {
    record: RwLock<JobRecord>,
    pub(crate) cancel: CancellationToken,
    lease_lost: AtomicBool,
    lease: Option<LeaseHandle>,
}

impl LiveJob {
    pub(crate) fn new(record: JobRecord, cancel: CancellationToken) -> Self {
        Self {
            record: RwLock::new(record),
            cancel,
            lease_lost: AtomicBool::new(false),
            lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: LeaseHandle) -> Self {
        self.lease = Some(lease);
        self
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&JobRecord) -> R) -> R {
        let guard = self.record.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut JobRecord) -> R) -> R {
        let mut guard = self.record.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub(crate) fn record(&self) -> JobRecord {
        self.read(JobRecord::clone)
    }

    pub(crate) fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
    }

    pub(crate) fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Extend the lease and write live progress through to the store.
    ///
    /// A lost lease cancels the job and comes back as `Cancelled`.
    pub(crate) async fn persist(&self) -> Result<()> {
        let Some(ref lease) = self.lease else {
            return Ok(());
        };
        let job = self.record();
        let state = lease
            .store
            .heartbeat(&job, &lease.worker_id, Utc::now() + lease.lease)
            .await?;

        if !state.held {
            warn!(job_id = %job.job_id, "Lease taken over by another worker");
            self.mark_lease_lost();
            self.cancel.cancel();
            return Err(ReplicatorError::Cancelled(format!("job {} lost its lease", job.job_id)));
        }
        if state.cancel_requested && !self.cancel.is_cancelled() {
            info!(job_id = %job.job_id, "Cancellation picked up from store");
            self.cancel.cancel();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProgressSink for LiveJob {
    fn set_target(&self, target: u32) {
        self.update(|job| {
            job.target_count = target;
            job.progress = job.progress.min(target);
        });
    }

    fn set_progress(&self, progress: u32) {
        self.update(|job| job.progress = progress.min(job.target_count));
    }

    fn set_operation(&self, operation: String) {
        self.update(|job| job.current_operation = operation);
    }

    fn add_created(&self, child_ref: &str) {
        self.update(|job| job.created_refs.push(child_ref.to_string()));
    }

    async fn checkpoint(&self, plan: &UnitPlan) -> Result<()> {
        self.update(|job| job.plan = Some(plan.clone()));
        self.persist().await
    }
}

/// Sum per-target numbers into the deploy job's totals
fn aggregate_targets(job: &mut JobRecord) {
    job.target_count = job.targets.iter().map(|t| t.target_count).sum();
    job.progress = job.targets.iter().map(|t| t.progress).sum();
    job.deficit = job.targets.iter().map(|t| t.deficit).sum();
    job.surplus = job.targets.iter().map(|t| t.surplus).sum();
}

/// Progress of one deploy target, folded into the deploy job
struct TargetSink {
    live: Arc<LiveJob>,
    index: usize,
}

impl TargetSink {
    fn with_target(&self, f: impl FnOnce(&mut TargetResult)) {
        self.live.update(|job| {
            if let Some(target) = job.targets.get_mut(self.index) {
                f(target);
            }
            aggregate_targets(job);
        });
    }
}

#[async_trait::async_trait]
impl ProgressSink for TargetSink {
    fn set_target(&self, target: u32) {
        self.with_target(|t| {
            t.status = TargetStatus::Running;
            t.target_count = target;
            t.progress = t.progress.min(target);
        });
    }

    fn set_progress(&self, progress: u32) {
        self.with_target(|t| t.progress = progress.min(t.target_count));
    }

    fn set_operation(&self, operation: String) {
        self.live.update(|job| {
            let scope = job
                .targets
                .get(self.index)
                .map(|t| t.target.clone())
                .unwrap_or_default();
            job.current_operation = format!("[{}] {}", scope, operation);
        });
    }

    fn add_created(&self, child_ref: &str) {
        self.live.update(|job| job.created_refs.push(child_ref.to_string()));
    }

    async fn checkpoint(&self, plan: &UnitPlan) -> Result<()> {
        self.with_target(|t| t.plan = Some(plan.clone()));
        self.live.persist().await
    }
}

pub(crate) struct DeployObserver {
    pub(crate) live: Arc<LiveJob>,
}

impl TargetObserver for DeployObserver {
    fn target_sink(&self, index: usize) -> Arc<dyn ProgressSink> {
        Arc::new(TargetSink {
            live: Arc::clone(&self.live),
            index,
        })
    }

    fn target_finished(&self, index: usize, result: &TargetResult) {
        self.live.update(|job| {
            job.failures.extend(result.failures.iter().cloned());
            if let Some(target) = job.targets.get_mut(index) {
                *target = TargetResult {
                    failures: Vec::new(),
                    ..result.clone()
                };
            }
            aggregate_targets(job);
        });
    }
}
