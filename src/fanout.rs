//! Fan-out Coordinator
//!
//! Deploys one template into N scopes. Every target runs its own
//! create-container, dispatch, reconcile cycle with the credentials its scope
//! is bound to, and every target's outcome is captured on its own: a target
//! that fails (unknown scope, exhausted quota, rejected container, even a
//! panic inside its task) never aborts or rolls back another.
//!
//! Parallel mode runs up to `concurrency` targets at once; sequential mode
//! finishes one target before starting the next. Both produce a
//! [`FanoutReport`] with results in target order.
//!
//! A deploy picked up again after its worker died carries the target rows of
//! the earlier run: finished targets are kept as they are, and a target with
//! a saved plan continues in the container it already created.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{
    ProgressSink, ReplicaCount, ReplicationEngine, UnitContext, UnitPlan, UnitReport,
};
use crate::ledger::{EntityKind, FailureLedger, FailureRecord, FailureStage, FailureSummary};
use crate::platform::ErrorClass;
use crate::quota::CredentialPool;
use crate::strategy::StrategyKind;
use crate::templates::Template;
use crate::types::ReplicatorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    Ready,
    Running,
    Success,
    Partial,
    Failed,
}

impl TargetStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TargetStatus::Success | TargetStatus::Partial | TargetStatus::Failed)
    }
}

/// Outcome for one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub target: String,
    pub status: TargetStatus,
    /// Per-target job row
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub target_count: u32,
    pub progress: u32,
    pub deficit: u32,
    #[serde(default)]
    pub surplus: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureSummary>,
    #[serde(default)]
    pub error: Option<String>,
    /// Saved once the target's container exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<UnitPlan>,
}

impl TargetResult {
    pub fn ready(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn failed(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: TargetStatus::Failed,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_failure(mut self, failure: FailureSummary) -> Self {
        self.failures.push(failure);
        self
    }

    fn from_report(target: &str, report: &UnitReport) -> Self {
        let status = if report.deficit == 0 && !report.unverified {
            TargetStatus::Success
        } else if report.progress > 0 {
            TargetStatus::Partial
        } else {
            TargetStatus::Failed
        };
        Self {
            target: target.to_string(),
            status,
            job_id: None,
            container_id: (!report.container_id.is_empty()).then(|| report.container_id.clone()),
            target_count: report.copies_target,
            progress: report.progress,
            deficit: report.deficit,
            surplus: report.surplus,
            failures: report.failures.clone(),
            error: report.error.clone().or_else(|| {
                if report.deficit > 0 {
                    Some(format!("{} copies missing", report.deficit))
                } else if report.unverified {
                    Some("final count unavailable".to_string())
                } else {
                    None
                }
            }),
            plan: None,
        }
    }
}

/// Aggregate of a fan-out
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutReport {
    pub total_targets: usize,
    pub successful: usize,
    /// Targets not fully successful, partial ones included
    pub failed: usize,
    pub partial: usize,
    pub per_target_results: Vec<TargetResult>,
}

impl FanoutReport {
    pub fn from_results(per_target_results: Vec<TargetResult>) -> Self {
        let successful = per_target_results
            .iter()
            .filter(|r| r.status == TargetStatus::Success)
            .count();
        let partial = per_target_results
            .iter()
            .filter(|r| r.status == TargetStatus::Partial)
            .count();
        Self {
            total_targets: per_target_results.len(),
            successful,
            failed: per_target_results.len() - successful,
            partial,
            per_target_results,
        }
    }
}

/// Receives per-target progress
pub trait TargetObserver: Send + Sync {
    /// Progress sink for target `index`
    fn target_sink(&self, index: usize) -> Arc<dyn ProgressSink>;

    fn target_finished(&self, index: usize, result: &TargetResult);
}

/// One deploy request
#[derive(Clone)]
pub struct DeployPlan {
    pub job_id: String,
    pub template: Arc<Template>,
    pub targets: Vec<String>,
    pub mode: FanoutMode,
    pub count: ReplicaCount,
    pub strategy: StrategyKind,
    pub pixel_id: Option<String>,
    /// Target rows left by an earlier run of the same job
    pub previous: Vec<TargetResult>,
}

#[derive(Clone)]
pub struct FanoutCoordinator {
    engine: Arc<ReplicationEngine>,
    pool: Arc<CredentialPool>,
    ledger: FailureLedger,
    concurrency: usize,
}

impl FanoutCoordinator {
    pub fn new(
        engine: Arc<ReplicationEngine>,
        pool: Arc<CredentialPool>,
        ledger: FailureLedger,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            pool,
            ledger,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn deploy(
        &self,
        plan: DeployPlan,
        cancel: &CancellationToken,
        observer: Arc<dyn TargetObserver>,
    ) -> FanoutReport {
        info!(
            job_id = %plan.job_id,
            targets = plan.targets.len(),
            mode = ?plan.mode,
            "Fan-out started"
        );
        let plan = Arc::new(plan);

        let results = match plan.mode {
            FanoutMode::Sequential => {
                let mut results = Vec::with_capacity(plan.targets.len());
                for index in 0..plan.targets.len() {
                    results.push(self.run_target(&plan, index, cancel, &observer).await);
                }
                results
            }
            FanoutMode::Parallel => {
                let mut indexed: Vec<(usize, TargetResult)> = stream::iter(0..plan.targets.len())
                    .map(|index| {
                        let this = self.clone();
                        let plan = Arc::clone(&plan);
                        let cancel = cancel.clone();
                        let observer = Arc::clone(&observer);
                        async move {
                            let scope = plan.targets[index].clone();
                            let task_observer = Arc::clone(&observer);
                            let handle = tokio::spawn(async move {
                                this.run_target(&plan, index, &cancel, &task_observer).await
                            });
                            match handle.await {
                                Ok(result) => (index, result),
                                Err(join_error) => {
                                    error!(target_scope = %scope, error = %join_error, "Target task aborted");
                                    let result = TargetResult::failed(
                                        scope,
                                        format!("target task aborted: {}", join_error),
                                    );
                                    observer.target_finished(index, &result);
                                    (index, result)
                                }
                            }
                        }
                    })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;
                indexed.sort_by_key(|(index, _)| *index);
                indexed.into_iter().map(|(_, result)| result).collect()
            }
        };

        let report = FanoutReport::from_results(results);
        info!(
            job_id = %plan.job_id,
            total = report.total_targets,
            successful = report.successful,
            failed = report.failed,
            partial = report.partial,
            "Fan-out finished"
        );
        report
    }

    async fn run_target(
        &self,
        plan: &DeployPlan,
        index: usize,
        cancel: &CancellationToken,
        observer: &Arc<dyn TargetObserver>,
    ) -> TargetResult {
        let scope = plan.targets[index].as_str();
        let sink = observer.target_sink(index);
        let previous = plan.previous.get(index).filter(|p| p.target == scope);

        let result = if let Some(done) = previous.filter(|p| p.status.is_finished()) {
            debug!(job_id = %plan.job_id, target_scope = %scope, "Target finished in an earlier run");
            done.clone()
        } else if cancel.is_cancelled() {
            TargetResult::failed(scope, "cancelled before start")
        } else {
            match self.pool.affinity_for_scope(scope).await {
                None => {
                    let message = format!("scope {} is not registered", scope);
                    warn!(job_id = %plan.job_id, target_scope = %scope, "Unknown deploy target");
                    let failure = self.record_target_failure(plan, scope, ErrorClass::PermanentValidation, &message);
                    TargetResult::failed(scope, message).with_failure(failure)
                }
                Some(affinity) => {
                    let ctx = UnitContext {
                        job_id: plan.job_id.clone(),
                        scope_id: scope.to_string(),
                        container_id: String::new(),
                        template: Arc::clone(&plan.template),
                        affinity,
                        pixel_id: plan.pixel_id.clone(),
                        cancel: cancel.child_token(),
                        ledger: self.ledger.clone(),
                        resume: previous.and_then(|p| p.plan.clone()),
                    };
                    match self
                        .engine
                        .deploy_unit(ctx, plan.count, plan.strategy, sink.as_ref())
                        .await
                    {
                        Ok(report) => TargetResult::from_report(scope, &report),
                        Err(e) => {
                            warn!(job_id = %plan.job_id, target_scope = %scope, error = %e, "Deploy target failed");
                            let result = TargetResult::failed(scope, e.to_string());
                            match target_failure_class(&e) {
                                Some(class) => result.with_failure(self.record_target_failure(
                                    plan,
                                    scope,
                                    class,
                                    &e.to_string(),
                                )),
                                None => result,
                            }
                        }
                    }
                }
            }
        };

        observer.target_finished(index, &result);
        result
    }

    fn record_target_failure(
        &self,
        plan: &DeployPlan,
        scope: &str,
        class: ErrorClass,
        message: &str,
    ) -> FailureSummary {
        let record = FailureRecord::new(EntityKind::Target, FailureStage::Deploy, class, message)
            .with_job(plan.job_id.clone())
            .with_target(scope);
        let summary = record.summary();
        self.ledger.record(record);
        summary
    }
}

/// Class to record for a target-level error; `None` when the failure was
/// already recorded closer to its source or is not a failure
fn target_failure_class(error: &ReplicatorError) -> Option<ErrorClass> {
    match error {
        ReplicatorError::Platform(_) | ReplicatorError::Cancelled(_) => None,
        ReplicatorError::Quota(_) => Some(ErrorClass::QuotaExceeded),
        ReplicatorError::BadRequest(_) | ReplicatorError::NotFound(_) => {
            Some(ErrorClass::PermanentValidation)
        }
        _ => Some(ErrorClass::Internal),
    }
}
