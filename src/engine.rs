//! Replication engine
//!
//! Runs one logical replication unit against one scope:
//!
//! 1. authoritative baseline count under the container
//! 2. resolve the requested [`ReplicaCount`] into a total and checkpoint it
//!    as a [`UnitPlan`] before anything is created
//! 3. create the missing copies with the selected strategy
//! 4. reconcile against a fresh authoritative count and top up
//!
//! A deploy first creates the container in the target scope and then runs the
//! same steps from an empty baseline. A unit handed a saved plan (its job was
//! claimed again after a worker died) recounts and fills up to the saved total
//! instead of resolving the count a second time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::{BatchDispatcher, BatchLayout, PlanTarget, SingleDispatcher};
use crate::ledger::{EntityKind, FailureLedger, FailureRecord, FailureStage, FailureSummary};
use crate::platform::{AdPlatform, ErrorClass, ObjectSpec};
use crate::quota::{CredentialAffinity, CredentialPool};
use crate::recovery::{DeficitRecovery, RecoveryConfig};
use crate::retry::BackoffPolicy;
use crate::strategy::{
    AdaptiveStrategy, BatchStrategy, ReplicationStrategy, SequentialStrategy, StrategyKind,
};
use crate::templates::Template;
use crate::types::{ReplicatorError, Result};

/// How many copies a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicaCount {
    /// Create this many new copies on top of what exists
    CopiesToCreate(u32),
    /// End with this many copies in total
    #[serde(rename = "totalDesiredCount")]
    TotalDesired(u32),
}

impl ReplicaCount {
    /// Total copies wanted given `baseline` existing ones
    pub fn total(&self, baseline: u32) -> u32 {
        match *self {
            ReplicaCount::CopiesToCreate(n) => baseline.saturating_add(n),
            ReplicaCount::TotalDesired(n) => n,
        }
    }

    pub fn value(&self) -> u32 {
        match *self {
            ReplicaCount::CopiesToCreate(n) | ReplicaCount::TotalDesired(n) => n,
        }
    }
}

/// Resolved count of a unit, saved before the first copy is dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPlan {
    pub container_id: String,
    /// Complete copies before the first attempt
    pub baseline: u32,
    pub target_total: u32,
}

impl UnitPlan {
    pub fn copies_target(&self) -> u32 {
        self.target_total.saturating_sub(self.baseline)
    }
}

/// Receives live progress of a unit
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    fn set_target(&self, target: u32);
    fn set_progress(&self, progress: u32);
    fn set_operation(&self, operation: String);
    /// A child object was created
    fn add_created(&self, child_ref: &str);

    /// Persist the resolved plan. An error aborts the unit before dispatch.
    async fn checkpoint(&self, _plan: &UnitPlan) -> Result<()> {
        Ok(())
    }
}

/// Sink that drops everything
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn set_target(&self, _target: u32) {}
    fn set_progress(&self, _progress: u32) {}
    fn set_operation(&self, _operation: String) {}
    fn add_created(&self, _child_ref: &str) {}
}

/// Shifts pass-local progress by the copies a resumed unit already had
struct ResumedSink<'a> {
    inner: &'a dyn ProgressSink,
    offset: u32,
}

#[async_trait::async_trait]
impl ProgressSink for ResumedSink<'_> {
    fn set_target(&self, target: u32) {
        self.inner.set_target(target);
    }

    fn set_progress(&self, progress: u32) {
        self.inner.set_progress(progress.saturating_add(self.offset));
    }

    fn set_operation(&self, operation: String) {
        self.inner.set_operation(operation);
    }

    fn add_created(&self, child_ref: &str) {
        self.inner.add_created(child_ref);
    }

    async fn checkpoint(&self, plan: &UnitPlan) -> Result<()> {
        self.inner.checkpoint(plan).await
    }
}

/// Everything one unit of work needs
#[derive(Clone)]
pub struct UnitContext {
    pub job_id: String,
    /// Scope new objects are created in
    pub scope_id: String,
    /// Container the copies hang under
    pub container_id: String,
    pub template: Arc<Template>,
    pub affinity: CredentialAffinity,
    pub pixel_id: Option<String>,
    pub cancel: CancellationToken,
    pub ledger: FailureLedger,
    /// Plan saved by an earlier run of the same job
    pub resume: Option<UnitPlan>,
}

impl UnitContext {
    pub fn plan_target(&self) -> PlanTarget<'_> {
        PlanTarget {
            owner: &self.scope_id,
            container_id: &self.container_id,
            pixel_id: self.pixel_id.as_deref(),
        }
    }

    /// Tag a failure with this unit, send it to the ledger and return its summary
    pub fn record(&self, record: FailureRecord) -> FailureSummary {
        let record = record
            .with_job(self.job_id.clone())
            .with_target(self.scope_id.clone());
        let summary = record.summary();
        self.ledger.record(record);
        summary
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReplicatorError::Cancelled(format!("job {}", self.job_id)));
        }
        Ok(())
    }
}

/// Outcome of one unit
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub scope_id: String,
    pub container_id: String,
    pub strategy: String,
    pub fell_back: bool,
    /// Complete copies before the unit started
    pub baseline: u32,
    pub target_total: u32,
    /// Copies this unit had to create
    pub copies_target: u32,
    /// Complete copies at the final authoritative count
    pub actual: u32,
    pub progress: u32,
    pub deficit: u32,
    /// Complete copies beyond the target
    pub surplus: u32,
    /// The final count could not be taken; `actual` is a local estimate
    pub unverified: bool,
    pub created_refs: Vec<String>,
    pub failures: Vec<FailureSummary>,
    pub batch_calls: u32,
    pub recovery_attempts: u32,
    pub recovered: u32,
    /// Why the unit could not run, when it stopped early
    pub error: Option<String>,
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_ops_per_call: usize,
    pub layout: BatchLayout,
    pub retry: BackoffPolicy,
    pub recovery: RecoveryConfig,
    pub sequential_delay: Duration,
    pub fallback_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_ops_per_call: 50,
            layout: BatchLayout::Interleaved,
            retry: BackoffPolicy::default(),
            recovery: RecoveryConfig::default(),
            sequential_delay: Duration::from_millis(2000),
            fallback_threshold: 0.5,
        }
    }
}

pub struct ReplicationEngine {
    single: SingleDispatcher,
    batch: BatchStrategy,
    sequential: SequentialStrategy,
    adaptive: AdaptiveStrategy,
    recovery: DeficitRecovery,
    config: EngineConfig,
}

impl ReplicationEngine {
    pub fn new(pool: Arc<CredentialPool>, platform: Arc<dyn AdPlatform>, config: EngineConfig) -> Self {
        let single = SingleDispatcher::new(Arc::clone(&pool), Arc::clone(&platform), config.retry);
        let dispatcher = BatchDispatcher::new(pool, platform, config.retry);

        let batch = BatchStrategy::new(dispatcher, config.max_ops_per_call, config.layout);
        let sequential = SequentialStrategy::new(single.clone(), config.sequential_delay);
        let adaptive = AdaptiveStrategy::new(batch.clone(), sequential.clone(), config.fallback_threshold);
        let recovery = DeficitRecovery::new(single.clone(), config.recovery.clone());

        Self {
            single,
            batch,
            sequential,
            adaptive,
            recovery,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn strategy(&self, kind: StrategyKind) -> &dyn ReplicationStrategy {
        match kind {
            StrategyKind::Batch => &self.batch,
            StrategyKind::Sequential => &self.sequential,
            StrategyKind::Adaptive => &self.adaptive,
        }
    }

    /// Replicate within the context's existing container
    pub async fn run_unit(
        &self,
        ctx: &UnitContext,
        count: ReplicaCount,
        kind: StrategyKind,
        sink: &dyn ProgressSink,
    ) -> Result<UnitReport> {
        if let Some(plan) = ctx.resume.as_ref().filter(|p| p.container_id == ctx.container_id) {
            return self.resume(ctx, plan, kind, sink).await;
        }

        sink.set_operation("Counting existing copies".to_string());
        let baseline = self.recovery.authoritative_count(ctx).await?;
        let plan = UnitPlan {
            container_id: ctx.container_id.clone(),
            baseline,
            target_total: count.total(baseline),
        };
        info!(
            job_id = %ctx.job_id,
            scope = %ctx.scope_id,
            baseline = baseline,
            target_total = plan.target_total,
            "Replication unit started"
        );
        sink.checkpoint(&plan).await?;
        self.fill(ctx, &plan, baseline, kind, sink).await
    }

    /// Create the template's container in `ctx.scope_id`, then fill it.
    /// The template's own pair counts as the baseline copy.
    ///
    /// Once the container exists every error is folded into the report, so
    /// the caller always learns the container id.
    pub async fn deploy_unit(
        &self,
        mut ctx: UnitContext,
        count: ReplicaCount,
        kind: StrategyKind,
        sink: &dyn ProgressSink,
    ) -> Result<UnitReport> {
        let (plan, resumed) = match ctx.resume.clone() {
            Some(plan) => {
                info!(job_id = %ctx.job_id, scope = %ctx.scope_id, container = %plan.container_id, "Resuming deploy");
                (plan, true)
            }
            None => {
                ctx.check_cancelled()?;
                sink.set_operation(format!("Creating container in {}", ctx.scope_id));
                let container = ObjectSpec {
                    edge: ctx.template.container.edge.clone(),
                    body: ctx.template.container_body(),
                };
                let container_id = match self
                    .single
                    .create_object(&ctx.scope_id, &container, &ctx.affinity, &ctx.cancel)
                    .await?
                {
                    Ok(id) => id,
                    Err(error) => {
                        warn!(job_id = %ctx.job_id, scope = %ctx.scope_id, error = %error, "Container creation failed");
                        let failure = ctx.record(FailureRecord::from_platform(
                            EntityKind::Container,
                            FailureStage::Deploy,
                            &error,
                        ));
                        let target_total = count.total(1);
                        return Ok(UnitReport {
                            scope_id: ctx.scope_id.clone(),
                            strategy: self.strategy(kind).name().to_string(),
                            target_total,
                            copies_target: target_total,
                            deficit: target_total,
                            failures: vec![failure],
                            error: Some(format!("container creation failed: {}", error)),
                            ..Default::default()
                        });
                    }
                };
                info!(job_id = %ctx.job_id, scope = %ctx.scope_id, container = %container_id, "Container created");
                let plan = UnitPlan {
                    container_id,
                    baseline: 0,
                    target_total: count.total(1),
                };
                (plan, false)
            }
        };
        ctx.container_id = plan.container_id.clone();

        let filled = if resumed {
            self.resume(&ctx, &plan, kind, sink).await
        } else {
            match sink.checkpoint(&plan).await {
                Ok(()) => self.fill(&ctx, &plan, 0, kind, sink).await,
                Err(e) => Err(e),
            }
        };
        match filled {
            Ok(report) => Ok(report),
            Err(e) => Ok(self.unfilled(&ctx, &plan, kind, e)),
        }
    }

    /// Pick up a saved plan: recount, then fill the rest
    async fn resume(
        &self,
        ctx: &UnitContext,
        plan: &UnitPlan,
        kind: StrategyKind,
        sink: &dyn ProgressSink,
    ) -> Result<UnitReport> {
        sink.set_operation("Counting copies made before the restart".to_string());
        let current = self.recovery.authoritative_count(ctx).await?;
        info!(
            job_id = %ctx.job_id,
            scope = %ctx.scope_id,
            baseline = plan.baseline,
            current = current,
            target_total = plan.target_total,
            "Replication unit resumed"
        );
        self.fill(ctx, plan, current, kind, sink).await
    }

    /// Report for a deployed container whose fill stopped with an error
    fn unfilled(&self, ctx: &UnitContext, plan: &UnitPlan, kind: StrategyKind, error: ReplicatorError) -> UnitReport {
        warn!(
            job_id = %ctx.job_id,
            scope = %ctx.scope_id,
            container = %plan.container_id,
            error = %error,
            "Deployed container left unfilled"
        );
        let class = match error {
            ReplicatorError::Quota(_) => ErrorClass::QuotaExceeded,
            _ => ErrorClass::Internal,
        };
        let failure = ctx.record(
            FailureRecord::new(
                EntityKind::Container,
                FailureStage::Deploy,
                class,
                format!("container {} left unfilled: {}", plan.container_id, error),
            )
            .with_parent(plan.container_id.clone()),
        );
        UnitReport {
            scope_id: ctx.scope_id.clone(),
            container_id: plan.container_id.clone(),
            strategy: self.strategy(kind).name().to_string(),
            baseline: plan.baseline,
            target_total: plan.target_total,
            copies_target: plan.copies_target(),
            deficit: plan.copies_target(),
            failures: vec![failure],
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Fill the container from `current` complete copies up to the plan's total
    async fn fill(
        &self,
        ctx: &UnitContext,
        plan: &UnitPlan,
        current: u32,
        kind: StrategyKind,
        sink: &dyn ProgressSink,
    ) -> Result<UnitReport> {
        let copies_target = plan.copies_target();
        let done = current.saturating_sub(plan.baseline).min(copies_target);
        sink.set_target(copies_target);
        sink.set_progress(done);

        let strategy = self.strategy(kind);
        let mut report = UnitReport {
            scope_id: ctx.scope_id.clone(),
            container_id: ctx.container_id.clone(),
            strategy: strategy.name().to_string(),
            baseline: plan.baseline,
            target_total: plan.target_total,
            copies_target,
            ..Default::default()
        };

        let missing = plan.target_total.saturating_sub(current);
        let mut next_copy = current + 1;
        let mut created = 0;
        if missing > 0 {
            let pass_sink = ResumedSink { inner: sink, offset: done };
            let pass = strategy.replicate(ctx, next_copy, missing, &pass_sink).await?;
            next_copy += pass.attempted;
            created = pass.created;
            report.fell_back = pass.fell_back;
            report.batch_calls = pass.calls;
            report.created_refs = pass.created_refs;
            report.failures = pass.failures;
        }

        let reconciled = self
            .recovery
            .reconcile(ctx, plan, next_copy, current + created, sink)
            .await?;

        report.actual = reconciled.actual;
        report.deficit = reconciled.deficit;
        report.surplus = reconciled.surplus;
        report.unverified = reconciled.unverified;
        report.progress = reconciled.actual.saturating_sub(plan.baseline).min(copies_target);
        report.recovery_attempts = reconciled.attempts_used;
        report.recovered = reconciled.recovered;
        report.created_refs.extend(reconciled.created_refs);
        report.failures.extend(reconciled.failures);

        if report.surplus > 0 {
            warn!(
                job_id = %ctx.job_id,
                scope = %ctx.scope_id,
                actual = report.actual,
                target_total = report.target_total,
                "More complete copies than requested"
            );
        }
        info!(
            job_id = %ctx.job_id,
            scope = %ctx.scope_id,
            actual = report.actual,
            deficit = report.deficit,
            unverified = report.unverified,
            failures = report.failures.len(),
            "Replication unit finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_count_resolution() {
        assert_eq!(ReplicaCount::CopiesToCreate(49).total(1), 50);
        assert_eq!(ReplicaCount::TotalDesired(50).total(1), 50);
        assert_eq!(ReplicaCount::TotalDesired(3).total(7), 3);
    }

    #[test]
    fn test_replica_count_is_explicit_on_the_wire() {
        let count: ReplicaCount = serde_json::from_str(r#"{"copiesToCreate": 49}"#).unwrap();
        assert_eq!(count, ReplicaCount::CopiesToCreate(49));
        let count: ReplicaCount = serde_json::from_str(r#"{"totalDesiredCount": 50}"#).unwrap();
        assert_eq!(count, ReplicaCount::TotalDesired(50));
    }

    #[test]
    fn test_unit_plan_survives_a_job_row() {
        let plan = UnitPlan {
            container_id: "c-1".into(),
            baseline: 1,
            target_total: 4,
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["targetTotal"], 4);
        let back: UnitPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.copies_target(), 3);
    }
}
