//! Replication strategies
//!
//! A strategy creates `count` parent/child copies and reports per-copy
//! outcomes. It does not verify results; the engine reconciles afterwards.
//!
//! - [`BatchStrategy`]: packed batch calls
//! - [`SequentialStrategy`]: one pair at a time with a delay between pairs
//! - [`AdaptiveStrategy`]: batch, falling back to sequential for the rest
//!   once the success rate drops below a threshold because of retryable
//!   failures. The rest is taken from a fresh count, since a failed entry
//!   may still have materialized.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatch::{pause, plan, BatchDispatcher, BatchGroup, BatchLayout, PairOutcome, SingleDispatcher};
use crate::engine::{ProgressSink, UnitContext};
use crate::ledger::{EntityKind, FailureRecord, FailureStage, FailureSummary};
use crate::platform::ErrorClass;
use crate::types::Result;

/// Strategy requested for a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Batch,
    Sequential,
    #[default]
    Adaptive,
}

/// What one strategy pass did
#[derive(Debug, Clone, Default)]
pub struct StrategyReport {
    /// Copies attempted (copy numbers consumed)
    pub attempted: u32,
    pub created: u32,
    pub created_refs: Vec<String>,
    pub failures: Vec<FailureSummary>,
    /// Failures a later attempt could plausibly fix
    pub retryable_failures: u32,
    /// Network calls made
    pub calls: u32,
    pub fell_back: bool,
}

impl StrategyReport {
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 1.0;
        }
        self.created as f64 / self.attempted as f64
    }

    /// Fold one copy's outcome into the report
    fn absorb(&mut self, ctx: &UnitContext, outcome: PairOutcome, stage: FailureStage, sink: &dyn ProgressSink) {
        self.attempted += 1;
        match outcome {
            PairOutcome::Created { child_id, .. } => {
                self.created += 1;
                sink.add_created(&child_id);
                self.created_refs.push(child_id);
            }
            PairOutcome::Orphan {
                copy_number,
                parent_id,
                error,
            } => {
                if error.class().is_retryable() {
                    self.retryable_failures += 1;
                }
                let mut record = FailureRecord::from_platform(EntityKind::Child, stage, &error)
                    .with_parent(parent_id)
                    .with_copy(copy_number);
                record.class = ErrorClass::PartialBatch;
                self.failures.push(ctx.record(record));
            }
            PairOutcome::Failed { copy_number, error } => {
                if error.class().is_retryable() {
                    self.retryable_failures += 1;
                }
                let record = FailureRecord::from_platform(EntityKind::Parent, stage, &error)
                    .with_parent(ctx.container_id.clone())
                    .with_copy(copy_number);
                self.failures.push(ctx.record(record));
            }
        }
    }
}

/// A way of creating copies
#[async_trait::async_trait]
pub trait ReplicationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create `count` copies numbered from `first_copy`
    async fn replicate(
        &self,
        ctx: &UnitContext,
        first_copy: u32,
        count: u32,
        sink: &dyn ProgressSink,
    ) -> Result<StrategyReport>;
}

// ===== Batch =====

#[derive(Clone)]
pub struct BatchStrategy {
    dispatcher: BatchDispatcher,
    max_ops_per_call: usize,
    layout: BatchLayout,
}

impl BatchStrategy {
    pub fn new(dispatcher: BatchDispatcher, max_ops_per_call: usize, layout: BatchLayout) -> Self {
        Self {
            dispatcher,
            max_ops_per_call,
            layout,
        }
    }

    fn plan(&self, ctx: &UnitContext, first_copy: u32, count: u32) -> Result<Vec<BatchGroup>> {
        plan(
            &ctx.template,
            &ctx.plan_target(),
            first_copy,
            count,
            self.max_ops_per_call,
            self.layout,
        )
    }

    async fn run_group(
        &self,
        ctx: &UnitContext,
        group: &BatchGroup,
        total_groups: usize,
        report: &mut StrategyReport,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        sink.set_operation(format!(
            "Dispatching batch {}/{} ({} copies)",
            group.sequence + 1,
            total_groups,
            group.pair_count()
        ));

        let outcome = self.dispatcher.dispatch(group, &ctx.affinity, &ctx.cancel).await?;
        report.calls += outcome.attempts;
        if let Some(ref overflow) = outcome.usage_error {
            report.failures.push(ctx.record(FailureRecord::new(
                EntityKind::Quota,
                FailureStage::Batch,
                ErrorClass::Internal,
                overflow.clone(),
            )));
        }
        let created = outcome.created();
        for pair in outcome.pairs {
            report.absorb(ctx, pair, FailureStage::Batch, sink);
        }
        sink.set_progress(report.created);

        debug!(
            job_id = %ctx.job_id,
            group = group.sequence,
            pairs = group.pair_count(),
            created = created,
            attempts = outcome.attempts,
            "Batch group done"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicationStrategy for BatchStrategy {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn replicate(
        &self,
        ctx: &UnitContext,
        first_copy: u32,
        count: u32,
        sink: &dyn ProgressSink,
    ) -> Result<StrategyReport> {
        let groups = self.plan(ctx, first_copy, count)?;
        let mut report = StrategyReport::default();
        for group in &groups {
            self.run_group(ctx, group, groups.len(), &mut report, sink).await?;
        }
        Ok(report)
    }
}

// ===== Sequential =====

#[derive(Clone)]
pub struct SequentialStrategy {
    single: SingleDispatcher,
    delay: Duration,
}

impl SequentialStrategy {
    pub fn new(single: SingleDispatcher, delay: Duration) -> Self {
        Self { single, delay }
    }

    async fn run_into(
        &self,
        ctx: &UnitContext,
        first_copy: u32,
        count: u32,
        report: &mut StrategyReport,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let target = ctx.plan_target();
        for offset in 0..count {
            ctx.check_cancelled()?;
            let copy_number = first_copy + offset;
            sink.set_operation(format!("Creating copy {} ({}/{})", copy_number, offset + 1, count));

            let outcome = self
                .single
                .create_pair(&ctx.template, &target, copy_number, &ctx.affinity, &ctx.cancel)
                .await?;
            report.calls += 2;
            report.absorb(ctx, outcome, FailureStage::Sequential, sink);
            sink.set_progress(report.created);

            if offset + 1 < count {
                pause(self.delay, &ctx.cancel).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicationStrategy for SequentialStrategy {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn replicate(
        &self,
        ctx: &UnitContext,
        first_copy: u32,
        count: u32,
        sink: &dyn ProgressSink,
    ) -> Result<StrategyReport> {
        let mut report = StrategyReport::default();
        self.run_into(ctx, first_copy, count, &mut report, sink).await?;
        Ok(report)
    }
}

// ===== Adaptive =====

#[derive(Clone)]
pub struct AdaptiveStrategy {
    batch: BatchStrategy,
    sequential: SequentialStrategy,
    threshold: f64,
}

impl AdaptiveStrategy {
    pub fn new(batch: BatchStrategy, sequential: SequentialStrategy, threshold: f64) -> Self {
        Self {
            batch,
            sequential,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    fn should_fall_back(&self, report: &StrategyReport) -> bool {
        report.success_rate() < self.threshold && report.retryable_failures > 0
    }
}

#[async_trait::async_trait]
impl ReplicationStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    async fn replicate(
        &self,
        ctx: &UnitContext,
        first_copy: u32,
        count: u32,
        sink: &dyn ProgressSink,
    ) -> Result<StrategyReport> {
        let groups = self.batch.plan(ctx, first_copy, count)?;
        let mut report = StrategyReport::default();

        for group in &groups {
            self.batch
                .run_group(ctx, group, groups.len(), &mut report, sink)
                .await?;
            if self.should_fall_back(&report) {
                report.fell_back = true;
                break;
            }
        }

        if report.fell_back {
            let wanted = (first_copy - 1).saturating_add(count);
            let counted = self
                .sequential
                .single
                .count_complete(&ctx.template, &ctx.container_id, &ctx.affinity, &ctx.cancel)
                .await?;
            match counted {
                Ok(actual) => {
                    let remaining = wanted.saturating_sub(actual);
                    warn!(
                        job_id = %ctx.job_id,
                        success_rate = report.success_rate(),
                        actual = actual,
                        remaining = remaining,
                        "Batch success rate below threshold, continuing sequentially"
                    );
                    let next_copy = first_copy + report.attempted;
                    self.sequential
                        .run_into(ctx, next_copy, remaining, &mut report, sink)
                        .await?;
                }
                // left to reconcile, which counts again
                Err(error) => {
                    warn!(job_id = %ctx.job_id, error = %error, "Count before fallback failed");
                    report.failures.push(ctx.record(
                        FailureRecord::from_platform(EntityKind::Container, FailureStage::Count, &error)
                            .with_parent(ctx.container_id.clone()),
                    ));
                }
            }
        }

        info!(
            job_id = %ctx.job_id,
            created = report.created,
            attempted = report.attempted,
            fell_back = report.fell_back,
            "Adaptive pass done"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut report = StrategyReport::default();
        assert_eq!(report.success_rate(), 1.0);
        report.attempted = 4;
        report.created = 1;
        assert_eq!(report.success_rate(), 0.25);
    }

    #[test]
    fn test_default_strategy_is_adaptive() {
        let kind: StrategyKind = serde_json::from_str("\"sequential\"").unwrap();
        assert_eq!(kind, StrategyKind::Sequential);
        assert_eq!(StrategyKind::default(), StrategyKind::Adaptive);
    }
}
