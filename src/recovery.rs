//! Deficit Recovery Controller
//!
//! Compares the authoritative count of complete copies (parents holding at
//! least one child) with the target and closes the gap one pair at a time.
//! Local counters are never trusted: every iteration starts from a fresh
//! list call against the platform, so an orphaned parent is not counted and
//! a copy that materialized despite a reported failure is not created twice.
//!
//! The loop stops when the deficit is closed, when the attempt budget is
//! spent, or on a permanent validation failure (the same object would be
//! rejected again).
//!
//! Once copies have been dispatched a failed recount no longer aborts the
//! unit: the pass ends with a local estimate, flagged unverified, and the
//! Count failure on the report.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatch::{pause, PairOutcome, SingleDispatcher};
use crate::engine::{ProgressSink, UnitContext, UnitPlan};
use crate::ledger::{EntityKind, FailureRecord, FailureStage, FailureSummary};
use crate::platform::ErrorClass;
use crate::types::{ReplicatorError, Result};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    /// Wait between recovery attempts
    pub inter_request_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            inter_request_delay: Duration::from_millis(2000),
        }
    }
}

/// Final counts of a reconcile pass
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub target_total: u32,
    pub actual: u32,
    pub deficit: u32,
    pub attempts_used: u32,
    pub recovered: u32,
    pub stopped_on_permanent: bool,
    /// Complete copies beyond the target
    pub surplus: u32,
    /// A recount failed; `actual` is estimated from local outcomes
    pub unverified: bool,
    pub created_refs: Vec<String>,
    pub failures: Vec<FailureSummary>,
}

#[derive(Clone)]
pub struct DeficitRecovery {
    single: SingleDispatcher,
    config: RecoveryConfig,
}

impl DeficitRecovery {
    pub fn new(single: SingleDispatcher, config: RecoveryConfig) -> Self {
        Self { single, config }
    }

    /// Complete copies under the context's container, straight from the platform
    pub async fn authoritative_count(&self, ctx: &UnitContext) -> Result<u32> {
        match self.count_or_record(ctx).await? {
            Ok(count) => Ok(count),
            Err(failure) => Err(ReplicatorError::Platform(format!(
                "authoritative count under {} failed: {}",
                ctx.container_id, failure.error
            ))),
        }
    }

    /// Count, or ledger the failed count and hand back its summary
    async fn count_or_record(&self, ctx: &UnitContext) -> Result<std::result::Result<u32, FailureSummary>> {
        match self
            .single
            .count_complete(&ctx.template, &ctx.container_id, &ctx.affinity, &ctx.cancel)
            .await?
        {
            Ok(count) => Ok(Ok(count)),
            Err(error) => Ok(Err(ctx.record(
                FailureRecord::from_platform(EntityKind::Container, FailureStage::Count, &error)
                    .with_parent(ctx.container_id.clone()),
            ))),
        }
    }

    /// Close the gap between the platform's count and the plan's total.
    ///
    /// `estimate` is the complete-copy count implied by local outcomes; it
    /// stands in for the platform's count when a recount fails.
    pub async fn reconcile(
        &self,
        ctx: &UnitContext,
        plan: &UnitPlan,
        next_copy: u32,
        estimate: u32,
        sink: &dyn ProgressSink,
    ) -> Result<ReconcileReport> {
        let target_total = plan.target_total;
        let baseline = plan.baseline;
        let copies_target = plan.copies_target();
        let target = ctx.plan_target();
        let mut report = ReconcileReport {
            target_total,
            ..Default::default()
        };
        let mut copy_number = next_copy;

        sink.set_operation("Verifying created copies".to_string());
        let mut actual = match self.count_or_record(ctx).await? {
            Ok(count) => count,
            Err(failure) => {
                report.failures.push(failure);
                report.unverified = true;
                estimate
            }
        };

        while !report.unverified {
            sink.set_progress(actual.saturating_sub(baseline).min(copies_target));
            let deficit = target_total.saturating_sub(actual);
            if deficit == 0 || report.attempts_used >= self.config.max_attempts {
                break;
            }
            ctx.check_cancelled()?;

            report.attempts_used += 1;
            sink.set_operation(format!(
                "Recovering {} missing copies (attempt {}/{})",
                deficit, report.attempts_used, self.config.max_attempts
            ));

            let outcome = self
                .single
                .create_pair(&ctx.template, &target, copy_number, &ctx.affinity, &ctx.cancel)
                .await?;
            copy_number += 1;

            let mut permanent = false;
            let mut created = false;
            match outcome {
                PairOutcome::Created { child_id, .. } => {
                    created = true;
                    report.recovered += 1;
                    sink.add_created(&child_id);
                    report.created_refs.push(child_id);
                }
                PairOutcome::Orphan {
                    copy_number,
                    parent_id,
                    error,
                } => {
                    permanent = error.class() == ErrorClass::PermanentValidation;
                    let mut record = FailureRecord::from_platform(EntityKind::Child, FailureStage::Recovery, &error)
                        .with_parent(parent_id)
                        .with_copy(copy_number);
                    record.class = ErrorClass::PartialBatch;
                    report.failures.push(ctx.record(record));
                }
                PairOutcome::Failed { copy_number, error } => {
                    permanent = error.class() == ErrorClass::PermanentValidation;
                    report.failures.push(ctx.record(
                        FailureRecord::from_platform(EntityKind::Parent, FailureStage::Recovery, &error)
                            .with_parent(ctx.container_id.clone())
                            .with_copy(copy_number),
                    ));
                }
            }

            if permanent {
                warn!(
                    job_id = %ctx.job_id,
                    deficit = deficit,
                    "Permanent validation failure, stopping recovery"
                );
                report.stopped_on_permanent = true;
            } else {
                pause(self.config.inter_request_delay, &ctx.cancel).await?;
            }

            match self.count_or_record(ctx).await? {
                Ok(count) => actual = count,
                Err(failure) => {
                    report.failures.push(failure);
                    report.unverified = true;
                    actual += u32::from(created);
                }
            }
            if permanent {
                break;
            }
        }

        if report.unverified {
            warn!(
                job_id = %ctx.job_id,
                estimate = actual,
                target_total = target_total,
                "Recount failed, finishing on local outcomes"
            );
        }
        report.actual = actual;
        report.deficit = target_total.saturating_sub(actual);
        report.surplus = actual.saturating_sub(target_total);
        sink.set_progress(actual.saturating_sub(baseline).min(copies_target));

        if report.attempts_used > 0 || report.deficit > 0 {
            info!(
                job_id = %ctx.job_id,
                actual = actual,
                deficit = report.deficit,
                attempts = report.attempts_used,
                recovered = report.recovered,
                unverified = report.unverified,
                "Reconcile finished"
            );
        }
        Ok(report)
    }
}
