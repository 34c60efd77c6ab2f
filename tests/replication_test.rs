//! Replication engine integration tests
//!
//! Drives whole units against the simulated platform:
//! - batch packing and the authoritative baseline
//! - orphan detection by recount, never by local counters
//! - convergence after transient failures
//! - recovery stopping on permanent validation failures
//! - adaptive fallback and cancellation
//! - replies that cannot be read, counts that stop answering, usage overflow

mod common;

use std::time::Duration;

use common::{fast_config, throttled, validation_error, Harness, OWNER, TEMPLATE_SCOPE};
use replicator::engine::{NoopSink, ProgressSink, ReplicaCount};
use replicator::ledger::{EntityKind, FailureQuery, FailureStage};
use replicator::platform::{ErrorClass, FailureRule};
use replicator::quota::Credential;
use replicator::retry::BackoffPolicy;
use replicator::strategy::StrategyKind;
use replicator::types::ReplicatorError;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Batch path
// =============================================================================

#[tokio::test]
async fn test_forty_nine_copies_in_two_batch_calls() {
    let harness = Harness::new(5000).await;
    let ctx = harness.unit("job-49");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(49), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    assert_eq!(report.baseline, 1);
    assert_eq!(report.target_total, 50);
    assert_eq!(report.copies_target, 49);
    assert_eq!(report.batch_calls, 2);
    assert_eq!(harness.platform.batch_calls(), 2);
    assert_eq!(report.actual, 50);
    assert_eq!(report.deficit, 0);
    assert_eq!(report.progress, 49);
    assert_eq!(report.created_refs.len(), 49);
    assert!(report.failures.is_empty());
    assert_eq!(harness.pairs_in_template_scope(), 50);
}

#[tokio::test]
async fn test_total_desired_counts_existing_copies() {
    let harness = Harness::new(5000).await;
    let ctx = harness.unit("job-total");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::TotalDesired(5), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    assert_eq!(report.copies_target, 4);
    assert_eq!(report.actual, 5);
    assert_eq!(harness.pairs_in_template_scope(), 5);
}

// =============================================================================
// Orphans and recovery
// =============================================================================

#[tokio::test]
async fn test_orphan_is_found_by_recount_and_recovered_once() {
    let harness = Harness::new(5000).await;
    harness
        .platform
        .add_rule(FailureRule::new("ads", validation_error()).times(1));
    let ctx = harness.unit("job-orphan");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(4), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    // one child rejected inside the batch leaves a parent without a child
    assert_eq!(report.recovery_attempts, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.actual, 5);
    assert_eq!(report.deficit, 0);
    assert_eq!(harness.platform.objects_in(TEMPLATE_SCOPE, "adsets"), 6);
    assert_eq!(harness.pairs_in_template_scope(), 5);

    harness.ledger.flush().await;
    let orphans = harness
        .ledger
        .query(&FailureQuery {
            job_id: Some("job-orphan".into()),
            class: Some(ErrorClass::PartialBatch),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert!(orphans[0].parent_ref.is_some());
    assert_eq!(orphans[0].target.as_deref(), Some(TEMPLATE_SCOPE));
}

#[tokio::test]
async fn test_transient_failures_converge_through_recovery() {
    let harness = Harness::with_config(5000, fast_config(BackoffPolicy::no_retry())).await;
    harness
        .platform
        .add_rule(FailureRule::new("adsets", throttled()).times(3));
    let ctx = harness.unit("job-transient");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(3), StrategyKind::Sequential, &NoopSink)
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 3);
    assert!(report
        .failures
        .iter()
        .all(|f| f.class == ErrorClass::Transient && f.stage == FailureStage::Sequential));
    assert_eq!(report.recovered, 3);
    assert_eq!(report.actual, 4);
    assert_eq!(report.deficit, 0);
    assert_eq!(report.progress, 3);
}

#[tokio::test]
async fn test_permanent_failure_stops_recovery() {
    let harness = Harness::new(5000).await;
    harness
        .platform
        .add_rule(FailureRule::new("adsets", validation_error()));
    let ctx = harness.unit("job-permanent");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(2), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    assert_eq!(report.recovery_attempts, 1);
    assert_eq!(report.recovered, 0);
    assert_eq!(report.actual, 1);
    assert_eq!(report.deficit, 2);
    assert_eq!(report.progress, 0);
    // two batch failures plus the single recovery attempt
    assert_eq!(report.failures.len(), 3);
}

#[tokio::test]
async fn test_copy_materialized_despite_error_is_not_duplicated() {
    let harness = Harness::new(5000).await;
    harness.platform.add_rule(
        FailureRule::new("ads", validation_error())
            .times(1)
            .materialize(),
    );
    let ctx = harness.unit("job-phantom");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(2), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    assert_eq!(report.recovery_attempts, 0);
    assert_eq!(report.actual, 3);
    assert_eq!(report.deficit, 0);
    assert_eq!(harness.pairs_in_template_scope(), 3);
}

// =============================================================================
// Adaptive strategy
// =============================================================================

#[tokio::test]
async fn test_adaptive_falls_back_after_retryable_batch_failures() {
    let harness = Harness::with_config(5000, fast_config(BackoffPolicy::no_retry())).await;
    harness.platform.fail_next_batches(vec![throttled()]);
    let ctx = harness.unit("job-adaptive");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(3), StrategyKind::Adaptive, &NoopSink)
        .await
        .unwrap();

    assert!(report.fell_back);
    assert_eq!(harness.platform.batch_calls(), 1);
    assert_eq!(report.actual, 4);
    assert_eq!(report.deficit, 0);
}

#[tokio::test]
async fn test_adaptive_keeps_batching_on_permanent_failures() {
    let harness = Harness::new(5000).await;
    harness
        .platform
        .add_rule(FailureRule::new("adsets", validation_error()));
    let ctx = harness.unit("job-adaptive-permanent");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(3), StrategyKind::Adaptive, &NoopSink)
        .await
        .unwrap();

    assert!(!report.fell_back);
    assert_eq!(report.actual, 1);
}

#[tokio::test]
async fn test_unreadable_batch_reply_is_not_resent() {
    let (harness, scripted) = Harness::scripted(5000, fast_config(BackoffPolicy::no_retry())).await;
    scripted.truncate_batches();
    let ctx = harness.unit("job-short-reply");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(3), StrategyKind::Adaptive, &NoopSink)
        .await
        .unwrap();

    // the batch ran even though its reply was short
    assert!(!report.fell_back);
    assert_eq!(harness.platform.batch_calls(), 1);
    assert_eq!(report.actual, 4);
    assert_eq!(report.surplus, 0);
    assert_eq!(report.deficit, 0);
    assert_eq!(harness.pairs_in_template_scope(), 4);
}

#[tokio::test]
async fn test_fallback_counts_before_going_sequential() {
    let harness = Harness::with_config(5000, fast_config(BackoffPolicy::no_retry())).await;
    // children exist although their entries report throttling
    harness.platform.add_rule(
        FailureRule::new("ads", throttled())
            .times(3)
            .materialize(),
    );
    let ctx = harness.unit("job-fallback-count");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(4), StrategyKind::Adaptive, &NoopSink)
        .await
        .unwrap();

    assert!(report.fell_back);
    assert_eq!(harness.platform.create_calls(), 0);
    assert_eq!(report.actual, 5);
    assert_eq!(report.surplus, 0);
    assert_eq!(harness.pairs_in_template_scope(), 5);
}

// =============================================================================
// Counts that stop answering
// =============================================================================

#[tokio::test]
async fn test_failed_recount_finishes_on_local_outcomes() {
    let (harness, scripted) = Harness::scripted(5000, fast_config(BackoffPolicy::no_retry())).await;
    scripted.fail_lists_after(1);
    let ctx = harness.unit("job-recount-lost");

    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(2), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    assert!(report.unverified);
    assert!(report.error.is_none());
    assert_eq!(report.actual, 3);
    assert_eq!(report.progress, 2);
    assert_eq!(report.recovery_attempts, 0);
    assert_eq!(
        report
            .failures
            .iter()
            .filter(|f| f.stage == FailureStage::Count)
            .count(),
        1
    );
    assert_eq!(harness.pairs_in_template_scope(), 3);
}

// =============================================================================
// Quota and cancellation
// =============================================================================

#[tokio::test]
async fn test_usage_overflow_is_ledgered() {
    let (harness, scripted) = Harness::scripted(5, fast_config(BackoffPolicy::no_retry())).await;
    harness
        .pool
        .register_credential(Credential::new("su-2", "token-2", OWNER, 4))
        .await
        .unwrap();
    scripted.pad_batches();
    let ctx = harness.unit("job-overflow");

    // su-1 takes the baseline count and the batch, which answers one entry more
    let report = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(2), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();
    assert_eq!(report.actual, 3);
    assert!(report.failures.iter().any(|f| f.entity == EntityKind::Quota));

    harness.ledger.flush().await;
    let records = harness
        .ledger
        .query(&FailureQuery {
            job_id: Some("job-overflow".into()),
            class: Some(ErrorClass::Internal),
            ..Default::default()
        })
        .await
        .unwrap();
    let overflow: Vec<_> = records.iter().filter(|r| r.entity == EntityKind::Quota).collect();
    assert_eq!(overflow.len(), 1);
    assert!(overflow[0].error.contains("usage overflow of 1 calls"));
}

#[tokio::test]
async fn test_quota_charges_every_call() {
    let harness = Harness::new(5000).await;
    let ctx = harness.unit("job-quota");

    harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(2), StrategyKind::Batch, &NoopSink)
        .await
        .unwrap();

    // baseline count, one batch of four operations, final count
    let consumed: u32 = harness.pool.snapshot().await.iter().map(|c| c.consumed).sum();
    assert_eq!(consumed, 6);
}

#[tokio::test]
async fn test_cancelled_unit_stops_before_dispatch() {
    let harness = Harness::new(5000).await;
    let ctx = harness.unit("job-cancel");
    ctx.cancel.cancel();

    let result = harness
        .engine
        .run_unit(&ctx, ReplicaCount::CopiesToCreate(10), StrategyKind::Batch, &NoopSink)
        .await;

    assert!(matches!(result, Err(ReplicatorError::Cancelled(_))));
    assert_eq!(harness.platform.batch_calls(), 0);
}

#[tokio::test]
async fn test_deferred_admission_waits_for_cancellation() {
    // room for the baseline count only
    let harness = Harness::new(1).await;
    let ctx = harness.unit("job-starved");
    let cancel = ctx.cancel.clone();

    let engine = harness.engine.clone();
    let task = tokio::spawn(async move {
        engine
            .run_unit(&ctx, ReplicaCount::CopiesToCreate(1), StrategyKind::Sequential, &NoopSink)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(ReplicatorError::Cancelled(_))));
    assert_eq!(harness.platform.create_calls(), 0);
}

/// Cancels the unit as soon as its fill starts
struct CancelOnTarget(CancellationToken);

impl ProgressSink for CancelOnTarget {
    fn set_target(&self, _target: u32) {
        self.0.cancel();
    }
    fn set_progress(&self, _progress: u32) {}
    fn set_operation(&self, _operation: String) {}
    fn add_created(&self, _child_ref: &str) {}
}

#[tokio::test]
async fn test_cancelled_deploy_still_reports_its_container() {
    let harness = Harness::new(5000).await;
    harness.register_scope("act_2").await;
    let mut ctx = harness.unit("job-deploy-cancel");
    ctx.scope_id = "act_2".into();
    let sink = CancelOnTarget(ctx.cancel.clone());

    let report = harness
        .engine
        .deploy_unit(ctx, ReplicaCount::CopiesToCreate(2), StrategyKind::Batch, &sink)
        .await
        .unwrap();

    assert_eq!(harness.platform.objects_in("act_2", "campaigns"), 1);
    assert!(!report.container_id.is_empty());
    assert!(report.error.is_some());
    assert_eq!(report.progress, 0);
    assert_eq!(harness.platform.batch_calls(), 0);

    harness.ledger.flush().await;
    let records = harness
        .ledger
        .query(&FailureQuery {
            job_id: Some("job-deploy-cancel".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(records.iter().any(|r| r.entity == EntityKind::Container
        && r.parent_ref.as_deref() == Some(report.container_id.as_str())));
}
