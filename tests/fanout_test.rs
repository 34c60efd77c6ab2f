//! Fan-out integration tests
//!
//! One template deployed into several scopes, with failures isolated per
//! target and results reported in target order.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{fast_config, validation_error, Harness};
use replicator::engine::{EngineConfig, NoopSink, ProgressSink, ReplicaCount};
use replicator::fanout::{
    DeployPlan, FanoutCoordinator, FanoutMode, TargetObserver, TargetResult, TargetStatus,
};
use replicator::ledger::{EntityKind, FailureQuery};
use replicator::platform::{ErrorClass, FailureRule};
use replicator::recovery::RecoveryConfig;
use replicator::retry::BackoffPolicy;
use replicator::strategy::StrategyKind;
use tokio_util::sync::CancellationToken;

/// Records finished targets in completion order
#[derive(Default)]
struct RecordingObserver {
    finished: Mutex<Vec<(usize, TargetStatus)>>,
}

impl TargetObserver for RecordingObserver {
    fn target_sink(&self, _index: usize) -> Arc<dyn ProgressSink> {
        Arc::new(NoopSink)
    }

    fn target_finished(&self, index: usize, result: &TargetResult) {
        self.finished.lock().unwrap().push((index, result.status));
    }
}

fn plan(harness: &Harness, job_id: &str, targets: &[&str], mode: FanoutMode, count: ReplicaCount) -> DeployPlan {
    DeployPlan {
        job_id: job_id.into(),
        template: harness.template.clone(),
        targets: targets.iter().map(|t| t.to_string()).collect(),
        mode,
        count,
        strategy: StrategyKind::Batch,
        pixel_id: None,
        previous: Vec::new(),
    }
}

fn coordinator(harness: &Harness, concurrency: usize) -> FanoutCoordinator {
    FanoutCoordinator::new(
        harness.engine.clone(),
        harness.pool.clone(),
        harness.ledger.clone(),
        concurrency,
    )
}

#[tokio::test]
async fn test_one_failing_target_does_not_affect_the_others() {
    let harness = Harness::new(5000).await;
    for scope in ["act_2", "act_3", "act_4", "act_5"] {
        harness.register_scope(scope).await;
    }
    harness
        .platform
        .add_rule(FailureRule::new("campaigns", validation_error()).in_scope("act_4"));

    let observer = Arc::new(RecordingObserver::default());
    let report = coordinator(&harness, 3)
        .deploy(
            plan(
                &harness,
                "job-fanout",
                &["act_2", "act_3", "act_4", "act_5"],
                FanoutMode::Parallel,
                ReplicaCount::CopiesToCreate(2),
            ),
            &CancellationToken::new(),
            observer.clone(),
        )
        .await;

    assert_eq!(report.total_targets, 4);
    assert_eq!(report.successful, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.successful + report.failed, report.total_targets);

    let targets: Vec<&str> = report.per_target_results.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["act_2", "act_3", "act_4", "act_5"]);

    let failed = &report.per_target_results[2];
    assert_eq!(failed.status, TargetStatus::Failed);
    assert!(failed.container_id.is_none());
    assert_eq!(failed.failures.len(), 1);
    assert_eq!(failed.failures[0].entity, EntityKind::Container);
    assert!(failed.error.as_deref().unwrap_or_default().contains("container creation failed"));

    // template pair plus two copies in every healthy scope
    for scope in ["act_2", "act_3", "act_5"] {
        assert_eq!(harness.platform.objects_in(scope, "ads"), 3, "scope {}", scope);
    }
    assert_eq!(harness.platform.objects_in("act_4", "adsets"), 0);
    assert_eq!(observer.finished.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_unknown_scope_is_recorded_as_target_failure() {
    let harness = Harness::new(5000).await;
    harness.register_scope("act_2").await;

    let report = coordinator(&harness, 2)
        .deploy(
            plan(
                &harness,
                "job-unknown",
                &["act_2", "act_missing"],
                FanoutMode::Sequential,
                ReplicaCount::CopiesToCreate(0),
            ),
            &CancellationToken::new(),
            Arc::new(RecordingObserver::default()),
        )
        .await;

    assert_eq!(report.successful, 1);
    assert_eq!(report.per_target_results[1].status, TargetStatus::Failed);
    assert_eq!(harness.platform.objects_in("act_2", "ads"), 1);

    harness.ledger.flush().await;
    let records = harness
        .ledger
        .query(&FailureQuery {
            target: Some("act_missing".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity, EntityKind::Target);
    assert_eq!(records[0].class, ErrorClass::PermanentValidation);
}

#[tokio::test]
async fn test_partial_target_counts_as_failed() {
    // no recovery budget, so a short batch stays short
    let config = EngineConfig {
        recovery: RecoveryConfig {
            max_attempts: 0,
            inter_request_delay: Duration::from_millis(1),
        },
        ..fast_config(BackoffPolicy::no_retry())
    };
    let harness = Harness::with_config(5000, config).await;
    harness.register_scope("act_2").await;
    harness.register_scope("act_3").await;
    harness
        .platform
        .add_rule(FailureRule::new("adsets", validation_error()).in_scope("act_3").times(2));

    let report = coordinator(&harness, 2)
        .deploy(
            plan(
                &harness,
                "job-partial",
                &["act_2", "act_3"],
                FanoutMode::Sequential,
                ReplicaCount::CopiesToCreate(2),
            ),
            &CancellationToken::new(),
            Arc::new(RecordingObserver::default()),
        )
        .await;

    let partial = &report.per_target_results[1];
    assert_eq!(partial.status, TargetStatus::Partial);
    assert_eq!(partial.progress, 1);
    assert_eq!(partial.deficit, 2);
    assert_eq!(report.successful, 1);
    assert_eq!(report.partial, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_cancelled_fanout_skips_remaining_targets() {
    let harness = Harness::new(5000).await;
    harness.register_scope("act_2").await;
    harness.register_scope("act_3").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = coordinator(&harness, 2)
        .deploy(
            plan(
                &harness,
                "job-cancelled",
                &["act_2", "act_3"],
                FanoutMode::Sequential,
                ReplicaCount::CopiesToCreate(1),
            ),
            &cancel,
            Arc::new(RecordingObserver::default()),
        )
        .await;

    assert_eq!(report.successful, 0);
    assert!(report
        .per_target_results
        .iter()
        .all(|r| r.status == TargetStatus::Failed));
    assert_eq!(harness.platform.create_calls(), 0);
}
