//! Lease worker
//!
//! Each worker loops: claim a job, run it with a heartbeat holding the lease,
//! write the terminal row, repeat. Idle workers sleep for the poll interval or
//! until a new job is accepted on this process.
//!
//! A claimed job that already carries a plan (or deploy target rows) was
//! started by a worker whose lease expired; the engine resumes from them.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::tracker::{DeployObserver, JobTracker, LeaseHandle, LiveJob};
use super::{JobKind, JobRecord, JobStatus};
use crate::engine::{ProgressSink, UnitContext, UnitReport};
use crate::fanout::{DeployPlan, FanoutReport, TargetResult, TargetStatus};
use crate::quota::CredentialAffinity;
use crate::types::{ReplicatorError, Result};

enum JobOutcome {
    Unit(UnitReport),
    Fanout(FanoutReport),
}

pub(super) async fn worker_loop(tracker: Arc<JobTracker>, index: usize, shutdown: CancellationToken) {
    debug!(worker = index, "Job worker started");
    let poll = tracker.config.poll_interval;

    while !shutdown.is_cancelled() {
        match tracker.run_next().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => warn!(worker = index, error = %e, "Failed to claim job"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tracker.wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    debug!(worker = index, "Job worker stopped");
}

/// Run one claimed job to a terminal state
pub(super) async fn execute(tracker: &Arc<JobTracker>, job: JobRecord) {
    let job_id = job.job_id.clone();
    let cancel = CancellationToken::new();
    if job.cancel_requested {
        cancel.cancel();
    }
    info!(job_id = %job_id, kind = ?job.kind, worker_id = %tracker.config.worker_id, "Job processing");

    let lease = LeaseHandle {
        store: Arc::clone(&tracker.store),
        worker_id: tracker.config.worker_id.clone(),
        lease: ChronoDuration::from_std(tracker.config.lease)
            .unwrap_or_else(|_| ChronoDuration::seconds(60)),
    };
    let live = Arc::new(LiveJob::new(job, cancel.clone()).with_lease(lease));
    tracker.live.insert(job_id.clone(), Arc::clone(&live));

    let stop_heartbeat = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&live),
        tracker.config.lease,
        stop_heartbeat.clone(),
    ));

    let outcome = if cancel.is_cancelled() {
        Err(ReplicatorError::Cancelled(format!("job {}", job_id)))
    } else {
        run_job(tracker, &live).await
    };

    stop_heartbeat.cancel();
    if let Err(e) = heartbeat.await {
        warn!(job_id = %job_id, error = %e, "Heartbeat task ended abnormally");
    }

    if live.lease_lost() {
        warn!(job_id = %job_id, "Lease lost while running; leaving the job to its new owner");
        tracker.live.remove(&job_id);
        return;
    }

    let children = finish(&live, outcome);
    for child in &children {
        if let Err(e) = tracker.store.insert(child).await {
            warn!(job_id = %job_id, child = %child.job_id, error = %e, "Failed to store target job row");
        }
    }

    let record = live.record();
    match tracker.store.save(&record).await {
        Ok(()) => info!(
            job_id = %job_id,
            status = %record.status,
            progress = record.progress,
            target = record.target_count,
            deficit = record.deficit,
            failures = record.failures.len(),
            "Job finished"
        ),
        Err(e) => error!(job_id = %job_id, error = %e, "Failed to persist finished job"),
    }

    let retention = tracker.config.retention;
    let tracker = Arc::clone(tracker);
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        tracker.live.remove(&job_id);
    });
}

async fn run_job(tracker: &JobTracker, live: &Arc<LiveJob>) -> Result<JobOutcome> {
    let (job_id, request, resume, previous) = live.read(|job| {
        (
            job.job_id.clone(),
            job.request.clone(),
            job.plan.clone(),
            job.targets.clone(),
        )
    });
    if resume.is_some() {
        info!(job_id = %job_id, "Resuming from saved plan");
    }
    live.set_operation("Loading template".to_string());
    let template = Arc::new(tracker.templates.load(&request.template_ref).await?);
    let selection = tracker
        .selection
        .resolve_for(&request.selection, &template.scope_id)
        .await;
    let pixel_id = selection.pixel().map(str::to_string);

    match request.kind() {
        JobKind::Duplicate | JobKind::Multiply => {
            let scope_id = selection
                .ad_account()
                .unwrap_or(&template.scope_id)
                .to_string();
            let affinity = tracker
                .pool
                .affinity_for_scope(&scope_id)
                .await
                .unwrap_or_else(CredentialAffinity::any);
            let ctx = UnitContext {
                job_id,
                scope_id,
                container_id: template.container_id.clone(),
                template: Arc::clone(&template),
                affinity,
                pixel_id,
                cancel: live.cancel.clone(),
                ledger: tracker.ledger.clone(),
                resume,
            };

            let count = request.replica_count();
            let report = if ctx.scope_id == template.scope_id {
                tracker
                    .engine
                    .run_unit(&ctx, count, request.strategy, &**live)
                    .await?
            } else {
                // Another account was selected: the container has to exist there first
                tracker
                    .engine
                    .deploy_unit(ctx, count, request.strategy, &**live)
                    .await?
            };
            Ok(JobOutcome::Unit(report))
        }
        JobKind::Deploy => {
            let plan = DeployPlan {
                job_id,
                template,
                targets: request.targets.clone(),
                mode: request.mode,
                count: request.replica_count(),
                strategy: request.strategy,
                pixel_id,
                previous,
            };
            let observer = Arc::new(DeployObserver {
                live: Arc::clone(live),
            });
            let report = tracker.fanout.deploy(plan, &live.cancel, observer).await;
            Ok(JobOutcome::Fanout(report))
        }
    }
}

/// Write the terminal state into the live record. Returns per-target rows
/// for a deploy.
fn finish(live: &LiveJob, outcome: Result<JobOutcome>) -> Vec<JobRecord> {
    let now = Utc::now();
    let cancelled = live.cancel.is_cancelled();

    live.update(|job| {
        let mut children = Vec::new();
        let status = match outcome {
            Ok(JobOutcome::Unit(report)) => {
                job.target_count = report.copies_target;
                job.progress = report.progress;
                job.deficit = report.deficit;
                job.surplus = report.surplus;
                job.created_refs = report.created_refs;
                job.failures = report.failures;
                job.error = report.error;
                if job.error.is_some() && cancelled {
                    JobStatus::Cancelled
                } else if job.error.is_some() && job.progress == 0 {
                    JobStatus::Failed
                } else if job.deficit == 0 && !report.unverified {
                    JobStatus::Completed
                } else {
                    JobStatus::CompletedWithDeficit
                }
            }
            Ok(JobOutcome::Fanout(report)) => {
                for result in &report.per_target_results {
                    let child = target_row(job, result, now);
                    children.push(child);
                }
                // job.failures already holds every target's failures, earlier runs included
                job.targets = report
                    .per_target_results
                    .into_iter()
                    .zip(&children)
                    .map(|(result, child)| TargetResult {
                        job_id: Some(child.job_id.clone()),
                        failures: Vec::new(),
                        ..result
                    })
                    .collect();
                job.target_count = job.targets.iter().map(|t| t.target_count).sum();
                job.progress = job.targets.iter().map(|t| t.progress).sum();
                job.deficit = job.targets.iter().map(|t| t.deficit).sum();
                job.surplus = job.targets.iter().map(|t| t.surplus).sum();

                if cancelled {
                    JobStatus::Cancelled
                } else if report.successful == report.total_targets {
                    JobStatus::Completed
                } else if report.successful == 0 && report.partial == 0 {
                    job.error = Some(format!("all {} targets failed", report.total_targets));
                    JobStatus::Failed
                } else {
                    JobStatus::CompletedWithDeficit
                }
            }
            Err(ReplicatorError::Cancelled(_)) => {
                job.deficit = job.target_count.saturating_sub(job.progress);
                JobStatus::Cancelled
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Job failed");
                job.deficit = job.target_count.saturating_sub(job.progress);
                job.error = Some(e.to_string());
                JobStatus::Failed
            }
        };
        job.finish(status, now);
        children
    })
}

/// Per-target job row of a deploy
fn target_row(parent: &JobRecord, result: &TargetResult, now: chrono::DateTime<Utc>) -> JobRecord {
    let mut request = parent.request.clone();
    request.targets = vec![result.target.clone()];

    let mut child = JobRecord::new(request, parent.estimated_seconds);
    child.parent_job_id = Some(parent.job_id.clone());
    child.target_scope = Some(result.target.clone());
    child.targets = Vec::new();
    child.target_count = result.target_count;
    child.progress = result.progress;
    child.deficit = result.deficit;
    child.surplus = result.surplus;
    child.plan = result.plan.clone();
    child.failures = result.failures.clone();
    child.error = result.error.clone();
    child.started_at = parent.started_at;

    let status = match result.status {
        TargetStatus::Success => JobStatus::Completed,
        TargetStatus::Partial => JobStatus::CompletedWithDeficit,
        TargetStatus::Failed => JobStatus::Failed,
        TargetStatus::Ready | TargetStatus::Running => JobStatus::Cancelled,
    };
    child.finish(status, now);
    child
}

async fn heartbeat_loop(live: Arc<LiveJob>, lease: Duration, stop: CancellationToken) {
    let period = (lease / 3).max(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        match live.persist().await {
            Ok(()) => {}
            Err(ReplicatorError::Cancelled(_)) => break,
            Err(e) => {
                let job_id = live.read(|job| job.job_id.clone());
                warn!(job_id = %job_id, error = %e, "Heartbeat failed");
            }
        }
    }
}
