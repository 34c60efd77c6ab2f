//! Job Tracker
//!
//! A replication request becomes a durable job row the moment it is accepted;
//! the caller gets the job id back immediately and polls for status. Workers
//! claim rows under a lease, run them, and write the terminal state back.
//!
//! ```text
//! started -> processing -> completed | completed_with_deficit | failed | cancelled
//! ```

pub mod store;
pub mod tracker;
mod worker;

pub use store::{InMemoryJobStore, JobStore, LeaseState, MongoJobStore};
pub use tracker::{JobTracker, TrackerConfig, TrackerParts};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{ReplicaCount, UnitPlan};
use crate::fanout::{FanoutMode, TargetResult};
use crate::ledger::FailureSummary;
use crate::selection::SelectionOverride;
use crate::strategy::StrategyKind;
use crate::types::{ReplicatorError, Result};

/// Upper bound on copies one request may ask for
pub const MAX_REPLICAS: u32 = 1000;

/// Upper bound on targets one deploy may fan out to
pub const MAX_TARGETS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Exactly one copy in the template's scope
    Duplicate,
    /// N copies in the template's scope
    Multiply,
    /// The template deployed into other scopes
    Deploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Started,
    Processing,
    Completed,
    CompletedWithDeficit,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Started | JobStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Started => "started",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithDeficit => "completed_with_deficit",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===== Request =====

/// Start-replication request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationRequest {
    pub template_ref: String,
    /// Defaults to `deploy` when targets are given, `multiply` otherwise
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub count: Option<ReplicaCount>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub mode: FanoutMode,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub selection: SelectionOverride,
}

impl ReplicationRequest {
    pub fn kind(&self) -> JobKind {
        self.kind.unwrap_or(if self.targets.is_empty() {
            JobKind::Multiply
        } else {
            JobKind::Deploy
        })
    }

    /// Count the engine runs with. A deploy without a count only places the
    /// template's own pair in each target.
    pub fn replica_count(&self) -> ReplicaCount {
        match (self.kind(), self.count) {
            (JobKind::Duplicate, _) => ReplicaCount::CopiesToCreate(1),
            (_, Some(count)) => count,
            (JobKind::Deploy, None) => ReplicaCount::CopiesToCreate(0),
            (JobKind::Multiply, None) => ReplicaCount::CopiesToCreate(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.template_ref.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("templateRef is required".into()));
        }

        match self.kind() {
            JobKind::Duplicate => {
                if !self.targets.is_empty() {
                    return Err(ReplicatorError::BadRequest(
                        "duplicate does not take targets".into(),
                    ));
                }
                if matches!(self.count, Some(c) if c != ReplicaCount::CopiesToCreate(1)) {
                    return Err(ReplicatorError::BadRequest(
                        "duplicate always creates exactly one copy".into(),
                    ));
                }
            }
            JobKind::Multiply => {
                if !self.targets.is_empty() {
                    return Err(ReplicatorError::BadRequest(
                        "multiply does not take targets; use deploy".into(),
                    ));
                }
                match self.count {
                    None => {
                        return Err(ReplicatorError::BadRequest(
                            "multiply requires copiesToCreate or totalDesiredCount".into(),
                        ))
                    }
                    Some(ReplicaCount::CopiesToCreate(0)) | Some(ReplicaCount::TotalDesired(0)) => {
                        return Err(ReplicatorError::BadRequest(
                            "count must be greater than zero".into(),
                        ))
                    }
                    Some(_) => {}
                }
            }
            JobKind::Deploy => {
                if self.targets.is_empty() {
                    return Err(ReplicatorError::BadRequest("deploy requires targets".into()));
                }
                if self.targets.len() > MAX_TARGETS {
                    return Err(ReplicatorError::BadRequest(format!(
                        "at most {} targets per deploy",
                        MAX_TARGETS
                    )));
                }
                let mut seen = std::collections::HashSet::new();
                for target in &self.targets {
                    if target.trim().is_empty() {
                        return Err(ReplicatorError::BadRequest("empty target scope".into()));
                    }
                    if !seen.insert(target.as_str()) {
                        return Err(ReplicatorError::BadRequest(format!(
                            "duplicate target {}",
                            target
                        )));
                    }
                }
            }
        }

        if let Some(count) = self.count {
            if count.value() > MAX_REPLICAS {
                return Err(ReplicatorError::BadRequest(format!(
                    "at most {} copies per request",
                    MAX_REPLICAS
                )));
            }
        }
        Ok(())
    }
}

// ===== Job record =====

/// Durable job row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub kind: JobKind,
    pub request: ReplicationRequest,
    pub status: JobStatus,
    /// Deploy job this per-target row belongs to
    #[serde(default)]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub target_scope: Option<String>,
    pub target_count: u32,
    pub progress: u32,
    pub deficit: u32,
    /// Complete copies beyond the target
    #[serde(default)]
    pub surplus: u32,
    /// Count the job resolved to, checkpointed before the first dispatch so
    /// a worker that claims the job again fills up to it instead of
    /// resolving the request anew
    #[serde(default)]
    pub plan: Option<UnitPlan>,
    #[serde(default)]
    pub current_operation: String,
    #[serde(default)]
    pub created_refs: Vec<String>,
    #[serde(default)]
    pub failures: Vec<FailureSummary>,
    #[serde(default)]
    pub targets: Vec<TargetResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub estimated_seconds: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_owner: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl JobRecord {
    pub fn new(request: ReplicationRequest, estimated_seconds: u64) -> Self {
        let targets = request.targets.iter().map(TargetResult::ready).collect();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            kind: request.kind(),
            request,
            status: JobStatus::Started,
            parent_job_id: None,
            target_scope: None,
            target_count: 0,
            progress: 0,
            deficit: 0,
            surplus: 0,
            plan: None,
            current_operation: "Queued".to_string(),
            created_refs: Vec::new(),
            failures: Vec::new(),
            targets,
            error: None,
            estimated_seconds,
            started_at: Utc::now(),
            finished_at: None,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
        }
    }

    /// Move to a terminal status and release the lease
    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.current_operation = match status {
            JobStatus::Completed => "Completed".to_string(),
            JobStatus::CompletedWithDeficit => format!("Completed with {} missing", self.deficit),
            JobStatus::Cancelled => "Cancelled".to_string(),
            JobStatus::Failed => "Failed".to_string(),
            JobStatus::Started | JobStatus::Processing => std::mem::take(&mut self.current_operation),
        };
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> JobSnapshot {
        let end = self.finished_at.unwrap_or(now);
        let elapsed_seconds = (end - self.started_at).num_seconds().max(0) as u64;
        let remaining_seconds = if self.status.is_terminal() {
            0
        } else {
            self.estimated_seconds.saturating_sub(elapsed_seconds)
        };

        JobSnapshot {
            job_id: self.job_id.clone(),
            kind: self.kind,
            status: self.status,
            parent_job_id: self.parent_job_id.clone(),
            target_scope: self.target_scope.clone(),
            target_count: self.target_count,
            progress: self.progress.min(self.target_count),
            deficit: self.deficit,
            surplus: self.surplus,
            current_operation: self.current_operation.clone(),
            elapsed_seconds,
            remaining_seconds,
            estimated_seconds: self.estimated_seconds,
            created_refs: self.created_refs.clone(),
            failures: self.failures.clone(),
            targets: self.targets.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

// ===== Responses =====

/// Answer to a start-replication call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedJob {
    pub job_id: String,
    pub status: JobStatus,
    pub estimated_seconds: u64,
}

/// Status snapshot handed to pollers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_scope: Option<String>,
    pub target_count: u32,
    pub progress: u32,
    pub deficit: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub surplus: u32,
    pub current_operation: String,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub estimated_seconds: u64,
    pub created_refs: Vec<String>,
    pub failures: Vec<FailureSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Result of a status lookup; an unknown id is a normal answer, not an error
#[derive(Debug, Clone)]
pub enum JobLookup {
    Found(Box<JobSnapshot>),
    NotFound { job_id: String },
}

impl JobLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, JobLookup::Found(_))
    }
}

impl Serialize for JobLookup {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        match self {
            JobLookup::Found(snapshot) => snapshot.serialize(serializer),
            JobLookup::NotFound { job_id } => {
                let mut state = serializer.serialize_struct("JobLookup", 2)?;
                state.serialize_field("jobId", job_id)?;
                state.serialize_field("status", "not_found")?;
                state.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> ReplicationRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_kind_defaults_from_targets() {
        let r = request(r#"{"templateRef":"t","count":{"copiesToCreate":3}}"#);
        assert_eq!(r.kind(), JobKind::Multiply);
        assert!(r.validate().is_ok());

        let r = request(r#"{"templateRef":"t","targets":["act_1","act_2"]}"#);
        assert_eq!(r.kind(), JobKind::Deploy);
        assert_eq!(r.replica_count(), ReplicaCount::CopiesToCreate(0));
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_ambiguous_requests() {
        assert!(request(r#"{"templateRef":"t","kind":"multiply"}"#).validate().is_err());
        assert!(request(r#"{"templateRef":"t","kind":"duplicate","count":{"copiesToCreate":4}}"#)
            .validate()
            .is_err());
        assert!(request(r#"{"templateRef":"t","targets":["a","a"]}"#).validate().is_err());
        assert!(request(r#"{"templateRef":"t","count":{"totalDesiredCount":5000}}"#)
            .validate()
            .is_err());
        assert!(request(r#"{"templateRef":"","count":{"copiesToCreate":1}}"#).validate().is_err());
    }

    #[test]
    fn test_duplicate_is_one_copy() {
        let r = request(r#"{"templateRef":"t","kind":"duplicate"}"#);
        assert!(r.validate().is_ok());
        assert_eq!(r.replica_count(), ReplicaCount::CopiesToCreate(1));
    }

    #[test]
    fn test_snapshot_clamps_progress_and_remaining() {
        let r = request(r#"{"templateRef":"t","count":{"copiesToCreate":3}}"#);
        let mut job = JobRecord::new(r, 30);
        job.target_count = 3;
        job.progress = 5;
        let snapshot = job.snapshot(job.started_at + chrono::Duration::seconds(10));
        assert_eq!(snapshot.progress, 3);
        assert_eq!(snapshot.elapsed_seconds, 10);
        assert_eq!(snapshot.remaining_seconds, 20);

        job.finish(JobStatus::Completed, job.started_at + chrono::Duration::seconds(12));
        let snapshot = job.snapshot(job.started_at + chrono::Duration::seconds(100));
        assert_eq!(snapshot.elapsed_seconds, 12);
        assert_eq!(snapshot.remaining_seconds, 0);
    }

    #[test]
    fn test_not_found_is_a_plain_answer() {
        let lookup = JobLookup::NotFound {
            job_id: "nope".into(),
        };
        let json = serde_json::to_value(&lookup).unwrap();
        assert_eq!(json["status"], "not_found");
        assert_eq!(json["jobId"], "nope");
    }
}
