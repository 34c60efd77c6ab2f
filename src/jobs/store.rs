//! Durable job rows and leases
//!
//! A worker claims a job that is `started`, or `processing` with an expired
//! lease (its worker died), and keeps the lease alive with heartbeats. A
//! heartbeat also checkpoints live progress, the resolved plan and deploy
//! target rows, so a status poll served by a different process sees recent
//! numbers and a worker that takes the job over can resume it.

use bson::{doc, DateTime as BsonDateTime};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{JobRecord, JobStatus};
use crate::db::schemas::{JobDoc, JOB_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{ReplicatorError, Result};

/// What a heartbeat learned about the lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseState {
    /// The caller still owns the lease
    pub held: bool,
    pub cancel_requested: bool,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &JobRecord) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Claim one runnable job for `worker_id`, moving it to `processing`
    async fn claim(&self, worker_id: &str, lease: Duration, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Extend the lease to `until` and checkpoint progress and plan
    async fn heartbeat(&self, job: &JobRecord, worker_id: &str, until: DateTime<Utc>) -> Result<LeaseState>;

    /// Flag a running job for cancellation. Returns the job's status, or
    /// `None` if it does not exist.
    async fn request_cancel(&self, job_id: &str) -> Result<Option<JobStatus>>;

    /// Overwrite the whole row
    async fn save(&self, job: &JobRecord) -> Result<()>;

    /// Newest first
    async fn list(&self, active_only: bool, limit: usize) -> Result<Vec<JobRecord>>;
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    let lease = ChronoDuration::from_std(lease)
        .map_err(|e| ReplicatorError::Config(format!("invalid lease duration: {}", e)))?;
    Ok(now + lease)
}

// ============================================================================
// In-Memory Store (for testing/local development)
// ============================================================================

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(ReplicatorError::Conflict(format!("job {} exists", job.job_id)));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn claim(&self, worker_id: &str, lease: Duration, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let until = lease_until(now, lease)?;
        let mut jobs = self.jobs.write().await;

        let candidate = jobs
            .values_mut()
            .filter(|job| match job.status {
                JobStatus::Started => true,
                JobStatus::Processing => job.lease_expires_at.map_or(true, |at| at < now),
                _ => false,
            })
            .min_by_key(|job| job.started_at);

        Ok(candidate.map(|job| {
            job.status = JobStatus::Processing;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_expires_at = Some(until);
            job.clone()
        }))
    }

    async fn heartbeat(&self, job: &JobRecord, worker_id: &str, until: DateTime<Utc>) -> Result<LeaseState> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.job_id) {
            Some(stored) if stored.lease_owner.as_deref() == Some(worker_id) => {
                stored.lease_expires_at = Some(until);
                stored.target_count = job.target_count;
                stored.progress = job.progress;
                stored.deficit = job.deficit;
                stored.surplus = job.surplus;
                stored.plan = job.plan.clone();
                stored.current_operation = job.current_operation.clone();
                stored.created_refs = job.created_refs.clone();
                stored.failures = job.failures.clone();
                stored.targets = job.targets.clone();
                Ok(LeaseState {
                    held: true,
                    cancel_requested: stored.cancel_requested,
                })
            }
            Some(stored) => Ok(LeaseState {
                held: false,
                cancel_requested: stored.cancel_requested,
            }),
            None => Ok(LeaseState {
                held: false,
                cancel_requested: false,
            }),
        }
    }

    async fn request_cancel(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.get_mut(job_id).map(|job| {
            if !job.status.is_terminal() {
                job.cancel_requested = true;
            }
            job.status
        }))
    }

    async fn save(&self, job: &JobRecord) -> Result<()> {
        self.jobs.write().await.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn list(&self, active_only: bool, limit: usize) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut listed: Vec<JobRecord> = jobs
            .values()
            .filter(|job| !active_only || !job.status.is_terminal())
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        listed.truncate(limit);
        Ok(listed)
    }
}

// ============================================================================
// MongoDB Store
// ============================================================================

pub struct MongoJobStore {
    collection: MongoCollection<JobDoc>,
}

impl MongoJobStore {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            collection: mongo.collection::<JobDoc>(JOB_COLLECTION).await?,
        })
    }
}

#[async_trait::async_trait]
impl JobStore for MongoJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        self.collection.insert_one(JobDoc::new(job.clone())).await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self
            .collection
            .find_one(doc! { "job_id": job_id })
            .await?
            .map(JobDoc::into_record))
    }

    async fn claim(&self, worker_id: &str, lease: Duration, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let until = lease_until(now, lease)?;
        let filter = doc! {
            "$or": [
                { "status": JobStatus::Started.as_str() },
                {
                    "status": JobStatus::Processing.as_str(),
                    "lease_expires_at": { "$lt": BsonDateTime::from_chrono(now) },
                },
            ],
        };
        let update = doc! {
            "$set": {
                "status": JobStatus::Processing.as_str(),
                "lease_owner": worker_id,
                "lease_expires_at": BsonDateTime::from_chrono(until),
                "metadata.updated_at": BsonDateTime::now(),
            }
        };
        Ok(self
            .collection
            .find_one_and_update(filter, update)
            .await?
            .map(JobDoc::into_record))
    }

    async fn heartbeat(&self, job: &JobRecord, worker_id: &str, until: DateTime<Utc>) -> Result<LeaseState> {
        let update = doc! {
            "$set": {
                "lease_expires_at": BsonDateTime::from_chrono(until),
                "record.targetCount": job.target_count as i64,
                "record.progress": job.progress as i64,
                "record.deficit": job.deficit as i64,
                "record.surplus": job.surplus as i64,
                "record.plan": bson::to_bson(&job.plan)?,
                "record.currentOperation": job.current_operation.as_str(),
                "record.createdRefs": job.created_refs.clone(),
                "record.failures": bson::to_bson(&job.failures)?,
                "record.targets": bson::to_bson(&job.targets)?,
                "metadata.updated_at": BsonDateTime::now(),
            }
        };
        let updated = self
            .collection
            .find_one_and_update(doc! { "job_id": job.job_id.as_str(), "lease_owner": worker_id }, update)
            .await?;

        match updated {
            Some(doc) => Ok(LeaseState {
                held: true,
                cancel_requested: doc.cancel_requested,
            }),
            None => {
                let cancel_requested = self
                    .get(&job.job_id)
                    .await?
                    .map_or(false, |job| job.cancel_requested);
                Ok(LeaseState {
                    held: false,
                    cancel_requested,
                })
            }
        }
    }

    async fn request_cancel(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let filter = doc! {
            "job_id": job_id,
            "status": { "$in": [JobStatus::Started.as_str(), JobStatus::Processing.as_str()] },
        };
        let update = doc! {
            "$set": { "cancel_requested": true, "metadata.updated_at": BsonDateTime::now() }
        };
        match self.collection.find_one_and_update(filter, update).await? {
            Some(doc) => Ok(Some(doc.status)),
            None => Ok(self.get(job_id).await?.map(|job| job.status)),
        }
    }

    async fn save(&self, job: &JobRecord) -> Result<()> {
        let result = self
            .collection
            .replace_one(doc! { "job_id": job.job_id.as_str() }, JobDoc::new(job.clone()))
            .await?;
        if result.matched_count == 0 {
            self.collection.insert_one(JobDoc::new(job.clone())).await?;
        }
        Ok(())
    }

    async fn list(&self, active_only: bool, limit: usize) -> Result<Vec<JobRecord>> {
        let filter = if active_only {
            doc! {
                "status": { "$in": [JobStatus::Started.as_str(), JobStatus::Processing.as_str()] }
            }
        } else {
            doc! {}
        };
        let docs = self
            .collection
            .find_sorted(filter, Some(doc! { "started_at": -1 }), Some(limit as i64))
            .await?;
        Ok(docs.into_iter().map(JobDoc::into_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UnitPlan;
    use crate::jobs::ReplicationRequest;

    fn job() -> JobRecord {
        let request: ReplicationRequest =
            serde_json::from_str(r#"{"templateRef":"t","count":{"copiesToCreate":2}}"#).unwrap();
        JobRecord::new(request, 10)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();
        let now = Utc::now();
        let lease = Duration::from_secs(60);

        let claimed = store.claim("a", lease, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(store.claim("b", lease, now).await.unwrap().is_none());

        let later = now + ChronoDuration::seconds(61);
        let reclaimed = store.claim("b", lease, later).await.unwrap().unwrap();
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("b"));

        let state = store.heartbeat(&claimed, "a", later).await.unwrap();
        assert!(!state.held);
    }

    #[tokio::test]
    async fn test_cancel_flag_reaches_heartbeat() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();
        let claimed = store
            .claim("a", Duration::from_secs(60), Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            store.request_cancel(&job.job_id).await.unwrap(),
            Some(JobStatus::Processing)
        );
        let state = store.heartbeat(&claimed, "a", Utc::now()).await.unwrap();
        assert!(state.held);
        assert!(state.cancel_requested);

        assert_eq!(store.request_cancel("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_not_claimed() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        job.finish(JobStatus::Completed, Utc::now());
        store.insert(&job).await.unwrap();
        assert!(store
            .claim("a", Duration::from_secs(60), Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(store.list(true, 10).await.unwrap().is_empty());
        assert_eq!(store.list(false, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_plan_for_the_next_owner() {
        let store = InMemoryJobStore::new();
        store.insert(&job()).await.unwrap();
        let now = Utc::now();

        let mut claimed = store.claim("a", Duration::ZERO, now).await.unwrap().unwrap();
        claimed.plan = Some(UnitPlan {
            container_id: "c-1".into(),
            baseline: 1,
            target_total: 3,
        });
        claimed.progress = 1;
        assert!(store.heartbeat(&claimed, "a", now).await.unwrap().held);

        let later = now + ChronoDuration::seconds(1);
        let reclaimed = store
            .claim("b", Duration::from_secs(60), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.plan, claimed.plan);
        assert_eq!(reclaimed.progress, 1);
    }
}
