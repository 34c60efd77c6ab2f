//! Replication job document schema
//!
//! The job record is embedded whole. Lease and status fields are duplicated at
//! the top level so claims and heartbeats can be single atomic updates; the
//! top-level copy wins when the document is read back.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::jobs::{JobRecord, JobStatus};

/// Collection name for replication jobs
pub const JOB_COLLECTION: &str = "replication_jobs";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub job_id: String,

    pub status: JobStatus,

    #[serde(default)]
    pub parent_job_id: Option<String>,

    #[serde(default)]
    pub lease_owner: Option<String>,

    #[serde(default)]
    pub lease_expires_at: Option<DateTime>,

    #[serde(default)]
    pub cancel_requested: bool,

    pub started_at: DateTime,

    pub record: JobRecord,
}

impl JobDoc {
    pub fn new(record: JobRecord) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            job_id: record.job_id.clone(),
            status: record.status,
            parent_job_id: record.parent_job_id.clone(),
            lease_owner: record.lease_owner.clone(),
            lease_expires_at: record.lease_expires_at.map(DateTime::from_chrono),
            cancel_requested: record.cancel_requested,
            started_at: DateTime::from_chrono(record.started_at),
            record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        let mut record = self.record;
        record.status = self.status;
        record.lease_owner = self.lease_owner;
        record.lease_expires_at = self.lease_expires_at.map(|at| at.to_chrono());
        record.cancel_requested = self.cancel_requested;
        record
    }
}

impl IntoIndexes for JobDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "job_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("job_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "status": 1, "lease_expires_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("status_lease_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "parent_job_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("parent_job_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for JobDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ReplicationRequest;

    #[test]
    fn test_top_level_fields_win_on_read() {
        let request: ReplicationRequest =
            serde_json::from_str(r#"{"templateRef":"t","count":{"copiesToCreate":2}}"#).unwrap();
        let mut doc = JobDoc::new(JobRecord::new(request, 10));
        doc.status = JobStatus::Processing;
        doc.lease_owner = Some("worker-a".into());
        doc.cancel_requested = true;

        let record = doc.into_record();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.lease_owner.as_deref(), Some("worker-a"));
        assert!(record.cancel_requested);
    }
}
