//! Failure record document schema
//!
//! The full record is embedded; the fields queries filter and sort on are
//! lifted to the top level.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::ledger::FailureRecord;
use crate::platform::ErrorClass;

/// Collection name for failure records
pub const FAILURE_COLLECTION: &str = "failure_records";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FailureDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub record_id: String,

    #[serde(default)]
    pub job_id: Option<String>,

    #[serde(default)]
    pub target: Option<String>,

    pub class: ErrorClass,

    pub created_at: DateTime,

    pub record: FailureRecord,
}

impl FailureDoc {
    pub fn new(record: FailureRecord) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            record_id: record.record_id.clone(),
            job_id: record.job_id.clone(),
            target: record.target.clone(),
            class: record.class,
            created_at: DateTime::from_chrono(record.created_at),
            record,
        }
    }
}

impl IntoIndexes for FailureDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "job_id": 1, "created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("job_created_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("created_at_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for FailureDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
