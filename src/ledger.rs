//! Failure Ledger
//!
//! Append-only sink for failure records. Recording is fire-and-forget: records
//! go onto a bounded channel drained by a writer task, and a full channel or a
//! failing store only produces a warning. Nothing the ledger does can fail or
//! block the operation that reported the failure.

use bson::doc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::db::schemas::{FailureDoc, FAILURE_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::platform::{ErrorClass, PlatformError};
use crate::types::Result;

/// Default number of records returned by a query
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// What kind of entity failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Container,
    Parent,
    Child,
    Target,
    Quota,
}

/// Lifecycle stage at which the failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Batch,
    Sequential,
    Recovery,
    Count,
    Deploy,
}

// ===== Types =====

/// One failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub record_id: String,
    pub entity: EntityKind,
    pub stage: FailureStage,
    #[serde(default)]
    pub job_id: Option<String>,
    /// Scope the failure happened in
    #[serde(default)]
    pub target: Option<String>,
    /// Parent (or container) the failed object hangs under
    #[serde(default)]
    pub parent_ref: Option<String>,
    #[serde(default)]
    pub copy_number: Option<u32>,
    pub class: ErrorClass,
    pub error: String,
    /// Raw error payload
    #[serde(default)]
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(entity: EntityKind, stage: FailureStage, class: ErrorClass, error: impl Into<String>) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            entity,
            stage,
            job_id: None,
            target: None,
            parent_ref: None,
            copy_number: None,
            class,
            error: error.into(),
            payload: None,
            created_at: Utc::now(),
        }
    }

    /// Record for a platform failure, carrying the error as payload
    pub fn from_platform(entity: EntityKind, stage: FailureStage, error: &PlatformError) -> Self {
        let mut record = Self::new(entity, stage, error.class(), error.to_string());
        record.payload = serde_json::to_value(error).ok();
        record
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_parent(mut self, parent_ref: impl Into<String>) -> Self {
        self.parent_ref = Some(parent_ref.into());
        self
    }

    pub fn with_copy(mut self, copy_number: u32) -> Self {
        self.copy_number = Some(copy_number);
        self
    }

    /// Short form carried on job status
    pub fn summary(&self) -> FailureSummary {
        FailureSummary {
            record_id: self.record_id.clone(),
            entity: self.entity,
            stage: self.stage,
            class: self.class,
            copy_number: self.copy_number,
            parent_ref: self.parent_ref.clone(),
            error: self.error.clone(),
        }
    }
}

/// Failure entry in a job's status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub record_id: String,
    pub entity: EntityKind,
    pub stage: FailureStage,
    pub class: ErrorClass,
    #[serde(default)]
    pub copy_number: Option<u32>,
    #[serde(default)]
    pub parent_ref: Option<String>,
    pub error: String,
}

/// Filters for operator queries
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureQuery {
    pub job_id: Option<String>,
    pub target: Option<String>,
    pub class: Option<ErrorClass>,
    pub limit: Option<usize>,
}

impl FailureQuery {
    fn matches(&self, record: &FailureRecord) -> bool {
        if self.job_id.is_some() && record.job_id != self.job_id {
            return false;
        }
        if self.target.is_some() && record.target != self.target {
            return false;
        }
        if let Some(class) = self.class {
            if record.class != class {
                return false;
            }
        }
        true
    }

    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).max(1)
    }
}

// ===== Stores =====

/// Storage backend for failure records
#[async_trait::async_trait]
pub trait FailureStore: Send + Sync {
    async fn append(&self, record: &FailureRecord) -> Result<()>;

    /// Newest first
    async fn query(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>>;
}

/// Process-local failure store
#[derive(Default)]
pub struct InMemoryFailureStore {
    records: RwLock<Vec<FailureRecord>>,
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FailureStore for InMemoryFailureStore {
    async fn append(&self, record: &FailureRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn query(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .take(query.effective_limit())
            .cloned()
            .collect())
    }
}

/// MongoDB-backed failure store
pub struct MongoFailureStore {
    collection: MongoCollection<FailureDoc>,
}

impl MongoFailureStore {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            collection: mongo.collection::<FailureDoc>(FAILURE_COLLECTION).await?,
        })
    }
}

#[async_trait::async_trait]
impl FailureStore for MongoFailureStore {
    async fn append(&self, record: &FailureRecord) -> Result<()> {
        self.collection.insert_one(FailureDoc::new(record.clone())).await?;
        Ok(())
    }

    async fn query(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>> {
        let mut filter = doc! {};
        if let Some(ref job_id) = query.job_id {
            filter.insert("job_id", job_id);
        }
        if let Some(ref target) = query.target {
            filter.insert("target", target);
        }
        if let Some(class) = query.class {
            filter.insert("class", class.as_str());
        }

        let docs = self
            .collection
            .find_sorted(
                filter,
                Some(doc! { "created_at": -1 }),
                Some(query.effective_limit() as i64),
            )
            .await?;
        Ok(docs.into_iter().map(|d| d.record).collect())
    }
}

// ===== Ledger =====

enum LedgerCommand {
    Record(Box<FailureRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the failure ledger; cheap to clone
#[derive(Clone)]
pub struct FailureLedger {
    tx: mpsc::Sender<LedgerCommand>,
    store: Arc<dyn FailureStore>,
}

impl FailureLedger {
    /// Start the writer task
    pub fn spawn(store: Arc<dyn FailureStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<LedgerCommand>(capacity.max(1));
        let writer_store = Arc::clone(&store);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    LedgerCommand::Record(record) => {
                        if let Err(e) = writer_store.append(&record).await {
                            warn!(
                                record_id = %record.record_id,
                                error = %e,
                                "Failed to write failure record"
                            );
                        }
                    }
                    LedgerCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Failure ledger writer stopped");
        });

        Self { tx, store }
    }

    /// Record a failure. Never blocks and never fails.
    pub fn record(&self, record: FailureRecord) {
        debug!(
            class = %record.class,
            job_id = ?record.job_id,
            error = %record.error,
            "Failure recorded"
        );
        if let Err(e) = self.tx.try_send(LedgerCommand::Record(Box::new(record))) {
            warn!(error = %e, "Failure ledger unavailable, record dropped");
        }
    }

    /// Wait until every record sent so far has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LedgerCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub async fn query(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>> {
        self.store.query(query).await
    }
}
