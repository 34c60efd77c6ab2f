//! Shared fixtures: a simulated platform seeded with one template pair, an
//! in-memory credential pool and a failure ledger. `ScriptedPlatform` wraps
//! the simulation to bend its replies (short or padded batches, lists that
//! stop answering).

#![allow(dead_code)]

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use replicator::engine::{EngineConfig, ReplicationEngine, UnitContext};
use replicator::ledger::{FailureLedger, InMemoryFailureStore};
use replicator::platform::{
    AdPlatform, BatchRequest, BatchResponse, ChildNode, ObjectSpec, PlatformError, SimulatedPlatform,
};
use replicator::quota::{Credential, CredentialAffinity, CredentialPool, ExternalScope, InMemoryQuotaStore};
use replicator::recovery::RecoveryConfig;
use replicator::retry::BackoffPolicy;
use replicator::templates::Template;

pub const TEMPLATE_SCOPE: &str = "act_1";
pub const OWNER: &str = "biz";

pub struct Harness {
    pub platform: Arc<SimulatedPlatform>,
    pub pool: Arc<CredentialPool>,
    pub engine: Arc<ReplicationEngine>,
    pub failures: Arc<InMemoryFailureStore>,
    pub ledger: FailureLedger,
    pub template: Arc<Template>,
}

fn object(fields: Value) -> Map<String, Value> {
    fields.as_object().cloned().unwrap_or_default()
}

/// Engine tuning with millisecond delays
pub fn fast_config(retry: BackoffPolicy) -> EngineConfig {
    EngineConfig {
        retry,
        recovery: RecoveryConfig {
            max_attempts: 10,
            inter_request_delay: Duration::from_millis(1),
        },
        sequential_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

pub fn validation_error() -> PlatformError {
    PlatformError::Api {
        status: 400,
        code: Some(100),
        subcode: Some(1487),
        transient: None,
        message: "Invalid parameter".into(),
    }
}

pub fn throttled() -> PlatformError {
    PlatformError::Api {
        status: 400,
        code: Some(17),
        subcode: None,
        transient: Some(true),
        message: "User request limit reached".into(),
    }
}

// =============================================================================
// Scripted platform
// =============================================================================

/// Simulated platform whose replies can be bent after the fact
#[derive(Default)]
pub struct ScriptedPlatform {
    pub inner: Arc<SimulatedPlatform>,
    /// Drop the last reply slot of every batch (the object is still created)
    truncate_batches: AtomicBool,
    /// Append one stray reply slot to every batch
    pad_batches: AtomicBool,
    /// List calls that still answer; every later list call fails
    lists_left: AtomicU32,
    fail_lists: AtomicBool,
}

impl ScriptedPlatform {
    pub fn new(inner: Arc<SimulatedPlatform>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn truncate_batches(&self) {
        self.truncate_batches.store(true, Ordering::SeqCst);
    }

    pub fn pad_batches(&self) {
        self.pad_batches.store(true, Ordering::SeqCst);
    }

    /// Let `n` more list calls through, then fail the rest
    pub fn fail_lists_after(&self, n: u32) {
        self.lists_left.store(n, Ordering::SeqCst);
        self.fail_lists.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AdPlatform for ScriptedPlatform {
    async fn create_object(
        &self,
        credential: &Credential,
        owner: &str,
        spec: &ObjectSpec,
    ) -> Result<String, PlatformError> {
        self.inner.create_object(credential, owner, spec).await
    }

    async fn batch(
        &self,
        credential: &Credential,
        requests: &[BatchRequest],
    ) -> Result<Vec<Option<BatchResponse>>, PlatformError> {
        let mut replies = self.inner.batch(credential, requests).await?;
        if self.truncate_batches.load(Ordering::SeqCst) {
            replies.pop();
        }
        if self.pad_batches.load(Ordering::SeqCst) {
            replies.push(Some(BatchResponse {
                code: 200,
                body: json!({ "id": "stray" }),
            }));
        }
        Ok(replies)
    }

    async fn list_children(
        &self,
        credential: &Credential,
        parent_id: &str,
        edge: &str,
        child_edge: &str,
    ) -> Result<Vec<ChildNode>, PlatformError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            let allowed = self
                .lists_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(PlatformError::Timeout);
            }
        }
        self.inner.list_children(credential, parent_id, edge, child_edge).await
    }
}

// =============================================================================
// Harness
// =============================================================================

impl Harness {
    pub async fn new(capacity: u32) -> Self {
        Self::with_config(capacity, fast_config(BackoffPolicy::fixed(3, Duration::from_millis(1)))).await
    }

    /// Seeds the template's container holding one complete pair
    pub async fn with_config(capacity: u32, config: EngineConfig) -> Self {
        let platform = Arc::new(SimulatedPlatform::new());
        Self::build(capacity, config, platform.clone(), platform).await
    }

    /// Engine talks to a scripted wrapper around the simulation
    pub async fn scripted(capacity: u32, config: EngineConfig) -> (Self, Arc<ScriptedPlatform>) {
        let platform = Arc::new(SimulatedPlatform::new());
        let scripted = Arc::new(ScriptedPlatform::new(platform.clone()));
        let harness = Self::build(capacity, config, platform, scripted.clone()).await;
        (harness, scripted)
    }

    async fn build(
        capacity: u32,
        config: EngineConfig,
        platform: Arc<SimulatedPlatform>,
        engine_platform: Arc<dyn AdPlatform>,
    ) -> Self {
        let container_id = platform.seed_object(TEMPLATE_SCOPE, "campaigns", object(json!({ "name": "Spring" })));
        let parent_id = platform.seed_object(
            TEMPLATE_SCOPE,
            "adsets",
            object(json!({ "name": "Audience A", "campaign_id": container_id })),
        );
        platform.seed_object(TEMPLATE_SCOPE, "ads", object(json!({ "name": "Ad A", "adset_id": parent_id })));

        let pool = Arc::new(CredentialPool::new(
            Arc::new(InMemoryQuotaStore::new()),
            Duration::from_secs(3600),
        ));
        pool.register_credential(Credential::new("su-1", "token-1", OWNER, capacity))
            .await
            .unwrap();

        let failures = Arc::new(InMemoryFailureStore::new());
        let ledger = FailureLedger::spawn(failures.clone(), 256);
        let engine = Arc::new(ReplicationEngine::new(pool.clone(), engine_platform, config));

        let template = Arc::new(Template {
            template_ref: "tpl-1".into(),
            scope_id: TEMPLATE_SCOPE.into(),
            container_id,
            container: ObjectSpec::new("campaigns").with_field("name", "Spring"),
            parent: ObjectSpec::new("adsets").with_field("name", "Audience A"),
            child: ObjectSpec::new("ads").with_field("name", "Ad A"),
            container_link_field: "campaign_id".into(),
            parent_link_field: "adset_id".into(),
            shared_asset_id: Some("cr-9".into()),
        });

        Self {
            platform,
            pool,
            engine,
            failures,
            ledger,
            template,
        }
    }

    pub async fn register_scope(&self, scope_id: &str) {
        self.pool
            .register_scope(ExternalScope {
                scope_id: scope_id.into(),
                owner_scope: OWNER.into(),
                credential_id: None,
                label: None,
            })
            .await
            .unwrap();
    }

    /// Context for a unit inside the template's own container
    pub fn unit(&self, job_id: &str) -> UnitContext {
        UnitContext {
            job_id: job_id.into(),
            scope_id: TEMPLATE_SCOPE.into(),
            container_id: self.template.container_id.clone(),
            template: self.template.clone(),
            affinity: CredentialAffinity::any(),
            pixel_id: None,
            cancel: CancellationToken::new(),
            ledger: self.ledger.clone(),
            resume: None,
        }
    }

    /// Complete pairs under the template's container
    pub fn pairs_in_template_scope(&self) -> usize {
        self.platform.objects_in(TEMPLATE_SCOPE, "ads")
    }
}
