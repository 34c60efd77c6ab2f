//! Single-object calls
//!
//! Used by the sequential strategy, by deficit recovery, by deploys (the
//! container) and for authoritative counting. Each attempt reserves one call.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::parser::PairOutcome;
use super::planner::PlanTarget;
use super::{acquire, pause, CallResult};
use crate::platform::{AdPlatform, ObjectSpec, PlatformError};
use crate::quota::{Credential, CredentialAffinity, CredentialPool};
use crate::retry::BackoffPolicy;
use crate::templates::Template;
use crate::types::Result;

#[derive(Clone)]
pub struct SingleDispatcher {
    pool: Arc<CredentialPool>,
    platform: Arc<dyn AdPlatform>,
    retry: BackoffPolicy,
}

impl SingleDispatcher {
    pub fn new(pool: Arc<CredentialPool>, platform: Arc<dyn AdPlatform>, retry: BackoffPolicy) -> Self {
        Self {
            pool,
            platform,
            retry,
        }
    }

    /// Run one platform call under admission and retry policy
    async fn call<T, F, Fut>(
        &self,
        what: &str,
        affinity: &CredentialAffinity,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<CallResult<T>>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        let mut attempts = 0;
        loop {
            let reservation = acquire(&self.pool, 1, affinity, cancel).await?;
            attempts += 1;

            let result = op(reservation.credential.clone()).await;
            if let Err(e) = self.pool.record_usage(&reservation, 1).await {
                warn!(error = %e, "Quota usage mismatch");
            }

            match result {
                Ok(value) => return Ok(Ok(value)),
                Err(error) => {
                    let class = error.class();
                    if class.is_retryable() && self.retry.allows_retry(attempts) {
                        let delay = self.retry.delay_for(attempts);
                        warn!(
                            call = what,
                            attempt = attempts,
                            class = %class,
                            error = %error,
                            "Platform call failed, retrying"
                        );
                        pause(delay, cancel).await?;
                        continue;
                    }
                    debug!(call = what, attempts = attempts, class = %class, error = %error, "Platform call failed");
                    return Ok(Err(error));
                }
            }
        }
    }

    /// Create one object under `owner`
    pub async fn create_object(
        &self,
        owner: &str,
        spec: &ObjectSpec,
        affinity: &CredentialAffinity,
        cancel: &CancellationToken,
    ) -> Result<CallResult<String>> {
        let platform = &self.platform;
        self.call(&spec.edge, affinity, cancel, |credential| async move {
            platform.create_object(&credential, owner, spec).await
        })
        .await
    }

    /// Create one parent and then its child, using the parent's materialized id
    pub async fn create_pair(
        &self,
        template: &Template,
        target: &PlanTarget<'_>,
        copy_number: u32,
        affinity: &CredentialAffinity,
        cancel: &CancellationToken,
    ) -> Result<PairOutcome> {
        let parent = ObjectSpec {
            edge: template.parent.edge.clone(),
            body: template.parent_body(target.container_id, copy_number, target.pixel_id),
        };
        let parent_id = match self.create_object(target.owner, &parent, affinity, cancel).await? {
            Ok(id) => id,
            Err(error) => return Ok(PairOutcome::Failed { copy_number, error }),
        };

        let child = ObjectSpec {
            edge: template.child.edge.clone(),
            body: template.child_body(&parent_id, copy_number),
        };
        // the parent exists now, so any failure from here on is an orphan
        let outcome = match self.create_object(target.owner, &child, affinity, cancel).await {
            Ok(Ok(child_id)) => PairOutcome::Created {
                copy_number,
                parent_id,
                child_id,
            },
            Ok(Err(error)) => PairOutcome::Orphan {
                copy_number,
                parent_id,
                error,
            },
            Err(e) => {
                warn!(parent_id = %parent_id, error = %e, "Child not attempted");
                PairOutcome::Orphan {
                    copy_number,
                    parent_id,
                    error: PlatformError::NotExecuted,
                }
            }
        };
        Ok(outcome)
    }

    /// Authoritative number of parents under `container_id` that hold at
    /// least one child
    pub async fn count_complete(
        &self,
        template: &Template,
        container_id: &str,
        affinity: &CredentialAffinity,
        cancel: &CancellationToken,
    ) -> Result<CallResult<u32>> {
        let platform = &self.platform;
        let parent_edge = template.parent.edge.as_str();
        let child_edge = template.child.edge.as_str();
        let nodes = self
            .call("count", affinity, cancel, |credential| async move {
                platform
                    .list_children(&credential, container_id, parent_edge, child_edge)
                    .await
            })
            .await?;
        Ok(nodes.map(|nodes| nodes.iter().filter(|n| n.child_count >= 1).count() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FailureRule, SimulatedPlatform};
    use crate::quota::InMemoryQuotaStore;
    use crate::templates::tests::sample_template;
    use std::time::Duration;

    async fn dispatcher(platform: Arc<SimulatedPlatform>, retry: BackoffPolicy) -> SingleDispatcher {
        let pool = Arc::new(CredentialPool::new(
            Arc::new(InMemoryQuotaStore::new()),
            Duration::from_secs(3600),
        ));
        pool.register_credential(Credential::new("su-1", "tok", "biz", 200))
            .await
            .unwrap();
        SingleDispatcher::new(pool, platform, retry)
    }

    fn target(container: &str) -> PlanTarget<'_> {
        PlanTarget {
            owner: "act_1",
            container_id: container,
            pixel_id: None,
        }
    }

    #[tokio::test]
    async fn test_pair_then_count() {
        let platform = Arc::new(SimulatedPlatform::new());
        let container = platform.seed_object("act_1", "campaigns", Default::default());
        let single = dispatcher(platform.clone(), BackoffPolicy::no_retry()).await;
        let template = sample_template();
        let cancel = CancellationToken::new();

        let outcome = single
            .create_pair(&template, &target(&container), 1, &CredentialAffinity::any(), &cancel)
            .await
            .unwrap();
        assert!(outcome.is_created());

        let count = single
            .count_complete(&template, &container, &CredentialAffinity::any(), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_child_failure_is_orphan_and_not_counted() {
        let platform = Arc::new(SimulatedPlatform::new());
        let container = platform.seed_object("act_1", "campaigns", Default::default());
        platform.add_rule(FailureRule::new("ads", PlatformError::Api {
            status: 400,
            code: Some(100),
            subcode: None,
            transient: None,
            message: "Invalid creative".into(),
        }));
        let single = dispatcher(platform.clone(), BackoffPolicy::no_retry()).await;
        let template = sample_template();
        let cancel = CancellationToken::new();

        let outcome = single
            .create_pair(&template, &target(&container), 1, &CredentialAffinity::any(), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, PairOutcome::Orphan { .. }));

        let count = single
            .count_complete(&template, &container, &CredentialAffinity::any(), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_transient_create_is_retried() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.add_rule(FailureRule::new("adsets", PlatformError::Timeout).times(2));
        let single = dispatcher(platform.clone(), BackoffPolicy::fixed(3, Duration::from_millis(1))).await;

        let id = single
            .create_object(
                "act_1",
                &ObjectSpec::new("adsets"),
                &CredentialAffinity::any(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(id.is_ok());
        assert_eq!(platform.create_calls(), 3);
    }
}
