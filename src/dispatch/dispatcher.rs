//! Group dispatch
//!
//! Sends one [`BatchGroup`] as a single batch call. Whole-call failures that
//! are retryable (transport, throttling) resend the group under the backoff
//! policy; failures of individual entries inside a successful call are never
//! retried here and come back as per-pair outcomes.
//!
//! A batch reply can report more executed entries than were reserved; the
//! quota overflow comes back on the outcome for the caller to ledger.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::parser::{fail_all, parse_group, PairOutcome};
use super::planner::BatchGroup;
use super::{acquire, pause};
use crate::platform::{AdPlatform, PlatformError};
use crate::quota::{CredentialAffinity, CredentialPool};
use crate::retry::BackoffPolicy;
use crate::types::Result;

/// Result of dispatching one group
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub pairs: Vec<PairOutcome>,
    /// Batch calls made, including retries
    pub attempts: u32,
    /// Set when the call as a whole failed and every pair was marked failed
    pub group_error: Option<PlatformError>,
    /// Usage the credential pool could not absorb
    pub usage_error: Option<String>,
}

impl GroupOutcome {
    pub fn created(&self) -> usize {
        self.pairs.iter().filter(|p| p.is_created()).count()
    }
}

/// Sends batch groups
#[derive(Clone)]
pub struct BatchDispatcher {
    pool: Arc<CredentialPool>,
    platform: Arc<dyn AdPlatform>,
    retry: BackoffPolicy,
}

impl BatchDispatcher {
    pub fn new(pool: Arc<CredentialPool>, platform: Arc<dyn AdPlatform>, retry: BackoffPolicy) -> Self {
        Self {
            pool,
            platform,
            retry,
        }
    }

    /// Dispatch one group.
    ///
    /// Returns `Err` only for engine-level conditions: cancellation, or no
    /// credential able to serve the call.
    pub async fn dispatch(
        &self,
        group: &BatchGroup,
        affinity: &CredentialAffinity,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome> {
        let requests = group.requests();
        let calls = group.len() as u32;
        let mut attempts = 0;
        let mut usage_error = None;

        loop {
            let reservation = acquire(&self.pool, calls, affinity, cancel).await?;
            attempts += 1;
            debug!(
                group = group.sequence,
                operations = calls,
                attempt = attempts,
                credential = %reservation.credential.credential_id,
                "Sending batch"
            );

            let result = self.platform.batch(&reservation.credential, &requests).await;

            let used = match &result {
                Ok(responses) => responses.iter().filter(|r| r.is_some()).count() as u32,
                Err(_) => calls,
            };
            if let Err(e) = self.pool.record_usage(&reservation, used).await {
                warn!(group = group.sequence, reserved = calls, used = used, error = %e, "Quota usage mismatch");
                usage_error = Some(e.to_string());
            }

            let error = match result {
                Ok(responses) => match parse_group(group, &responses) {
                    Ok(pairs) => {
                        return Ok(GroupOutcome {
                            pairs,
                            attempts,
                            group_error: None,
                            usage_error,
                        })
                    }
                    // the call ran; resending could duplicate objects
                    Err(malformed) => {
                        warn!(group = group.sequence, error = %malformed, "Unreadable batch response");
                        return Ok(self.failed(group, attempts, malformed, usage_error));
                    }
                },
                Err(error) => error,
            };

            let class = error.class();
            if class.is_retryable() && self.retry.allows_retry(attempts) {
                let delay = self.retry.delay_for(attempts);
                warn!(
                    group = group.sequence,
                    attempt = attempts,
                    class = %class,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Batch call failed, retrying group"
                );
                pause(delay, cancel).await?;
                continue;
            }

            warn!(
                group = group.sequence,
                attempts = attempts,
                class = %class,
                error = %error,
                "Batch call failed, giving up on group"
            );
            return Ok(self.failed(group, attempts, error, usage_error));
        }
    }

    fn failed(
        &self,
        group: &BatchGroup,
        attempts: u32,
        error: PlatformError,
        usage_error: Option<String>,
    ) -> GroupOutcome {
        GroupOutcome {
            pairs: fail_all(group, &error),
            attempts,
            group_error: Some(error),
            usage_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::planner::{plan, BatchLayout, PlanTarget};
    use crate::platform::{BatchRequest, BatchResponse, ChildNode, ObjectSpec, SimulatedPlatform};
    use crate::quota::{Credential, InMemoryQuotaStore};
    use crate::templates::tests::sample_template;
    use std::time::Duration;

    async fn setup(capacity: u32) -> (Arc<CredentialPool>, Arc<SimulatedPlatform>) {
        let pool = Arc::new(CredentialPool::new(
            Arc::new(InMemoryQuotaStore::new()),
            Duration::from_secs(3600),
        ));
        pool.register_credential(Credential::new("su-1", "tok", "biz", capacity))
            .await
            .unwrap();
        (pool, Arc::new(SimulatedPlatform::new()))
    }

    /// Answers every batch with one executed entry more than it was sent
    struct PaddedReplies(SimulatedPlatform);

    #[async_trait::async_trait]
    impl AdPlatform for PaddedReplies {
        async fn create_object(
            &self,
            credential: &Credential,
            owner: &str,
            spec: &ObjectSpec,
        ) -> std::result::Result<String, PlatformError> {
            self.0.create_object(credential, owner, spec).await
        }

        async fn batch(
            &self,
            credential: &Credential,
            requests: &[BatchRequest],
        ) -> std::result::Result<Vec<Option<BatchResponse>>, PlatformError> {
            let mut responses = self.0.batch(credential, requests).await?;
            let extra = responses.last().cloned().flatten();
            responses.push(extra);
            Ok(responses)
        }

        async fn list_children(
            &self,
            credential: &Credential,
            parent_id: &str,
            edge: &str,
            child_edge: &str,
        ) -> std::result::Result<Vec<ChildNode>, PlatformError> {
            self.0.list_children(credential, parent_id, edge, child_edge).await
        }
    }

    fn groups(count: u32) -> Vec<BatchGroup> {
        let target = PlanTarget {
            owner: "act_1",
            container_id: "c-1",
            pixel_id: None,
        };
        plan(&sample_template(), &target, 1, count, 50, BatchLayout::Interleaved).unwrap()
    }

    #[tokio::test]
    async fn test_transport_failure_retries_whole_group() {
        let (pool, platform) = setup(200).await;
        platform.fail_next_batches(vec![PlatformError::Timeout]);
        let dispatcher = BatchDispatcher::new(
            pool.clone(),
            platform.clone(),
            BackoffPolicy::fixed(3, Duration::from_millis(1)),
        );

        let group = &groups(4)[0];
        let outcome = dispatcher
            .dispatch(group, &CredentialAffinity::any(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.created(), 4);
        assert_eq!(platform.batch_calls(), 2);
        // both attempts were charged
        assert_eq!(pool.snapshot().await[0].consumed, 16);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_every_pair() {
        let (pool, platform) = setup(200).await;
        platform.fail_next_batches(vec![
            PlatformError::Transport("reset".into()),
            PlatformError::Transport("reset".into()),
        ]);
        let dispatcher = BatchDispatcher::new(
            pool,
            platform,
            BackoffPolicy::fixed(2, Duration::from_millis(1)),
        );

        let group = &groups(3)[0];
        let outcome = dispatcher
            .dispatch(group, &CredentialAffinity::any(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.group_error.is_some());
        assert_eq!(outcome.pairs.len(), 3);
        assert!(outcome.pairs.iter().all(|p| matches!(p, PairOutcome::Failed { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let (pool, platform) = setup(200).await;
        let dispatcher = BatchDispatcher::new(pool, platform.clone(), BackoffPolicy::no_retry());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher
            .dispatch(&groups(1)[0], &CredentialAffinity::any(), &cancel)
            .await;
        assert!(matches!(result, Err(crate::types::ReplicatorError::Cancelled(_))));
        assert_eq!(platform.batch_calls(), 0);
    }

    #[tokio::test]
    async fn test_usage_beyond_reservation_is_reported() {
        let (pool, _) = setup(8).await;
        let dispatcher = BatchDispatcher::new(
            pool.clone(),
            Arc::new(PaddedReplies(SimulatedPlatform::new())),
            BackoffPolicy::no_retry(),
        );

        let group = &groups(4)[0];
        let outcome = dispatcher
            .dispatch(group, &CredentialAffinity::any(), &CancellationToken::new())
            .await
            .unwrap();

        let overflow = outcome.usage_error.expect("overflow reported");
        assert!(overflow.contains("usage overflow of 1 calls"));
        // the reply no longer lines up with the request, nothing is trusted
        assert!(outcome.group_error.is_some());
        assert_eq!(pool.snapshot().await[0].consumed, 8);
    }
}
