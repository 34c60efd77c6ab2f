//! Batch Dispatch Planner
//!
//! - [`planner`]: packs copies into batch groups
//! - [`parser`]: turns batch responses back into per-copy outcomes
//! - [`dispatcher`]: sends groups under quota admission and retry policy
//! - [`single`]: one-object calls for the sequential and recovery paths
//!
//! Every network call goes through [`acquire`] first, which waits out
//! deferred admissions instead of dropping the work.

pub mod dispatcher;
pub mod parser;
pub mod planner;
pub mod single;

use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::platform::PlatformError;
use crate::quota::{Admission, CredentialAffinity, CredentialPool, Reservation};
use crate::types::{ReplicatorError, Result};

pub use dispatcher::{BatchDispatcher, GroupOutcome};
pub use parser::PairOutcome;
pub use planner::{plan, BatchGroup, BatchLayout, OpRole, PlanTarget, SubOperation};
pub use single::SingleDispatcher;

/// Outcome of one platform call: the platform's answer, separate from
/// engine-level errors (cancellation, no credential)
pub type CallResult<T> = std::result::Result<T, PlatformError>;

/// Reserve `calls` on the pool, sleeping through deferrals
pub(crate) async fn acquire(
    pool: &CredentialPool,
    calls: u32,
    affinity: &CredentialAffinity,
    cancel: &CancellationToken,
) -> Result<Reservation> {
    loop {
        if cancel.is_cancelled() {
            return Err(ReplicatorError::Cancelled("cancelled while waiting for quota".into()));
        }
        let admission = pool.reserve(calls, affinity).await?;
        let wait = match admission {
            Admission::Granted(reservation) => return Ok(reservation),
            Admission::Deferred { .. } => admission.wait_duration(Utc::now()).unwrap_or_default(),
        };

        info!(
            calls = calls,
            wait_secs = wait.as_secs(),
            "Quota exhausted, waiting for window reset"
        );
        pause(wait.max(Duration::from_millis(10)), cancel).await?;
    }
}

/// Sleep unless cancelled first
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(ReplicatorError::Cancelled("cancelled".into()))
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ReplicatorError::Cancelled("cancelled".into())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
