//! Health check endpoint
//!
//! `/health`, `/healthz` - liveness probe. Always 200 while the process
//! serves requests; `status` is `degraded` when no credential is registered,
//! since no job can make progress then.

use chrono::Utc;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::{json_response, FullBody};
use crate::server::AppState;

const ACTIVE_JOB_SCAN: usize = 1000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    /// 'online' or 'degraded'
    pub status: &'static str,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub worker_id: String,
    /// Where jobs and credentials are persisted
    pub storage: &'static str,
    pub credentials: usize,
    pub active_jobs: usize,
    pub timestamp: String,
}

pub async fn health_check(state: Arc<AppState>) -> Response<FullBody> {
    let credentials = state.pool.credential_count().await;
    let active_jobs = state
        .tracker
        .list_active(ACTIVE_JOB_SCAN)
        .await
        .map(|jobs| jobs.len())
        .unwrap_or(0);

    let response = HealthResponse {
        healthy: true,
        status: if credentials > 0 { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        worker_id: state.tracker.config().worker_id.clone(),
        storage: state.storage,
        credentials,
        active_jobs,
        timestamp: Utc::now().to_rfc3339(),
    };
    json_response(StatusCode::OK, &response)
}
