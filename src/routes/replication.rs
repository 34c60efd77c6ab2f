//! Replication job endpoints
//!
//! - `POST /replications` - accept a job, reply 202 with its id and estimate
//! - `GET /replications` - list jobs (`?active=true&limit=20`)
//! - `GET /replications/{id}` - status snapshot, `not_found` for unknown ids
//! - `POST /replications/{id}/cancel` - request cancellation

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{error_from, json_response, parse_query, read_json, FullBody};
use crate::jobs::{JobSnapshot, ReplicationRequest};
use crate::server::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub active: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobSnapshot>,
    pub count: usize,
}

pub async fn handle_start(state: Arc<AppState>, req: Request<Incoming>) -> Response<FullBody> {
    let request: ReplicationRequest = match read_json(req).await {
        Ok(request) => request,
        Err(e) => return error_from(e),
    };

    match state.tracker.start(request).await {
        Ok(started) => {
            info!(job_id = %started.job_id, estimated_seconds = started.estimated_seconds, "Replication accepted");
            json_response(StatusCode::ACCEPTED, &started)
        }
        Err(e) => error_from(e),
    }
}

pub async fn handle_status(state: Arc<AppState>, job_id: &str) -> Response<FullBody> {
    match state.tracker.status(job_id).await {
        Ok(lookup) => json_response(StatusCode::OK, &lookup),
        Err(e) => error_from(e),
    }
}

pub async fn handle_cancel(state: Arc<AppState>, job_id: &str) -> Response<FullBody> {
    match state.tracker.cancel(job_id).await {
        Ok(lookup) => json_response(StatusCode::OK, &lookup),
        Err(e) => error_from(e),
    }
}

pub async fn handle_list(state: Arc<AppState>, query: Option<&str>) -> Response<FullBody> {
    let query: ListQuery = match parse_query(query) {
        Ok(q) => q,
        Err(e) => return error_from(e),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match state.tracker.list(query.active.unwrap_or(false), limit).await {
        Ok(jobs) => json_response(
            StatusCode::OK,
            &JobListResponse {
                count: jobs.len(),
                jobs,
            },
        ),
        Err(e) => error_from(e),
    }
}
