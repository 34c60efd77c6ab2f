//! Operator endpoints
//!
//! Credential and scope registration, the quota headroom report, the active
//! selection switch, template storage and failure ledger queries.

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::{error_from, json_response, parse_query, read_json, FullBody};
use crate::ledger::{FailureQuery, FailureRecord};
use crate::quota::{Credential, CredentialHeadroom, ExternalScope};
use crate::selection::SelectionOverride;
use crate::server::AppState;
use crate::templates::Template;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRegistered {
    pub credential_id: String,
    pub owner_scope: String,
    pub hourly_capacity: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialListResponse {
    pub credentials: Vec<CredentialHeadroom>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureListResponse {
    pub failures: Vec<FailureRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStored {
    pub template_ref: String,
    pub scope_id: String,
}

// ===== Credentials =====

pub async fn handle_register_credential(state: Arc<AppState>, req: Request<Incoming>) -> Response<FullBody> {
    let credential: Credential = match read_json(req).await {
        Ok(c) => c,
        Err(e) => return error_from(e),
    };
    let registered = CredentialRegistered {
        credential_id: credential.credential_id.clone(),
        owner_scope: credential.owner_scope.clone(),
        hourly_capacity: credential.hourly_capacity,
    };

    match state.pool.register_credential(credential).await {
        Ok(()) => json_response(StatusCode::CREATED, &registered),
        Err(e) => error_from(e),
    }
}

pub async fn handle_list_credentials(state: Arc<AppState>) -> Response<FullBody> {
    let credentials = state.pool.snapshot().await;
    json_response(
        StatusCode::OK,
        &CredentialListResponse {
            count: credentials.len(),
            credentials,
        },
    )
}

// ===== Scopes =====

pub async fn handle_register_scope(state: Arc<AppState>, req: Request<Incoming>) -> Response<FullBody> {
    let scope: ExternalScope = match read_json(req).await {
        Ok(s) => s,
        Err(e) => return error_from(e),
    };

    match state.pool.register_scope(scope.clone()).await {
        Ok(()) => json_response(StatusCode::CREATED, &scope),
        Err(e) => error_from(e),
    }
}

// ===== Selection =====

pub async fn handle_switch_selection(state: Arc<AppState>, req: Request<Incoming>) -> Response<FullBody> {
    let selection: SelectionOverride = match read_json(req).await {
        Ok(s) => s,
        Err(e) => return error_from(e),
    };
    state.selection.switch(selection.clone()).await;
    json_response(StatusCode::OK, &selection)
}

// ===== Templates =====

pub async fn handle_store_template(state: Arc<AppState>, req: Request<Incoming>) -> Response<FullBody> {
    let template: Template = match read_json(req).await {
        Ok(t) => t,
        Err(e) => return error_from(e),
    };
    let stored = TemplateStored {
        template_ref: template.template_ref.clone(),
        scope_id: template.scope_id.clone(),
    };

    match state.templates.save(template).await {
        Ok(()) => {
            info!(template_ref = %stored.template_ref, scope_id = %stored.scope_id, "Template stored");
            json_response(StatusCode::CREATED, &stored)
        }
        Err(e) => error_from(e),
    }
}

// ===== Failure ledger =====

pub async fn handle_query_failures(state: Arc<AppState>, query: Option<&str>) -> Response<FullBody> {
    let query: FailureQuery = match parse_query(query) {
        Ok(q) => q,
        Err(e) => return error_from(e),
    };

    // Pending writes first, so a job's failures are visible right after it ends
    state.ledger.flush().await;
    match state.ledger.query(&query).await {
        Ok(failures) => json_response(
            StatusCode::OK,
            &FailureListResponse {
                count: failures.len(),
                failures,
            },
        ),
        Err(e) => error_from(e),
    }
}
