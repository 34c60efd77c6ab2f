//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Every replication call is
//! request/accept: the handler hands back a job id and the work continues on
//! the tracker's workers.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::jobs::JobTracker;
use crate::ledger::FailureLedger;
use crate::quota::CredentialPool;
use crate::routes;
use crate::selection::SelectionState;
use crate::templates::TemplateSource;
use crate::types::ReplicatorError;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Accepts, runs and reports replication jobs
    pub tracker: Arc<JobTracker>,
    /// Credentials, scopes and quota windows
    pub pool: Arc<CredentialPool>,
    pub templates: Arc<dyn TemplateSource>,
    /// Switched account/pixel configuration
    pub selection: Arc<SelectionState>,
    pub ledger: FailureLedger,
    /// "mongodb" or "memory"
    pub storage: &'static str,
    pub started_at: Instant,
}

/// Run the HTTP server until `shutdown` fires
pub async fn run(state: Arc<AppState>, shutdown: CancellationToken) -> Result<(), ReplicatorError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Replicator listening on {} as worker {}",
        state.args.listen,
        state.tracker.config().worker_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("HTTP server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Health check
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(Arc::clone(&state)).await,

        // ===== Replication jobs =====
        (Method::POST, "/replications") => routes::handle_start(Arc::clone(&state), req).await,
        (Method::GET, "/replications") => {
            routes::handle_list(Arc::clone(&state), query.as_deref()).await
        }
        (Method::POST, p) if p.starts_with("/replications/") && p.ends_with("/cancel") => {
            match job_id_segment(p.trim_end_matches("/cancel")) {
                Some(job_id) => routes::handle_cancel(Arc::clone(&state), job_id).await,
                None => not_found_response(p),
            }
        }
        (Method::GET, p) if p.starts_with("/replications/") => match job_id_segment(p) {
            Some(job_id) => routes::handle_status(Arc::clone(&state), job_id).await,
            None => not_found_response(p),
        },

        // ===== Administration =====
        (Method::POST, "/admin/credentials") => {
            routes::handle_register_credential(Arc::clone(&state), req).await
        }
        (Method::GET, "/admin/credentials") => routes::handle_list_credentials(Arc::clone(&state)).await,
        (Method::POST, "/admin/scopes") => routes::handle_register_scope(Arc::clone(&state), req).await,
        (Method::POST, "/admin/selection") => {
            routes::handle_switch_selection(Arc::clone(&state), req).await
        }
        (Method::POST, "/admin/templates") => routes::handle_store_template(Arc::clone(&state), req).await,
        (Method::GET, "/admin/failures") => {
            routes::handle_query_failures(Arc::clone(&state), query.as_deref()).await
        }

        (_, p) => not_found_response(p),
    };

    Ok(to_boxed(response))
}

/// `/replications/{id}` -> `{id}`
fn job_id_segment(path: &str) -> Option<&str> {
    path.strip_prefix("/replications/")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    routes::error_response(StatusCode::NOT_FOUND, &format!("no route for {}", path), Some("NOT_FOUND"))
}

/// Convert a Full<Bytes> response to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_segment() {
        assert_eq!(job_id_segment("/replications/abc"), Some("abc"));
        assert_eq!(job_id_segment("/replications/"), None);
        assert_eq!(job_id_segment("/replications/abc/extra"), None);
        assert_eq!(
            job_id_segment("/replications/abc/cancel".trim_end_matches("/cancel")),
            Some("abc")
        );
    }
}
