//! Replicator - bulk replication engine for rate-limited advertising platforms
//!
//! Turns one template resource (a parent object with one child) into N
//! copies, inside its own ad account or fanned out to many, while spending a
//! pool of per-credential hourly call quotas.
//!
//! ## Layers
//!
//! - **Quota**: credential pool with rolling windows and atomic reservations
//! - **Dispatch**: batch planning, response parsing and quota-gated calls
//! - **Strategies**: batch, sequential and adaptive replication
//! - **Recovery**: authoritative recount and sequential deficit filling
//! - **Fan-out**: one template deployed to many external scopes
//! - **Jobs**: durable, leased background jobs with status polling
//! - **Ledger**: every failure as a queryable record

pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod fanout;
pub mod jobs;
pub mod ledger;
pub mod platform;
pub mod quota;
pub mod recovery;
pub mod retry;
pub mod routes;
pub mod selection;
pub mod server;
pub mod strategy;
pub mod templates;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{ReplicatorError, Result};
