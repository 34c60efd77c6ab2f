//! Database schemas for the replicator
//!
//! Defines MongoDB document structures for credentials, scopes, templates,
//! jobs, and failure records.

mod credential;
mod failure;
mod job;
mod metadata;
mod scope;
mod template;

pub use credential::{CredentialDoc, CREDENTIAL_COLLECTION};
pub use failure::{FailureDoc, FAILURE_COLLECTION};
pub use job::{JobDoc, JOB_COLLECTION};
pub use metadata::Metadata;
pub use scope::{ScopeDoc, SCOPE_COLLECTION};
pub use template::{TemplateDoc, TEMPLATE_COLLECTION};
