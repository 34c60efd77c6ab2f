//! Database layer
//!
//! MongoDB persistence for credentials, scopes, jobs, failures and templates.

pub mod mongo;
pub mod schemas;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection, MutMetadata};
