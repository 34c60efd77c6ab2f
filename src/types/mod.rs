//! Shared types

pub mod error;

pub use error::{ReplicatorError, Result};
