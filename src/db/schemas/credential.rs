//! Credential document schema
//!
//! Stores platform credentials together with their current quota window.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::quota::{Credential, CredentialStatus, QuotaWindow};

/// Collection name for credentials
pub const CREDENTIAL_COLLECTION: &str = "credentials";

/// Credential document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CredentialDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// System user id
    pub credential_id: String,

    /// Access token
    pub secret: String,

    pub owner_scope: String,

    pub hourly_capacity: i64,

    #[serde(default)]
    pub status: CredentialStatus,

    /// Calls consumed in the current window
    #[serde(default)]
    pub window_consumed: i64,

    /// When the current window resets
    #[serde(default)]
    pub window_resets_at: Option<DateTime>,

    /// Version of the last saved window
    #[serde(default)]
    pub window_version: i64,
}

impl CredentialDoc {
    pub fn new(credential: &Credential, window: &QuotaWindow) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            credential_id: credential.credential_id.clone(),
            secret: credential.secret.clone(),
            owner_scope: credential.owner_scope.clone(),
            hourly_capacity: credential.hourly_capacity as i64,
            status: credential.status,
            window_consumed: window.consumed as i64,
            window_resets_at: Some(DateTime::from_chrono(window.resets_at)),
            window_version: window.version as i64,
        }
    }

    /// Split into the credential and its persisted window, if any
    pub fn into_parts(self) -> (Credential, Option<QuotaWindow>) {
        let capacity = u32::try_from(self.hourly_capacity).unwrap_or(0);
        let window = self.window_resets_at.map(|resets_at| QuotaWindow {
            consumed: u32::try_from(self.window_consumed)
                .unwrap_or(0)
                .min(capacity),
            resets_at: resets_at.to_chrono(),
            version: u64::try_from(self.window_version).unwrap_or(0),
        });
        let credential = Credential {
            credential_id: self.credential_id,
            secret: self.secret,
            owner_scope: self.owner_scope,
            hourly_capacity: capacity,
            status: self.status,
        };
        (credential, window)
    }
}

impl IntoIndexes for CredentialDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "credential_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("credential_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "owner_scope": 1 },
                Some(
                    IndexOptions::builder()
                        .name("owner_scope_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for CredentialDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_into_parts_clamps_consumed_to_capacity() {
        let credential = Credential::new("su-1", "tok", "biz", 100);
        let mut doc = CredentialDoc::new(&credential, &QuotaWindow::fresh(Utc::now(), Duration::hours(1)));
        doc.window_consumed = 250;

        let (credential, window) = doc.into_parts();
        assert_eq!(credential.hourly_capacity, 100);
        assert_eq!(window.map(|w| w.consumed), Some(100));
    }
}
