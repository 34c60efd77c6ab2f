//! External scope document schema

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::quota::ExternalScope;

/// Collection name for external scopes
pub const SCOPE_COLLECTION: &str = "external_scopes";

/// External scope (ad account) document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScopeDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub scope_id: String,

    pub owner_scope: String,

    /// Credential pinned to this scope
    #[serde(default)]
    pub credential_id: Option<String>,

    #[serde(default)]
    pub label: Option<String>,
}

impl ScopeDoc {
    pub fn new(scope: &ExternalScope) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            scope_id: scope.scope_id.clone(),
            owner_scope: scope.owner_scope.clone(),
            credential_id: scope.credential_id.clone(),
            label: scope.label.clone(),
        }
    }

    pub fn into_scope(self) -> ExternalScope {
        ExternalScope {
            scope_id: self.scope_id,
            owner_scope: self.owner_scope,
            credential_id: self.credential_id,
            label: self.label,
        }
    }
}

impl IntoIndexes for ScopeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "scope_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("scope_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ScopeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
