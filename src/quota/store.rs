//! Persistence for credentials, quota windows and external scopes
//!
//! Quota resets are wall-clock based, so windows must survive a restart;
//! otherwise a restarted process would hand out a fresh budget that the
//! platform has already counted.
//!
//! The pool saves windows outside its lock, so saves can land out of order.
//! A store ignores a window whose version is not newer than the stored one.

use bson::{doc, DateTime as BsonDateTime};
use dashmap::DashMap;

use super::{Credential, CredentialStatus, ExternalScope, QuotaWindow};
use crate::db::schemas::{CredentialDoc, ScopeDoc, CREDENTIAL_COLLECTION, SCOPE_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::types::Result;

/// Storage backend for the credential pool
#[async_trait::async_trait]
pub trait QuotaStore: Send + Sync {
    /// All credentials with their last persisted window
    async fn load_credentials(&self) -> Result<Vec<(Credential, Option<QuotaWindow>)>>;

    async fn load_scopes(&self) -> Result<Vec<ExternalScope>>;

    async fn insert_credential(&self, credential: &Credential, window: &QuotaWindow) -> Result<()>;

    async fn insert_scope(&self, scope: &ExternalScope) -> Result<()>;

    /// Persist `window` unless a newer version is already stored
    async fn save_window(&self, credential_id: &str, window: &QuotaWindow) -> Result<()>;

    async fn save_status(&self, credential_id: &str, status: CredentialStatus) -> Result<()>;
}

// ============================================================================
// In-Memory Store (for testing/local development)
// ============================================================================

/// Process-local quota store
#[derive(Default)]
pub struct InMemoryQuotaStore {
    credentials: DashMap<String, (Credential, QuotaWindow)>,
    scopes: DashMap<String, ExternalScope>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last persisted window of a credential
    pub fn window(&self, credential_id: &str) -> Option<QuotaWindow> {
        self.credentials.get(credential_id).map(|entry| entry.1)
    }
}

#[async_trait::async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn load_credentials(&self) -> Result<Vec<(Credential, Option<QuotaWindow>)>> {
        Ok(self
            .credentials
            .iter()
            .map(|entry| (entry.0.clone(), Some(entry.1)))
            .collect())
    }

    async fn load_scopes(&self) -> Result<Vec<ExternalScope>> {
        Ok(self.scopes.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn insert_credential(&self, credential: &Credential, window: &QuotaWindow) -> Result<()> {
        self.credentials
            .insert(credential.credential_id.clone(), (credential.clone(), *window));
        Ok(())
    }

    async fn insert_scope(&self, scope: &ExternalScope) -> Result<()> {
        self.scopes.insert(scope.scope_id.clone(), scope.clone());
        Ok(())
    }

    async fn save_window(&self, credential_id: &str, window: &QuotaWindow) -> Result<()> {
        if let Some(mut entry) = self.credentials.get_mut(credential_id) {
            if window.version > entry.1.version {
                entry.1 = *window;
            }
        }
        Ok(())
    }

    async fn save_status(&self, credential_id: &str, status: CredentialStatus) -> Result<()> {
        if let Some(mut entry) = self.credentials.get_mut(credential_id) {
            entry.0.status = status;
        }
        Ok(())
    }
}

// ============================================================================
// MongoDB Store
// ============================================================================

/// MongoDB-backed quota store
pub struct MongoQuotaStore {
    credentials: MongoCollection<CredentialDoc>,
    scopes: MongoCollection<ScopeDoc>,
}

impl MongoQuotaStore {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            credentials: mongo.collection::<CredentialDoc>(CREDENTIAL_COLLECTION).await?,
            scopes: mongo.collection::<ScopeDoc>(SCOPE_COLLECTION).await?,
        })
    }
}

#[async_trait::async_trait]
impl QuotaStore for MongoQuotaStore {
    async fn load_credentials(&self) -> Result<Vec<(Credential, Option<QuotaWindow>)>> {
        let docs = self.credentials.find_many(doc! {}).await?;
        Ok(docs.into_iter().map(CredentialDoc::into_parts).collect())
    }

    async fn load_scopes(&self) -> Result<Vec<ExternalScope>> {
        let docs = self.scopes.find_many(doc! {}).await?;
        Ok(docs.into_iter().map(ScopeDoc::into_scope).collect())
    }

    async fn insert_credential(&self, credential: &Credential, window: &QuotaWindow) -> Result<()> {
        self.credentials
            .insert_one(CredentialDoc::new(credential, window))
            .await?;
        Ok(())
    }

    async fn insert_scope(&self, scope: &ExternalScope) -> Result<()> {
        self.scopes.insert_one(ScopeDoc::new(scope)).await?;
        Ok(())
    }

    async fn save_window(&self, credential_id: &str, window: &QuotaWindow) -> Result<()> {
        self.credentials
            .update_one(
                doc! {
                    "credential_id": credential_id,
                    "$or": [
                        { "window_version": { "$lt": window.version as i64 } },
                        { "window_version": { "$exists": false } },
                    ],
                },
                doc! {
                    "$set": {
                        "window_consumed": window.consumed as i64,
                        "window_resets_at": BsonDateTime::from_chrono(window.resets_at),
                        "window_version": window.version as i64,
                        "metadata.updated_at": BsonDateTime::now(),
                    }
                },
            )
            .await?;
        Ok(())
    }

    async fn save_status(&self, credential_id: &str, status: CredentialStatus) -> Result<()> {
        self.credentials
            .update_one(
                doc! { "credential_id": credential_id },
                doc! {
                    "$set": {
                        "status": status.as_str(),
                        "metadata.updated_at": BsonDateTime::now(),
                    }
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_stale_window_save_is_ignored() {
        let store = InMemoryQuotaStore::new();
        let credential = Credential::new("su-1", "tok", "biz", 100);
        let fresh = QuotaWindow::fresh(Utc::now(), Duration::hours(1));
        store.insert_credential(&credential, &fresh).await.unwrap();

        let older = QuotaWindow {
            consumed: 4,
            version: 1,
            ..fresh
        };
        let newer = QuotaWindow {
            consumed: 9,
            version: 2,
            ..fresh
        };
        store.save_window("su-1", &newer).await.unwrap();
        store.save_window("su-1", &older).await.unwrap();

        assert_eq!(store.window("su-1"), Some(newer));
    }
}
