//! Credential Pool - quota ledger over a set of platform credentials
//!
//! Every credential (system user) carries its own hourly call budget. Before any
//! network call the engine asks the pool for capacity; the pool picks the
//! credential with the most headroom that can absorb the call and commits the
//! usage in the same critical section, so two concurrent jobs can never both
//! observe the same headroom.
//!
//! ## Window model
//!
//! Each credential has one [`QuotaWindow`] (`consumed`, `resets_at`). When the
//! wall clock passes `resets_at` the window rolls over: `consumed` drops to
//! zero and a new window of `window_length` starts.
//!
//! ## Reserve and record
//!
//! [`CredentialPool::reserve`] commits the requested calls up front and hands
//! back a [`Reservation`]. [`CredentialPool::record_usage`] then reconciles the
//! reservation with the calls actually made: unused calls are released, extra
//! calls are recorded only up to capacity and the overflow is reported as an
//! internal error.

pub mod store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{ReplicatorError, Result};

pub use store::{InMemoryQuotaStore, MongoQuotaStore, QuotaStore};

/// Default hourly call capacity per credential
pub const DEFAULT_HOURLY_CAPACITY: u32 = 200;

/// Credential status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    #[default]
    Active,
    Suspended,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Suspended => "suspended",
        }
    }
}

/// A platform identity with its own independent call quota
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// External identifier (system user id)
    pub credential_id: String,
    /// Access token
    pub secret: String,
    /// Business scope that owns this credential
    pub owner_scope: String,
    /// Calls allowed per window
    pub hourly_capacity: u32,
    #[serde(default)]
    pub status: CredentialStatus,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("credential_id", &self.credential_id)
            .field("secret", &"<redacted>")
            .field("owner_scope", &self.owner_scope)
            .field("hourly_capacity", &self.hourly_capacity)
            .field("status", &self.status)
            .finish()
    }
}

impl Credential {
    pub fn new(
        credential_id: impl Into<String>,
        secret: impl Into<String>,
        owner_scope: impl Into<String>,
        hourly_capacity: u32,
    ) -> Self {
        Self {
            credential_id: credential_id.into(),
            secret: secret.into(),
            owner_scope: owner_scope.into(),
            hourly_capacity,
            status: CredentialStatus::Active,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.credential_id.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("credential_id is required".into()));
        }
        if self.secret.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("secret is required".into()));
        }
        if self.owner_scope.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("owner_scope is required".into()));
        }
        if self.hourly_capacity == 0 {
            return Err(ReplicatorError::BadRequest(
                "hourly_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// An external scope (ad account) replicas can be created in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalScope {
    /// External identifier, e.g. `act_123`
    pub scope_id: String,
    /// Business scope whose credentials may act on this scope
    pub owner_scope: String,
    /// Credential pinned to this scope, if any
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl ExternalScope {
    fn validate(&self) -> Result<()> {
        if self.scope_id.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("scope_id is required".into()));
        }
        if self.owner_scope.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("owner_scope is required".into()));
        }
        Ok(())
    }
}

/// Calls consumed in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub consumed: u32,
    pub resets_at: DateTime<Utc>,
    /// Bumped on every change; stores keep the highest version they have seen
    #[serde(default)]
    pub version: u64,
}

impl QuotaWindow {
    pub fn fresh(now: DateTime<Utc>, length: ChronoDuration) -> Self {
        Self {
            consumed: 0,
            resets_at: now + length,
            version: 0,
        }
    }

    /// Roll the window over if `now` has passed its reset time
    fn roll(&mut self, now: DateTime<Utc>, length: ChronoDuration) -> bool {
        if now >= self.resets_at {
            self.consumed = 0;
            self.resets_at = now + length;
            true
        } else {
            false
        }
    }
}

/// Which credentials may serve a call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialAffinity {
    /// Only credentials owned by this business scope
    pub owner_scope: Option<String>,
    /// Only this credential
    pub credential_id: Option<String>,
}

impl CredentialAffinity {
    pub fn any() -> Self {
        Self::default()
    }

    fn admits(&self, credential: &Credential) -> bool {
        if let Some(ref id) = self.credential_id {
            if &credential.credential_id != id {
                return false;
            }
        }
        if let Some(ref owner) = self.owner_scope {
            if &credential.owner_scope != owner {
                return false;
            }
        }
        true
    }
}

/// Calls committed against one credential
#[derive(Debug, Clone)]
pub struct Reservation {
    pub credential: Credential,
    pub calls: u32,
    /// Reset time of the window the calls were committed to
    pub window_resets_at: DateTime<Utc>,
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone)]
pub enum Admission {
    Granted(Reservation),
    /// No credential can absorb the call before `retry_at`
    Deferred { retry_at: DateTime<Utc> },
}

impl Admission {
    /// How long to wait before retrying a deferred admission
    pub fn wait_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Admission::Granted(_) => None,
            Admission::Deferred { retry_at } => {
                Some((*retry_at - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Headroom report for one credential (no secrets)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialHeadroom {
    pub credential_id: String,
    pub owner_scope: String,
    pub status: CredentialStatus,
    pub capacity: u32,
    pub consumed: u32,
    pub available: u32,
    pub resets_at: DateTime<Utc>,
}

struct PoolEntry {
    credential: Credential,
    window: QuotaWindow,
}

impl PoolEntry {
    fn headroom(&self) -> u32 {
        self.credential
            .hourly_capacity
            .saturating_sub(self.window.consumed)
    }
}

#[derive(Default)]
struct PoolState {
    credentials: HashMap<String, PoolEntry>,
    scopes: HashMap<String, ExternalScope>,
}

/// Quota ledger over all registered credentials
pub struct CredentialPool {
    state: Mutex<PoolState>,
    store: Arc<dyn QuotaStore>,
    window_length: ChronoDuration,
}

impl CredentialPool {
    /// Create an empty pool
    pub fn new(store: Arc<dyn QuotaStore>, window_length: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            store,
            window_length: ChronoDuration::from_std(window_length)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
        }
    }

    /// Create a pool and load persisted credentials, windows and scopes
    pub async fn load(store: Arc<dyn QuotaStore>, window_length: Duration) -> Result<Self> {
        let pool = Self::new(Arc::clone(&store), window_length);
        let now = Utc::now();

        let credentials = store.load_credentials().await?;
        let scopes = store.load_scopes().await?;
        {
            let mut state = pool.state.lock().await;
            for (credential, window) in credentials {
                let window =
                    window.unwrap_or_else(|| QuotaWindow::fresh(now, pool.window_length));
                state.credentials.insert(
                    credential.credential_id.clone(),
                    PoolEntry { credential, window },
                );
            }
            for scope in scopes {
                state.scopes.insert(scope.scope_id.clone(), scope);
            }
            info!(
                credentials = state.credentials.len(),
                scopes = state.scopes.len(),
                "Credential pool loaded"
            );
        }

        Ok(pool)
    }

    /// Register a credential; duplicates are rejected
    pub async fn register_credential(&self, credential: Credential) -> Result<()> {
        credential.validate()?;
        let mut state = self.state.lock().await;
        if state.credentials.contains_key(&credential.credential_id) {
            return Err(ReplicatorError::Conflict(format!(
                "credential {} already registered",
                credential.credential_id
            )));
        }

        let window = QuotaWindow::fresh(Utc::now(), self.window_length);
        self.store.insert_credential(&credential, &window).await?;

        info!(
            credential = %credential.credential_id,
            owner_scope = %credential.owner_scope,
            capacity = credential.hourly_capacity,
            "Registered credential"
        );
        state.credentials.insert(
            credential.credential_id.clone(),
            PoolEntry { credential, window },
        );
        Ok(())
    }

    /// Register an external scope; duplicates are rejected
    pub async fn register_scope(&self, scope: ExternalScope) -> Result<()> {
        scope.validate()?;
        let mut state = self.state.lock().await;
        if state.scopes.contains_key(&scope.scope_id) {
            return Err(ReplicatorError::Conflict(format!(
                "scope {} already registered",
                scope.scope_id
            )));
        }
        if let Some(ref credential_id) = scope.credential_id {
            if !state.credentials.contains_key(credential_id) {
                return Err(ReplicatorError::BadRequest(format!(
                    "scope {} pins unknown credential {}",
                    scope.scope_id, credential_id
                )));
            }
        }

        self.store.insert_scope(&scope).await?;
        info!(scope = %scope.scope_id, owner_scope = %scope.owner_scope, "Registered external scope");
        state.scopes.insert(scope.scope_id.clone(), scope);
        Ok(())
    }

    /// Look up a registered scope
    pub async fn scope(&self, scope_id: &str) -> Option<ExternalScope> {
        self.state.lock().await.scopes.get(scope_id).cloned()
    }

    /// Affinity for calls made on behalf of a registered scope
    pub async fn affinity_for_scope(&self, scope_id: &str) -> Option<CredentialAffinity> {
        self.scope(scope_id).await.map(|scope| CredentialAffinity {
            owner_scope: Some(scope.owner_scope),
            credential_id: scope.credential_id,
        })
    }

    /// Suspend or reactivate a credential
    pub async fn set_status(&self, credential_id: &str, status: CredentialStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .credentials
            .get_mut(credential_id)
            .ok_or_else(|| ReplicatorError::NotFound(format!("credential {}", credential_id)))?;
        self.store.save_status(credential_id, status).await?;
        entry.credential.status = status;
        info!(credential = %credential_id, status = status.as_str(), "Credential status changed");
        Ok(())
    }

    /// Reserve capacity for `required` calls
    pub async fn reserve(&self, required: u32, affinity: &CredentialAffinity) -> Result<Admission> {
        self.reserve_at(required, affinity, Utc::now()).await
    }

    /// Reserve capacity as of `now`.
    ///
    /// Selection and commit happen under one lock; the window is persisted
    /// after the lock is released.
    pub async fn reserve_at(
        &self,
        required: u32,
        affinity: &CredentialAffinity,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        if required == 0 {
            return Err(ReplicatorError::Internal(
                "reservation of zero calls".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let window_length = self.window_length;

        let mut candidates: Vec<&mut PoolEntry> = state
            .credentials
            .values_mut()
            .filter(|e| e.credential.status == CredentialStatus::Active)
            .filter(|e| affinity.admits(&e.credential))
            .collect();

        if candidates.is_empty() {
            return Err(ReplicatorError::Quota(format!(
                "no active credential matches {:?}",
                affinity
            )));
        }

        for entry in candidates.iter_mut() {
            if entry.window.roll(now, window_length) {
                debug!(credential = %entry.credential.credential_id, "Quota window rolled over");
            }
        }

        let max_capacity = candidates
            .iter()
            .map(|e| e.credential.hourly_capacity)
            .max()
            .unwrap_or(0);
        if required > max_capacity {
            return Err(ReplicatorError::Internal(format!(
                "call of {} exceeds every credential capacity (max {})",
                required, max_capacity
            )));
        }

        let best = candidates
            .into_iter()
            .filter(|e| e.headroom() >= required)
            .max_by(|a, b| {
                a.headroom()
                    .cmp(&b.headroom())
                    .then_with(|| b.credential.credential_id.cmp(&a.credential.credential_id))
            });

        let Some(entry) = best else {
            let retry_at = state
                .credentials
                .values()
                .filter(|e| e.credential.status == CredentialStatus::Active)
                .filter(|e| affinity.admits(&e.credential))
                .map(|e| e.window.resets_at)
                .min()
                .unwrap_or(now + window_length);
            debug!(required = required, retry_at = %retry_at, "Reservation deferred");
            return Ok(Admission::Deferred { retry_at });
        };

        entry.window.consumed += required;
        entry.window.version += 1;
        let reservation = Reservation {
            credential: entry.credential.clone(),
            calls: required,
            window_resets_at: entry.window.resets_at,
        };
        let window = entry.window;
        drop(state);

        if let Err(e) = self
            .store
            .save_window(&reservation.credential.credential_id, &window)
            .await
        {
            warn!(
                credential = %reservation.credential.credential_id,
                error = %e,
                "Failed to persist quota window"
            );
        }

        debug!(
            credential = %reservation.credential.credential_id,
            calls = required,
            consumed = window.consumed,
            "Reserved quota"
        );
        Ok(Admission::Granted(reservation))
    }

    /// Reconcile a reservation with the calls actually made.
    ///
    /// Returns an internal error when `actual` exceeds what the credential can
    /// absorb; the overflow is not recorded.
    pub async fn record_usage(&self, reservation: &Reservation, actual: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let window_length = self.window_length;
        let entry = state
            .credentials
            .get_mut(&reservation.credential.credential_id)
            .ok_or_else(|| {
                ReplicatorError::Internal(format!(
                    "usage recorded for unknown credential {}",
                    reservation.credential.credential_id
                ))
            })?;

        entry.window.roll(Utc::now(), window_length);
        let same_window = entry.window.resets_at == reservation.window_resets_at;

        let mut overflow = 0;
        if actual < reservation.calls {
            if same_window {
                entry.window.consumed = entry
                    .window
                    .consumed
                    .saturating_sub(reservation.calls - actual);
            }
        } else if actual > reservation.calls {
            let extra = actual - reservation.calls;
            let granted = extra.min(entry.headroom());
            entry.window.consumed += granted;
            overflow = extra - granted;
        }

        entry.window.version += 1;
        let window = entry.window;
        let credential_id = entry.credential.credential_id.clone();
        drop(state);

        if let Err(e) = self.store.save_window(&credential_id, &window).await {
            warn!(credential = %credential_id, error = %e, "Failed to persist quota window");
        }

        if overflow > 0 {
            return Err(ReplicatorError::Internal(format!(
                "usage overflow of {} calls on credential {}",
                overflow, credential_id
            )));
        }
        Ok(())
    }

    /// Headroom of every credential as of `now`
    pub async fn snapshot(&self) -> Vec<CredentialHeadroom> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut report: Vec<CredentialHeadroom> = state
            .credentials
            .values()
            .map(|e| {
                let mut window = e.window;
                window.roll(now, self.window_length);
                CredentialHeadroom {
                    credential_id: e.credential.credential_id.clone(),
                    owner_scope: e.credential.owner_scope.clone(),
                    status: e.credential.status,
                    capacity: e.credential.hourly_capacity,
                    consumed: window.consumed,
                    available: e.credential.hourly_capacity.saturating_sub(window.consumed),
                    resets_at: window.resets_at,
                }
            })
            .collect();
        report.sort_by(|a, b| a.credential_id.cmp(&b.credential_id));
        report
    }

    /// Number of registered credentials
    pub async fn credential_count(&self) -> usize {
        self.state.lock().await.credentials.len()
    }
}
