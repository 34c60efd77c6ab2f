//! In-process advertising platform
//!
//! Keeps objects in memory and answers the create, batch and list endpoints
//! the way the Graph API does, including named back-references inside a
//! batch and `null` entries for operations whose dependency failed. Failure
//! rules inject platform errors per edge and scope. Used in dev mode and by
//! the test suites.

use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{AdPlatform, BatchRequest, BatchResponse, ChildNode, ObjectSpec, PlatformError};
use crate::quota::Credential;

const FIRST_ID: u64 = 120_000_000_000_000;

/// Injects an error into creates on one edge
#[derive(Debug, Clone)]
pub struct FailureRule {
    pub edge: String,
    /// Only creates under this owner
    pub owner: Option<String>,
    /// Remaining matches; `None` fails forever
    pub remaining: Option<u32>,
    pub error: PlatformError,
    /// Create the object anyway and still report the error
    pub materialize: bool,
}

impl FailureRule {
    pub fn new(edge: impl Into<String>, error: PlatformError) -> Self {
        Self {
            edge: edge.into(),
            owner: None,
            remaining: None,
            error,
            materialize: false,
        }
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn in_scope(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn materialize(mut self) -> Self {
        self.materialize = true;
        self
    }

    fn matches(&self, owner: &str, edge: &str) -> bool {
        self.remaining != Some(0)
            && self.edge == edge
            && self.owner.as_deref().map_or(true, |o| o == owner)
    }
}

#[derive(Debug, Clone)]
struct SimObject {
    owner: String,
    edge: String,
    /// Ids of existing objects referenced from top-level body fields
    links: Vec<String>,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    objects: HashMap<String, SimObject>,
    rules: Vec<FailureRule>,
    batch_failures: VecDeque<PlatformError>,
}

/// Simulated advertising platform
#[derive(Default)]
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
    batch_calls: AtomicU64,
    create_calls: AtomicU64,
    list_calls: AtomicU64,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an object directly, bypassing rules and counters
    pub fn seed_object(&self, owner: &str, edge: &str, body: Map<String, Value>) -> String {
        self.state().insert(owner, edge, &body)
    }

    pub fn add_rule(&self, rule: FailureRule) {
        self.state().rules.push(rule);
    }

    /// Fail the next batch calls as a whole, one error per call
    pub fn fail_next_batches(&self, errors: Vec<PlatformError>) {
        self.state().batch_failures.extend(errors);
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::Relaxed)
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// Objects on `edge`, across all owners
    pub fn object_count(&self, edge: &str) -> usize {
        self.state().objects.values().filter(|o| o.edge == edge).count()
    }

    /// Objects on `edge` under `owner`
    pub fn objects_in(&self, owner: &str, edge: &str) -> usize {
        self.state()
            .objects
            .values()
            .filter(|o| o.edge == edge && o.owner == owner)
            .count()
    }
}

impl SimState {
    fn insert(&mut self, owner: &str, edge: &str, body: &Map<String, Value>) -> String {
        let id = (FIRST_ID + self.next_id).to_string();
        self.next_id += 1;

        let links = body
            .values()
            .filter_map(Value::as_str)
            .filter(|v| self.objects.contains_key(*v))
            .map(str::to_string)
            .collect();
        self.objects.insert(
            id.clone(),
            SimObject {
                owner: owner.to_string(),
                edge: edge.to_string(),
                links,
            },
        );
        id
    }

    fn create(&mut self, owner: &str, edge: &str, body: &Map<String, Value>) -> Result<String, PlatformError> {
        if let Some(rule) = self.rules.iter_mut().find(|r| r.matches(owner, edge)) {
            if let Some(ref mut remaining) = rule.remaining {
                *remaining -= 1;
            }
            let error = rule.error.clone();
            if rule.materialize {
                self.insert(owner, edge, body);
            }
            return Err(error);
        }
        Ok(self.insert(owner, edge, body))
    }
}

fn error_entry(error: &PlatformError) -> BatchResponse {
    let (code, body) = match error {
        PlatformError::Api {
            status,
            code,
            subcode,
            transient,
            message,
        } => (
            *status,
            json!({ "error": {
                "message": message,
                "code": code,
                "error_subcode": subcode,
                "is_transient": transient,
            }}),
        ),
        other => (
            500,
            json!({ "error": { "message": other.to_string(), "code": 2, "is_transient": true }}),
        ),
    };
    BatchResponse { code, body }
}

/// Substitute `{result=<name>:$.id}` references; `None` if a reference is unresolved
fn resolve_references(body: &Map<String, Value>, named: &HashMap<String, String>) -> Option<Map<String, Value>> {
    let mut resolved = Map::new();
    for (key, value) in body {
        let value = match value.as_str().and_then(parse_reference) {
            Some(name) => Value::String(named.get(name)?.clone()),
            None => value.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    Some(resolved)
}

fn parse_reference(value: &str) -> Option<&str> {
    value
        .strip_prefix("{result=")?
        .strip_suffix(":$.id}")
}

#[async_trait::async_trait]
impl AdPlatform for SimulatedPlatform {
    async fn create_object(
        &self,
        _credential: &Credential,
        owner: &str,
        spec: &ObjectSpec,
    ) -> Result<String, PlatformError> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        self.state().create(owner, &spec.edge, &spec.body)
    }

    async fn batch(
        &self,
        _credential: &Credential,
        requests: &[BatchRequest],
    ) -> Result<Vec<Option<BatchResponse>>, PlatformError> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if let Some(error) = state.batch_failures.pop_front() {
            return Err(error);
        }

        let mut named: HashMap<String, String> = HashMap::new();
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let Some((owner, edge)) = request.owner_and_edge() else {
                responses.push(Some(error_entry(&PlatformError::Api {
                    status: 400,
                    code: Some(100),
                    subcode: None,
                    transient: None,
                    message: format!("Unknown path {}", request.relative_url),
                })));
                continue;
            };
            let Some(body) = resolve_references(&request.body, &named) else {
                responses.push(None);
                continue;
            };

            match state.create(owner, edge, &body) {
                Ok(id) => {
                    if let Some(ref name) = request.name {
                        named.insert(name.clone(), id.clone());
                    }
                    responses.push(Some(BatchResponse {
                        code: 200,
                        body: json!({ "id": id }),
                    }));
                }
                Err(error) => responses.push(Some(error_entry(&error))),
            }
        }
        Ok(responses)
    }

    async fn list_children(
        &self,
        _credential: &Credential,
        parent_id: &str,
        edge: &str,
        child_edge: &str,
    ) -> Result<Vec<ChildNode>, PlatformError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state();
        if !state.objects.contains_key(parent_id) {
            return Err(PlatformError::Api {
                status: 400,
                code: Some(100),
                subcode: Some(33),
                transient: None,
                message: format!("Object {} does not exist", parent_id),
            });
        }

        let mut nodes: Vec<ChildNode> = state
            .objects
            .iter()
            .filter(|(_, o)| o.edge == edge && o.links.iter().any(|l| l == parent_id))
            .map(|(id, _)| ChildNode {
                id: id.clone(),
                child_count: state
                    .objects
                    .values()
                    .filter(|c| c.edge == child_edge && c.links.iter().any(|l| l == id))
                    .count() as u32,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential::new("su-1", "tok", "biz", 200)
    }

    fn request(name: Option<&str>, url: &str, body: Value) -> BatchRequest {
        BatchRequest {
            method: "POST".into(),
            relative_url: url.into(),
            name: name.map(String::from),
            body: body.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_batch_resolves_references_and_nulls_dependents() {
        let platform = SimulatedPlatform::new();
        let campaign = platform.seed_object("act_1", "campaigns", Map::new());
        platform.add_rule(FailureRule::new("adsets", PlatformError::Api {
            status: 400,
            code: Some(100),
            subcode: None,
            transient: None,
            message: "Invalid targeting".into(),
        }).times(1));

        let requests = vec![
            request(Some("p0"), "act_1/adsets", json!({ "campaign_id": campaign })),
            request(None, "act_1/ads", json!({ "adset_id": "{result=p0:$.id}" })),
            request(Some("p1"), "act_1/adsets", json!({ "campaign_id": campaign })),
            request(None, "act_1/ads", json!({ "adset_id": "{result=p1:$.id}" })),
        ];
        let responses = platform.batch(&credential(), &requests).await.unwrap();

        assert_eq!(responses[0].as_ref().map(|r| r.code), Some(400));
        assert!(responses[1].is_none());
        assert!(responses[2].as_ref().and_then(|r| r.created_id()).is_some());
        assert!(responses[3].as_ref().and_then(|r| r.created_id()).is_some());

        let nodes = platform
            .list_children(&credential(), &campaign, "adsets", "ads")
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].child_count, 1);
    }

    #[tokio::test]
    async fn test_materialized_failure_still_creates() {
        let platform = SimulatedPlatform::new();
        platform.add_rule(FailureRule::new("adsets", PlatformError::Timeout).times(1).materialize());

        let result = platform
            .create_object(&credential(), "act_1", &ObjectSpec::new("adsets"))
            .await;
        assert_eq!(result, Err(PlatformError::Timeout));
        assert_eq!(platform.object_count("adsets"), 1);
    }

    #[tokio::test]
    async fn test_list_unknown_parent_fails() {
        let platform = SimulatedPlatform::new();
        let result = platform
            .list_children(&credential(), "404", "adsets", "ads")
            .await;
        assert!(matches!(result, Err(PlatformError::Api { code: Some(100), .. })));
    }
}
