//! Graph-style HTTP client
//!
//! Talks to a Graph API compatible endpoint:
//! - create: `POST /{version}/{owner}/{edge}` with form fields
//! - batch: `POST /{version}/` with a `batch` JSON array whose entries carry
//!   url-encoded bodies; the answer is a parallel array of `{code, body}`
//!   where `body` is itself a JSON string, or `null` for skipped entries
//! - list: `GET /{version}/{parent}/{edge}?fields=id,{child}.limit(0).summary(true)`
//!   following `paging.next`

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use super::{AdPlatform, BatchRequest, BatchResponse, ChildNode, ObjectSpec, PlatformError};
use crate::quota::Credential;
use crate::types::{ReplicatorError, Result};

/// Page size for list calls
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct GraphClientConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl Default for GraphClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v19.0".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct GraphClient {
    client: Client,
    config: GraphClientConfig,
}

#[derive(Debug, Deserialize)]
struct RawBatchEntry {
    code: u16,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

impl GraphClient {
    pub fn new(config: GraphClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ReplicatorError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            path.trim_start_matches('/')
        )
    }

    /// Parse a JSON response, mapping non-2xx answers to platform errors
    async fn read_json(response: Response) -> std::result::Result<Value, PlatformError> {
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport)?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !(200..300).contains(&status) {
            return Err(PlatformError::from_error_body(status, &body));
        }
        if body.is_null() {
            return Err(PlatformError::Malformed(format!("non-JSON response: {}", text)));
        }
        Ok(body)
    }
}

fn transport(error: reqwest::Error) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Timeout
    } else {
        PlatformError::Transport(error.to_string())
    }
}

/// Form fields for a body: strings as-is, everything else JSON-encoded
fn form_fields(body: &Map<String, Value>) -> Vec<(String, String)> {
    body.iter()
        .map(|(key, value)| {
            let encoded = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), encoded)
        })
        .collect()
}

fn child_count(node: &Value, child_edge: &str) -> u32 {
    node.get(child_edge)
        .and_then(|edge| edge.get("summary"))
        .and_then(|summary| summary.get("total_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

#[async_trait]
impl AdPlatform for GraphClient {
    async fn create_object(
        &self,
        credential: &Credential,
        owner: &str,
        spec: &ObjectSpec,
    ) -> std::result::Result<String, PlatformError> {
        let mut form = form_fields(&spec.body);
        form.push(("access_token".into(), credential.secret.clone()));

        let response = self
            .client
            .post(self.url(&format!("{}/{}", owner, spec.edge)))
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        let body = Self::read_json(response).await?;

        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Malformed("create response without id".into()))
    }

    async fn batch(
        &self,
        credential: &Credential,
        requests: &[BatchRequest],
    ) -> std::result::Result<Vec<Option<BatchResponse>>, PlatformError> {
        let mut entries = Vec::with_capacity(requests.len());
        for request in requests {
            let body = serde_urlencoded::to_string(form_fields(&request.body))
                .map_err(|e| PlatformError::Malformed(format!("unencodable body: {}", e)))?;
            let mut entry = Map::new();
            entry.insert("method".into(), Value::String(request.method.clone()));
            entry.insert("relative_url".into(), Value::String(request.relative_url.clone()));
            entry.insert("body".into(), Value::String(body));
            if let Some(ref name) = request.name {
                entry.insert("name".into(), Value::String(name.clone()));
                entry.insert("omit_response_on_success".into(), Value::Bool(false));
            }
            entries.push(Value::Object(entry));
        }

        let form = [
            ("access_token", credential.secret.clone()),
            ("batch", Value::Array(entries).to_string()),
            ("include_headers", "false".to_string()),
        ];
        debug!(operations = requests.len(), "POST batch");

        let response = self
            .client
            .post(self.url(""))
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        let body = Self::read_json(response).await?;

        let raw: Vec<Option<RawBatchEntry>> = serde_json::from_value(body)
            .map_err(|e| PlatformError::Malformed(format!("batch response: {}", e)))?;

        Ok(raw
            .into_iter()
            .map(|entry| {
                entry.map(|e| BatchResponse {
                    code: e.code,
                    body: e
                        .body
                        .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
                        .unwrap_or(Value::Null),
                })
            })
            .collect())
    }

    async fn list_children(
        &self,
        credential: &Credential,
        parent_id: &str,
        edge: &str,
        child_edge: &str,
    ) -> std::result::Result<Vec<ChildNode>, PlatformError> {
        let fields = format!("id,{}.limit(0).summary(true)", child_edge);
        let limit = LIST_PAGE_SIZE.to_string();
        let mut nodes = Vec::new();

        let mut request = self
            .client
            .get(self.url(&format!("{}/{}", parent_id, edge)))
            .query(&[
                ("fields", fields.as_str()),
                ("limit", limit.as_str()),
                ("access_token", credential.secret.as_str()),
            ]);

        loop {
            let response = request.send().await.map_err(transport)?;
            let page: ListPage = serde_json::from_value(Self::read_json(response).await?)
                .map_err(|e| PlatformError::Malformed(format!("list response: {}", e)))?;

            for node in &page.data {
                let Some(id) = node.get("id").and_then(Value::as_str) else {
                    continue;
                };
                nodes.push(ChildNode {
                    id: id.to_string(),
                    child_count: child_count(node, child_edge),
                });
            }

            match page.paging.and_then(|p| p.next) {
                Some(next) if !page.data.is_empty() => request = self.client.get(next),
                _ => break,
            }
        }

        debug!(parent = %parent_id, nodes = nodes.len(), "Listed children");
        Ok(nodes)
    }
}
