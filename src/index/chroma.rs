//! Chroma collection over the v2 HTTP API.
//!
//! All collection routes live under
//! `/api/v2/tenants/{tenant}/databases/{database}/collections`. The
//! collection is resolved by name (created if missing) on first use and its
//! id cached for the lifetime of the client.
//!
//! Requests that fail with HTTP 429, 5xx, or a network error are retried with
//! exponential backoff; other 4xx responses fail immediately. Error messages
//! carry the status code so [`classify_error`](crate::error::classify_error)
//! can tell quota and availability problems from hard failures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{IndexBackend, IndexRecord, RemoteRecord, META_PARENT_ID};
use crate::config::{ChromaConfig, Config};
use crate::embedding::OpenAIProvider;
use crate::error::SyncError;

const PAGE_SIZE: usize = 1000;

pub struct ChromaIndex {
    client: reqwest::Client,
    endpoint: String,
    tenant: String,
    database: String,
    collection: String,
    auth: Option<(String, String)>,
    max_retries: u32,
    backoff: Duration,
    collection_id: OnceCell<String>,
    embedder: Option<OpenAIProvider>,
}

impl ChromaIndex {
    pub fn new(config: &ChromaConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let auth = config.resolve_token().map(|token| {
            let value = if config.token_header.eq_ignore_ascii_case("authorization") {
                format!("Bearer {}", token)
            } else {
                token
            };
            (config.token_header.clone(), value)
        });

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            tenant: config.tenant.clone(),
            database: config.database.clone(),
            collection: config.collection.clone(),
            auth,
            max_retries: config.max_retries,
            backoff: Duration::from_secs(1),
            collection_id: OnceCell::new(),
            embedder: None,
        })
    }

    /// Backend for a full configuration, computing embeddings locally when
    /// the embedding provider asks for it.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut index = Self::new(&config.chroma)?;
        if config.embedding.is_client_side() {
            index.embedder = Some(OpenAIProvider::new(&config.embedding)?);
        }
        Ok(index)
    }

    pub fn with_embedder(mut self, embedder: OpenAIProvider) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Base delay of the retry backoff (doubled per attempt).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Liveness probe of the server.
    pub async fn heartbeat(&self) -> Result<(), SyncError> {
        let url = format!("{}/api/v2/heartbeat", self.endpoint);
        self.request(Method::GET, &url, None).await.map(|_| ())
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/api/v2/tenants/{}/databases/{}/collections",
            self.endpoint, self.tenant, self.database
        )
    }

    async fn collection_url(&self) -> Result<String, SyncError> {
        let id = self
            .collection_id
            .get_or_try_init(|| self.resolve_collection())
            .await?;
        Ok(format!("{}/{}", self.collections_url(), id))
    }

    async fn resolve_collection(&self) -> Result<String, SyncError> {
        let body = json!({ "name": self.collection, "get_or_create": true });
        let resp = self
            .request(Method::POST, &self.collections_url(), Some(&body))
            .await?;
        let id = resp
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::executor("Chroma collection response missing id"))?;
        info!(collection = %self.collection, id = %id, "Resolved Chroma collection");
        Ok(id.to_string())
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), url);
            if let Some((name, value)) = &self.auth {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();

                    if status.is_success() {
                        if text.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_str(&text).map_err(|e| {
                            SyncError::executor(format!("Invalid Chroma response: {}", e))
                        });
                    }

                    let err = SyncError::executor(format!("Chroma API error {}: {}", status, text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(url = %url, status = %status, attempt, "Retrying Chroma request");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    let message = if e.is_timeout() {
                        format!("Chroma request timed out: {}", e)
                    } else {
                        format!("Chroma request failed: {}", e)
                    };
                    last_err = Some(SyncError::executor(message));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| SyncError::executor("Chroma request failed after retries")))
    }
}

#[async_trait]
impl IndexBackend for ChromaIndex {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn ensure_ready(&self) -> Result<(), SyncError> {
        self.collection_url().await.map(|_| ())
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<(), SyncError> {
        if records.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let documents: Vec<&str> = records.iter().map(|r| r.document.as_str()).collect();
        let metadatas: Vec<&Map<String, Value>> = records.iter().map(|r| &r.metadata).collect();
        let mut body = json!({
            "ids": ids,
            "documents": documents,
            "metadatas": metadatas,
        });

        if let Some(embedder) = &self.embedder {
            let texts: Vec<String> = records.iter().map(|r| r.document.clone()).collect();
            let vectors = embedder
                .embed(&texts)
                .await
                .map_err(|e| SyncError::executor(e.to_string()))?;
            body["embeddings"] = json!(vectors);
        }

        let url = format!("{}/upsert", self.collection_url().await?);
        self.request(Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/delete", self.collection_url().await?);
        self.request(Method::POST, &url, Some(&json!({ "ids": ids })))
            .await?;
        Ok(())
    }

    async fn delete_by_parent(&self, parent_id: &str) -> Result<(), SyncError> {
        let url = format!("{}/delete", self.collection_url().await?);
        let mut filter = Map::new();
        filter.insert(META_PARENT_ID.to_string(), Value::String(parent_id.to_string()));
        let body = json!({ "where": filter });
        self.request(Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<RemoteRecord>, SyncError> {
        let url = format!("{}/get", self.collection_url().await?);
        let mut records = Vec::new();
        let mut offset = 0;

        loop {
            let body = json!({
                "limit": PAGE_SIZE,
                "offset": offset,
                "include": ["metadatas"],
            });
            let page = self.request(Method::POST, &url, Some(&body)).await?;
            let ids = page
                .get("ids")
                .and_then(Value::as_array)
                .ok_or_else(|| SyncError::executor("Chroma get response missing ids"))?;
            let metadatas = page.get("metadatas").and_then(Value::as_array);

            for (i, id) in ids.iter().enumerate() {
                let Some(id) = id.as_str() else { continue };
                let metadata = metadatas
                    .and_then(|m| m.get(i))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                records.push(RemoteRecord {
                    id: id.to_string(),
                    metadata,
                });
            }

            if ids.len() < PAGE_SIZE {
                break;
            }
            offset += ids.len();
        }

        debug!(records = records.len(), "Listed Chroma records");
        Ok(records)
    }

    async fn count(&self) -> Result<usize, SyncError> {
        let url = format!("{}/count", self.collection_url().await?);
        let resp = self.request(Method::GET, &url, None).await?;
        resp.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| SyncError::executor(format!("Unexpected Chroma count response: {}", resp)))
    }
}
