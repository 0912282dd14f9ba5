//! # Weaviate backend
//!
//! [`WeaviateClient`] talks to Weaviate's REST and GraphQL endpoints directly:
//!
//! - `GET  /v1/schema` as a liveness probe,
//! - `GET  /v1/schema/{class}` / `POST /v1/schema` to bootstrap the collection,
//! - `POST /v1/batch/objects` for inserts,
//! - `POST /v1/graphql` with a `nearText` query for retrieval.
//!
//! Vectorisation happens server side (`text2vec-openai`), so the OpenAI key travels
//! in the `X-OpenAI-Api-Key` header. [`WeaviateConnector`] tries an anonymous
//! connection first and then the configured Weaviate API key, under the shared
//! retry policy.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::*;

use crate::config::VectorIndexConfig;
use crate::retry::RetryPolicy;
use crate::vector_store::{
    ChunkRecord, ContextMetadata, ContextResult, IndexConnector, IndexError, VectorIndex,
    reject_empty,
};

const OPENAI_KEY_HEADER: &str = "X-OpenAI-Api-Key";

/// A connected Weaviate instance bound to one collection.
#[derive(Debug, Clone)]
pub struct WeaviateClient {
    http: Client,
    base_url: String,
    class_name: String,
    embedding_model: String,
}

impl WeaviateClient {
    /// Build a client. `api_key` adds a bearer `Authorization` header; `openai_key`
    /// is forwarded for the server-side vectorizer.
    pub fn new(
        config: &VectorIndexConfig,
        api_key: Option<&str>,
        openai_key: Option<&str>,
    ) -> Result<Self, IndexError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {key}"))?);
        }
        if let Some(key) = openai_key.filter(|k| !k.is_empty()) {
            headers.insert(OPENAI_KEY_HEADER, header_value(key)?);
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| IndexError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            class_name: config.class_name.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check the server answers with our credentials.
    pub async fn ping(&self) -> Result<(), IndexError> {
        let response = self.http.get(self.url("/v1/schema")).send().await?;
        check_status(response).await.map(|_| ())
    }

    pub async fn class_exists(&self) -> Result<bool, IndexError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/schema/{}", self.class_name)))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => check_status(response).await.map(|_| false),
        }
    }

    /// Create the collection. Losing a creation race to another process is fine.
    pub async fn create_class(&self) -> Result<(), IndexError> {
        let response = self
            .http
            .post(self.url("/v1/schema"))
            .json(&self.class_definition())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!("Created {} collection", self.class_name);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 422 && body.contains("already exists") {
            info!("{} collection already exists", self.class_name);
            return Ok(());
        }
        Err(IndexError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Make sure the collection exists, creating it if needed.
    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let result = match self.class_exists().await {
            Ok(true) => {
                info!("{} collection already exists", self.class_name);
                Ok(())
            }
            Ok(false) => self.create_class().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            error!("Failed to prepare {} collection: {}", self.class_name, e);
            IndexError::Bootstrap(e.to_string())
        })
    }

    fn class_definition(&self) -> Value {
        let skipped = |name: &str| {
            json!({
                "name": name,
                "dataType": ["text"],
                "moduleConfig": {
                    "text2vec-openai": { "skip": true, "vectorizePropertyName": false }
                }
            })
        };
        json!({
            "class": self.class_name,
            "vectorizer": "text2vec-openai",
            "moduleConfig": {
                "text2vec-openai": {
                    "model": self.embedding_model,
                    "type": "text",
                    "vectorizeClassName": false
                }
            },
            "properties": [
                {
                    "name": "content",
                    "dataType": ["text"],
                    "moduleConfig": {
                        "text2vec-openai": { "skip": false, "vectorizePropertyName": false }
                    }
                },
                skipped("title"),
                skipped("category"),
                skipped("source")
            ]
        })
    }

    fn near_text_query(&self, text: &str, limit: usize) -> Result<String, IndexError> {
        let concept =
            serde_json::to_string(text).map_err(|e| IndexError::InvalidRecord(e.to_string()))?;
        Ok(format!(
            "{{ Get {{ {class}(nearText: {{concepts: [{concept}]}}, limit: {limit}) \
             {{ content category source title _additional {{ distance }} }} }} }}",
            class = self.class_name,
        ))
    }
}

#[async_trait]
impl VectorIndex for WeaviateClient {
    fn name(&self) -> &str {
        "weaviate"
    }

    async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<usize, IndexError> {
        if records.is_empty() {
            return Ok(0);
        }
        reject_empty(records)?;

        let objects: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "class": self.class_name,
                    "id": r.id,
                    "properties": {
                        "content": r.content,
                        "title": r.title,
                        "category": r.category,
                        "source": r.source
                    }
                })
            })
            .collect();

        let response = self
            .http
            .post(self.url("/v1/batch/objects"))
            .json(&json!({ "objects": objects }))
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        let items = body
            .as_array()
            .ok_or_else(|| IndexError::Malformed("batch response is not an array".into()))?;
        let errors: Vec<String> = items.iter().filter_map(item_error).collect();
        let written = items.len().saturating_sub(errors.len());
        debug!("Batch wrote {}/{} objects", written, records.len());

        match errors.into_iter().next() {
            Some(message) => Err(IndexError::Batch {
                written,
                total: records.len(),
                message,
            }),
            None => Ok(written),
        }
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<ContextResult>, IndexError> {
        let query = self.near_text_query(text, limit)?;
        let response = self
            .http
            .post(self.url("/v1/graphql"))
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        parse_query_response(&body, &self.class_name)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, IndexError> {
    HeaderValue::from_str(value)
        .map_err(|e| IndexError::InvalidRecord(format!("invalid header value: {e}")))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, IndexError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IndexError::Status {
        status: status.as_u16(),
        body,
    })
}

/// First error message attached to one batch result item, if any.
fn item_error(item: &Value) -> Option<String> {
    item.pointer("/result/errors/error")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .map(|e| {
            e.get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown batch error")
                .to_string()
        })
}

fn parse_query_response(body: &Value, class_name: &str) -> Result<Vec<ContextResult>, IndexError> {
    if let Some(message) = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Err(IndexError::Malformed(format!("graphql error: {message}")));
    }

    let hits = body
        .get("data")
        .and_then(|d| d.get("Get"))
        .and_then(|g| g.get(class_name))
        .and_then(Value::as_array)
        .ok_or_else(|| IndexError::Malformed(format!("no {class_name} results in response")))?;

    let field = |hit: &Value, name: &str| {
        hit.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(hits
        .iter()
        .map(|hit| ContextResult {
            content: field(hit, "content"),
            metadata: ContextMetadata {
                title: field(hit, "title"),
                category: field(hit, "category"),
                source: field(hit, "source"),
            },
            distance: hit
                .pointer("/_additional/distance")
                .and_then(Value::as_f64)
                .map(|d| d as f32),
        })
        .collect())
}

/// Connects to Weaviate and bootstraps the collection.
pub struct WeaviateConnector {
    config: VectorIndexConfig,
    openai_api_key: Option<String>,
    policy: RetryPolicy,
}

impl WeaviateConnector {
    pub fn new(
        config: VectorIndexConfig,
        openai_api_key: Option<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            config,
            openai_api_key,
            policy,
        }
    }

    async fn try_connect(&self) -> Result<WeaviateClient, IndexError> {
        let openai_key = self.openai_api_key.as_deref();
        let anonymous = WeaviateClient::new(&self.config, None, openai_key)?;
        let anonymous_err = match anonymous.ping().await {
            Ok(()) => {
                info!("Connected to Weaviate at {} anonymously", self.config.url);
                return Ok(anonymous);
            }
            Err(e) => e,
        };

        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(anonymous_err);
        };
        debug!("Anonymous connection failed ({}); trying API key", anonymous_err);
        let keyed = WeaviateClient::new(&self.config, Some(api_key), openai_key)?;
        keyed.ping().await?;
        info!("Connected to Weaviate at {} with API key", self.config.url);
        Ok(keyed)
    }
}

#[async_trait]
impl IndexConnector for WeaviateConnector {
    async fn connect(&self) -> Result<Arc<dyn VectorIndex>, IndexError> {
        let client = match self
            .policy
            .run_with("Weaviate connection", |_: &IndexError| true, |_| self.try_connect())
            .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Weaviate unreachable at {}: {}", self.config.url, e);
                return Err(IndexError::Unavailable);
            }
        };
        client.ensure_collection().await?;
        Ok(Arc::new(client))
    }
}
