//! HTTP client for the remote blob store.
//!
//! The store is an opaque key-value service holding JSON blobs:
//!
//! | Request | Meaning |
//! |---------|---------|
//! | `GET /fields/{key}` | read a whole field (`404` = absent) |
//! | `PUT /fields/{key}` | replace a whole field |
//! | `GET /logs/{collection}` | read the operation log of a collection |
//! | `POST /logs/{collection}` | append one operation; `2xx` is the acknowledgement |

use super::encoding::{field_path, log_path};
use opsync_core::{Collection, Operation};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Remote store client configuration.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Base URL of the store (e.g., <http://localhost:8090>)
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Optional bearer token passed through to the store
    pub bearer_token: Option<String>,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            timeout: Duration::from_secs(30),
            bearer_token: None,
        }
    }
}

/// Client for whole-field reads and writes against the remote store.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: Client,
    config: RemoteStoreConfig,
}

impl RemoteStore {
    /// Create a new remote store client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(config: RemoteStoreConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn field_url(&self, key: &str) -> String {
        self.url(&field_path(key))
    }

    fn log_url(&self, collection: &Collection) -> String {
        self.url(&log_path(collection))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))
    }

    async fn ensure_success(response: Response) -> Result<Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(ClientError::ApiError {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }

    /// Read a whole field.
    ///
    /// Returns `None` if the field has never been written.
    ///
    /// # Errors
    ///
    /// Returns error on network or API errors.
    pub async fn get_field(&self, key: &str) -> Result<Option<Value>, ClientError> {
        let url = self.field_url(key);
        tracing::debug!(key, url, "GET field");

        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Self::ensure_success(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(|e| ClientError::Parse(e.to_string()))
    }

    /// Replace a whole field.
    ///
    /// # Errors
    ///
    /// Returns error on network or API errors.
    pub async fn put_field(&self, key: &str, value: &Value) -> Result<(), ClientError> {
        let url = self.field_url(key);
        tracing::debug!(key, url, "PUT field");

        let response = self.send(self.client.put(&url).json(value)).await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Append an operation to its collection's log.
    ///
    /// Resolves only once the store acknowledged the write.
    ///
    /// # Errors
    ///
    /// Returns error on network or API errors.
    pub async fn append_operation(&self, op: &Operation) -> Result<(), ClientError> {
        let url = self.log_url(op.target());
        tracing::debug!(op_id = %op.id(), url, "POST operation");

        let response = self.send(self.client.post(&url).json(op)).await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// Read every operation logged for `collection`.
    ///
    /// Entries that do not decode are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error on network or API errors.
    pub async fn load_operations(
        &self,
        collection: &Collection,
    ) -> Result<Vec<Operation>, ClientError> {
        let url = self.log_url(collection);
        tracing::debug!(%collection, url, "GET operation log");

        let response = self.send(self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let body: Value = Self::ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;

        Ok(decode_operation_log(body))
    }
}

/// Decode an operation log body, dropping malformed entries.
///
/// Accepts a bare array or an object wrapping it in `result`.
#[must_use]
pub fn decode_operation_log(body: Value) -> Vec<Operation> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => match obj.remove("result") {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Operation>(entry) {
            Ok(op) => Some(op),
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed operation in remote log");
                None
            }
        })
        .collect()
}

/// Errors that can occur with the remote store client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
    /// HTTP request failed
    #[error("request error: {0}")]
    Request(String),
    /// Store returned an error status
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the store
        message: String,
    },
    /// Response parsing failed
    #[error("parse error: {0}")]
    Parse(String),
}
