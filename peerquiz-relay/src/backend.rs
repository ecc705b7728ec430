//! Backend Read Client
//!
//! The relay never talks SQL: on a cache miss the read routes fetch
//! from the backend store's REST surface through this client. The
//! fetcher is a trait so tests can count fetches without a network.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::{ApiError, ApiResult};

/// Seam between the cache-fronted routes and the backend store.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    /// Fetch the rows of `table` scoped to one question.
    async fn fetch(&self, table: &str, question_id: &str) -> ApiResult<JsonValue>;
}

/// HTTP implementation backed by reqwest.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Build a client whose every request carries the configured fetch
    /// timeout, so a stalled backend surfaces as an error, not a hang.
    pub fn new(config: &RelayConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.backend_fetch_timeout)
            .build()
            .map_err(|e| ApiError::internal_error(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.backend_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QueryFetcher for BackendClient {
    async fn fetch(&self, table: &str, question_id: &str) -> ApiResult<JsonValue> {
        let url = format!("{}/{}", self.base_url, table);
        debug!(%url, question_id, "backend fetch");
        let response = self
            .http
            .get(&url)
            .query(&[("question_id", question_id)])
            .send()
            .await?
            .error_for_status()
            .map_err(ApiError::from)?;
        let value = response.json::<JsonValue>().await?;
        Ok(value)
    }
}
