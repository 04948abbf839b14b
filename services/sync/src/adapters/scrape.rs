//! services/sync/src/adapters/scrape.rs
//!
//! An adapter that implements the `ScrapeService` port by calling the backend's
//! hosted scraping function over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use spirit_core::ports::{PortError, PortResult, ScrapeService};
use std::time::Duration;
use tracing::{debug, warn};

/// What the scraping function answers with.
#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    success: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl ScrapeResponse {
    fn into_result(self) -> PortResult<serde_json::Value> {
        if self.success {
            Ok(self.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(PortError::Unexpected(
                self.error.unwrap_or_else(|| "scrape failed".to_string()),
            ))
        }
    }
}

pub struct HttpScrapeAdapter {
    client: reqwest::Client,
    function_url: String,
    api_key: Option<String>,
}

impl HttpScrapeAdapter {
    pub fn new(function_url: &str, api_key: Option<String>) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self {
            client,
            function_url: function_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ScrapeService for HttpScrapeAdapter {
    async fn scrape(&self, url: &str) -> PortResult<serde_json::Value> {
        debug!(%url, "Requesting scrape");
        let mut request = self
            .client
            .post(&self.function_url)
            .json(&serde_json::json!({ "url": url }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Scrape request failed: {}", e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PortError::Unauthorized);
        }

        let body: ScrapeResponse = response
            .json()
            .await
            .map_err(|e| PortError::Decode(format!("Invalid scrape response: {}", e)))?;
        let result = body.into_result();
        if let Err(e) = &result {
            warn!(%url, "Scrape failed: {}", e);
        }
        result
    }
}
