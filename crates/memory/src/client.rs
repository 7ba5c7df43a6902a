//! HTTP client for the external semantic-memory service.
//!
//! The store is an external collaborator; its only contract here is a
//! `POST /search` endpoint. Failures degrade to empty results — a missing
//! memory service must never break the chat pipeline.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreHit {
    pub text: String,
    #[serde(default)]
    pub score: f32,
    /// `core`, `semantic`, `episodic`, … — `core` earns a source bonus.
    #[serde(default)]
    pub tier: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<StoreHit>,
}

#[derive(Debug, Clone)]
pub struct SemanticClient {
    client: reqwest::Client,
    base_url: String,
}

impl SemanticClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Vec<StoreHit> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "query": query, "limit": limit });

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "semantic store unreachable — continuing without memories");
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "semantic store search failed");
            return Vec::new();
        }
        match response.json::<SearchResponse>().await {
            Ok(parsed) => parsed.results,
            Err(err) => {
                warn!(%err, "semantic store returned malformed JSON");
                Vec::new()
            }
        }
    }
}
