use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::CollectionRef;
use crate::error::{RetrievalError, RetrievalResult};

/// A raw scored hit from a search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source_id: String,
    pub text: String,
    pub score: f64,
}

/// A searchable document store.
///
/// Implementations return at most `top_k` hits. An unknown or empty
/// collection yields an empty list, not an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(
        &self,
        query: &str,
        collection: &CollectionRef,
        top_k: usize,
    ) -> RetrievalResult<Vec<SearchHit>>;
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Search backend reached over HTTP.
///
/// Calls `POST {base_url}/v1/collections/{collection}/search`, with the
/// collection id percent-encoded.
#[derive(Clone)]
pub struct HttpSearchBackend {
    client: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpSearchBackend {
    /// Create a new HTTP search backend
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        timeout_ms: u64,
    ) -> RetrievalResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(RetrievalError::Http)?;

        Ok(Self {
            client,
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_ms,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/v1/collections/{collection}/search` with the collection id
    /// encoded as a single path segment.
    pub fn search_url(&self, collection: &CollectionRef) -> RetrievalResult<Url> {
        let id = collection.as_str();
        if id == "." || id == ".." {
            return Err(RetrievalError::MalformedQuery {
                message: format!("invalid collection id: {}", id),
            });
        }

        let mut url = Url::parse(&self.base_url)
            .map_err(|e| self.unavailable(format!("invalid base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| self.unavailable("base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(["v1", "collections", id, "search"]);
        Ok(url)
    }

    fn unavailable(&self, message: impl Into<String>) -> RetrievalError {
        RetrievalError::Unavailable {
            backend: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(
        &self,
        query: &str,
        collection: &CollectionRef,
        top_k: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let url = self.search_url(collection)?;
        let start = Instant::now();

        debug!(
            backend = %self.name,
            collection = %collection,
            top_k = top_k,
            "Calling search backend"
        );

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&SearchRequest { query, top_k });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RetrievalError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                self.unavailable(e.to_string())
            }
        })?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            info!(
                backend = %self.name,
                collection = %collection,
                "Collection not found, returning no evidence"
            );
            return Ok(Vec::new());
        }

        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::MalformedQuery { message: body });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                backend = %self.name,
                status = status.as_u16(),
                latency_ms = start.elapsed().as_millis(),
                "Search backend call failed"
            );
            return Err(self.unavailable(format!("{} - {}", status.as_u16(), body)));
        }

        let parsed: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| RetrievalError::InvalidResponse {
                    message: format!("Failed to parse search response: {}", e),
                })?;

        let mut hits = parsed.results;
        hits.truncate(top_k);

        debug!(
            backend = %self.name,
            hits = hits.len(),
            latency_ms = start.elapsed().as_millis(),
            "Search backend call succeeded"
        );

        Ok(hits)
    }
}
