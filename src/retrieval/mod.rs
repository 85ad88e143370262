//! Evidence retrieval.
//!
//! This module provides:
//! - [`EvidenceChunk`]: a scored span of source text
//! - [`RetrievalStrategy`]: vector, keyword or weighted hybrid retrieval
//! - [`Retriever`]: strategy dispatch over injected [`SearchBackend`]s
//! - [`HttpSearchBackend`] and [`KeywordIndex`] backend implementations
//!
//! Ordering contract: results are sorted by descending relevance score, ties
//! broken by ascending source id.

mod backend;
mod keyword;

pub use backend::*;
pub use keyword::*;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{RetrievalError, RetrievalResult};

/// Opaque handle naming a document collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionRef(String);

impl CollectionRef {
    /// Create a collection reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the collection id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Which retrieval path produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTag {
    /// Vector-similarity search.
    Vector,
    /// Lexical keyword search.
    Keyword,
    /// Weighted combination of both.
    Hybrid,
}

impl StrategyTag {
    /// Get the tag name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::Vector => "vector",
            StrategyTag::Keyword => "keyword",
            StrategyTag::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scored span of source text. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceChunk {
    /// Source document identifier.
    pub source_id: String,
    /// The retrieved text span.
    pub text: String,
    /// Relevance score (0.0-1.0).
    pub score: f64,
    /// Retrieval strategy that produced this chunk.
    pub strategy: StrategyTag,
}

impl EvidenceChunk {
    /// Create a chunk, clamping the score into [0, 1]
    pub fn new(
        source_id: impl Into<String>,
        text: impl Into<String>,
        score: f64,
        strategy: StrategyTag,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            score: clamp_score(score),
            strategy,
        }
    }
}

/// Shared reference to an evidence chunk; steps reuse chunks without copying.
pub type EvidenceRef = Arc<EvidenceChunk>;

/// Weights for hybrid retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    /// Weight of the vector-similarity score.
    pub vector: f64,
    /// Weight of the keyword score.
    pub keyword: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            keyword: 0.3,
        }
    }
}

impl HybridWeights {
    /// Check that weights are non-negative and not both zero
    pub fn validate(&self) -> Result<(), String> {
        if self.vector < 0.0
            || self.keyword < 0.0
            || !self.vector.is_finite()
            || !self.keyword.is_finite()
        {
            return Err("hybrid weights must be finite and non-negative".to_string());
        }
        if self.vector + self.keyword <= 0.0 {
            return Err("hybrid weights must not both be zero".to_string());
        }
        Ok(())
    }

    /// Weights scaled to sum to 1.
    pub fn normalized(&self) -> (f64, f64) {
        let total = self.vector + self.keyword;
        if total <= 0.0 {
            return (0.5, 0.5);
        }
        (self.vector / total, self.keyword / total)
    }
}

/// Retrieval strategy, resolved once per run from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Vector-similarity search only.
    Vector,
    /// Keyword search only.
    Keyword,
    /// Weighted linear combination of vector and keyword scores.
    Hybrid(HybridWeights),
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        RetrievalStrategy::Hybrid(HybridWeights::default())
    }
}

impl RetrievalStrategy {
    /// Get the strategy name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Vector => "vector",
            RetrievalStrategy::Keyword => "keyword",
            RetrievalStrategy::Hybrid(_) => "hybrid",
        }
    }
}

impl std::fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vector" => Ok(RetrievalStrategy::Vector),
            "keyword" => Ok(RetrievalStrategy::Keyword),
            "hybrid" => Ok(RetrievalStrategy::Hybrid(HybridWeights::default())),
            _ => Err(format!("Unknown retrieval strategy: {}", s)),
        }
    }
}

/// Strategy dispatch over the injected search backends.
#[derive(Clone)]
pub struct Retriever {
    strategy: RetrievalStrategy,
    vector: Arc<dyn SearchBackend>,
    keyword: Arc<dyn SearchBackend>,
    max_top_k: usize,
}

impl Retriever {
    /// Create a retriever for one run
    pub fn new(
        strategy: RetrievalStrategy,
        vector: Arc<dyn SearchBackend>,
        keyword: Arc<dyn SearchBackend>,
        max_top_k: usize,
    ) -> Self {
        Self {
            strategy,
            vector,
            keyword,
            max_top_k: max_top_k.max(1),
        }
    }

    /// The resolved strategy.
    pub fn strategy(&self) -> RetrievalStrategy {
        self.strategy
    }

    /// Retrieve ranked evidence for `query`.
    ///
    /// `top_k` is capped at the configured maximum. Each backend call is
    /// bounded by `timeout`. An empty collection yields an empty list.
    pub async fn retrieve(
        &self,
        query: &str,
        collection: &CollectionRef,
        top_k: usize,
        timeout: Duration,
    ) -> RetrievalResult<Vec<EvidenceRef>> {
        if query.trim().is_empty() {
            return Err(RetrievalError::MalformedQuery {
                message: "query cannot be empty".to_string(),
            });
        }

        let top_k = top_k.clamp(1, self.max_top_k);
        let start = Instant::now();

        debug!(
            strategy = %self.strategy,
            collection = %collection,
            top_k = top_k,
            "Retrieving evidence"
        );

        let chunks = match self.strategy {
            RetrievalStrategy::Vector => {
                let hits =
                    search_with_timeout(self.vector.as_ref(), query, collection, top_k, timeout)
                        .await?;
                tag_hits(hits, StrategyTag::Vector)
            }
            RetrievalStrategy::Keyword => {
                let hits =
                    search_with_timeout(self.keyword.as_ref(), query, collection, top_k, timeout)
                        .await?;
                tag_hits(hits, StrategyTag::Keyword)
            }
            RetrievalStrategy::Hybrid(weights) => {
                self.hybrid(query, collection, top_k, timeout, weights).await?
            }
        };

        let ranked = rank_chunks(chunks, top_k);

        info!(
            strategy = %self.strategy,
            collection = %collection,
            results = ranked.len(),
            latency_ms = start.elapsed().as_millis(),
            "Retrieval completed"
        );

        Ok(ranked.into_iter().map(Arc::new).collect())
    }

    async fn hybrid(
        &self,
        query: &str,
        collection: &CollectionRef,
        top_k: usize,
        timeout: Duration,
        weights: HybridWeights,
    ) -> RetrievalResult<Vec<EvidenceChunk>> {
        let (vector, keyword) = tokio::join!(
            search_with_timeout(self.vector.as_ref(), query, collection, top_k, timeout),
            search_with_timeout(self.keyword.as_ref(), query, collection, top_k, timeout),
        );

        let (vector_hits, keyword_hits) = match (vector, keyword) {
            (Ok(v), Ok(k)) => (v, k),
            (Ok(v), Err(e)) => {
                warn!(error = %e, "Keyword side of hybrid retrieval failed, using vector only");
                (v, Vec::new())
            }
            (Err(e), Ok(k)) => {
                warn!(error = %e, "Vector side of hybrid retrieval failed, using keyword only");
                (Vec::new(), k)
            }
            (Err(e), Err(_)) => return Err(e),
        };

        Ok(fuse_hybrid(vector_hits, keyword_hits, weights))
    }
}

async fn search_with_timeout(
    backend: &dyn SearchBackend,
    query: &str,
    collection: &CollectionRef,
    top_k: usize,
    timeout: Duration,
) -> RetrievalResult<Vec<SearchHit>> {
    match tokio::time::timeout(timeout, backend.search(query, collection, top_k)).await {
        Ok(result) => result,
        Err(_) => Err(RetrievalError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn tag_hits(hits: Vec<SearchHit>, tag: StrategyTag) -> Vec<EvidenceChunk> {
    hits.into_iter()
        .map(|h| EvidenceChunk::new(h.source_id, h.text, h.score, tag))
        .collect()
}

/// Weighted linear combination of vector and keyword hits.
///
/// The same chunk (source id and text) returned by both backends gets
/// `w_v * s_v + w_k * s_k`; a chunk seen by one side only scores 0 on the other.
pub fn fuse_hybrid(
    vector_hits: Vec<SearchHit>,
    keyword_hits: Vec<SearchHit>,
    weights: HybridWeights,
) -> Vec<EvidenceChunk> {
    let (wv, wk) = weights.normalized();
    let mut order: Vec<(String, String)> = Vec::new();
    let mut scores: HashMap<(String, String), (f64, f64)> = HashMap::new();

    for (hits, is_vector) in [(vector_hits, true), (keyword_hits, false)] {
        for hit in hits {
            let key = (hit.source_id, hit.text);
            let entry = scores.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (0.0, 0.0)
            });
            let score = clamp_score(hit.score);
            if is_vector {
                entry.0 = entry.0.max(score);
            } else {
                entry.1 = entry.1.max(score);
            }
        }
    }

    order
        .into_iter()
        .map(|key| {
            let (sv, sk) = scores[&key];
            EvidenceChunk::new(key.0, key.1, wv * sv + wk * sk, StrategyTag::Hybrid)
        })
        .collect()
}

/// Total order: descending score, then ascending source id.
pub fn compare_chunks(a: &EvidenceChunk, b: &EvidenceChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.source_id.cmp(&b.source_id))
}

/// Sort by [`compare_chunks`] and keep the first `top_k`.
pub fn rank_chunks(mut chunks: Vec<EvidenceChunk>, top_k: usize) -> Vec<EvidenceChunk> {
    chunks.sort_by(compare_chunks);
    chunks.truncate(top_k);
    chunks
}

/// Deduplicate by source id keeping the highest score per source, ranked.
pub fn dedupe_by_source<'a, I>(chunks: I) -> Vec<EvidenceRef>
where
    I: IntoIterator<Item = &'a EvidenceRef>,
{
    let mut best: HashMap<&str, &EvidenceRef> = HashMap::new();
    for chunk in chunks {
        match best.get(chunk.source_id.as_str()) {
            Some(existing) if existing.score >= chunk.score => {}
            _ => {
                best.insert(chunk.source_id.as_str(), chunk);
            }
        }
    }

    let mut deduped: Vec<EvidenceRef> = best.into_values().cloned().collect();
    deduped.sort_by(|a, b| compare_chunks(a, b));
    deduped
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
