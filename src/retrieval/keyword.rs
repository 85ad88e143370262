use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use super::{CollectionRef, SearchBackend, SearchHit};
use crate::error::{AppError, AppResult, RetrievalResult};
use crate::text::content_terms;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// One document in a JSON corpus file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub collection: String,
    pub source_id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    source_id: String,
    text: String,
    term_freqs: HashMap<String, u32>,
    length: usize,
}

#[derive(Debug, Default)]
struct CollectionIndex {
    docs: Vec<IndexedDoc>,
    doc_freqs: HashMap<String, u32>,
    total_length: usize,
}

impl CollectionIndex {
    fn insert(&mut self, source_id: String, text: String) {
        let terms = content_terms(&text);
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for term in &terms {
            *term_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += terms.len();
        self.docs.push(IndexedDoc {
            source_id,
            text,
            term_freqs,
            length: terms.len(),
        });
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// BM25 scores divided by the best score the query terms could reach,
    /// so results land in [0, 1].
    fn search(&self, query: &str, top_k: usize) -> Vec<SearchHit> {
        if self.docs.is_empty() {
            return Vec::new();
        }

        let mut query_terms = content_terms(query);
        query_terms.sort();
        query_terms.dedup();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let avg_len = (self.total_length as f64 / self.docs.len() as f64).max(1.0);
        let idfs: Vec<f64> = query_terms.iter().map(|t| self.idf(t)).collect();
        let ceiling: f64 = idfs.iter().map(|idf| idf * (BM25_K1 + 1.0)).sum();
        if ceiling <= 0.0 {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .docs
            .iter()
            .filter_map(|doc| {
                let raw: f64 = query_terms
                    .iter()
                    .zip(&idfs)
                    .map(|(term, idf)| {
                        let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * doc.length as f64 / avg_len);
                        idf * tf * (BM25_K1 + 1.0) / (tf + norm)
                    })
                    .sum();
                (raw > 0.0).then(|| SearchHit {
                    source_id: doc.source_id.clone(),
                    text: doc.text.clone(),
                    score: (raw / ceiling).min(1.0),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(top_k);
        hits
    }
}

/// In-process BM25 keyword index keyed by collection.
#[derive(Debug, Default)]
pub struct KeywordIndex {
    collections: RwLock<HashMap<String, CollectionIndex>>,
}

impl KeywordIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from corpus entries
    pub fn from_entries(entries: impl IntoIterator<Item = CorpusEntry>) -> Self {
        let mut collections: HashMap<String, CollectionIndex> = HashMap::new();
        for entry in entries {
            collections
                .entry(entry.collection)
                .or_default()
                .insert(entry.source_id, entry.text);
        }
        Self {
            collections: RwLock::new(collections),
        }
    }

    /// Load a JSON array of [`CorpusEntry`] from disk
    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Config {
            message: format!("Failed to read corpus {}: {}", path.display(), e),
        })?;
        let entries: Vec<CorpusEntry> =
            serde_json::from_str(&raw).map_err(|e| AppError::Config {
                message: format!("Failed to parse corpus {}: {}", path.display(), e),
            })?;

        let count = entries.len();
        let index = Self::from_entries(entries);
        info!(path = %path.display(), documents = count, "Keyword corpus loaded");
        Ok(index)
    }

    /// Add a single document
    pub async fn add_document(
        &self,
        collection: &CollectionRef,
        source_id: impl Into<String>,
        text: impl Into<String>,
    ) {
        self.collections
            .write()
            .await
            .entry(collection.as_str().to_string())
            .or_default()
            .insert(source_id.into(), text.into());
    }

    /// Number of documents in a collection
    pub async fn len(&self, collection: &CollectionRef) -> usize {
        self.collections
            .read()
            .await
            .get(collection.as_str())
            .map(|c| c.docs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SearchBackend for KeywordIndex {
    async fn search(
        &self,
        query: &str,
        collection: &CollectionRef,
        top_k: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection.as_str())
            .map(|index| index.search(query, top_k))
            .unwrap_or_default())
    }
}
