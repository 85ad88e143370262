//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rag_cot::error::{
    EvaluationError, GenerationError, GenerationResult, RetrievalError, RetrievalResult,
};
use rag_cot::generation::{
    AnswerGenerator, CallPurpose, Completion, CompletionRequest, LlmProvider, RetryPolicy,
};
use rag_cot::pipeline::{Collaborators, PipelineOrchestrator};
use rag_cot::reasoning::{EvaluationInput, ResponseEvaluator, RunContext, Score, ScorerKind};
use rag_cot::retrieval::{CollectionRef, SearchBackend, SearchHit};

/// What the scripted provider does for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Text { text: String, tokens: u32 },
    Fail,
}

impl Reply {
    pub fn text(text: &str, tokens: u32) -> Self {
        Reply::Text {
            text: text.to_string(),
            tokens,
        }
    }
}

/// LLM provider that answers from per-purpose scripts.
///
/// Queued replies are consumed first; afterwards the purpose's default reply
/// repeats. A purpose with no script fails.
#[derive(Default)]
pub struct ScriptedProvider {
    defaults: Mutex<HashMap<CallPurpose, Reply>>,
    queues: Mutex<HashMap<CallPurpose, VecDeque<Reply>>>,
    calls: Mutex<HashMap<CallPurpose, u32>>,
    prompts: Mutex<Vec<(CallPurpose, String)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, purpose: CallPurpose, text: &str, tokens: u32) -> Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(purpose, Reply::text(text, tokens));
        self
    }

    pub fn fail(self, purpose: CallPurpose) -> Self {
        self.defaults.lock().unwrap().insert(purpose, Reply::Fail);
        self
    }

    pub fn then(self, purpose: CallPurpose, reply: Reply) -> Self {
        self.queues
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Provider attempts for `purpose`, retries included.
    pub fn calls(&self, purpose: CallPurpose) -> u32 {
        self.calls.lock().unwrap().get(&purpose).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn prompts(&self, purpose: CallPurpose) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == purpose)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> GenerationResult<Completion> {
        *self.calls.lock().unwrap().entry(request.purpose).or_insert(0) += 1;
        self.prompts
            .lock()
            .unwrap()
            .push((request.purpose, request.prompt.clone()));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(|q| q.pop_front());
        let reply = queued.or_else(|| self.defaults.lock().unwrap().get(&request.purpose).cloned());

        match reply {
            Some(Reply::Text { text, tokens }) => Ok(Completion {
                text,
                tokens_used: tokens,
            }),
            Some(Reply::Fail) | None => Err(GenerationError::Provider {
                message: format!("scripted failure for {}", request.purpose),
            }),
        }
    }
}

/// Search backend serving fixed hits, optionally failing on chosen calls.
///
/// Routes registered with [`ScriptedBackend::route`] take precedence: the
/// first whose marker appears in the lowercased query supplies the hits.
pub struct ScriptedBackend {
    hits: Vec<SearchHit>,
    routes: Vec<(String, Vec<SearchHit>)>,
    delay: Option<Duration>,
    fail_on: HashSet<u32>,
    always_fail: bool,
    calls: AtomicU32,
    queries: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            routes: Vec::new(),
            delay: None,
            fail_on: HashSet::new(),
            always_fail: false,
            calls: AtomicU32::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn route(mut self, marker: &str, hits: Vec<SearchHit>) -> Self {
        self.routes.push((marker.to_lowercase(), hits));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the given calls, counted from 1.
    pub fn fail_on(mut self, calls: &[u32]) -> Self {
        self.fail_on = calls.iter().copied().collect();
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchBackend for ScriptedBackend {
    async fn search(
        &self,
        query: &str,
        _collection: &CollectionRef,
        top_k: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.queries.lock().unwrap().push(query.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail || self.fail_on.contains(&call) {
            return Err(RetrievalError::Unavailable {
                backend: "scripted".to_string(),
                message: format!("scripted failure on call {}", call),
            });
        }
        let lowered = query.to_lowercase();
        let hits = self
            .routes
            .iter()
            .find(|(marker, _)| lowered.contains(marker.as_str()))
            .map(|(_, hits)| hits)
            .unwrap_or(&self.hits);
        Ok(hits.iter().take(top_k).cloned().collect())
    }
}

/// Evaluator returning scripted scores in order; the last one repeats.
pub struct ScriptedEvaluator {
    scores: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    calls: AtomicU32,
}

impl ScriptedEvaluator {
    pub fn new(scores: &[f64]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            last: Mutex::new(scores.last().copied().unwrap_or(1.0)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(&[0.95])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseEvaluator for ScriptedEvaluator {
    async fn score(
        &self,
        _input: EvaluationInput<'_>,
        _generator: &AnswerGenerator,
        _ctx: &mut RunContext,
    ) -> Result<Score, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = self
            .scores
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.last.lock().unwrap());
        Ok(Score {
            value,
            feedback: None,
            scorer: ScorerKind::Custom,
        })
    }
}

pub fn hit(source_id: &str, text: &str, score: f64) -> SearchHit {
    SearchHit {
        source_id: source_id.to_string(),
        text: text.to_string(),
        score,
    }
}

/// The store policy corpus most scenarios retrieve from.
pub fn policy_hits() -> Vec<SearchHit> {
    vec![
        hit(
            "refund-policy",
            "Laptops can be returned for a full refund within 30 days of delivery.",
            0.92,
        ),
        hit(
            "warranty-policy",
            "Laptops carry a two year limited warranty covering manufacturing defects.",
            0.81,
        ),
    ]
}

/// Backend that answers refund queries with the refund policy only and
/// warranty queries with the warranty policy only.
pub fn split_policy_backend() -> ScriptedBackend {
    let hits = policy_hits();
    ScriptedBackend::new(hits.clone())
        .route("refund", vec![hits[0].clone()])
        .route("warranty", vec![hits[1].clone()])
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        call_timeout_ms: 5000,
    }
}

/// Orchestrator over scripted doubles; the backend serves both retrieval paths.
pub fn orchestrator(
    provider: Arc<ScriptedProvider>,
    backend: Arc<ScriptedBackend>,
    evaluator: Arc<dyn ResponseEvaluator>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        Collaborators::new(provider, backend.clone(), backend)
            .with_evaluator(evaluator)
            .with_retry(fast_retry()),
    )
}

pub fn collection() -> CollectionRef {
    CollectionRef::new("store-policies")
}
