//! Pipeline entry point.
//!
//! [`PipelineOrchestrator`] validates a request, picks the run mode, builds
//! the per-run components over shared collaborators and packages the
//! engine outcome as a [`PipelineRunResult`].

mod result;

pub use result::*;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{AppError, AppResult};
use crate::generation::{AnswerGenerator, LlmProvider, RetryPolicy};
use crate::reasoning::{
    ChainOfThoughtEngine, EngineOutcome, LexicalEvaluator, Question, ResponseEvaluator,
    RunContext, RunMode,
};
use crate::retrieval::{CollectionRef, Retriever, SearchBackend};

/// Injected collaborators, shared across runs.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn LlmProvider>,
    pub vector: Arc<dyn SearchBackend>,
    pub keyword: Arc<dyn SearchBackend>,
    pub evaluator: Arc<dyn ResponseEvaluator>,
    pub retry: RetryPolicy,
}

impl Collaborators {
    /// Collaborators with the lexical evaluator and default retry policy.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        vector: Arc<dyn SearchBackend>,
        keyword: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            provider,
            vector,
            keyword,
            evaluator: Arc::new(LexicalEvaluator),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ResponseEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Runs questions end to end. Cheap to clone; safe to share between
/// concurrent requests since every run owns its own context.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    collaborators: Collaborators,
}

impl PipelineOrchestrator {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Answer `question` against `collection` under `config`.
    ///
    /// Only invalid input and an outage of every collaborator are errors.
    /// Budget exhaustion, timeouts and step failures all produce a result.
    pub async fn run(
        &self,
        question: &Question,
        collection: &CollectionRef,
        config: &PipelineConfig,
    ) -> AppResult<PipelineRunResult> {
        config.validate()?;
        if question.text().is_empty() {
            return Err(AppError::InvalidRequest {
                message: "question cannot be empty".to_string(),
            });
        }
        if collection.as_str().trim().is_empty() {
            return Err(AppError::InvalidRequest {
                message: "collection cannot be empty".to_string(),
            });
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let config = config.clone();
        let mut ctx = RunContext::new(
            config.token_budget,
            Duration::from_secs(config.timeout_seconds),
        );

        let mode = if config.enable_cot && config.complexity.is_complex(question.text()) {
            RunMode::ChainOfThought
        } else {
            RunMode::Plain
        };

        info!(
            run_id = %run_id,
            mode = %mode,
            collection = %collection,
            strategy = %config.retrieval_strategy,
            budget = config.token_budget,
            "Pipeline run started"
        );

        let retriever = Retriever::new(
            config.retrieval_strategy,
            self.collaborators.vector.clone(),
            self.collaborators.keyword.clone(),
            config.max_top_k,
        );
        let generator = AnswerGenerator::new(
            self.collaborators.provider.clone(),
            self.collaborators.retry,
            config.min_generation_tokens,
        );
        let token_budget = config.token_budget;
        let engine = ChainOfThoughtEngine::new(
            config,
            retriever,
            generator,
            self.collaborators.evaluator.clone(),
        );

        let outcome = engine.run(question, collection, mode, &mut ctx).await;

        if all_backends_down(&outcome, &ctx) {
            error!(
                run_id = %run_id,
                retrieval_failures = ctx.stats.retrieval_failures,
                generation_failures = ctx.stats.generation_failures,
                "Every collaborator call failed"
            );
            return Err(AppError::BackendUnavailable {
                message: format!(
                    "{} retrieval and {} generation calls failed",
                    ctx.stats.retrieval_failures, ctx.stats.generation_failures
                ),
            });
        }

        if ctx.timed_out {
            warn!(run_id = %run_id, "Run reached its deadline, returning partial answer");
        }

        let result = PipelineRunResult {
            run_id,
            question: question.text().to_string(),
            collection: collection.to_string(),
            mode,
            answer: outcome.answer,
            trace: outcome.trace,
            evidence: outcome.evidence,
            fallback: outcome.fallback,
            timed_out: ctx.timed_out,
            confidence: outcome.confidence,
            verdict: outcome.evaluation.as_ref().map(|e| e.verdict),
            low_confidence: outcome.low_confidence,
            token_usage: ctx.budget.usage(),
            token_budget,
            terminal_state: outcome.terminal_state,
            states: outcome.states,
            synthesis_attempts: ctx.stats.synthesis_calls,
            call_stats: ctx.stats,
            evaluation_degraded: outcome.evaluation.as_ref().is_some_and(|e| e.degraded),
            unresolved_citations: outcome.unresolved_citations,
            elapsed_ms: ctx.deadline.elapsed_ms(),
            created_at: Utc::now(),
        };

        info!(
            run_id = %result.run_id,
            terminal = %result.terminal_state,
            steps = result.trace.len(),
            consumed = result.token_usage.consumed,
            confidence = result.confidence,
            fallback = result.fallback,
            elapsed_ms = result.elapsed_ms,
            "Pipeline run finished"
        );

        Ok(result)
    }
}

/// One-shot convenience over [`PipelineOrchestrator::run`].
pub async fn run_pipeline(
    question: &Question,
    collection: &CollectionRef,
    config: &PipelineConfig,
    collaborators: Collaborators,
) -> AppResult<PipelineRunResult> {
    PipelineOrchestrator::new(collaborators)
        .run(question, collection, config)
        .await
}

/// No answer, nothing succeeded, and the run was not cut short by its
/// deadline.
fn all_backends_down(outcome: &EngineOutcome, ctx: &RunContext) -> bool {
    let attempted = ctx.stats.retrieval_calls + ctx.stats.generation_calls;
    outcome.answer.is_empty() && ctx.stats.successful_calls == 0 && !ctx.timed_out && attempted > 0
}
