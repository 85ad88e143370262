//! LLM generation under a token budget.
//!
//! [`AnswerGenerator`] wraps an injected [`LlmProvider`] with budget
//! reservation, bounded retry with exponential backoff, and deadline checks.

mod budget;

pub use budget::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RequestConfig;
use crate::error::{BudgetExceeded, GenerationError, GenerationResult};
use crate::reasoning::RunContext;

/// What a provider call is for. Providers may route purposes to different
/// models or pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Decompose,
    Rewrite,
    StepAnswer,
    Synthesis,
    Judge,
}

impl CallPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPurpose::Decompose => "decompose",
            CallPurpose::Rewrite => "rewrite",
            CallPurpose::StepAnswer => "step_answer",
            CallPurpose::Synthesis => "synthesis",
            CallPurpose::Judge => "judge",
        }
    }
}

impl std::fmt::Display for CallPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single provider request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub purpose: CallPurpose,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Provider output with the tokens it consumed (prompt and completion).
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u32,
}

/// An LLM completion service.
///
/// One call is one attempt; retries are the generator's concern.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> GenerationResult<Completion>;
}

/// Bounded retry with exponential backoff.
///
/// `call_timeout_ms` bounds each provider attempt on its own; the run
/// deadline is only consulted before an attempt starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            call_timeout_ms: 30000,
        }
    }
}

impl From<&RequestConfig> for RetryPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_delay_ms,
            call_timeout_ms: config.timeout_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * 2_u64.pow(retry.saturating_sub(1)))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// A generation call as planned by the engine.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub purpose: CallPurpose,
    pub prompt: String,
    pub max_tokens: u32,
    /// Tokens that must stay unreserved after this call (synthesis headroom).
    pub keep_in_reserve: u32,
}

impl GenerationRequest {
    pub fn new(purpose: CallPurpose, prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            purpose,
            prompt: prompt.into(),
            max_tokens,
            keep_in_reserve: 0,
        }
    }

    pub fn with_reserve(mut self, tokens: u32) -> Self {
        self.keep_in_reserve = tokens;
        self
    }
}

/// Result of a successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Tokens charged to the budget.
    pub tokens_used: u32,
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Budgeted, retrying front for an [`LlmProvider`].
#[derive(Clone)]
pub struct AnswerGenerator {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    min_tokens: u32,
}

impl AnswerGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryPolicy, min_tokens: u32) -> Self {
        Self {
            provider,
            retry,
            min_tokens,
        }
    }

    /// Smallest completion this generator will start.
    pub fn min_tokens(&self) -> u32 {
        self.min_tokens
    }

    /// Run one generation against the run's budget and deadline.
    ///
    /// The budget must cover the estimated prompt plus `min_tokens` beyond
    /// `keep_in_reserve`, otherwise no call is made.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        ctx: &mut RunContext,
    ) -> GenerationResult<Generation> {
        if ctx.deadline_passed() {
            return Err(GenerationError::DeadlineReached);
        }

        let prompt_tokens = estimate_tokens(&request.prompt);
        let remaining = ctx.budget.remaining();
        let available = remaining.saturating_sub(request.keep_in_reserve);
        let required = prompt_tokens + self.min_tokens;
        if available < required {
            debug!(
                purpose = %request.purpose,
                required = required,
                available = available,
                "Skipping generation, budget exhausted"
            );
            return Err(BudgetExceeded {
                requested: required + request.keep_in_reserve,
                remaining,
            }
            .into());
        }

        let grant = request
            .max_tokens
            .max(self.min_tokens)
            .min(available - prompt_tokens);
        let reservation = ctx.budget.reserve(prompt_tokens + grant)?;

        ctx.stats.generation_calls += 1;
        match request.purpose {
            CallPurpose::Decompose => ctx.stats.decomposition_calls += 1,
            CallPurpose::Rewrite => ctx.stats.rewrite_calls += 1,
            CallPurpose::StepAnswer => ctx.stats.step_answer_calls += 1,
            CallPurpose::Synthesis => ctx.stats.synthesis_calls += 1,
            CallPurpose::Judge => ctx.stats.judge_calls += 1,
        }

        let start = Instant::now();
        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retry.max_retries {
            if attempts > 0 {
                let delay = self.retry.delay_for(attempts);
                warn!(
                    purpose = %request.purpose,
                    retry = attempts,
                    delay_ms = delay.as_millis(),
                    "Retrying provider call"
                );
                tokio::time::sleep(delay).await;
                if ctx.deadline_passed() {
                    break;
                }
            }

            attempts += 1;
            ctx.stats.provider_attempts += 1;

            let call = self.provider.complete(CompletionRequest {
                purpose: request.purpose,
                prompt: request.prompt.clone(),
                max_tokens: grant,
            });

            let outcome = match tokio::time::timeout(self.retry.call_timeout(), call).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::ProviderTimeout {
                    timeout_ms: self.retry.call_timeout_ms,
                }),
            };

            match outcome {
                Ok(completion) => {
                    if ctx.deadline_passed() {
                        debug!(
                            purpose = %request.purpose,
                            "Provider call finished after the run deadline"
                        );
                    }
                    let charged = ctx.budget.settle(reservation, completion.tokens_used);
                    ctx.stats.successful_calls += 1;
                    let latency_ms = start.elapsed().as_millis() as u64;
                    info!(
                        purpose = %request.purpose,
                        tokens = charged,
                        attempts = attempts,
                        latency_ms = latency_ms,
                        "Generation succeeded"
                    );
                    return Ok(Generation {
                        text: completion.text.trim().to_string(),
                        tokens_used: charged,
                        attempts,
                        latency_ms,
                    });
                }
                Err(e) => {
                    error!(
                        purpose = %request.purpose,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = attempts - 1,
                        "Provider call failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        ctx.budget.release(reservation);
        ctx.stats.generation_failures += 1;

        if ctx.timed_out && attempts <= self.retry.max_retries {
            return Err(GenerationError::DeadlineReached);
        }

        Err(GenerationError::RetriesExhausted {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            call_timeout_ms: 1000,
        }
    }

    fn generator(provider: MockLlmProvider) -> AnswerGenerator {
        AnswerGenerator::new(Arc::new(provider), fast_retry(), 16)
    }

    fn context(budget: u32) -> RunContext {
        RunContext::new(budget, Duration::from_secs(30))
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            call_timeout_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_from_request_config() {
        let policy = RetryPolicy::from(&RequestConfig::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_generate_settles_actual_usage() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().times(1).returning(|_| {
            Ok(Completion {
                text: "  Paris  ".to_string(),
                tokens_used: 40,
            })
        });

        let mut ctx = context(1000);
        let generation = generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 200),
                &mut ctx,
            )
            .await
            .unwrap();

        assert_eq!(generation.text, "Paris");
        assert_eq!(generation.tokens_used, 40);
        assert_eq!(ctx.budget.consumed(), 40);
        assert_eq!(ctx.budget.remaining(), 960);
        assert_eq!(ctx.stats.step_answer_calls, 1);
        assert_eq!(ctx.stats.successful_calls, 1);
    }

    #[tokio::test]
    async fn test_generate_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GenerationError::ProviderTimeout { timeout_ms: 10 })
            } else {
                Ok(Completion {
                    text: "ok".to_string(),
                    tokens_used: 5,
                })
            }
        });

        let mut ctx = context(1000);
        let generation = generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::Synthesis, "prompt", 100),
                &mut ctx,
            )
            .await
            .unwrap();

        assert_eq!(generation.attempts, 3);
        assert_eq!(ctx.stats.provider_attempts, 3);
        assert_eq!(ctx.stats.generation_calls, 1);
    }

    #[tokio::test]
    async fn test_generate_gives_up_after_three_attempts() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().times(3).returning(|_| {
            Err(GenerationError::Provider {
                message: "503".to_string(),
            })
        });

        let mut ctx = context(1000);
        let err = generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 100),
                &mut ctx,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GenerationError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(ctx.budget.consumed(), 0);
        assert_eq!(ctx.budget.remaining(), 1000);
        assert_eq!(ctx.stats.generation_failures, 1);
    }

    #[tokio::test]
    async fn test_generate_skipped_when_budget_short() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().never();

        let mut ctx = context(10);
        let err = generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 100),
                &mut ctx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Budget(_)));
        assert_eq!(ctx.stats.generation_calls, 0);
    }

    #[tokio::test]
    async fn test_generate_honours_reserve() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().never();

        // 100 available, but 90 must stay free for synthesis
        let mut ctx = context(100);
        let err = generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 50).with_reserve(90),
                &mut ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Budget(_)));
    }

    #[tokio::test]
    async fn test_grant_capped_by_available_budget() {
        let mut provider = MockLlmProvider::new();
        provider
            .expect_complete()
            .withf(|req| req.max_tokens == 48)
            .times(1)
            .returning(|req| {
                Ok(Completion {
                    text: "short".to_string(),
                    tokens_used: req.max_tokens,
                })
            });

        // "prompt" estimates to 2 tokens; 50 remain, so 48 can be granted
        let mut ctx = context(50);
        generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 500),
                &mut ctx,
            )
            .await
            .unwrap();
        assert!(ctx.budget.consumed() <= 50);
    }

    #[tokio::test]
    async fn test_generate_refused_after_deadline() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().never();

        let mut ctx = RunContext::new(1000, Duration::ZERO);
        let err = generator(provider)
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 100),
                &mut ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::DeadlineReached));
        assert!(ctx.timed_out);
    }

    struct SlowProvider {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn complete(&self, _request: CompletionRequest) -> GenerationResult<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Completion {
                text: "late but valid".to_string(),
                tokens_used: 12,
            })
        }
    }

    fn slow(delay_ms: u64) -> Arc<SlowProvider> {
        Arc::new(SlowProvider {
            delay: Duration::from_millis(delay_ms),
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_in_flight_call_outlives_run_deadline() {
        let provider = slow(150);
        let generator = AnswerGenerator::new(provider.clone(), fast_retry(), 16);

        let mut ctx = RunContext::new(1000, Duration::from_millis(40));
        let generation = generator
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 100),
                &mut ctx,
            )
            .await
            .unwrap();

        assert_eq!(generation.text, "late but valid");
        assert_eq!(ctx.budget.consumed(), 12);
        assert!(ctx.timed_out);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failed_attempt() {
        let provider = slow(200);
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1,
            call_timeout_ms: 30,
        };
        let generator = AnswerGenerator::new(provider.clone(), policy, 16);

        let mut ctx = context(1000);
        let err = generator
            .generate(
                GenerationRequest::new(CallPurpose::StepAnswer, "prompt", 100),
                &mut ctx,
            )
            .await
            .unwrap_err();

        match err {
            GenerationError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("30ms"));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(!ctx.timed_out);
        assert_eq!(ctx.budget.consumed(), 0);
    }
}
