//! Chain-of-thought state machine.
//!
//! `Decomposing -> ExecutingStep(i)* -> Aggregating -> Evaluating` ends in
//! `Accepted`, `Exhausted` or `Fallback`. An evaluator retry re-enters
//! `Aggregating -> Evaluating` once. Fallback is terminal: once entered no
//! further plan step runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    enforce_closure, DecomposedStep, Evaluation, EvaluationInput, LexicalEvaluator, Question,
    QueryRewriter, QuestionDecomposer, ReasoningStepResult, ResponseEvaluator, RunContext,
    StepStatus, Verdict, VerdictPolicy,
};
use crate::config::PipelineConfig;
use crate::error::{GenerationError, RetrievalError, RetrievalResult};
use crate::generation::{AnswerGenerator, CallPurpose, GenerationRequest};
use crate::prompts::{step_request, synthesis_request, SubAnswer};
use crate::retrieval::{compare_chunks, dedupe_by_source, CollectionRef, EvidenceRef, Retriever};

const DEFAULT_RETRY_FEEDBACK: &str =
    "Ground every claim in the evidence and cite the supporting source ids.";

/// Engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Decomposing,
    ExecutingStep(usize),
    Aggregating,
    Evaluating,
    Accepted,
    Fallback,
    Exhausted,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Accepted | EngineState::Fallback | EngineState::Exhausted
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Decomposing => "decomposing",
            EngineState::ExecutingStep(_) => "executing_step",
            EngineState::Aggregating => "aggregating",
            EngineState::Evaluating => "evaluating",
            EngineState::Accepted => "accepted",
            EngineState::Fallback => "fallback",
            EngineState::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::ExecutingStep(i) => write!(f, "executing_step({})", i),
            other => write!(f, "{}", other.name()),
        }
    }
}

impl std::str::FromStr for EngineState {
    type Err = String;

    /// Parses terminal states, as persisted with a run.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(EngineState::Accepted),
            "fallback" => Ok(EngineState::Fallback),
            "exhausted" => Ok(EngineState::Exhausted),
            _ => Err(format!("Unknown terminal state: {}", s)),
        }
    }
}

/// Whether a run decomposes the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    ChainOfThought,
    /// Single step against the original question, same machinery.
    Plain,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::ChainOfThought => "chain_of_thought",
            RunMode::Plain => "plain",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything an engine run produced.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub answer: String,
    pub trace: Vec<ReasoningStepResult>,
    pub evidence: Vec<EvidenceRef>,
    pub fallback: bool,
    pub terminal_state: EngineState,
    /// Every state entered, in order.
    pub states: Vec<EngineState>,
    pub evaluation: Option<Evaluation>,
    pub confidence: f64,
    pub low_confidence: bool,
    pub unresolved_citations: Vec<String>,
}

enum StepOutcome {
    Completed(ReasoningStepResult),
    /// First-step failure. The failed step keeps any evidence it retrieved.
    Abort {
        reason: String,
        partial: ReasoningStepResult,
    },
}

/// An answer candidate after citation closure.
struct Candidate {
    answer: String,
    unresolved: Vec<String>,
}

impl Candidate {
    fn new(answer: &str, evidence: &[EvidenceRef]) -> Self {
        let check = enforce_closure(answer, evidence);
        if !check.unresolved.is_empty() {
            warn!(unresolved = ?check.unresolved, "Stripped citations with no matching evidence");
        }
        Self {
            answer: check.answer,
            unresolved: check.unresolved,
        }
    }
}

/// Runs one question through decomposition, per-step retrieval and
/// generation, aggregation and evaluation.
pub struct ChainOfThoughtEngine {
    config: PipelineConfig,
    retriever: Retriever,
    generator: AnswerGenerator,
    rewriter: QueryRewriter,
    decomposer: QuestionDecomposer,
    evaluator: Arc<dyn ResponseEvaluator>,
    policy: VerdictPolicy,
}

impl ChainOfThoughtEngine {
    pub fn new(
        config: PipelineConfig,
        retriever: Retriever,
        generator: AnswerGenerator,
        evaluator: Arc<dyn ResponseEvaluator>,
    ) -> Self {
        let rewriter = QueryRewriter::new(config.rewrite_mode, config.decomposition_max_tokens);
        let decomposer =
            QuestionDecomposer::new(config.complexity.clone(), config.decomposition_max_tokens);
        let policy = VerdictPolicy {
            acceptance_threshold: config.acceptance_threshold,
            reject_floor: config.reject_floor,
        };

        Self {
            config,
            retriever,
            generator,
            rewriter,
            decomposer,
            evaluator,
            policy,
        }
    }

    pub async fn run(
        &self,
        question: &Question,
        collection: &CollectionRef,
        mode: RunMode,
        ctx: &mut RunContext,
    ) -> EngineOutcome {
        let mut states = vec![EngineState::Decomposing];
        debug!(mode = ?mode, collection = %collection, "Engine run started");

        let mut plan = match mode {
            RunMode::Plain => vec![DecomposedStep::new(0, question.text())],
            RunMode::ChainOfThought => {
                self.decomposer
                    .decompose(
                        question,
                        self.config.max_reasoning_depth,
                        &self.generator,
                        ctx,
                    )
                    .await
            }
        };

        if let Err(reason) = validate_plan(&plan, self.config.max_reasoning_depth) {
            return self
                .fallback(question, collection, states, Vec::new(), reason, ctx)
                .await;
        }

        let multi_step = plan.len() > 1;
        let headroom = if multi_step {
            self.config.min_generation_tokens
        } else {
            0
        };
        let mut trace: Vec<ReasoningStepResult> = Vec::with_capacity(plan.len());

        for step in plan.iter_mut() {
            if ctx.deadline_passed() {
                warn!(step = step.index, "Run deadline reached, stopping step execution");
                break;
            }
            let required = self.config.min_generation_tokens + headroom;
            if !ctx.budget.covers(required) {
                info!(
                    step = step.index,
                    required = required,
                    remaining = ctx.budget.remaining(),
                    "Token budget cannot cover another step"
                );
                break;
            }

            states.push(EngineState::ExecutingStep(step.index));
            step.status = StepStatus::Running;

            match self
                .execute_step(step, &trace, collection, headroom, ctx)
                .await
            {
                StepOutcome::Completed(result) => {
                    step.status = result.status;
                    trace.push(result);
                }
                StepOutcome::Abort { reason, partial } => {
                    step.status = StepStatus::Failed;
                    trace.push(partial);
                    return self
                        .fallback(question, collection, states, trace, reason, ctx)
                        .await;
                }
            }
        }

        states.push(EngineState::Aggregating);

        if !trace.iter().any(|r| r.succeeded()) {
            return self
                .fallback(
                    question,
                    collection,
                    states,
                    trace,
                    "no step succeeded".to_string(),
                    ctx,
                )
                .await;
        }
        let successes: Vec<&ReasoningStepResult> = trace.iter().filter(|r| r.succeeded()).collect();

        let evidence = dedupe_by_source(successes.iter().flat_map(|r| r.evidence.iter()));
        let mut extractive = false;

        let first_answer = if multi_step {
            match self.synthesize(question, &successes, &evidence, None, ctx).await {
                Ok(text) => text,
                Err(reason) => {
                    warn!(reason = %reason, "Synthesis unavailable, joining step answers");
                    extractive = true;
                    extractive_join(&successes)
                }
            }
        } else {
            successes[0].sub_answer.clone()
        };

        states.push(EngineState::Evaluating);

        let first = Candidate::new(&first_answer, &evidence);
        let first_eval = self
            .evaluate(question, &first.answer, &evidence, !ctx.deadline.expired(), ctx)
            .await;

        let (terminal, chosen, evaluation, low_confidence) = match first_eval.verdict {
            Verdict::Accept => (EngineState::Accepted, first, first_eval, extractive),
            Verdict::Reject => (EngineState::Exhausted, first, first_eval, true),
            Verdict::Retry => {
                let feedback = first_eval
                    .feedback
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RETRY_FEEDBACK.to_string());
                info!(score = first_eval.score, "Evaluator requested retry, re-synthesizing");
                states.push(EngineState::Aggregating);

                match self
                    .synthesize(question, &successes, &evidence, Some(&feedback), ctx)
                    .await
                {
                    Ok(text) => {
                        let second = Candidate::new(&text, &evidence);
                        states.push(EngineState::Evaluating);
                        let second_eval = self
                            .evaluate(question, &second.answer, &evidence, false, ctx)
                            .await;
                        if second_eval.verdict == Verdict::Accept {
                            (EngineState::Accepted, second, second_eval, false)
                        } else if second_eval.score >= first_eval.score {
                            (EngineState::Exhausted, second, second_eval, true)
                        } else {
                            (EngineState::Exhausted, first, first_eval, true)
                        }
                    }
                    Err(reason) => {
                        warn!(reason = %reason, "Retry synthesis failed, keeping first answer");
                        (EngineState::Exhausted, first, first_eval, true)
                    }
                }
            }
        };

        let evaluation = if terminal == EngineState::Exhausted {
            Evaluation {
                verdict: Verdict::Reject,
                ..evaluation
            }
        } else {
            evaluation
        };

        finish(
            terminal,
            states,
            chosen,
            trace,
            evidence,
            Some(evaluation),
            low_confidence,
            false,
        )
    }

    async fn execute_step(
        &self,
        step: &DecomposedStep,
        trace: &[ReasoningStepResult],
        collection: &CollectionRef,
        headroom: u32,
        ctx: &mut RunContext,
    ) -> StepOutcome {
        let start = Instant::now();
        let consumed_before = ctx.budget.consumed();
        let is_first = step.index == 0;
        let timeout = Duration::from_millis(self.config.retrieval_timeout_ms);

        let queries = self
            .rewriter
            .rewrite(&step.sub_question, headroom, &self.generator, ctx)
            .await;

        let mut degraded = false;
        let evidence = match self.retrieve_queries(&queries, collection, timeout, ctx).await {
            Ok(evidence) => evidence,
            Err(e) if is_first => {
                let reason = format!("first step retrieval failed: {}", e);
                return StepOutcome::Abort {
                    partial: failed_step(
                        step,
                        reason.clone(),
                        false,
                        start,
                        ctx.budget.consumed() - consumed_before,
                    ),
                    reason,
                };
            }
            Err(e) => {
                warn!(step = step.index, error = %e, "Retrieval failed, retrying once");
                degraded = true;
                match self
                    .retrieve_queries(&queries[..1], collection, timeout / 2, ctx)
                    .await
                {
                    Ok(evidence) => evidence,
                    Err(e) => {
                        return StepOutcome::Completed(failed_step(
                            step,
                            format!("retrieval failed after retry: {}", e),
                            true,
                            start,
                            ctx.budget.consumed() - consumed_before,
                        ));
                    }
                }
            }
        };

        let prior: Vec<SubAnswer<'_>> = trace
            .iter()
            .filter(|r| r.succeeded() && step.depends_on.contains(&r.step_index))
            .map(|r| SubAnswer {
                question: &r.sub_question,
                answer: &r.sub_answer,
            })
            .collect();

        let prompt = step_request(
            &step.sub_question,
            evidence.iter().map(|c| c.as_ref()),
            &prior,
        );
        let request =
            GenerationRequest::new(CallPurpose::StepAnswer, prompt, self.config.step_max_tokens)
                .with_reserve(headroom);

        let reason = match self.generator.generate(request, ctx).await {
            Ok(generation) if !generation.text.is_empty() => {
                let score = LexicalEvaluator::grounding_score(
                    &step.sub_question,
                    &generation.text,
                    &evidence,
                );
                info!(
                    step = step.index,
                    evidence = evidence.len(),
                    tokens = generation.tokens_used,
                    "Step succeeded"
                );
                return StepOutcome::Completed(ReasoningStepResult {
                    step_index: step.index,
                    sub_question: step.sub_question.clone(),
                    sub_answer: generation.text,
                    evidence,
                    token_cost: ctx.budget.consumed() - consumed_before,
                    latency_ms: start.elapsed().as_millis() as u64,
                    score: Some(score),
                    status: StepStatus::Succeeded,
                    degraded,
                    failure_reason: None,
                });
            }
            Ok(_) => "provider returned an empty answer".to_string(),
            Err(e) => failure_reason(&e),
        };

        let mut failed = failed_step(
            step,
            reason.clone(),
            degraded,
            start,
            ctx.budget.consumed() - consumed_before,
        );
        failed.evidence = evidence;

        if is_first {
            return StepOutcome::Abort {
                reason: format!("first step generation failed: {}", reason),
                partial: failed,
            };
        }

        warn!(step = step.index, reason = %reason, "Step failed");
        StepOutcome::Completed(failed)
    }

    /// Retrieve for each query and merge. Fails only when every query fails.
    async fn retrieve_queries(
        &self,
        queries: &[String],
        collection: &CollectionRef,
        timeout: Duration,
        ctx: &mut RunContext,
    ) -> RetrievalResult<Vec<EvidenceRef>> {
        let mut merged: Vec<EvidenceRef> = Vec::new();
        let mut first_error = None;
        let mut succeeded = false;

        for query in queries {
            if ctx.deadline_passed() {
                break;
            }
            ctx.stats.retrieval_calls += 1;
            match self
                .retriever
                .retrieve(query, collection, self.config.retrieval_top_k, timeout)
                .await
            {
                Ok(chunks) => {
                    ctx.stats.successful_calls += 1;
                    succeeded = true;
                    merged.extend(chunks);
                }
                Err(e) => {
                    ctx.stats.retrieval_failures += 1;
                    warn!(error = %e, "Retrieval call failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if !succeeded {
            return Err(first_error.unwrap_or(RetrievalError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }));
        }

        if queries.len() > 1 {
            merged = merge_ranked(merged, self.config.retrieval_top_k);
        }
        Ok(merged)
    }

    async fn synthesize(
        &self,
        question: &Question,
        successes: &[&ReasoningStepResult],
        evidence: &[EvidenceRef],
        feedback: Option<&str>,
        ctx: &mut RunContext,
    ) -> Result<String, String> {
        let sub_answers: Vec<SubAnswer<'_>> = successes
            .iter()
            .map(|r| SubAnswer {
                question: &r.sub_question,
                answer: &r.sub_answer,
            })
            .collect();
        let prompt = synthesis_request(
            question.text(),
            &sub_answers,
            evidence.iter().map(|c| c.as_ref()),
            feedback,
        );
        let request = GenerationRequest::new(
            CallPurpose::Synthesis,
            prompt,
            self.config.synthesis_max_tokens,
        );

        match self.generator.generate(request, ctx).await {
            Ok(generation) if !generation.text.is_empty() => Ok(generation.text),
            Ok(_) => Err("provider returned an empty synthesis".to_string()),
            Err(e) => Err(failure_reason(&e)),
        }
    }

    async fn evaluate(
        &self,
        question: &Question,
        answer: &str,
        evidence: &[EvidenceRef],
        retries_remaining: bool,
        ctx: &mut RunContext,
    ) -> Evaluation {
        self.policy
            .evaluate(
                self.evaluator.as_ref(),
                EvaluationInput {
                    question: question.text(),
                    answer,
                    evidence,
                },
                retries_remaining,
                &self.generator,
                ctx,
            )
            .await
    }

    /// Single-shot retrieval and generation against the original question.
    /// The trace is replaced by this one step.
    ///
    /// Past the deadline nothing new can start, so the steps executed so far
    /// are returned as a partial result instead.
    async fn fallback(
        &self,
        question: &Question,
        collection: &CollectionRef,
        states: Vec<EngineState>,
        partial: Vec<ReasoningStepResult>,
        reason: String,
        ctx: &mut RunContext,
    ) -> EngineOutcome {
        if ctx.deadline_passed() {
            warn!(reason = %reason, "Run deadline reached, skipping fallback");
            return deadline_partial(states, partial);
        }

        warn!(reason = %reason, "Falling back to single-shot retrieval");

        let start = Instant::now();
        let consumed_before = ctx.budget.consumed();
        let step = DecomposedStep::new(0, question.text());
        let timeout = Duration::from_millis(self.config.retrieval_timeout_ms);

        let mut evidence: Vec<EvidenceRef> = Vec::new();
        let mut degraded = false;
        let queries = [question.text().to_string()];
        match self.retrieve_queries(&queries, collection, timeout, ctx).await {
            Ok(chunks) => evidence = chunks,
            Err(e) => {
                warn!(error = %e, "Fallback retrieval failed, answering without evidence");
                degraded = true;
            }
        }

        let prompt = step_request(question.text(), evidence.iter().map(|c| c.as_ref()), &[]);
        let request =
            GenerationRequest::new(CallPurpose::StepAnswer, prompt, self.config.step_max_tokens);
        let generated = match self.generator.generate(request, ctx).await {
            Ok(generation) if !generation.text.is_empty() => Ok(generation.text),
            Ok(_) => Err("provider returned an empty answer".to_string()),
            Err(e) => Err(failure_reason(&e)),
        };

        let answer = match generated {
            Ok(text) => text,
            Err(reason) => {
                warn!(reason = %reason, "Fallback generation failed");
                let mut failed = failed_step(
                    &step,
                    reason,
                    degraded,
                    start,
                    ctx.budget.consumed() - consumed_before,
                );
                let evidence = dedupe_by_source(&evidence);
                failed.evidence = evidence.clone();
                return finish(
                    EngineState::Fallback,
                    states,
                    Candidate {
                        answer: String::new(),
                        unresolved: Vec::new(),
                    },
                    vec![failed],
                    evidence,
                    None,
                    true,
                    true,
                );
            }
        };

        let score = LexicalEvaluator::grounding_score(question.text(), &answer, &evidence);
        let result = ReasoningStepResult {
            step_index: 0,
            sub_question: step.sub_question.clone(),
            sub_answer: answer.clone(),
            evidence: evidence.clone(),
            token_cost: ctx.budget.consumed() - consumed_before,
            latency_ms: start.elapsed().as_millis() as u64,
            score: Some(score),
            status: StepStatus::Succeeded,
            degraded,
            failure_reason: None,
        };

        let evidence = dedupe_by_source(&evidence);
        let candidate = Candidate::new(&answer, &evidence);
        let evaluation = self
            .evaluate(question, &candidate.answer, &evidence, false, ctx)
            .await;
        let low_confidence = evaluation.verdict != Verdict::Accept || evidence.is_empty();

        finish(
            EngineState::Fallback,
            states,
            candidate,
            vec![result],
            evidence,
            Some(evaluation),
            low_confidence,
            true,
        )
    }
}

/// A plan must hold between one and `max_depth` steps.
pub fn validate_plan(plan: &[DecomposedStep], max_depth: usize) -> Result<(), String> {
    if plan.is_empty() {
        return Err("decomposition produced an empty plan".to_string());
    }
    if plan.len() > max_depth {
        return Err(format!(
            "plan has {} steps, limit is {}",
            plan.len(),
            max_depth
        ));
    }
    Ok(())
}

/// Step answers joined in order, used when synthesis cannot run.
pub fn extractive_join(successes: &[&ReasoningStepResult]) -> String {
    match successes {
        [only] => only.sub_answer.clone(),
        _ => successes
            .iter()
            .map(|r| format!("{}\n{}", r.sub_question, r.sub_answer))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Merge results of several queries: one entry per chunk at its best score,
/// ranked, truncated to `top_k`.
fn merge_ranked(chunks: Vec<EvidenceRef>, top_k: usize) -> Vec<EvidenceRef> {
    let mut best: HashMap<(String, String), EvidenceRef> = HashMap::new();
    for chunk in chunks {
        let key = (chunk.source_id.clone(), chunk.text.clone());
        match best.get(&key) {
            Some(existing) if existing.score >= chunk.score => {}
            _ => {
                best.insert(key, chunk);
            }
        }
    }
    let mut merged: Vec<EvidenceRef> = best.into_values().collect();
    merged.sort_by(|a, b| compare_chunks(a, b));
    merged.truncate(top_k);
    merged
}

/// Result of a run cut short by its deadline before any answer existed.
/// Keeps the executed steps and whatever evidence they gathered.
fn deadline_partial(states: Vec<EngineState>, trace: Vec<ReasoningStepResult>) -> EngineOutcome {
    let evidence = dedupe_by_source(trace.iter().flat_map(|r| r.evidence.iter()));
    warn!(
        steps = trace.len(),
        evidence = evidence.len(),
        "Returning partial result at the run deadline"
    );
    finish(
        EngineState::Exhausted,
        states,
        Candidate {
            answer: String::new(),
            unresolved: Vec::new(),
        },
        trace,
        evidence,
        None,
        true,
        false,
    )
}

fn failure_reason(err: &GenerationError) -> String {
    match err {
        GenerationError::Budget(e) => format!("budget exhausted: {}", e),
        GenerationError::DeadlineReached => "deadline reached".to_string(),
        other => other.to_string(),
    }
}

fn failed_step(
    step: &DecomposedStep,
    reason: String,
    degraded: bool,
    start: Instant,
    token_cost: u32,
) -> ReasoningStepResult {
    ReasoningStepResult {
        step_index: step.index,
        sub_question: step.sub_question.clone(),
        sub_answer: String::new(),
        evidence: Vec::new(),
        token_cost,
        latency_ms: start.elapsed().as_millis() as u64,
        score: None,
        status: StepStatus::Failed,
        degraded,
        failure_reason: Some(reason),
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    terminal: EngineState,
    mut states: Vec<EngineState>,
    chosen: Candidate,
    trace: Vec<ReasoningStepResult>,
    evidence: Vec<EvidenceRef>,
    evaluation: Option<Evaluation>,
    low_confidence: bool,
    fallback: bool,
) -> EngineOutcome {
    states.push(terminal);
    let confidence = evaluation.as_ref().map(|e| e.score).unwrap_or(0.0);

    info!(
        terminal = %terminal,
        steps = trace.len(),
        evidence = evidence.len(),
        confidence = confidence,
        fallback = fallback,
        "Engine run finished"
    );

    EngineOutcome {
        answer: chosen.answer,
        trace,
        evidence,
        fallback,
        terminal_state: terminal,
        states,
        evaluation,
        confidence,
        low_confidence,
        unresolved_citations: chosen.unresolved,
    }
}
