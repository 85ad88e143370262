use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{extract_citations, extract_json_from_completion, strip_citations, RunContext};
use crate::error::{EvaluationError, GenerationError};
use crate::generation::{AnswerGenerator, CallPurpose, GenerationRequest};
use crate::prompts::judge_request;
use crate::retrieval::EvidenceRef;
use crate::text::term_set;

/// Evaluator decision for an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accept,
    Retry,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Retry => "RETRY",
            Verdict::Reject => "REJECT",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACCEPT" => Ok(Verdict::Accept),
            "RETRY" => Ok(Verdict::Retry),
            "REJECT" => Ok(Verdict::Reject),
            _ => Err(format!("Unknown verdict: {}", s)),
        }
    }
}

/// Which scorer produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Lexical,
    Judge,
    Custom,
}

/// Raw scorer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub feedback: Option<String>,
    pub scorer: ScorerKind,
}

/// What gets scored.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    pub evidence: &'a [EvidenceRef],
}

/// Scores an answer in [0, 1].
#[async_trait]
pub trait ResponseEvaluator: Send + Sync {
    async fn score(
        &self,
        input: EvaluationInput<'_>,
        generator: &AnswerGenerator,
        ctx: &mut RunContext,
    ) -> Result<Score, EvaluationError>;
}

/// Final judgement on one answer attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scorer: Option<ScorerKind>,
    /// The evaluator failed and the answer was accepted unscored.
    pub degraded: bool,
}

/// Score thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerdictPolicy {
    pub acceptance_threshold: f64,
    pub reject_floor: f64,
}

impl VerdictPolicy {
    pub fn verdict(&self, score: f64, retries_remaining: bool) -> Verdict {
        if score >= self.acceptance_threshold {
            Verdict::Accept
        } else if score >= self.reject_floor && retries_remaining {
            Verdict::Retry
        } else {
            Verdict::Reject
        }
    }

    /// Score and judge `input`. Evaluator failures accept the answer with
    /// `degraded` set and the threshold as its score.
    pub async fn evaluate(
        &self,
        evaluator: &dyn ResponseEvaluator,
        input: EvaluationInput<'_>,
        retries_remaining: bool,
        generator: &AnswerGenerator,
        ctx: &mut RunContext,
    ) -> Evaluation {
        ctx.stats.evaluations += 1;

        match evaluator.score(input, generator, ctx).await {
            Ok(score) => {
                let value = clamp_unit(score.value);
                let verdict = self.verdict(value, retries_remaining);
                debug!(
                    score = value,
                    verdict = %verdict,
                    scorer = ?score.scorer,
                    "Answer evaluated"
                );
                Evaluation {
                    score: value,
                    verdict,
                    feedback: score.feedback,
                    scorer: Some(score.scorer),
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "Evaluation failed, accepting answer unscored");
                Evaluation {
                    score: self.acceptance_threshold,
                    verdict: Verdict::Accept,
                    feedback: None,
                    scorer: None,
                    degraded: true,
                }
            }
        }
    }
}

/// Deterministic lexical grounding scorer: no I/O.
///
/// `0.6 * grounding + 0.3 * coverage + 0.1 * cited`, where grounding is the
/// share of answer terms found in the evidence, coverage the share of
/// question terms found in the answer or evidence, and cited whether the
/// answer cites at least one retrieved source.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalEvaluator;

impl LexicalEvaluator {
    pub fn grounding_score(question: &str, answer: &str, evidence: &[EvidenceRef]) -> f64 {
        let answer_terms = term_set(&strip_citations(answer));
        if answer_terms.is_empty() || evidence.is_empty() {
            return 0.0;
        }

        let evidence_terms: HashSet<String> = evidence
            .iter()
            .flat_map(|chunk| term_set(&chunk.text))
            .collect();

        let grounded = answer_terms.intersection(&evidence_terms).count();
        let grounding = grounded as f64 / answer_terms.len() as f64;

        let question_terms = term_set(question);
        let coverage = if question_terms.is_empty() {
            1.0
        } else {
            let covered = question_terms
                .iter()
                .filter(|t| answer_terms.contains(*t) || evidence_terms.contains(*t))
                .count();
            covered as f64 / question_terms.len() as f64
        };

        let sources: HashSet<&str> = evidence.iter().map(|c| c.source_id.as_str()).collect();
        let cited = extract_citations(answer)
            .iter()
            .any(|id| sources.contains(id.as_str()));

        clamp_unit(0.6 * grounding + 0.3 * coverage + if cited { 0.1 } else { 0.0 })
    }
}

#[async_trait]
impl ResponseEvaluator for LexicalEvaluator {
    async fn score(
        &self,
        input: EvaluationInput<'_>,
        _generator: &AnswerGenerator,
        _ctx: &mut RunContext,
    ) -> Result<Score, EvaluationError> {
        let value = Self::grounding_score(input.question, input.answer, input.evidence);
        let feedback = (value < 0.5).then(|| {
            "Several claims are not supported by the evidence; restrict the answer to cited sources."
                .to_string()
        });
        Ok(Score {
            value,
            feedback,
            scorer: ScorerKind::Lexical,
        })
    }
}

#[derive(Debug, Deserialize)]
struct JudgeResponse {
    score: f64,
    #[serde(default)]
    feedback: Option<String>,
}

/// LLM judge, falling back to [`LexicalEvaluator`] when the budget or the
/// deadline rules out a call.
#[derive(Debug, Clone, Copy)]
pub struct JudgeEvaluator {
    max_tokens: u32,
}

impl JudgeEvaluator {
    pub fn new(max_tokens: u32) -> Self {
        Self { max_tokens }
    }

    async fn lexical(
        &self,
        input: EvaluationInput<'_>,
        generator: &AnswerGenerator,
        ctx: &mut RunContext,
    ) -> Result<Score, EvaluationError> {
        LexicalEvaluator.score(input, generator, ctx).await
    }
}

#[async_trait]
impl ResponseEvaluator for JudgeEvaluator {
    async fn score(
        &self,
        input: EvaluationInput<'_>,
        generator: &AnswerGenerator,
        ctx: &mut RunContext,
    ) -> Result<Score, EvaluationError> {
        if ctx.deadline_passed() {
            debug!("Deadline passed, judging lexically");
            return self.lexical(input, generator, ctx).await;
        }

        let prompt = judge_request(
            input.question,
            input.answer,
            input.evidence.iter().map(|c| c.as_ref()),
        );
        let request = GenerationRequest::new(CallPurpose::Judge, prompt, self.max_tokens);

        let completion = match generator.generate(request, ctx).await {
            Ok(generation) => generation.text,
            Err(GenerationError::Budget(e)) => {
                debug!(error = %e, "Budget too small for judge, judging lexically");
                return self.lexical(input, generator, ctx).await;
            }
            Err(GenerationError::DeadlineReached) => {
                return self.lexical(input, generator, ctx).await;
            }
            Err(e) => {
                return Err(EvaluationError::Scoring {
                    message: e.to_string(),
                })
            }
        };

        let json = extract_json_from_completion(&completion)
            .map_err(|message| EvaluationError::Parse { message })?;
        let parsed: JudgeResponse =
            serde_json::from_str(json).map_err(|e| EvaluationError::Parse {
                message: format!("Failed to parse judge response: {}", e),
            })?;

        Ok(Score {
            value: clamp_unit(parsed.score),
            feedback: parsed.feedback.filter(|f| !f.trim().is_empty()),
            scorer: ScorerKind::Judge,
        })
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
