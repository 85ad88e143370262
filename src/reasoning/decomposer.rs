use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use super::{
    extract_json_from_completion, ComplexityHeuristic, DecomposedStep, Question, RunContext,
};
use crate::generation::{AnswerGenerator, CallPurpose, GenerationRequest};
use crate::prompts::decomposition_request;

/// Leading list markers: bullets, "1." / "2)" numbering, "Step 3:" labels.
static LIST_MARKER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*•]+|\d+\s*[.):]|step\s*\d+\s*[.):-]?|q\d+\s*[.):-])\s*").ok()
});

/// A sub-question as parsed from a completion, before indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedQuestion {
    pub text: String,
    /// Explicit dependencies; `None` means every earlier step.
    pub depends_on: Option<Vec<usize>>,
}

/// Splits complex questions into ordered sub-questions.
#[derive(Debug, Clone)]
pub struct QuestionDecomposer {
    heuristic: ComplexityHeuristic,
    max_tokens: u32,
}

impl QuestionDecomposer {
    pub fn new(heuristic: ComplexityHeuristic, max_tokens: u32) -> Self {
        Self {
            heuristic,
            max_tokens,
        }
    }

    /// Plan of 1..=`max_depth` steps. Never fails: simple questions, provider
    /// failures and unparseable output all yield the original question.
    pub async fn decompose(
        &self,
        question: &Question,
        max_depth: usize,
        generator: &AnswerGenerator,
        ctx: &mut RunContext,
    ) -> Vec<DecomposedStep> {
        let original = || vec![DecomposedStep::new(0, question.text())];

        if max_depth <= 1 || self.heuristic.is_simple(question.text()) {
            debug!("Question classified simple, skipping decomposition");
            return original();
        }

        let request = GenerationRequest::new(
            CallPurpose::Decompose,
            decomposition_request(question.text(), max_depth),
            self.max_tokens,
        );

        let completion = match generator.generate(request, ctx).await {
            Ok(generation) => generation.text,
            Err(e) => {
                warn!(error = %e, "Decomposition failed, using original question");
                return original();
            }
        };

        let planned = parse_plan(&completion);
        if planned.is_empty() {
            warn!("Decomposition produced no usable sub-questions, using original question");
            return original();
        }

        let steps = build_steps(planned, max_depth);
        info!(steps = steps.len(), max_depth = max_depth, "Question decomposed");
        steps
    }
}

/// Parse a decomposition completion: JSON first, then a line list.
pub fn parse_plan(completion: &str) -> Vec<PlannedQuestion> {
    let from_json = extract_json_from_completion(completion)
        .ok()
        .and_then(|json| serde_json::from_str::<Value>(json).ok())
        .map(|value| parse_json_plan(&value));

    match from_json {
        Some(plan) if !plan.is_empty() => plan,
        _ => parse_line_plan(completion),
    }
}

fn parse_json_plan(value: &Value) -> Vec<PlannedQuestion> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match ["sub_questions", "questions", "steps"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
        {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(PlannedQuestion {
                text: text.trim().to_string(),
                depends_on: None,
            }),
            Value::Object(obj) => {
                let text = ["question", "sub_question", "text"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_str))?;
                let depends_on = obj.get("depends_on").and_then(Value::as_array).map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_u64)
                        .map(|d| d as usize)
                        .collect()
                });
                Some(PlannedQuestion {
                    text: text.trim().to_string(),
                    depends_on,
                })
            }
            _ => None,
        })
        .filter(|p| is_well_formed(&p.text))
        .collect()
}

fn parse_line_plan(completion: &str) -> Vec<PlannedQuestion> {
    completion
        .lines()
        .map(strip_list_marker)
        .filter(|line| is_well_formed(line))
        .map(|line| PlannedQuestion {
            text: line.to_string(),
            depends_on: None,
        })
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    match LIST_MARKER.as_ref().and_then(|re| re.find(line)) {
        Some(m) => line[m.end()..].trim(),
        None => line,
    }
}

/// Rejects empty lines, headings ending in ':', fragments under two words,
/// and lines without letters.
fn is_well_formed(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty()
        && !line.ends_with(':')
        && line.split_whitespace().count() >= 2
        && line.chars().any(char::is_alphabetic)
}

fn dedupe_key(text: &str) -> String {
    text.trim()
        .trim_end_matches('?')
        .trim()
        .to_lowercase()
}

/// Index, deduplicate and truncate a parsed plan.
///
/// Explicit dependencies refer to positions in the parsed list and are
/// remapped onto the surviving steps.
pub fn build_steps(planned: Vec<PlannedQuestion>, max_depth: usize) -> Vec<DecomposedStep> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut remap: HashMap<usize, usize> = HashMap::new();
    let mut steps: Vec<DecomposedStep> = Vec::new();

    for (position, item) in planned.into_iter().enumerate() {
        let key = dedupe_key(&item.text);
        if let Some(existing) = seen.get(&key) {
            remap.insert(position, *existing);
            continue;
        }
        if steps.len() == max_depth {
            break;
        }

        let index = steps.len();
        seen.insert(key, index);
        remap.insert(position, index);

        let step = DecomposedStep::new(index, item.text);
        let step = match item.depends_on {
            Some(deps) => {
                let mapped = deps.iter().filter_map(|d| remap.get(d).copied()).collect();
                step.with_dependencies(mapped)
            }
            None => step,
        };
        steps.push(step);
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::generation::{Completion, MockLlmProvider, RetryPolicy};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const COMPLEX: &str =
        "Compare the refund policy and the warranty policy and tell me which is more generous";

    fn generator(provider: MockLlmProvider) -> AnswerGenerator {
        AnswerGenerator::new(
            Arc::new(provider),
            RetryPolicy {
                max_retries: 0,
                base_delay_ms: 0,
                call_timeout_ms: 1000,
            },
            16,
        )
    }

    fn decomposer() -> QuestionDecomposer {
        QuestionDecomposer::new(ComplexityHeuristic::default(), 256)
    }

    fn texts(steps: &[DecomposedStep]) -> Vec<&str> {
        steps.iter().map(|s| s.sub_question.as_str()).collect()
    }

    #[test]
    fn test_parse_json_object() {
        let plan = parse_plan(
            r#"{"sub_questions": ["What is the refund policy?", "What is the warranty policy?"]}"#,
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].text, "What is the warranty policy?");
        assert!(plan[0].depends_on.is_none());
    }

    #[test]
    fn test_parse_json_array_in_code_block() {
        let plan = parse_plan("```json\n[\"What is A?\", \"What is B?\"]\n```");
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_parse_json_objects_with_dependencies() {
        let plan = parse_plan(
            r#"{"sub_questions": [
                {"question": "What is the refund window?", "depends_on": []},
                {"question": "Is the warranty longer than that?", "depends_on": [0]}
            ]}"#,
        );
        assert_eq!(plan[0].depends_on, Some(vec![]));
        assert_eq!(plan[1].depends_on, Some(vec![0]));
    }

    #[test]
    fn test_parse_line_list_discards_malformed_lines() {
        let completion = "Sub-questions:\n\n1. What is the refund policy?\n- ???\n2) Warranty\n* What does the warranty cover?\nStep 3: 42 17\n";
        let plan = parse_plan(completion);
        let texts: Vec<&str> = plan.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["What is the refund policy?", "What does the warranty cover?"]
        );
    }

    #[test]
    fn test_build_steps_dedupes_and_truncates() {
        let planned = ["What is A?", "what is a", "What is B?", "What is C?", "What is D?"]
            .iter()
            .map(|t| PlannedQuestion {
                text: t.to_string(),
                depends_on: None,
            })
            .collect();
        let steps = build_steps(planned, 3);
        assert_eq!(texts(&steps), vec!["What is A?", "What is B?", "What is C?"]);
        assert_eq!(steps[2].depends_on, vec![0, 1]);
    }

    #[test]
    fn test_build_steps_remaps_explicit_dependencies() {
        let planned = vec![
            PlannedQuestion {
                text: "What is A?".to_string(),
                depends_on: Some(vec![]),
            },
            PlannedQuestion {
                text: "What is A?".to_string(),
                depends_on: Some(vec![]),
            },
            PlannedQuestion {
                text: "How does B relate?".to_string(),
                depends_on: Some(vec![1]),
            },
        ];
        let steps = build_steps(planned, 3);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].depends_on, vec![0]);
    }

    #[tokio::test]
    async fn test_simple_question_skips_llm() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().never();
        let mut ctx = RunContext::new(1000, Duration::from_secs(5));

        let steps = decomposer()
            .decompose(
                &Question::new("What is the capital of France?"),
                3,
                &generator(provider),
                &mut ctx,
            )
            .await;
        assert_eq!(texts(&steps), vec!["What is the capital of France?"]);
        assert_eq!(ctx.stats.decomposition_calls, 0);
    }

    #[tokio::test]
    async fn test_complex_question_decomposed() {
        let mut provider = MockLlmProvider::new();
        provider
            .expect_complete()
            .withf(|req| req.purpose == CallPurpose::Decompose)
            .times(1)
            .returning(|_| {
                Ok(Completion {
                    text: r#"{"sub_questions": ["What is the refund policy?", "What is the warranty policy?", "Which one is more generous?", "Anything else to note?"]}"#.to_string(),
                    tokens_used: 60,
                })
            });
        let mut ctx = RunContext::new(1000, Duration::from_secs(5));

        let steps = decomposer()
            .decompose(&Question::new(COMPLEX), 3, &generator(provider), &mut ctx)
            .await;
        assert_eq!(steps.len(), 3);
        assert_eq!(ctx.stats.decomposition_calls, 1);
        assert_eq!(ctx.budget.consumed(), 60);
    }

    #[tokio::test]
    async fn test_provider_failure_returns_original() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().returning(|_| {
            Err(GenerationError::ProviderTimeout { timeout_ms: 100 })
        });
        let mut ctx = RunContext::new(1000, Duration::from_secs(5));

        let steps = decomposer()
            .decompose(&Question::new(COMPLEX), 3, &generator(provider), &mut ctx)
            .await;
        assert_eq!(texts(&steps), vec![COMPLEX]);
    }

    #[tokio::test]
    async fn test_garbage_completion_returns_original() {
        let mut provider = MockLlmProvider::new();
        provider.expect_complete().returning(|_| {
            Ok(Completion {
                text: "Sure:\n\n???".to_string(),
                tokens_used: 5,
            })
        });
        let mut ctx = RunContext::new(1000, Duration::from_secs(5));

        let steps = decomposer()
            .decompose(&Question::new(COMPLEX), 3, &generator(provider), &mut ctx)
            .await;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].sub_question, COMPLEX);
    }
}
