//! Chain-of-thought reasoning over retrieved evidence.
//!
//! This module provides:
//! - [`QuestionDecomposer`]: complex question to ordered sub-questions
//! - [`QueryRewriter`]: retrieval-oriented query variants
//! - [`ResponseEvaluator`] implementations and verdict rules
//! - [`ChainOfThoughtEngine`]: the per-run state machine
//!
//! One engine run owns its [`RunContext`]; nothing here is shared between
//! requests except collaborator handles.

mod citations;
mod complexity;
mod context;
mod decomposer;
mod engine;
mod evaluator;
mod rewriter;

pub use citations::*;
pub use complexity::*;
pub use context::*;
pub use decomposer::*;
pub use engine::*;
pub use evaluator::*;
pub use rewriter::*;

use serde::{Deserialize, Serialize};

use crate::retrieval::{CollectionRef, EvidenceRef};

/// The user's question. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    text: String,
    collection: Option<CollectionRef>,
    user_id: Option<String>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            collection: None,
            user_id: None,
        }
    }

    pub fn with_collection(mut self, collection: CollectionRef) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn collection(&self) -> Option<&CollectionRef> {
        self.collection.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// Lifecycle of a decomposed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// One entry of a decomposition plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposedStep {
    pub index: usize,
    pub sub_question: String,
    /// Indices of earlier steps whose answers are chained in as context.
    pub depends_on: Vec<usize>,
    pub status: StepStatus,
}

impl DecomposedStep {
    /// A step that depends on every earlier step.
    pub fn new(index: usize, sub_question: impl Into<String>) -> Self {
        Self {
            index,
            sub_question: sub_question.into(),
            depends_on: (0..index).collect(),
            status: StepStatus::Pending,
        }
    }

    /// Set explicit dependencies; forward or self references are dropped.
    pub fn with_dependencies(mut self, depends_on: Vec<usize>) -> Self {
        let index = self.index;
        self.depends_on = depends_on.into_iter().filter(|d| *d < index).collect();
        self.depends_on.sort_unstable();
        self.depends_on.dedup();
        self
    }
}

/// Outcome of one executed step, appended to the trace in step order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStepResult {
    pub step_index: usize,
    pub sub_question: String,
    pub sub_answer: String,
    pub evidence: Vec<EvidenceRef>,
    pub token_cost: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub status: StepStatus,
    /// Produced after a retry or with reduced evidence.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ReasoningStepResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON (fast path)
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        crate::text::preview(completion, 100)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_trims_text() {
        let q = Question::new("  What is RAG?  ").with_user("u-1");
        assert_eq!(q.text(), "What is RAG?");
        assert_eq!(q.user_id(), Some("u-1"));
        assert!(q.collection().is_none());
    }

    #[test]
    fn test_step_defaults_to_depending_on_all_prior() {
        let step = DecomposedStep::new(2, "q");
        assert_eq!(step.depends_on, vec![0, 1]);
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn test_step_dependencies_drop_forward_refs() {
        let step = DecomposedStep::new(1, "q").with_dependencies(vec![3, 0, 1, 0]);
        assert_eq!(step.depends_on, vec![0]);
    }

    #[test]
    fn test_step_status_round_trip() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert!("done".parse::<StepStatus>().is_err());
    }

    #[test]
    fn test_extract_json_raw() {
        assert_eq!(
            extract_json_from_completion(r#"  {"a": 1} "#).unwrap(),
            r#"{"a": 1}"#
        );
    }

    #[test]
    fn test_extract_json_code_block() {
        let completion = "Here you go:\n```json\n[\"a\", \"b\"]\n```";
        assert_eq!(
            extract_json_from_completion(completion).unwrap(),
            r#"["a", "b"]"#
        );
    }

    #[test]
    fn test_extract_json_plain_code_block() {
        let completion = "```\n{\"score\": 0.5}\n```";
        assert_eq!(
            extract_json_from_completion(completion).unwrap(),
            r#"{"score": 0.5}"#
        );
    }

    #[test]
    fn test_extract_json_missing() {
        assert!(extract_json_from_completion("no json here").is_err());
    }
}
