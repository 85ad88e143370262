use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::generation::TokenUsage;
use crate::reasoning::{CallStats, EngineState, ReasoningStepResult, RunMode, Verdict};
use crate::retrieval::EvidenceRef;

/// Structured result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub run_id: String,
    pub question: String,
    pub collection: String,
    pub mode: RunMode,
    pub answer: String,
    /// Executed steps in order. A fallback run holds only the fallback step.
    pub trace: Vec<ReasoningStepResult>,
    /// Aggregated evidence, one entry per source at its best score.
    pub evidence: Vec<EvidenceRef>,
    pub fallback: bool,
    pub timed_out: bool,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub low_confidence: bool,
    pub token_usage: TokenUsage,
    pub token_budget: u32,
    pub terminal_state: EngineState,
    /// Engine states in the order they were entered, terminal state last.
    #[serde(default)]
    pub states: Vec<EngineState>,
    pub synthesis_attempts: u32,
    pub call_stats: CallStats,
    pub evaluation_degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_citations: Vec<String>,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl PipelineRunResult {
    /// Distinct source ids in the aggregated evidence.
    pub fn source_ids(&self) -> Vec<&str> {
        self.evidence.iter().map(|c| c.source_id.as_str()).collect()
    }

    pub fn accepted(&self) -> bool {
        self.terminal_state == EngineState::Accepted
    }
}
