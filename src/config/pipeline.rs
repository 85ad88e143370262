//! Per-run pipeline configuration.
//!
//! A [`PipelineConfig`] is cloned into each run at start and treated as
//! immutable for that run's lifetime.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::reasoning::{ComplexityHeuristic, RewriteMode};
use crate::retrieval::RetrievalStrategy;

/// Options recognized by `run_pipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Allow chain-of-thought decomposition for complex questions.
    pub enable_cot: bool,
    /// Maximum number of decomposed steps per run.
    pub max_reasoning_depth: usize,
    /// Ceiling on LLM token consumption for one run.
    pub token_budget: u32,
    /// Evidence chunks requested per retrieval.
    pub retrieval_top_k: usize,
    /// Hard cap applied to any requested `top_k`.
    pub max_top_k: usize,
    /// Retrieval strategy, resolved once per run.
    pub retrieval_strategy: RetrievalStrategy,
    /// Minimum evaluator score for ACCEPT (0.0-1.0).
    pub acceptance_threshold: f64,
    /// Scores below this floor are rejected without a retry.
    pub reject_floor: f64,
    /// Wall-clock limit for the whole run.
    pub timeout_seconds: u64,
    /// Per-call timeout for search backends.
    pub retrieval_timeout_ms: u64,
    /// Token cap for each sub-question answer.
    pub step_max_tokens: u32,
    /// Token cap for the final synthesis call.
    pub synthesis_max_tokens: u32,
    /// Token cap for the decomposition call.
    pub decomposition_max_tokens: u32,
    /// Token cap for an LLM judge evaluation.
    pub judge_max_tokens: u32,
    /// Smallest generation worth starting; below this the call is skipped.
    pub min_generation_tokens: u32,
    /// Query rewriting applied before each retrieval.
    pub rewrite_mode: RewriteMode,
    /// Simple-vs-complex question classifier.
    pub complexity: ComplexityHeuristic,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_cot: true,
            max_reasoning_depth: 3,
            token_budget: 4000,
            retrieval_top_k: 5,
            max_top_k: 20,
            retrieval_strategy: RetrievalStrategy::default(),
            acceptance_threshold: 0.7,
            reject_floor: 0.3,
            timeout_seconds: 30,
            retrieval_timeout_ms: 5000,
            step_max_tokens: 512,
            synthesis_max_tokens: 1024,
            decomposition_max_tokens: 256,
            judge_max_tokens: 256,
            min_generation_tokens: 64,
            rewrite_mode: RewriteMode::None,
            complexity: ComplexityHeuristic::default(),
        }
    }
}

impl PipelineConfig {
    /// Check the configuration before any run is attempted.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.token_budget == 0 {
            return Err(config_error("token_budget must be greater than 0"));
        }
        if self.max_reasoning_depth < 1 {
            return Err(config_error("max_reasoning_depth must be at least 1"));
        }
        if self.retrieval_top_k == 0 {
            return Err(config_error("retrieval_top_k must be greater than 0"));
        }
        if self.max_top_k == 0 {
            return Err(config_error("max_top_k must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return Err(config_error("acceptance_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.reject_floor)
            || self.reject_floor > self.acceptance_threshold
        {
            return Err(config_error(
                "reject_floor must be within [0, acceptance_threshold]",
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(config_error("timeout_seconds must be greater than 0"));
        }
        if self.retrieval_timeout_ms == 0 {
            return Err(config_error("retrieval_timeout_ms must be greater than 0"));
        }
        if self.min_generation_tokens == 0 {
            return Err(config_error("min_generation_tokens must be greater than 0"));
        }
        if self.step_max_tokens < self.min_generation_tokens
            || self.synthesis_max_tokens < self.min_generation_tokens
        {
            return Err(config_error(
                "step_max_tokens and synthesis_max_tokens must be at least min_generation_tokens",
            ));
        }
        if let RetrievalStrategy::Hybrid(weights) = &self.retrieval_strategy {
            weights.validate().map_err(|message| AppError::Config { message })?;
        }
        Ok(())
    }

    /// Set CoT enablement
    pub fn with_cot(mut self, enable: bool) -> Self {
        self.enable_cot = enable;
        self
    }

    /// Set maximum reasoning depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_reasoning_depth = depth;
        self
    }

    /// Set the token budget
    pub fn with_token_budget(mut self, budget: u32) -> Self {
        self.token_budget = budget;
        self
    }

    /// Set the retrieval strategy
    pub fn with_strategy(mut self, strategy: RetrievalStrategy) -> Self {
        self.retrieval_strategy = strategy;
        self
    }

    /// Set the acceptance threshold
    pub fn with_acceptance_threshold(mut self, threshold: f64) -> Self {
        self.acceptance_threshold = threshold;
        self
    }

    /// Set the wall-clock timeout
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set the query rewrite mode
    pub fn with_rewrite_mode(mut self, mode: RewriteMode) -> Self {
        self.rewrite_mode = mode;
        self
    }
}

fn config_error(message: &str) -> AppError {
    AppError::Config {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::HybridWeights;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_depth_is_three() {
        assert_eq!(PipelineConfig::default().max_reasoning_depth, 3);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = PipelineConfig::default()
            .with_token_budget(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
        assert!(err.to_string().contains("token_budget"));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = PipelineConfig::default()
            .with_max_depth(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_reasoning_depth"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err = PipelineConfig::default()
            .with_acceptance_threshold(1.5)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("acceptance_threshold"));
    }

    #[test]
    fn test_floor_above_threshold_rejected() {
        let mut config = PipelineConfig::default().with_acceptance_threshold(0.4);
        config.reject_floor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_weight_hybrid_rejected() {
        let config = PipelineConfig::default().with_strategy(RetrievalStrategy::Hybrid(
            HybridWeights {
                vector: 0.0,
                keyword: 0.0,
            },
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_step_cap_below_minimum_rejected() {
        let mut config = PipelineConfig::default();
        config.step_max_tokens = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"enable_cot": false, "token_budget": 900}"#).unwrap();
        assert!(!config.enable_cot);
        assert_eq!(config.token_budget, 900);
        assert_eq!(config.max_reasoning_depth, 3);
    }
}
