//! Command-line surface over the pipeline and run history.

use clap::Subcommand;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{BackendConfig, PipelineConfig};
use crate::error::AppResult;
use crate::pipeline::{PipelineOrchestrator, PipelineRunResult};
use crate::reasoning::{Question, RewriteMode};
use crate::retrieval::{
    CollectionRef, HttpSearchBackend, KeywordIndex, RetrievalStrategy, SearchBackend,
};
use crate::storage::{RunStore, SqliteStorage};
use crate::text::preview;

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Answer a question against a collection
    Query {
        /// The question to answer
        question: String,

        /// Collection to retrieve evidence from
        #[arg(long, short, default_value = "default")]
        collection: String,

        /// Never decompose, even for complex questions
        #[arg(long)]
        no_cot: bool,

        /// Retrieval strategy: vector, keyword or hybrid
        #[arg(long)]
        strategy: Option<RetrievalStrategy>,

        /// Maximum number of reasoning steps
        #[arg(long)]
        depth: Option<usize>,

        /// Token budget for the run
        #[arg(long)]
        budget: Option<u32>,

        /// Query rewriting: none, expand or hyde
        #[arg(long)]
        rewrite: Option<RewriteMode>,

        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Score answers with the LLM judge instead of the lexical scorer
        #[arg(long)]
        judge: bool,

        /// Save the run to the history database
        #[arg(long)]
        persist: bool,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    History {
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a saved run
    Show {
        /// Run identifier
        run_id: String,
    },
}

/// Per-invocation overrides applied on top of the configured pipeline.
#[derive(Debug, Clone, Default)]
pub struct QueryOverrides {
    pub no_cot: bool,
    pub strategy: Option<RetrievalStrategy>,
    pub depth: Option<usize>,
    pub budget: Option<u32>,
    pub rewrite: Option<RewriteMode>,
    pub timeout: Option<u64>,
}

impl QueryOverrides {
    pub fn apply(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut config = base.clone();
        if self.no_cot {
            config.enable_cot = false;
        }
        if let Some(strategy) = self.strategy {
            config.retrieval_strategy = strategy;
        }
        if let Some(depth) = self.depth {
            config.max_reasoning_depth = depth;
        }
        if let Some(budget) = self.budget {
            config.token_budget = budget;
        }
        if let Some(rewrite) = self.rewrite {
            config.rewrite_mode = rewrite;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_seconds = timeout;
        }
        config
    }
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Build the vector and keyword backends.
///
/// A backend without a URL is served by the local keyword index, loaded from
/// the corpus file when one is configured and empty otherwise.
pub fn build_backends(
    config: &BackendConfig,
    timeout_ms: u64,
) -> AppResult<(Arc<dyn SearchBackend>, Arc<dyn SearchBackend>)> {
    let local: Arc<dyn SearchBackend> = match &config.corpus_path {
        Some(path) => Arc::new(KeywordIndex::from_json_file(path)?),
        None => Arc::new(KeywordIndex::new()),
    };

    let vector: Arc<dyn SearchBackend> = match &config.vector_url {
        Some(url) => Arc::new(HttpSearchBackend::new(
            "vector",
            url,
            config.api_key.clone(),
            timeout_ms,
        )?),
        None => local.clone(),
    };
    let keyword: Arc<dyn SearchBackend> = match &config.keyword_url {
        Some(url) => Arc::new(HttpSearchBackend::new(
            "keyword",
            url,
            config.api_key.clone(),
            timeout_ms,
        )?),
        None => local,
    };

    Ok((vector, keyword))
}

/// Hybrid retrieval over two local backends would fuse the keyword index
/// with itself, so it is served as keyword retrieval instead.
pub fn resolve_strategy(backends: &BackendConfig, config: PipelineConfig) -> PipelineConfig {
    let both_local = backends.vector_url.is_none() && backends.keyword_url.is_none();
    if both_local && matches!(config.retrieval_strategy, RetrievalStrategy::Hybrid(_)) {
        warn!("No search backend URL configured, using keyword retrieval instead of hybrid");
        return config.with_strategy(RetrievalStrategy::Keyword);
    }
    config
}

/// Run one question and render the result.
pub async fn execute_query(
    orchestrator: &PipelineOrchestrator,
    storage: Option<&SqliteStorage>,
    question: &str,
    collection: &str,
    config: &PipelineConfig,
    json: bool,
) -> CliResult {
    let result = match orchestrator
        .run(&Question::new(question), &CollectionRef::new(collection), config)
        .await
    {
        Ok(result) => result,
        Err(e) => return CliResult::error(format!("Query failed: {}", e)),
    };

    if let Some(storage) = storage {
        if let Err(e) = storage.save_run(&result).await {
            return CliResult::error(format!("Run completed but could not be saved: {}", e));
        }
        info!(run_id = %result.run_id, "Run saved");
    }

    if json {
        return match serde_json::to_string_pretty(&result) {
            Ok(out) => CliResult::success(out),
            Err(e) => CliResult::error(format!("Failed to serialize result: {}", e)),
        };
    }

    CliResult::success(render_result(&result))
}

pub async fn execute_history(storage: &SqliteStorage, limit: u32) -> CliResult {
    let runs = match storage.list_runs(limit).await {
        Ok(runs) => runs,
        Err(e) => return CliResult::error(format!("Failed to list runs: {}", e)),
    };

    if runs.is_empty() {
        return CliResult::success("No runs recorded.");
    }

    let mut out = format!("{} most recent run(s):\n", runs.len());
    for run in runs {
        out.push_str(&format!(
            "  {}  {}  {:<9} conf={:.2} tokens={}{}  {}\n",
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.terminal_state,
            run.confidence,
            run.tokens_consumed,
            if run.fallback { " fallback" } else { "" },
            preview(&run.question, 60),
        ));
    }
    CliResult::success(out)
}

pub async fn execute_show(storage: &SqliteStorage, run_id: &str) -> CliResult {
    match storage.get_run(run_id).await {
        Ok(Some(run)) => CliResult::success(render_result(&run)),
        Ok(None) => CliResult::error(format!("Run not found: {}", run_id)),
        Err(e) => CliResult::error(format!("Failed to load run: {}", e)),
    }
}

/// Human-readable rendering of a run.
pub fn render_result(result: &PipelineRunResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", result.answer));

    let mut flags = Vec::new();
    if result.fallback {
        flags.push("fallback");
    }
    if result.timed_out {
        flags.push("timed out");
    }
    if result.low_confidence {
        flags.push("low confidence");
    }
    if result.evaluation_degraded {
        flags.push("unscored");
    }

    out.push_str(&format!(
        "run {} | {} | {} | confidence {:.2}",
        result.run_id, result.mode, result.terminal_state, result.confidence
    ));
    if !flags.is_empty() {
        out.push_str(&format!(" | {}", flags.join(", ")));
    }
    out.push_str(&format!(
        "\ntokens {}/{} | {} ms\n",
        result.token_usage.consumed, result.token_budget, result.elapsed_ms
    ));

    if result.trace.len() > 1 {
        out.push_str("\nsteps:\n");
        for step in &result.trace {
            out.push_str(&format!(
                "  {}. [{}] {}\n",
                step.step_index + 1,
                step.status,
                preview(&step.sub_question, 80)
            ));
        }
    }

    if !result.evidence.is_empty() {
        out.push_str("\nsources:\n");
        for chunk in &result.evidence {
            out.push_str(&format!("  [{}] {:.2}\n", chunk.source_id, chunk.score));
        }
    }

    out
}
