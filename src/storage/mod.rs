//! Storage layer for pipeline run history.
//!
//! Runs are persisted whole as JSON alongside an indexed summary row and one
//! row per executed step.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::pipeline::PipelineRunResult;

/// Summary row for listing past runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub question: String,
    pub collection: String,
    pub mode: String,
    pub terminal_state: String,
    pub confidence: f64,
    pub fallback: bool,
    pub timed_out: bool,
    pub tokens_consumed: u32,
    pub created_at: DateTime<Utc>,
}

/// One persisted trace step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStep {
    pub run_id: String,
    pub step_index: usize,
    pub sub_question: String,
    pub sub_answer: String,
    pub status: String,
    pub token_cost: u32,
    pub latency_ms: u64,
    pub degraded: bool,
    pub failure_reason: Option<String>,
    /// Source ids of the step's evidence, in rank order.
    pub evidence_ids: Vec<String>,
}

/// Persistence for completed runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Save a run and its trace. Saving the same run id again replaces it.
    async fn save_run(&self, run: &PipelineRunResult) -> StorageResult<()>;
    /// Load a full run by id.
    async fn get_run(&self, run_id: &str) -> StorageResult<Option<PipelineRunResult>>;
    /// Most recent runs first.
    async fn list_runs(&self, limit: u32) -> StorageResult<Vec<RunSummary>>;
    /// Trace steps of a run, in step order.
    async fn get_steps(&self, run_id: &str) -> StorageResult<Vec<StoredStep>>;
    /// Delete a run and its steps.
    async fn delete_run(&self, run_id: &str) -> StorageResult<()>;
}
