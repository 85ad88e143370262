use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{RunStore, RunSummary, StoredStep};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::pipeline::PipelineRunResult;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed run store
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory database on a single connection, for tests and dry runs.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for SqliteStorage {
    async fn save_run(&self, run: &PipelineRunResult) -> StorageResult<()> {
        let result_json = serde_json::to_string(run).map_err(|e| StorageError::Query {
            message: format!("Failed to serialize run: {}", e),
        })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_steps WHERE run_id = ?")
            .bind(&run.run_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs (id, question, collection, mode, answer, terminal_state, confidence, fallback, timed_out, tokens_consumed, token_budget, elapsed_ms, created_at, result_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.question)
        .bind(&run.collection)
        .bind(run.mode.as_str())
        .bind(&run.answer)
        .bind(run.terminal_state.name())
        .bind(run.confidence)
        .bind(run.fallback)
        .bind(run.timed_out)
        .bind(i64::from(run.token_usage.consumed))
        .bind(i64::from(run.token_budget))
        .bind(run.elapsed_ms as i64)
        .bind(run.created_at.to_rfc3339())
        .bind(&result_json)
        .execute(&mut *tx)
        .await?;

        for step in &run.trace {
            let evidence_ids: Vec<&str> =
                step.evidence.iter().map(|c| c.source_id.as_str()).collect();
            let evidence_json = serde_json::to_string(&evidence_ids).unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO run_steps (run_id, step_index, sub_question, sub_answer, status, token_cost, latency_ms, degraded, failure_reason, evidence_ids)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&run.run_id)
            .bind(step.step_index as i64)
            .bind(&step.sub_question)
            .bind(&step.sub_answer)
            .bind(step.status.as_str())
            .bind(i64::from(step.token_cost))
            .bind(step.latency_ms as i64)
            .bind(step.degraded)
            .bind(&step.failure_reason)
            .bind(&evidence_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(run_id = %run.run_id, steps = run.trace.len(), "Run saved");
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<Option<PipelineRunResult>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT result_json FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(json,)| {
            serde_json::from_str(&json).map_err(|e| StorageError::Query {
                message: format!("Corrupt run record {}: {}", run_id, e),
            })
        })
        .transpose()
    }

    async fn list_runs(&self, limit: u32) -> StorageResult<Vec<RunSummary>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, question, collection, mode, terminal_state, confidence, fallback, timed_out, tokens_consumed, created_at
            FROM runs
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn get_steps(&self, run_id: &str) -> StorageResult<Vec<StoredStep>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT run_id, step_index, sub_question, sub_answer, status, token_cost, latency_ms, degraded, failure_reason, evidence_ids
            FROM run_steps
            WHERE run_id = ?
            ORDER BY step_index ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn delete_run(&self, run_id: &str) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_steps WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    question: String,
    collection: String,
    mode: String,
    terminal_state: String,
    confidence: f64,
    fallback: bool,
    timed_out: bool,
    tokens_consumed: i64,
    created_at: String,
}

impl From<RunRow> for RunSummary {
    fn from(row: RunRow) -> Self {
        Self {
            run_id: row.id,
            question: row.question,
            collection: row.collection,
            mode: row.mode,
            terminal_state: row.terminal_state,
            confidence: row.confidence,
            fallback: row.fallback,
            timed_out: row.timed_out,
            tokens_consumed: u32::try_from(row.tokens_consumed).unwrap_or(0),
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    run_id: String,
    step_index: i64,
    sub_question: String,
    sub_answer: String,
    status: String,
    token_cost: i64,
    latency_ms: i64,
    degraded: bool,
    failure_reason: Option<String>,
    evidence_ids: String,
}

impl From<StepRow> for StoredStep {
    fn from(row: StepRow) -> Self {
        Self {
            run_id: row.run_id,
            step_index: usize::try_from(row.step_index).unwrap_or(0),
            sub_question: row.sub_question,
            sub_answer: row.sub_answer,
            status: row.status,
            token_cost: u32::try_from(row.token_cost).unwrap_or(0),
            latency_ms: u64::try_from(row.latency_ms).unwrap_or(0),
            degraded: row.degraded,
            failure_reason: row.failure_reason,
            evidence_ids: serde_json::from_str(&row.evidence_ids).unwrap_or_default(),
        }
    }
}
