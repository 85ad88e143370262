//! Integration tests for SQLite run storage
//!
//! Runs are produced by the pipeline over scripted collaborators and then
//! persisted to an in-memory database, or a file database for reopen tests.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;

use common::{
    collection, orchestrator, policy_hits, ScriptedBackend, ScriptedEvaluator, ScriptedProvider,
};
use rag_cot::config::DatabaseConfig;
use rag_cot::error::StorageError;
use rag_cot::generation::CallPurpose;
use rag_cot::reasoning::Question;
use rag_cot::retrieval::RetrievalStrategy;
use rag_cot::storage::{RunStore, SqliteStorage};
use rag_cot::{PipelineConfig, PipelineRunResult};

const TWO_STEP_PLAN: &str = r#"{"sub_questions": [
    {"question": "What is the refund policy for laptops?", "depends_on": []},
    {"question": "What warranty coverage do laptops carry?", "depends_on": []}
]}"#;

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

async fn simple_run() -> PipelineRunResult {
    let provider = Arc::new(ScriptedProvider::new().on(
        CallPurpose::StepAnswer,
        "Laptops can be returned within 30 days [refund-policy].",
        120,
    ));
    let backend = Arc::new(ScriptedBackend::new(policy_hits()));
    orchestrator(provider, backend, Arc::new(ScriptedEvaluator::accepting()))
        .run(
            &Question::new("What is the refund window for laptops?"),
            &collection(),
            &PipelineConfig::default().with_strategy(RetrievalStrategy::Vector),
        )
        .await
        .expect("simple run")
}

async fn two_step_run() -> PipelineRunResult {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on(CallPurpose::Decompose, TWO_STEP_PLAN, 40)
            .on(
                CallPurpose::StepAnswer,
                "Laptops can be returned for a full refund within 30 days [refund-policy].",
                100,
            )
            .on(
                CallPurpose::Synthesis,
                "Refunds within 30 days [refund-policy] and a two year warranty [warranty-policy].",
                150,
            ),
    );
    let backend = Arc::new(ScriptedBackend::new(policy_hits()));
    orchestrator(provider, backend, Arc::new(ScriptedEvaluator::accepting()))
        .run(
            &Question::new("Compare the refund policy and the warranty coverage for laptops"),
            &collection(),
            &PipelineConfig::default().with_strategy(RetrievalStrategy::Vector),
        )
        .await
        .expect("two step run")
}

#[cfg(test)]
mod run_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_and_get_run() {
        let storage = create_test_storage().await;
        let run = simple_run().await;

        storage.save_run(&run).await.unwrap();
        let loaded = storage.get_run(&run.run_id).await.unwrap().expect("run exists");

        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.question, run.question);
        assert_eq!(loaded.answer, run.answer);
        assert_eq!(loaded.mode, run.mode);
        assert_eq!(loaded.terminal_state, run.terminal_state);
        assert_eq!(loaded.token_usage, run.token_usage);
        assert_eq!(loaded.trace.len(), run.trace.len());
        assert_eq!(loaded.source_ids(), run.source_ids());
    }

    #[tokio::test]
    async fn test_get_missing_run_is_none() {
        let storage = create_test_storage().await;
        assert!(storage.get_run("no-such-run").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resave_replaces_run() {
        let storage = create_test_storage().await;
        let mut run = two_step_run().await;
        storage.save_run(&run).await.unwrap();

        run.answer = "Revised answer [refund-policy].".to_string();
        run.trace.truncate(1);
        storage.save_run(&run).await.unwrap();

        let loaded = storage.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.answer, "Revised answer [refund-policy].");
        assert_eq!(storage.get_steps(&run.run_id).await.unwrap().len(), 1);
        assert_eq!(storage.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_run() {
        let storage = create_test_storage().await;
        let run = two_step_run().await;
        storage.save_run(&run).await.unwrap();

        storage.delete_run(&run.run_id).await.unwrap();

        assert!(storage.get_run(&run.run_id).await.unwrap().is_none());
        assert!(storage.get_steps(&run.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_run_is_not_found() {
        let storage = create_test_storage().await;
        let run = simple_run().await;
        storage.save_run(&run).await.unwrap();
        storage.delete_run(&run.run_id).await.unwrap();

        let err = storage.delete_run(&run.run_id).await.unwrap_err();
        match err {
            StorageError::RunNotFound { run_id } => assert_eq!(run_id, run.run_id),
            other => panic!("Expected RunNotFound, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod listing_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_list_runs_newest_first_with_limit() {
        let storage = create_test_storage().await;
        let base = simple_run().await;
        let now = Utc::now();

        for (i, id) in ["run-old", "run-mid", "run-new"].iter().enumerate() {
            let mut run = base.clone();
            run.run_id = id.to_string();
            run.created_at = now - ChronoDuration::hours(3 - i as i64);
            storage.save_run(&run).await.unwrap();
        }

        let all = storage.list_runs(10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-new", "run-mid", "run-old"]);

        let limited = storage.list_runs(2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].run_id, "run-new");
    }

    #[tokio::test]
    async fn test_summary_reflects_run() {
        let storage = create_test_storage().await;
        let run = simple_run().await;
        storage.save_run(&run).await.unwrap();

        let summaries = storage.list_runs(5).await.unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.collection, "store-policies");
        assert_eq!(summary.mode, run.mode.as_str());
        assert_eq!(summary.terminal_state, run.terminal_state.name());
        assert_eq!(summary.tokens_consumed, run.token_usage.consumed);
        assert_eq!(summary.fallback, run.fallback);
    }

    #[tokio::test]
    async fn test_get_steps_in_order_with_evidence() {
        let storage = create_test_storage().await;
        let run = two_step_run().await;
        storage.save_run(&run).await.unwrap();

        let steps = storage.get_steps(&run.run_id).await.unwrap();
        assert_eq!(steps.len(), run.trace.len());

        for (stored, step) in steps.iter().zip(&run.trace) {
            assert_eq!(stored.step_index, step.step_index);
            assert_eq!(stored.sub_question, step.sub_question);
            assert_eq!(stored.status, step.status.as_str());
            assert_eq!(stored.token_cost, step.token_cost);
            let ids: Vec<String> = step.evidence.iter().map(|e| e.source_id.clone()).collect();
            assert_eq!(stored.evidence_ids, ids);
        }
        assert!(steps.windows(2).all(|w| w[0].step_index < w[1].step_index));
    }
}

#[cfg(test)]
mod file_database_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_runs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("runs.db"),
            max_connections: 2,
        };
        let run = simple_run().await;

        {
            let storage = SqliteStorage::new(&config).await.unwrap();
            storage.save_run(&run).await.unwrap();
            storage.pool().close().await;
        }

        let reopened = SqliteStorage::new(&config).await.unwrap();
        let loaded = reopened.get_run(&run.run_id).await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(reopened.list_runs(10).await.unwrap().len(), 1);
    }
}
