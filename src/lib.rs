//! # RAG Chain-of-Thought
//!
//! A retrieval-augmented question answering pipeline that breaks complex
//! questions into sub-questions, retrieves evidence and answers each one under
//! a shared token budget, then synthesizes and evaluates a final answer.
//!
//! ## Features
//!
//! - **Decomposition**: LLM-driven planning with a cheap simple-question bypass
//! - **Retrieval**: vector, keyword (BM25) and weighted hybrid strategies
//! - **Budgeted generation**: reservation-based token accounting with bounded retry
//! - **Evaluation**: lexical grounding scorer or LLM judge with one retry
//! - **Fallback**: single-shot retrieval whenever the reasoning chain breaks
//!
//! ## Architecture
//!
//! ```text
//! CLI → PipelineOrchestrator → ChainOfThoughtEngine
//!              ↓                    ↓           ↓
//!        SQLite (history)      Retriever   AnswerGenerator → Langbase Pipes
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rag_cot::pipeline::{Collaborators, PipelineOrchestrator};
//! use rag_cot::reasoning::Question;
//! use rag_cot::retrieval::{CollectionRef, KeywordIndex};
//!
//! let index = Arc::new(KeywordIndex::from_json_file("corpus.json".as_ref())?);
//! let pipeline = PipelineOrchestrator::new(Collaborators::new(provider, index.clone(), index));
//! let result = pipeline
//!     .run(&Question::new("What is the refund window?"), &CollectionRef::new("docs"), &config)
//!     .await?;
//! println!("{}", result.answer);
//! ```

/// Command-line commands and rendering.
pub mod cli;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Budgeted LLM generation.
pub mod generation;
/// Langbase API client and LLM provider.
pub mod langbase;
/// Pipeline entry point and run results.
pub mod pipeline;
/// Prompt templates for Langbase pipes.
pub mod prompts;
/// Decomposition, rewriting, evaluation and the reasoning engine.
pub mod reasoning;
/// Evidence retrieval strategies and search backends.
pub mod retrieval;
/// SQLite storage for run history.
pub mod storage;
/// Text normalization helpers.
pub mod text;

pub use config::{Config, PipelineConfig};
pub use error::{AppError, AppResult};
pub use pipeline::{run_pipeline, Collaborators, PipelineOrchestrator, PipelineRunResult};
