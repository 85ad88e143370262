use clap::Parser;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rag_cot::{
    cli::{
        build_backends, execute_history, execute_query, execute_show, resolve_strategy, Commands,
        QueryOverrides,
    },
    config::{Config, LogFormat},
    generation::RetryPolicy,
    langbase::{LangbaseClient, LangbaseProvider},
    pipeline::{Collaborators, PipelineOrchestrator},
    reasoning::JudgeEvaluator,
    storage::SqliteStorage,
};

#[derive(Parser, Debug)]
#[command(name = "rag-cot", version, about = "Chain-of-thought RAG query pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "rag-cot starting");

    let result = match cli.command {
        Commands::Query {
            question,
            collection,
            no_cot,
            strategy,
            depth,
            budget,
            rewrite,
            timeout,
            judge,
            persist,
            json,
        } => {
            let overrides = QueryOverrides {
                no_cot,
                strategy,
                depth,
                budget,
                rewrite,
                timeout,
            };
            let pipeline_config =
                resolve_strategy(&config.backend, overrides.apply(&config.pipeline));

            let orchestrator = build_orchestrator(&config, judge).await?;
            let storage = if persist {
                Some(open_storage(&config).await?)
            } else {
                None
            };

            execute_query(
                &orchestrator,
                storage.as_ref(),
                &question,
                &collection,
                &pipeline_config,
                json,
            )
            .await
        }
        Commands::History { limit } => {
            let storage = open_storage(&config).await?;
            execute_history(&storage, limit).await
        }
        Commands::Show { run_id } => {
            let storage = open_storage(&config).await?;
            execute_show(&storage, &run_id).await
        }
    };

    if result.exit_code == 0 {
        println!("{}", result.message);
    } else {
        eprintln!("{}", result.message);
    }
    std::process::exit(result.exit_code);
}

async fn build_orchestrator(config: &Config, judge: bool) -> anyhow::Result<PipelineOrchestrator> {
    let client = match LangbaseClient::new(&config.langbase, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.langbase.base_url, "Langbase client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Langbase client");
            return Err(e.into());
        }
    };

    let provider = LangbaseProvider::new(client, config.pipes.clone());
    if let Err(e) = provider.ensure_pipes().await {
        error!(error = %e, "Failed to ensure Langbase pipes exist");
        return Err(e.into());
    }

    let (vector, keyword) = build_backends(&config.backend, config.pipeline.retrieval_timeout_ms)?;

    let mut collaborators = Collaborators::new(Arc::new(provider), vector, keyword)
        .with_retry(RetryPolicy::from(&config.request));
    if judge {
        collaborators = collaborators
            .with_evaluator(Arc::new(JudgeEvaluator::new(config.pipeline.judge_max_tokens)));
    }

    Ok(PipelineOrchestrator::new(collaborators))
}

async fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Ok(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            Err(e.into())
        }
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
