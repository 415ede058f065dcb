use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use decision_atlas::collaborator::Pacer;
use decision_atlas::config::{self, Config, EmbeddingProvider};
use decision_atlas::embedding::chunking::BodyChunker;
use decision_atlas::embedding::embedding_client_from_config;
use decision_atlas::extraction::TikaExtractionClient;
use decision_atlas::pipeline::{PipelineOrchestrator, PipelineRequest};
use decision_atlas::projection::PcaProjector;
use decision_atlas::source::DiavgeiaClient;
use decision_atlas::stages::{Collaborators, StageCatalog, StageSettings, default_implementation};
use decision_atlas::summarization::chat_client_from_config;
use decision_atlas::tasks::{TaskId, TaskRegistry, TaskRunner, TaskType};
use decision_atlas::usage::{CostLedger, ExceedPolicy};
use decision_atlas::{api, db, logging};
use serde_json::{Map, Value, json};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "decision-atlas",
    about = "Versioned pipeline over public-sector decisions"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RunArgs {
    /// Run name; versions are counted per stage, implementation and name.
    #[arg(long)]
    name: String,
    /// Explicit version instead of the next free one.
    #[arg(long)]
    version: Option<i64>,
    /// Stage implementation to run.
    #[arg(long)]
    implementation: Option<String>,
}

#[derive(Args)]
struct DecisionRange {
    /// First issue date, `YYYY-MM-DD`.
    #[arg(long)]
    start_date: String,
    /// Last issue date, `YYYY-MM-DD`.
    #[arg(long)]
    end_date: String,
    /// Comma separated decision type ids.
    #[arg(long)]
    decision_types: String,
    /// Stop after this many decisions.
    #[arg(long)]
    only: Option<u64>,
}

impl DecisionRange {
    fn params(&self) -> Value {
        let mut params = json!({
            "startDate": self.start_date,
            "endDate": self.end_date,
            "decisionTypes": self.decision_types,
        });
        if let Some(only) = self.only {
            params["only"] = json!(only);
        }
        params
    }
}

#[derive(Subcommand)]
enum Command {
    /// Pull decisions from Diavgeia.
    Ingest {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        range: DecisionRange,
    },
    /// Extract document text for ingested decisions.
    ExtractText {
        #[command(flatten)]
        run: RunArgs,
        /// Defaults to the most recent ingestor task.
        #[arg(long)]
        ingestor_task_id: Option<TaskId>,
        #[arg(long)]
        only: Option<u64>,
    },
    /// Summarize extracted texts.
    Summarize {
        #[command(flatten)]
        run: RunArgs,
        /// Defaults to the most recent text extractor task.
        #[arg(long)]
        text_extractor_task_id: Option<TaskId>,
        #[arg(long)]
        only: Option<u64>,
    },
    /// Embed extracted texts, with summaries when available.
    Embed {
        #[command(flatten)]
        run: RunArgs,
        /// Defaults to the most recent text extractor task.
        #[arg(long)]
        text_extractor_task_id: Option<TaskId>,
        /// Defaults to the most recent summarizer task over the same texts.
        #[arg(long, conflicts_with = "no_summaries")]
        summarizer_task_id: Option<TaskId>,
        /// Embed without joining any summaries.
        #[arg(long)]
        no_summaries: bool,
        #[arg(long)]
        only: Option<u64>,
    },
    /// Project a sample of embedded decisions to 2D.
    ReduceDimensions {
        #[command(flatten)]
        run: RunArgs,
        /// Defaults to the most recent embedder task.
        #[arg(long)]
        embedder_task_id: Option<TaskId>,
        #[arg(long)]
        sample_size: Option<u64>,
    },
    /// Run every stage and publish a configuration.
    Pipeline {
        /// Run name shared by every stage and the configuration.
        #[arg(long)]
        name: String,
        #[command(flatten)]
        range: DecisionRange,
        /// Stage to leave out (only `summarizer` is accepted).
        #[arg(long)]
        skip: Vec<TaskType>,
        #[arg(long)]
        sample_size: Option<u64>,
    },
    /// Serve the read-only API.
    Serve {
        /// Overrides SERVER_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect or maintain the task registry.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List tasks, newest first.
    List {
        #[arg(long = "type")]
        task_type: Option<TaskType>,
    },
    /// Fail running tasks whose heartbeat is older than the lease.
    Reap {
        /// Overrides TASK_LEASE_SECS.
        #[arg(long)]
        lease_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);
    config::init_config();
    if let Err(err) = run(cli.command).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    let config = config::get_config();
    let pool = db::connect(&config.database_url)
        .await
        .context("failed to open the task database")?;
    let registry = TaskRegistry::new(pool.clone());

    match command {
        Command::Ingest { run, range } => {
            let collaborators = collaborators(config)?;
            run_stage(&registry, &collaborators, TaskType::Ingestor, &run, range.params()).await
        }
        Command::ExtractText {
            run,
            ingestor_task_id,
            only,
        } => {
            let collaborators = collaborators(config)?;
            let mut params = Map::new();
            params.insert(
                TaskType::Ingestor.upstream_param().into(),
                json!(upstream(&registry, ingestor_task_id, TaskType::Ingestor).await?),
            );
            insert_optional(&mut params, "only", only);
            run_stage(&registry, &collaborators, TaskType::TextExtractor, &run, Value::Object(params)).await
        }
        Command::Summarize {
            run,
            text_extractor_task_id,
            only,
        } => {
            let collaborators = collaborators(config)?;
            let mut params = Map::new();
            params.insert(
                TaskType::TextExtractor.upstream_param().into(),
                json!(upstream(&registry, text_extractor_task_id, TaskType::TextExtractor).await?),
            );
            insert_optional(&mut params, "only", only);
            run_stage(&registry, &collaborators, TaskType::Summarizer, &run, Value::Object(params)).await
        }
        Command::Embed {
            run,
            text_extractor_task_id,
            summarizer_task_id,
            no_summaries,
            only,
        } => {
            let collaborators = collaborators(config)?;
            let text_extractor_task_id =
                upstream(&registry, text_extractor_task_id, TaskType::TextExtractor).await?;
            let mut params = Map::new();
            params.insert(
                TaskType::TextExtractor.upstream_param().into(),
                json!(text_extractor_task_id),
            );
            let summarizer = match summarizer_task_id {
                Some(id) => Some(id),
                None if no_summaries => None,
                None => {
                    let latest = registry
                        .last_task_id_consuming(
                            TaskType::Summarizer,
                            TaskType::TextExtractor,
                            text_extractor_task_id,
                        )
                        .await?;
                    if latest.is_none() {
                        tracing::info!(
                            text_extractor_task_id,
                            "No summarizer task read these texts; embedding without summaries"
                        );
                    }
                    latest
                }
            };
            insert_optional(&mut params, TaskType::Summarizer.upstream_param(), summarizer);
            insert_optional(&mut params, "only", only);
            run_stage(&registry, &collaborators, TaskType::Embedder, &run, Value::Object(params)).await
        }
        Command::ReduceDimensions {
            run,
            embedder_task_id,
            sample_size,
        } => {
            let collaborators = collaborators(config)?;
            let mut params = Map::new();
            params.insert(
                TaskType::Embedder.upstream_param().into(),
                json!(upstream(&registry, embedder_task_id, TaskType::Embedder).await?),
            );
            insert_optional(&mut params, "sampleSize", sample_size);
            run_stage(
                &registry,
                &collaborators,
                TaskType::DimensionalityReducer,
                &run,
                Value::Object(params),
            )
            .await
        }
        Command::Pipeline {
            name,
            range,
            skip,
            sample_size,
        } => {
            let collaborators = collaborators(config)?;
            let mut request = PipelineRequest::new(name, range.params());
            for task_type in skip {
                request = request.skip(task_type);
            }
            if let Some(sample_size) = sample_size {
                request = request.with_stage_param(
                    TaskType::DimensionalityReducer,
                    "sampleSize",
                    json!(sample_size),
                );
            }
            let outcome = PipelineOrchestrator::new(registry, StageCatalog::builtin(), collaborators)
                .run(&request)
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "configurationId": outcome.configuration_id,
                    "tasks": outcome.task_ids,
                }))?
            );
            Ok(())
        }
        Command::Serve { port } => {
            let port = port.unwrap_or(config.server_port);
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
                .await
                .with_context(|| format!("failed to bind port {port}"))?;
            tracing::info!("Listening on http://0.0.0.0:{}", port);
            axum::serve(listener, api::create_router(pool)).await?;
            Ok(())
        }
        Command::Tasks {
            command: TasksCommand::List { task_type },
        } => {
            for task in registry
                .list()
                .await?
                .into_iter()
                .filter(|task| task_type.is_none_or(|wanted| task.task_type == wanted))
            {
                println!(
                    "{:>6}  {:<9}  {}  {}",
                    task.id,
                    task.status.as_str(),
                    task.identifier(),
                    task.metrics
                );
            }
            Ok(())
        }
        Command::Tasks {
            command: TasksCommand::Reap { lease_secs },
        } => {
            let lease = Duration::from_secs(lease_secs.unwrap_or(config.task_lease_secs));
            let reaped = registry.reap_stale(lease).await?;
            println!("Reaped {} task(s): {:?}", reaped.len(), reaped);
            Ok(())
        }
    }
}

/// Wire the configured collaborators. Chat and embeddings are optional so stages that do
/// not need them run without credentials.
fn collaborators(config: &Config) -> Result<Collaborators> {
    let ledger = Arc::new(CostLedger::new(config.max_cost_usd, ExceedPolicy::Exit));
    tracing::info!(max_cost_usd = ledger.max_cost_usd(), "Cost ceiling in effect");
    let chat = chat_client_from_config(config, ledger.clone())
        .inspect_err(|err| tracing::warn!(error = %err, "Chat collaborator unavailable"))
        .ok();
    let embeddings = embedding_client_from_config(config, ledger)
        .inspect_err(|err| tracing::warn!(error = %err, "Embedding collaborator unavailable"))
        .ok();

    // Without an embedding provider the chunker counts whitespace tokens.
    let chunker = BodyChunker::for_model(
        config.embedding_provider.unwrap_or(EmbeddingProvider::Hash),
        config.embedding_model.as_deref().unwrap_or_default(),
        config.text_splitter_chunk_size,
    )?;
    tracing::debug!(chunk_size = chunker.chunk_size(), "Body chunk budget");

    Ok(Collaborators {
        source: Arc::new(DiavgeiaClient::new(config.diavgeia_url.clone())?),
        extraction: Arc::new(TikaExtractionClient::new(config.text_extraction_url.clone())?),
        chat,
        chat_pacer: config
            .chat_requests_per_minute
            .map(|per_minute| Arc::new(Pacer::per_minute(per_minute))),
        embeddings,
        chunker,
        projector: Arc::new(PcaProjector),
        settings: StageSettings {
            concurrency: config.batch_concurrency,
            max_body_chunks: config.embedding_max_body_chunks,
        },
    })
}

async fn upstream(registry: &TaskRegistry, explicit: Option<TaskId>, task_type: TaskType) -> Result<TaskId> {
    match explicit {
        Some(id) => Ok(id),
        None => registry
            .last_task_id(task_type)
            .await?
            .with_context(|| format!("no {task_type} task recorded yet; pass its id explicitly")),
    }
}

fn insert_optional<T: Into<Value>>(params: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        params.insert(key.to_string(), value.into());
    }
}

async fn run_stage(
    registry: &TaskRegistry,
    collaborators: &Collaborators,
    task_type: TaskType,
    run: &RunArgs,
    params: Value,
) -> Result<()> {
    let implementation = run
        .implementation
        .as_deref()
        .unwrap_or_else(|| default_implementation(task_type));
    let behavior = StageCatalog::builtin().build(task_type, implementation, collaborators)?;
    let task_id = TaskRunner::new(registry.clone(), behavior, run.name.clone())
        .start(params, run.version)
        .await?;

    let task = registry
        .get(task_id)
        .await?
        .with_context(|| format!("task {task_id} vanished after finishing"))?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
