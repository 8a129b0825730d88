use anyhow::Context;
use clap::{Parser, Subcommand};
use ragline_embed::build_provider;
use ragline_retriever::{
    config::{DEFAULT_CONFIG_FILE, RagConfig},
    ingestion::{
        ExecutionRecord, FileOutcome, IngestionEngine, RunSummary, Step, WorkflowEngine,
        WorkflowJournal,
    },
    logging::init_tracing,
    retrieval::{DistanceMetric, FilterMode, RetrievalEngine, RetrievalRequest, RetrievalResponse},
    storage::{IngestionRun, MetadataFilter, SqliteStore},
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Ingest folders into a local RAG index and query it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./ragline.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default ragline.toml (if missing) and create the database
    Init,
    /// Ingest every supported file under a folder
    Ingest {
        folder: PathBuf,
        /// Use this run id instead of a generated one
        #[arg(long)]
        run_id: Option<String>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show one ingestion run, or the most recent runs
    Status {
        run_id: Option<String>,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List per-file workflow executions
    Executions {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Continue an execution from its last checkpoint
    Resume {
        execution_id: String,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Re-run a finished execution starting at a given step
    Fork {
        execution_id: String,
        /// check_exists, load_and_normalize, chunk, embed or save
        #[arg(long)]
        from: Step,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Cancel an execution; the current step finishes, the next never starts
    Cancel { execution_id: String },
    /// Resume every execution left unfinished by an interrupted process
    Recover {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Search the index
    Query {
        text: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Rerank an over-fetched candidate set
        #[arg(long)]
        rerank: bool,
        /// Only chunks from this path (exact or trailing path suffix)
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        file_type: Option<String>,
        #[arg(long)]
        page: Option<u32>,
        /// pre or post
        #[arg(long)]
        filter_mode: Option<FilterMode>,
        /// cosine, euclidean or inner_product
        #[arg(long)]
        metric: Option<DistanceMetric>,
        /// Keep results with distance <= threshold
        #[arg(short, long)]
        threshold: Option<f32>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show index statistics
    Stats {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = RagConfig::load_or_default(args.config.as_deref())?;
    if let Some(db) = &args.db {
        config.database.path = db.clone();
    }
    init_tracing(&config.logging)?;

    match args.command {
        Commands::Init => {
            let config_path = args
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            if config_path.exists() {
                println!("Keeping existing {}", config_path.display());
            } else {
                std::fs::write(&config_path, config.to_toml_string()?)
                    .with_context(|| format!("Failed to write {}", config_path.display()))?;
                println!("Wrote {}", config_path.display());
            }
            open_store(&config).await?;
            println!(
                "Initialized index database at {}",
                config.database.path.display()
            );
            Ok(())
        }
        Commands::Ingest {
            folder,
            run_id,
            format,
        } => {
            let engine = ingestion_engine(&config).await?;
            let handle = engine.submit_folder(&folder, run_id).await?;
            println!("Run {} started", handle.run_id);
            let summary = handle.wait().await?;
            print_summary(&summary, &format)?;
            Ok(())
        }
        Commands::Status {
            run_id,
            limit,
            format,
        } => {
            let store = open_store(&config).await?;
            let runs = match run_id {
                Some(run_id) => {
                    let run = store
                        .get_run(&run_id)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("No ingestion run with id {run_id}"))?;
                    vec![run]
                }
                None => store.list_runs(limit).await?,
            };
            print_runs(&runs, &format)
        }
        Commands::Executions { run_id, format } => {
            let store = open_store(&config).await?;
            let executions = WorkflowJournal::new(&store).list(run_id.as_deref()).await?;
            print_executions(&executions, &format)
        }
        Commands::Resume {
            execution_id,
            format,
        } => {
            let engine = workflow_engine(&config).await?;
            let outcome = engine.resume(&execution_id).await?;
            print_outcomes(&[outcome], &format)
        }
        Commands::Fork {
            execution_id,
            from,
            format,
        } => {
            let engine = workflow_engine(&config).await?;
            let outcome = engine.fork(&execution_id, from).await?;
            print_outcomes(&[outcome], &format)
        }
        Commands::Cancel { execution_id } => {
            let engine = workflow_engine(&config).await?;
            if engine.cancel(&execution_id).await? {
                println!("Cancelled {execution_id}");
            } else {
                println!("{execution_id} has already finished");
            }
            Ok(())
        }
        Commands::Recover { format } => {
            let engine = Arc::new(workflow_engine(&config).await?);
            let outcomes = engine.recover().await?;
            if outcomes.is_empty() && format != OutputFormat::Json {
                println!("Nothing to recover");
                return Ok(());
            }
            print_outcomes(&outcomes, &format)
        }
        Commands::Query {
            text,
            top_k,
            rerank,
            source,
            file_type,
            page,
            filter_mode,
            metric,
            threshold,
            format,
        } => {
            let store = open_store(&config).await?;
            let provider = build_provider(&config.embedding).await?;
            let engine = RetrievalEngine::from_config(store, provider, &config.retrieval).await?;

            let request = RetrievalRequest {
                query: text,
                top_k,
                filter: MetadataFilter {
                    source_path: source,
                    file_type,
                    page,
                    ..MetadataFilter::default()
                },
                rerank: rerank.then_some(true),
                distance_threshold: threshold,
                metric,
                filter_mode,
            };
            let response = engine.retrieve(&request).await?;
            print_response(&response, &format)
        }
        Commands::Stats { format } => {
            let store = open_store(&config).await?;
            let stats = store.stats().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Index Statistics:");
                    println!("  Database: {}", config.database.path.display());
                    println!("  Source files: {}", stats.source_files);
                    println!("  Chunks: {}", stats.chunks);
                    println!("  Ingestion runs: {}", stats.runs);
                    match &stats.model {
                        Some(model) => println!(
                            "  Embedding model: {} (dimension {})",
                            model.model_id, model.dimension
                        ),
                        None => println!("  Embedding model: none registered"),
                    }
                    if !stats.executions_by_state.is_empty() {
                        println!("  Executions:");
                        for (state, count) in &stats.executions_by_state {
                            println!("    {state}: {count}");
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

async fn open_store(config: &RagConfig) -> anyhow::Result<SqliteStore> {
    let path = &config.database.path;
    SqliteStore::open(path)
        .await
        .with_context(|| format!("Failed to open index database {}", path.display()))
}

async fn workflow_engine(config: &RagConfig) -> anyhow::Result<WorkflowEngine> {
    let store = open_store(config).await?;
    let provider = build_provider(&config.embedding).await?;
    Ok(WorkflowEngine::new(store, provider, config)?)
}

async fn ingestion_engine(config: &RagConfig) -> anyhow::Result<IngestionEngine> {
    let store = open_store(config).await?;
    let provider = build_provider(&config.embedding).await?;
    Ok(IngestionEngine::from_config(store, provider, config)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary(summary: &RunSummary, format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        return print_json(summary);
    }
    let c = &summary.counters;
    println!("Run {} {} ({})", summary.run_id, summary.status, summary.folder);
    println!(
        "  found: {} | processed: {} | cached: {} | skipped: {} | failed: {} | cancelled: {}",
        c.files_found, c.processed, c.cached, c.skipped, c.failed, c.cancelled
    );
    if *format == OutputFormat::Full {
        print_outcomes(&summary.outcomes, format)?;
    } else {
        for outcome in &summary.outcomes {
            if let FileOutcome::Failed { path, error, .. } = outcome {
                println!("  failed {path}: {error}");
            }
        }
    }
    for failure in &summary.discovery_failures {
        println!(
            "  unreadable {}: {}",
            failure.path.as_deref().unwrap_or("<walk>"),
            failure.error
        );
    }
    for path in &summary.pruned {
        println!("  pruned {path}");
    }
    if let Some(error) = &summary.error {
        println!("  error: {error}");
    }
    Ok(())
}

fn print_runs(runs: &[IngestionRun], format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        return print_json(runs);
    }
    if runs.is_empty() {
        println!("No ingestion runs recorded");
    }
    for run in runs {
        let c = &run.counters;
        println!(
            "{} | {} | {} | found {} processed {} cached {} skipped {} failed {}",
            run.run_id,
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            c.files_found,
            c.processed,
            c.cached,
            c.skipped,
            c.failed
        );
        if *format == OutputFormat::Full {
            println!("  folder: {}", run.folder);
            println!("  model: {}", run.model_id);
            println!("  pipeline version: {}", run.pipeline_version);
            if let Some(finished) = run.finished_at {
                println!("  finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(error) = &run.error {
                println!("  error: {error}");
            }
        }
    }
    Ok(())
}

fn print_executions(executions: &[ExecutionRecord], format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        return print_json(executions);
    }
    println!("Found {} executions:", executions.len());
    for record in executions {
        println!(
            "  {} | {} | {} | attempts {}",
            record.execution_id, record.state, record.file_path, record.attempt_count
        );
        if *format == OutputFormat::Full {
            if let Some(run_id) = &record.last_run_id {
                println!("    run: {run_id}");
            }
            println!("    forks: {}", record.fork_count);
            if let Some(error) = &record.error {
                println!("    error: {error}");
            }
        }
    }
    Ok(())
}

fn print_outcomes(outcomes: &[FileOutcome], format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        return print_json(outcomes);
    }
    for outcome in outcomes {
        match outcome {
            FileOutcome::Success { path, chunks, report } => println!(
                "  success {path}: {chunks} chunks ({} new, {} moved, {} superseded)",
                report.chunks_inserted, report.chunks_moved, report.chunks_superseded
            ),
            FileOutcome::Skipped { path, reason } => {
                println!("  skipped {path}: {}", reason.as_str())
            }
            FileOutcome::Failed { path, kind, error } => {
                println!("  failed {path} ({}): {error}", kind.as_str())
            }
            other => println!("  {} {}", other.label(), other.path()),
        }
    }
    Ok(())
}

fn print_response(response: &RetrievalResponse, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(response)?,
        OutputFormat::Summary => {
            println!("Found {} results for \"{}\":", response.results.len(), response.processed_query);
            for result in &response.results {
                println!(
                    "  Score: {:.3} | {} #{}{} | {}",
                    result.score,
                    result.metadata.source_path,
                    result.metadata.chunk_index,
                    result
                        .metadata
                        .page
                        .map(|p| format!(" p.{p}"))
                        .unwrap_or_default(),
                    preview(&result.content, 80)
                );
            }
        }
        OutputFormat::Full => {
            for result in &response.results {
                println!("Score: {:.3} (distance {:.4})", result.score, result.distance);
                if let Some(rerank) = result.rerank_score {
                    println!("Rerank score: {rerank:.3}");
                }
                println!("Chunk ID: {}", result.chunk_id);
                println!("File: {}", result.metadata.source_path);
                println!("Chunk index: {}", result.metadata.chunk_index);
                if let Some(page) = result.metadata.page {
                    println!("Page: {page}");
                }
                println!("Content:\n{}", result.content);
                println!("---");
            }
        }
    }
    Ok(())
}

fn preview(content: &str, max: usize) -> String {
    let flat: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        format!("{}...", flat.chars().take(max).collect::<String>())
    }
}
