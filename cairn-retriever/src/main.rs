use anyhow::Context;
use cairn_embed::{EmbeddingProvider, ProviderKind};
use cairn_retriever::config::RetrieverConfig;
use cairn_retriever::rag::{ContextAssembler, ContextFormat, ContextOptions};
use cairn_retriever::retrieval::index_manager::{InitOutcome, IndexManager, IndexStats};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Semantic index and context retrieval over a workspace.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace directory to index
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Index storage directory (defaults to <workspace>/.cairn)
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Configuration file (defaults to <workspace>/cairn.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Embedding provider: fastembed or hashing
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Embedding model name
    #[arg(long)]
    model: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the index, or load it if it is current
    Index {
        /// Rebuild even if a compatible index exists
        #[arg(long)]
        force: bool,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Search indexed chunks by similarity
    Search {
        query: String,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 8)]
        k: usize,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Assemble token-budgeted context for a query
    Context {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        min_score: Option<f32>,
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Context layout: compact, detailed or code-only
        #[arg(long)]
        layout: Option<ContextFormat>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show index statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Keep the index updated until interrupted
    Watch,
    /// Delete all indexed content
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
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

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.workspace.join("cairn.toml"));
    let mut config = RetrieverConfig::load_or_default(&config_path)?;
    if let Some(provider) = args.provider {
        config.embedding.provider = provider;
    }
    if let Some(model) = &args.model {
        config.embedding.model_name = model.clone();
    }
    config.indexing.watch = matches!(args.command, Commands::Watch);
    config.validate()?;

    let storage = args
        .storage
        .clone()
        .unwrap_or_else(|| args.workspace.join(&config.indexing.storage_dir));

    let manager = IndexManager::new(config.indexing.clone());
    let embed_config = config.embedding.clone();
    let outcome = manager
        .initialize(&args.workspace, &storage, async move {
            let provider: Arc<dyn EmbeddingProvider> =
                cairn_embed::load_provider(&embed_config).await?;
            Ok(provider)
        })
        .await?;
    if outcome == InitOutcome::ModelUnavailable {
        anyhow::bail!("Embedding model could not be loaded, see the log for details");
    }
    wait_until_idle(&manager).await?;

    match args.command {
        Commands::Index { force, format } => {
            let report = if force && outcome == InitOutcome::LoadedFromDisk {
                Some(manager.reindex().await.context("Rebuild task failed")??)
            } else {
                None
            };
            let stats = manager.stats().await;
            match format {
                OutputFormat::Json => {
                    let output = serde_json::json!({ "report": report, "stats": stats });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Summary => {
                    match (&report, outcome) {
                        (Some(report), _) => println!(
                            "Rebuilt index: {} of {} files, {} chunks in {}ms",
                            report.files_indexed,
                            report.files_scanned,
                            report.chunks_indexed,
                            report.duration_ms
                        ),
                        (None, InitOutcome::LoadedFromDisk) => {
                            println!("Loaded existing index (use --force to rebuild)")
                        }
                        (None, _) => println!("Built new index"),
                    }
                    print_stats(&stats);
                }
            }
        }
        Commands::Search { query, k, format } => {
            let results = manager.search(&query, k).await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
                OutputFormat::Summary => {
                    println!("Found {} results:", results.len());
                    for result in &results {
                        println!(
                            "  {:.3}  {} (chunk {})",
                            result.score, result.path, result.chunk_ordinal
                        );
                        let preview: String = result.text.chars().take(120).collect();
                        println!("         {}", preview.replace('\n', " "));
                    }
                }
            }
        }
        Commands::Context {
            query,
            k,
            min_score,
            max_tokens,
            layout,
            format,
        } => {
            let mut options = ContextOptions::from(&config.retrieval);
            if let Some(k) = k {
                options = options.with_k(k);
            }
            if let Some(min_score) = min_score {
                options = options.with_min_score(min_score);
            }
            if let Some(max_tokens) = max_tokens {
                options = options.with_max_tokens(max_tokens);
            }
            if let Some(layout) = layout {
                options = options.with_format(layout);
            }
            let assembler = ContextAssembler::new(manager.clone(), &config.retrieval);
            let context = assembler
                .get_context(&query, &options)
                .await
                .context("Retrieval is unavailable")?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&context)?),
                OutputFormat::Summary => {
                    println!("{}", context.context_text);
                    eprintln!(
                        "\n{} of {} chunks, {} tokens, {} files",
                        context.stats.chunks_used,
                        context.stats.chunks_found,
                        context.stats.total_tokens,
                        context.stats.files_included.len()
                    );
                }
            }
        }
        Commands::Stats { format } => {
            let stats = manager.stats().await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Summary => print_stats(&stats),
            }
        }
        Commands::Watch => {
            print_stats(&manager.stats().await);
            println!("Watching for changes, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
        Commands::Clear => {
            manager.clear().await?;
            println!("Cleared index at {}", storage.display());
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Waits for a scheduled build to finish.
async fn wait_until_idle(manager: &IndexManager) -> anyhow::Result<()> {
    let mut states = manager.subscribe_state();
    states
        .wait_for(|state| state.is_initialized() && !state.is_indexing())
        .await?;
    Ok(())
}

fn print_stats(stats: &IndexStats) {
    println!("State: {}", stats.state);
    println!("Enabled: {}", stats.enabled);
    println!("Documents: {}", stats.documents_count);
    println!("Chunks: {}", stats.chunks_count);
    if let Some(path) = &stats.index_path {
        println!("Index: {}", path.display());
    }
}
