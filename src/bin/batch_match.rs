use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use foodmatch::{
    Catalog, MatchConfig, Matcher, OpenAiChat, OpenAiEmbedder, Query, TokenUsage, VectorStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "foodmatch-batch",
    about = "Match a range of product-attribute rows against the reference corpus"
)]
struct BatchCli {
    /// First row of the attribute CSV to process (0-based, inclusive)
    #[arg(long)]
    start: usize,

    /// Row to stop before (exclusive)
    #[arg(long)]
    stop: usize,

    /// Product attribute CSV to read queries from
    #[arg(long, env = "FOODMATCH_INPUT")]
    input: PathBuf,

    /// Vector store directory (vectors.f32 + manifest.json)
    #[arg(long, env = "FOODMATCH_STORE")]
    store: PathBuf,

    /// SQLite catalog built alongside the vector store
    #[arg(long, env = "FOODMATCH_CATALOG")]
    catalog: PathBuf,

    /// Output CSV path; defaults to matches_{start}_{stop}.csv
    #[arg(long)]
    output: Option<PathBuf>,

    /// Directory receiving one marker file per failed row
    #[arg(long, env = "FOODMATCH_FAILURES", default_value = "failures")]
    failures: PathBuf,

    /// OpenAI API key used for both embedding and chat calls
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Base URL for the OpenAI-compatible API
    #[arg(
        long,
        env = "FOODMATCH_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Embedding model; must match the model recorded in the store manifest
    #[arg(
        long,
        env = "FOODMATCH_EMBED_MODEL",
        default_value = "text-embedding-3-small"
    )]
    embed_model: String,

    /// Chat model used for the consensus step
    #[arg(long, env = "FOODMATCH_CHAT_MODEL", default_value = "gpt-4.1-mini")]
    chat_model: String,

    /// Minimum cosine similarity for candidate rows
    #[arg(long, default_value_t = 0.6)]
    embedding_threshold: f32,

    /// Sampling temperature for consensus trials
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    /// Independent consensus trials per query
    #[arg(long, default_value_t = 10)]
    num_trials: u32,

    /// Max seconds to wait per HTTP request
    #[arg(long, env = "FOODMATCH_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,

    /// Retries for rate limits and transient errors
    #[arg(long, env = "FOODMATCH_MAX_RETRIES", default_value_t = 5)]
    max_retries: usize,

    /// Number of concurrent matcher workers
    #[arg(long, env = "FOODMATCH_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Accumulate and log token usage across the batch
    #[arg(long, default_value_t = false)]
    report_usage: bool,
}

/// One query row cut from the attribute CSV.
#[derive(Debug, Clone)]
struct AttributeRow {
    index: usize,
    gtin_upc: String,
    vendor: String,
    brand: String,
    product: String,
    level_of_processing: String,
}

/// What a worker hands back for one row.
enum RowOutcome {
    Matched {
        row: AttributeRow,
        matches: Vec<foodmatch::MatchRecord>,
        usage: Option<TokenUsage>,
    },
    Failed {
        index: usize,
        error: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = BatchCli::parse();
    anyhow::ensure!(cli.start < cli.stop, "start must be before stop");
    let workers = cli.workers.max(1);

    let rows = load_attribute_rows(&cli.input, cli.start, cli.stop)?;
    info!(rows = rows.len(), start = cli.start, stop = cli.stop, "loaded attribute rows");

    let store = Arc::new(
        VectorStore::open(&cli.store)
            .with_context(|| format!("failed to open vector store {}", cli.store.display()))?,
    );
    fs::create_dir_all(&cli.failures)
        .with_context(|| format!("failed to create {}", cli.failures.display()))?;

    let embedder = OpenAiEmbedder::new(
        cli.openai_api_key.clone(),
        cli.openai_base_url.clone(),
        cli.embed_model.clone(),
        Duration::from_secs(cli.timeout_secs.max(1)),
        cli.max_retries.max(1),
        1,
    )?;
    let chat = OpenAiChat::new(
        cli.openai_api_key.clone(),
        cli.openai_base_url.clone(),
        Duration::from_secs(cli.timeout_secs.max(1)),
        cli.max_retries.max(1),
    )?;
    let config = MatchConfig {
        embedding_threshold: cli.embedding_threshold,
        model: cli.chat_model.clone(),
        temperature: cli.temperature,
        num_trials: cli.num_trials,
        return_token_usage: cli.report_usage,
    };

    let (job_tx, job_rx) = bounded::<AttributeRow>(workers * 2);
    let (result_tx, result_rx) = bounded::<RowOutcome>(workers * 2);

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let store = Arc::clone(&store);
        let embedder = embedder.clone();
        let chat = chat.clone();
        let config = config.clone();
        let catalog_path = cli.catalog.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("matcher-{worker_id}"))
                .spawn(move || {
                    run_worker(job_rx, result_tx, store, catalog_path, embedder, chat, config)
                })
                .context("failed to spawn matcher worker")?,
        );
    }
    drop(job_rx);
    drop(result_tx);

    let feeder = thread::spawn(move || {
        for row in rows {
            if job_tx.send(row).is_err() {
                break;
            }
        }
    });

    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("matches_{}_{}.csv", cli.start, cli.stop)));
    let written = drain_results(result_rx, &output_path, &cli.failures, cli.report_usage)?;

    feeder.join().map_err(|_| anyhow!("feeder thread panicked"))?;
    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("matcher worker panicked"))??;
    }
    info!(written, output = %output_path.display(), "batch complete");
    Ok(())
}

fn run_worker(
    jobs: Receiver<AttributeRow>,
    results: Sender<RowOutcome>,
    store: Arc<VectorStore>,
    catalog_path: PathBuf,
    embedder: OpenAiEmbedder,
    chat: OpenAiChat,
    config: MatchConfig,
) -> Result<()> {
    // Each worker owns its own catalog connection; SQLite cursors must not
    // be shared across threads.
    let catalog = Catalog::open(&catalog_path)?;
    let matcher = Matcher::new(store, catalog, embedder, chat, config)?;

    for row in jobs {
        let query = Query {
            vendor: row.vendor.clone(),
            brand: row.brand.clone(),
            product: row.product.clone(),
        };
        let outcome = match matcher.find_matches(&query) {
            Ok(outcome) => RowOutcome::Matched {
                row,
                matches: outcome.matches,
                usage: outcome.usage,
            },
            Err(err) => RowOutcome::Failed {
                index: row.index,
                error: format!("{err:#}"),
            },
        };
        if results.send(outcome).is_err() {
            break;
        }
    }
    Ok(())
}

fn drain_results(
    results: Receiver<RowOutcome>,
    output_path: &PathBuf,
    failures_dir: &PathBuf,
    report_usage: bool,
) -> Result<usize> {
    let mut writer = csv::Writer::from_path(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;
    writer.write_record([
        "query_index",
        "query_gtin_upc",
        "query_vendor",
        "query_brand",
        "query_product",
        "level_of_processing",
        "encoding_similarity",
        "consensus_score",
        "usda_index",
        "usda_gtin_upc",
        "usda_vendor",
        "usda_brand",
        "usda_product",
        "usda_ingredients",
    ])?;

    let mut written = 0usize;
    let mut prompt_tokens = 0u64;
    let mut completion_tokens = 0u64;
    for outcome in results {
        match outcome {
            RowOutcome::Matched {
                row,
                matches,
                usage,
            } => {
                if let Some(usage) = usage {
                    prompt_tokens += usage.prompt_tokens;
                    completion_tokens += usage.completion_tokens;
                }
                for record in matches {
                    writer.write_record([
                        row.index.to_string(),
                        row.gtin_upc.clone(),
                        row.vendor.clone(),
                        row.brand.clone(),
                        row.product.clone(),
                        row.level_of_processing.clone(),
                        record.similarity.to_string(),
                        record.consensus_score.to_string(),
                        record.row.index.to_string(),
                        record.row.gtin_upc,
                        record.row.vendor,
                        record.row.brand,
                        record.row.product,
                        record.row.ingredients,
                    ])?;
                    written += 1;
                }
                writer.flush()?;
            }
            RowOutcome::Failed { index, error } => {
                // One bad row never aborts the batch; leave a marker and move on.
                error!(index, %error, "row failed");
                let marker = failures_dir.join(index.to_string());
                if let Err(err) = fs::write(&marker, &error) {
                    error!(index, error = %err, "failed to write failure marker");
                }
            }
        }
    }
    writer.flush()?;
    if report_usage {
        info!(prompt_tokens, completion_tokens, "token usage for batch");
    }
    Ok(written)
}

fn load_attribute_rows(path: &PathBuf, start: usize, stop: usize) -> Result<Vec<AttributeRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open attribute CSV {}", path.display()))?;
    let headers = reader.headers().context("failed to read CSV headers")?;
    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("attribute CSV is missing column '{name}'"))
    };
    let gtin_col = column("Product GTIN or UPC")?;
    let vendor_col = column("Vendor")?;
    let brand_col = column("Brand Name")?;
    let product_col = column("Product Type")?;
    let processing_col = column("Level of Processing")?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        if index < start {
            continue;
        }
        if index >= stop {
            break;
        }
        let record = record.with_context(|| format!("failed to read attribute row {index}"))?;
        let field = |col: usize| record.get(col).unwrap_or_default().to_string();
        rows.push(AttributeRow {
            index,
            gtin_upc: field(gtin_col),
            vendor: field(vendor_col),
            brand: field(brand_col),
            product: field(product_col),
            level_of_processing: field(processing_col),
        });
    }
    Ok(rows)
}
