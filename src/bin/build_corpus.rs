use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use foodmatch::store::VectorStoreWriter;
use foodmatch::{BrandedFood, Catalog, OpenAiEmbedder, TextEmbedder};

#[derive(Parser, Debug)]
#[command(
    name = "foodmatch-build-corpus",
    about = "Embed a branded-food CSV into a vector store plus SQLite catalog"
)]
struct BuildCli {
    /// Branded-food reference CSV
    #[arg(long, env = "FOODMATCH_REFERENCE")]
    input: PathBuf,

    /// Vector store directory to create
    #[arg(long, env = "FOODMATCH_STORE")]
    store: PathBuf,

    /// SQLite catalog path to create
    #[arg(long, env = "FOODMATCH_CATALOG")]
    catalog: PathBuf,

    /// OpenAI API key used for embedding calls
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Base URL for the OpenAI-compatible API
    #[arg(
        long,
        env = "FOODMATCH_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Embedding model; recorded in the store manifest for later verification
    #[arg(
        long,
        env = "FOODMATCH_EMBED_MODEL",
        default_value = "text-embedding-3-small"
    )]
    embed_model: String,

    /// Rows per embedding request
    #[arg(long, env = "FOODMATCH_EMBED_BATCH", default_value_t = 64)]
    batch_size: usize,

    /// Max seconds to wait per HTTP request
    #[arg(long, env = "FOODMATCH_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,

    /// Retries for rate limits and transient errors
    #[arg(long, env = "FOODMATCH_MAX_RETRIES", default_value_t = 5)]
    max_retries: usize,

    /// CSV column holding the GTIN/UPC code
    #[arg(long, default_value = "gtin_upc")]
    gtin_column: String,

    /// CSV column holding the vendor (brand owner)
    #[arg(long, default_value = "brand_owner")]
    vendor_column: String,

    /// CSV column holding the brand name
    #[arg(long, default_value = "brand_name")]
    brand_column: String,

    /// CSV column holding the product description
    #[arg(long, default_value = "description")]
    product_column: String,

    /// CSV column holding the ingredient list
    #[arg(long, default_value = "ingredients")]
    ingredients_column: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = BuildCli::parse();
    let batch_size = cli.batch_size.max(1);
    let embedder = OpenAiEmbedder::new(
        cli.openai_api_key.clone(),
        cli.openai_base_url.clone(),
        cli.embed_model.clone(),
        Duration::from_secs(cli.timeout_secs.max(1)),
        cli.max_retries.max(1),
        batch_size,
    )?;

    let rows = load_reference_rows(&cli)?;
    info!(rows = rows.len(), "loaded reference rows");
    anyhow::ensure!(!rows.is_empty(), "reference CSV holds no rows");

    let mut catalog = Catalog::open(&cli.catalog)?;
    catalog.create_schema()?;

    // The store dimension comes from the first embedding batch; the writer
    // is created once that batch returns.
    let mut writer: Option<VectorStoreWriter> = None;
    for batch in rows.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|row| row.rendered_text()).collect();
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = embedder
            .embed_batch(&inputs)
            .with_context(|| format!("failed to embed batch starting at row {}", batch[0].index))?;

        if writer.is_none() {
            let dim = vectors
                .first()
                .map(Vec::len)
                .ok_or_else(|| anyhow!("embedding service returned an empty batch"))?;
            writer = Some(VectorStoreWriter::create(&cli.store, dim, &cli.embed_model)?);
        }
        let store_writer = writer
            .as_mut()
            .ok_or_else(|| anyhow!("vector writer not initialized"))?;
        for vector in &vectors {
            store_writer.append(vector)?;
        }
        catalog.insert_rows(batch)?;
        if store_writer.rows() % (batch_size * 50) < batch_size {
            info!(embedded = store_writer.rows(), total = rows.len(), "ingest progress");
        }
    }

    let manifest = writer
        .ok_or_else(|| anyhow!("no batches were embedded"))?
        .finish()?;
    info!(
        rows = manifest.rows,
        dim = manifest.dim,
        model = %manifest.embedding_model,
        store = %cli.store.display(),
        catalog = %cli.catalog.display(),
        "corpus build complete"
    );
    Ok(())
}

fn load_reference_rows(cli: &BuildCli) -> Result<Vec<BrandedFood>> {
    let mut reader = csv::Reader::from_path(&cli.input)
        .with_context(|| format!("failed to open reference CSV {}", cli.input.display()))?;
    let headers = reader.headers().context("failed to read CSV headers")?;
    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("reference CSV is missing column '{name}'"))
    };
    let gtin_col = column(&cli.gtin_column)?;
    let vendor_col = column(&cli.vendor_column)?;
    let brand_col = column(&cli.brand_column)?;
    let product_col = column(&cli.product_column)?;
    let ingredients_col = column(&cli.ingredients_column)?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read reference row {index}"))?;
        let field = |col: usize| record.get(col).unwrap_or_default().to_string();
        rows.push(BrandedFood {
            index,
            gtin_upc: field(gtin_col),
            vendor: field(vendor_col),
            brand: field(brand_col),
            product: field(product_col),
            ingredients: field(ingredients_col),
        });
    }
    Ok(rows)
}
