use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use revsync_core::TableRef;
use revsync_storage::{Dialect, MemoryWarehouse};
use revsync_sync::{
    load_entities_file, run_obt_load, run_review_sync, run_sentiment_sync,
    ObtLoadRequest, ReviewSyncRequest, SentimentSyncRequest, SyncConfig, TaskContext,
};
use revsync_web::AppState;
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "revsync")]
#[command(about = "Incremental app review sync and OBT rebuilds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP task triggers.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Pull new reviews and merge them into the reviews table.
    SyncReviews {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        dataset_id: String,
        #[arg(long)]
        reviews_table_id: String,
        /// Product ids; repeat the flag or pass a `;`-separated list.
        #[arg(long, required = true)]
        products: Vec<String>,
    },
    /// Annotate reviews that have no sentiment row yet.
    SyncSentiment {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        dataset_id: String,
        #[arg(long)]
        reviews_table_id: String,
        #[arg(long)]
        sentiment_table_id: String,
    },
    /// Rebuild the one-big-table from every country's tables.
    LoadObt {
        /// YAML or JSON list of entity descriptors.
        #[arg(long)]
        entities: PathBuf,
        /// `project.dataset.table`; defaults to REVSYNC_OBT_TABLE.
        #[arg(long)]
        target_table: Option<String>,
        /// Print the composed statement instead of executing it.
        #[arg(long)]
        dry_run: bool,
        /// Dialect to render a dry run in; real runs execute on Postgres.
        #[arg(long, value_enum, default_value_t = DialectArg::Postgres)]
        dialect: DialectArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DialectArg {
    Bigquery,
    Postgres,
}

impl From<DialectArg> for Dialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Bigquery => Dialect::BigQuery,
            DialectArg::Postgres => Dialect::Postgres,
        }
    }
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn table(project: &str, dataset: &str, table: &str) -> Result<TableRef> {
    TableRef::new(project, dataset, table).with_context(|| format!("invalid table {project}.{dataset}.{table}"))
}

async fn load_obt(
    config: SyncConfig,
    entities: PathBuf,
    target_table: Option<String>,
    dry_run: bool,
    dialect: DialectArg,
) -> Result<()> {
    let entities = load_entities_file(&entities)?;
    let target = match target_table {
        Some(raw) => TableRef::parse(&raw).with_context(|| format!("invalid --target-table {raw}"))?,
        None => config
            .obt_target()?
            .context("no --target-table given and REVSYNC_OBT_TABLE is unset")?,
    };

    if dry_run {
        let warehouse = Arc::new(MemoryWarehouse::with_dialect(dialect.into()));
        let ctx = TaskContext::with_warehouse(config, warehouse.clone())?;
        run_obt_load(&ctx, ObtLoadRequest { entities, target }).await?;
        for sql in warehouse.executed().await {
            println!("{sql}");
        }
        return Ok(());
    }

    let ctx = TaskContext::from_config(config)?;
    let report = run_obt_load(&ctx, ObtLoadRequest { entities, target }).await?;
    print_json(&report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info")?;
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            let ctx = TaskContext::from_config(config)?;
            revsync_web::serve(AppState::new(ctx), port).await?;
        }
        Commands::SyncReviews {
            project_id,
            dataset_id,
            reviews_table_id,
            products,
        } => {
            let request = ReviewSyncRequest {
                target: table(&project_id, &dataset_id, &reviews_table_id)?,
                products: products.join(";"),
            };
            let ctx = TaskContext::from_config(config)?;
            let report = run_review_sync(&ctx, request).await?;
            info!(run_id = %report.run_id, degraded = report.degraded, "review sync finished");
            print_json(&report)?;
        }
        Commands::SyncSentiment {
            project_id,
            dataset_id,
            reviews_table_id,
            sentiment_table_id,
        } => {
            let request = SentimentSyncRequest {
                reviews: table(&project_id, &dataset_id, &reviews_table_id)?,
                target: table(&project_id, &dataset_id, &sentiment_table_id)?,
            };
            let ctx = TaskContext::from_config(config)?;
            let report = run_sentiment_sync(&ctx, request).await?;
            info!(run_id = %report.run_id, degraded = report.degraded, "sentiment sync finished");
            print_json(&report)?;
        }
        Commands::LoadObt {
            entities,
            target_table,
            dry_run,
            dialect,
        } => load_obt(config, entities, target_table, dry_run, dialect).await?,
    }

    Ok(())
}
