//! One-shot import worker.
//!
//! ```bash
//! # Import products into PostgreSQL (DATABASE_URL from the env or .env):
//! tabload-worker import --entity product --file products.csv --policy upsert
//!
//! # Validate and write against the in-memory store only:
//! tabload-worker import --entity partner --file partners.xlsx --dry-run --skip-errors
//!
//! # List importable entities and their fields:
//! tabload-worker entities
//! ```
//!
//! Columns are mapped by best-guess suggestion. The execution summary is
//! printed to stdout as JSON; logs go to stderr, filtered by `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tabload_core::outcome::WritePolicy;
use tabload_core::registry::{EntityDescriptor, EntityRegistry};
use tabload_core::validation::mapping_from_suggestions;
use tabload_db::{BulkStore, MemoryStore, PgBulkStore};
use tabload_engine::{sweeper, ExecuteOptions, ImportConfig, ImportService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Bulk-import CSV and spreadsheet files into registered entities.
#[derive(Parser)]
#[command(name = "tabload-worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import one file.
    Import(ImportArgs),
    /// Print the importable entities as JSON.
    Entities,
}

#[derive(Args)]
struct ImportArgs {
    /// Target entity name (see `entities`).
    #[arg(short, long)]
    entity: String,

    /// CSV, XLSX, or XLS file to import.
    #[arg(short, long)]
    file: PathBuf,

    /// create-only, update-only, or upsert.
    #[arg(short, long, default_value = "create-only")]
    policy: WritePolicy,

    /// Skip bad rows instead of aborting the import.
    #[arg(long)]
    skip_errors: bool,

    /// Rows per batch; defaults to IMPORT_BATCH_SIZE.
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Write to an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,

    /// Recorded as the session owner.
    #[arg(long)]
    owner: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabload_worker=debug,tabload_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(EntityRegistry::with_builtin_catalog()?);

    match cli.command {
        Command::Entities => {
            let entities = registry
                .list_entities()
                .into_iter()
                .map(|name| registry.describe(name))
                .collect::<Result<Vec<_>, _>>()?;
            let descriptors: Vec<&EntityDescriptor> = entities.iter().map(AsRef::as_ref).collect();
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
            Ok(())
        }
        Command::Import(args) => run_import(registry, args).await,
    }
}

async fn run_import(registry: Arc<EntityRegistry>, args: ImportArgs) -> anyhow::Result<()> {
    // --- Configuration ---
    let config = ImportConfig::from_env();
    tracing::info!(
        batch_size = config.batch_size,
        staging_dir = %config.staging_dir.display(),
        "Loaded import configuration"
    );

    // --- Store ---
    let store: Arc<dyn BulkStore> = if args.dry_run {
        tracing::info!("Dry run: writing to the in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let pool = tabload_db::create_pool(&database_url)
            .await
            .expect("Failed to connect to database");
        tracing::info!("Database connection pool created");

        tabload_db::health_check(&pool)
            .await
            .expect("Database health check failed");
        tracing::info!("Database health check passed");

        tabload_db::run_migrations(&pool)
            .await
            .expect("Failed to run database migrations");
        tracing::info!("Database migrations applied");

        Arc::new(PgBulkStore::new(pool))
    };

    let sweep_interval = config.sweep_interval;
    let service = ImportService::new(registry, store, config);

    // --- Session sweeper ---
    let sweeper_cancel = CancellationToken::new();
    let sweeper_handle = tokio::spawn(sweeper::run(
        Arc::clone(service.sessions()),
        sweep_interval,
        sweeper_cancel.clone(),
    ));

    let result = import_file(&service, &args).await;

    sweeper_cancel.cancel();
    sweeper_handle.await.ok();
    result
}

async fn import_file(service: &ImportService, args: &ImportArgs) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("file path has no file name")?;

    let session = service
        .create_session(bytes, &file_name, &args.entity, args.owner.as_deref())
        .await?;
    tracing::info!(
        token = %session.token,
        total_rows = session.total_rows(),
        columns = session.headers().len(),
        "Import session created"
    );

    let suggestions = service.suggest_mapping(&session.token).await?;
    for suggestion in &suggestions {
        tracing::debug!(
            column = %suggestion.column,
            field = suggestion.suggested_field.as_deref().unwrap_or("-"),
            confidence = suggestion.confidence,
            "Column mapping"
        );
    }
    service
        .set_mapping(&session.token, mapping_from_suggestions(&suggestions))
        .await?;

    let outcome = service
        .execute(
            &session.token,
            ExecuteOptions {
                mapping: None,
                write_policy: args.policy,
                skip_errors: args.skip_errors,
                batch_size: args.batch_size,
            },
        )
        .await;
    service.delete_session(&session.token).await;

    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
