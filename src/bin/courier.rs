//! Operations CLI for courier-managed storage.
//!
//! `setup` and `teardown` manage the schema, `clear`/`rebuild` reset data,
//! `check` detects schema drift (non-zero exit on drift), and `statistics`
//! prints current envelope counts. Exit code 0 means success.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use courier_core::storage::MessageStore;
use courier_core::{CourierConfig, PostgresMessageStore};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Manage courier durable-messaging storage")]
#[command(version)]
struct Cli {
    /// Path to a courier config file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database schema/namespace
    #[arg(long)]
    schema: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create all tables and triggers if missing (idempotent)
    Setup,
    /// Drop all courier tables
    Teardown,
    /// Purge all rows, keeping the schema
    Clear,
    /// Purge all rows and recreate the schema
    Rebuild,
    /// Verify the live schema matches this build; exits non-zero on drift
    Check,
    /// Print current envelope counts
    Statistics,
}

#[tokio::main]
async fn main() -> ExitCode {
    courier_core::logging::init_logging();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = CourierConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(schema) = cli.schema {
        config.database.schema = schema;
        config.validate().context("validating configuration")?;
    }

    // Connect without provisioning; the subcommands decide what to do with
    // the schema.
    let url = config.database.resolved_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.pool_size)
        .connect(&url)
        .await
        .context("connecting to database")?;
    let store = PostgresMessageStore::new(pool, config.database.schema.clone());

    match cli.command {
        Commands::Setup => {
            store.ensure_schema().await?;
            println!("schema {} is ready", config.database.schema);
        }
        Commands::Teardown => {
            store.teardown_schema().await?;
            println!("schema {} torn down", config.database.schema);
        }
        Commands::Clear => {
            store.clear_all().await?;
            println!("all rows purged from schema {}", config.database.schema);
        }
        Commands::Rebuild => {
            store.teardown_schema().await?;
            store.ensure_schema().await?;
            println!("schema {} rebuilt", config.database.schema);
        }
        Commands::Check => {
            store
                .check_schema()
                .await
                .context("schema drift detected")?;
            println!("schema {} matches expectations", config.database.schema);
        }
        Commands::Statistics => {
            let counts = store.fetch_counts().await?;
            println!("incoming:    {}", counts.incoming);
            println!("scheduled:   {}", counts.scheduled);
            println!("outgoing:    {}", counts.outgoing);
            println!("handled:     {}", counts.handled);
            println!("dead letter: {}", counts.dead_letter);
            println!("total:       {}", counts.total());
        }
    }
    Ok(())
}
