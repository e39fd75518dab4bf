//! Operator tool for inspecting and maintaining tenant sequences

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use dotenvy::dotenv;
use sequencer::database::mask_url;
use sequencer::{
    AllocatorConfig, DatabaseConfig, DeleteMode, NewRecord, SequentialAllocator, SqlStore,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "seqctl")]
#[clap(about = "Tenant-scoped sequential id allocator - operator tool")]
struct Args {
    /// Database connection URL (can also be set via SEQUENCER_DATABASE_URL env var)
    #[clap(long, env = "SEQUENCER_DATABASE_URL")]
    database_url: String,

    /// Write attempts per allocation before giving up
    #[clap(long, default_value_t = 5, env = "SEQUENCER_MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Timeout for every storage call, in milliseconds
    #[clap(long, default_value_t = 5_000, env = "SEQUENCER_CALL_TIMEOUT_MS")]
    call_timeout_ms: u64,

    /// Ceiling for the whole retry loop, in milliseconds
    #[clap(long, default_value_t = 10_000, env = "SEQUENCER_DEADLINE_MS")]
    deadline_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct Scope {
    /// Tenant reference (24 hex characters)
    #[clap(long)]
    tenant: String,

    /// Resource class, e.g. "house"
    #[clap(long = "class")]
    resource_class: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create tables and unique indexes
    InitSchema,
    /// Allocate the next id and create a record
    Create {
        #[clap(flatten)]
        scope: Scope,
        #[clap(long)]
        name: String,
        /// Opaque JSON payload stored with the record
        #[clap(long)]
        payload: Option<String>,
    },
    /// List live records
    List {
        #[clap(flatten)]
        scope: Scope,
    },
    /// Show one record
    Get {
        #[clap(flatten)]
        scope: Scope,
        #[clap(long)]
        id: u64,
    },
    /// Change a record's display name
    Rename {
        #[clap(flatten)]
        scope: Scope,
        #[clap(long)]
        id: u64,
        #[clap(long)]
        name: String,
    },
    /// Delete a record (its id is never reused)
    Delete {
        #[clap(flatten)]
        scope: Scope,
        #[clap(long)]
        id: u64,
        /// Keep the row and only mark it deleted
        #[clap(long)]
        soft: bool,
    },
    /// Show the id the next allocation would try
    Peek {
        #[clap(flatten)]
        scope: Scope,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sequencer={},seqctl={}", args.log_level, args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Database URL: {}", mask_url(&args.database_url));

    let store = Arc::new(
        SqlStore::connect(&DatabaseConfig::new(args.database_url.clone()))
            .await
            .context("Database connection failed")?,
    );

    let config = AllocatorConfig::default()
        .with_max_attempts(args.max_attempts)
        .with_call_timeout(Duration::from_millis(args.call_timeout_ms))
        .with_deadline(Duration::from_millis(args.deadline_ms));
    let allocator = SequentialAllocator::new(store.clone(), config)?;

    match args.command {
        Command::InitSchema => {
            store.init_schema().await?;
            tracing::info!("Schema ready");
        }
        Command::Create { scope, name, payload } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("Payload is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let record = allocator
                .allocate_and_create(
                    &scope.tenant,
                    &scope.resource_class,
                    NewRecord::named(name).with_payload(payload),
                )
                .await?;
            print_json(&record)?;
        }
        Command::List { scope } => {
            let records = allocator.list(&scope.tenant, &scope.resource_class).await?;
            print_json(&records)?;
        }
        Command::Get { scope, id } => {
            let record = allocator.get(&scope.tenant, &scope.resource_class, id).await?;
            print_json(&record)?;
        }
        Command::Rename { scope, id, name } => {
            let record = allocator
                .rename(&scope.tenant, &scope.resource_class, id, &name)
                .await?;
            print_json(&record)?;
        }
        Command::Delete { scope, id, soft } => {
            let mode = if soft { DeleteMode::Soft } else { DeleteMode::Hard };
            allocator
                .remove(&scope.tenant, &scope.resource_class, id, mode)
                .await?;
        }
        Command::Peek { scope } => {
            let next = allocator
                .peek_next(&scope.tenant, &scope.resource_class)
                .await?;
            println!("{}", next);
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
