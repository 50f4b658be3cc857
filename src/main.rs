use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fitted_analytics::QueryEngine;
use fitted_core::{AppError, Config};
use fitted_weather::{
    Clock, FetchOptions, FetchOrchestrator, PartitionedStore, SystemClock, UpstreamClient,
};

#[derive(Parser)]
#[command(name = "fitted", about = "Cached weather fetching and SQL over the weather archive")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch weather for a location through the cache tiers
    Fetch {
        location: String,
        /// Forecast horizon in days. Out-of-range values are clamped.
        forecast_days: Option<u32>,
    },
    /// Run a SQL query against the archive
    Query {
        /// The SELECT statement; multiple words are joined with spaces
        #[arg(required = true, num_args = 1..)]
        sql: Vec<String>,
    },
    /// Write a config file with the current settings if none exists
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    fitted_core::init()?;

    if let Command::Init = cli.command {
        let path = Config::config_path()?;
        if path.exists() {
            println!("Config already exists at {}", path.display());
        } else {
            Config::load()?.save_to(&path)?;
            println!("Wrote {}", path.display());
        }
        return Ok(());
    }

    let (config, _) = Config::load_validated()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        PartitionedStore::from_config(&config.store, clock.clone()).map_err(AppError::from)?,
    );
    tracing::info!(backend = ?config.store.backend, subject = %config.store.subject, "Archive ready");

    match cli.command {
        Command::Init => {}
        Command::Fetch {
            location,
            forecast_days,
        } => {
            let api_key = config.require_api_key().map_err(AppError::from)?;
            let client = UpstreamClient::from_config(&config.upstream, api_key)
                .map_err(AppError::from)?
                .with_clock(clock.clone());
            let service = FetchOrchestrator::from_config(&config, Arc::new(client), store, clock);

            let options = FetchOptions {
                // Saturate here; the orchestrator clamps to the provider range
                forecast_days: forecast_days.map(|days| u8::try_from(days).unwrap_or(u8::MAX)),
                ..FetchOptions::default()
            };
            let result = service.fetch(&location, options).await;
            // Let the write-through land before the process exits
            service.flush().await;

            let fetched = result.map_err(AppError::from)?;
            println!("{}", serde_json::to_string_pretty(&fetched)?);
            tracing::debug!(stats = ?service.stats(), "Fetch finished");
        }
        Command::Query { sql } => {
            let sql = sql.join(" ");
            let engine = QueryEngine::from_config(&config, store);
            let rows = engine.query(&sql).await.map_err(AppError::from)?;
            for warning in &rows.metadata.warnings {
                tracing::warn!("{warning}");
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}
