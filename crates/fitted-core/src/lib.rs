pub mod config;
pub mod error;

pub use config::{
    AnalyticsConfig, CacheConfig, Config, RetrySettings, StoreBackend, StoreConfig,
    UpstreamConfig, ValidationResult,
};
pub use error::{AppError, ConfigError, FetchError, QueryError, ReqwestErrorExt, StoreError};

use anyhow::Result;

/// Initialize logging for the process.
///
/// Reads the filter from `RUST_LOG`, defaulting to `info`.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;

    tracing::info!("Fitted core initialized");
    Ok(())
}
