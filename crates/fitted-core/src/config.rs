use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Prefix for environment overrides, e.g. `FITTED_CACHE__TTL_SECS=600`.
pub const ENV_PREFIX: &str = "FITTED";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub retry: RetrySettings,
    pub store: StoreConfig,
    pub analytics: AnalyticsConfig,
}

/// Weather provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,

    /// Provider API key. Falls back to `WEATHER_API_KEY`.
    pub api_key: Option<String>,

    /// Per-request HTTP timeout
    pub timeout_secs: u64,

    /// Upper bound for forecast horizons; larger requests are clamped.
    pub max_forecast_days: u8,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.weatherapi.com/v1".to_string(),
            api_key: None,
            timeout_secs: 10,
            max_forecast_days: 14,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window shared by L1 and L2
    pub ttl_secs: u64,

    /// Oldest archived object still usable as a stale fallback
    pub max_stale_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15 * 60,
            max_stale_secs: 24 * 60 * 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn max_stale(&self) -> Duration {
        Duration::from_secs(self.max_stale_secs)
    }
}

/// Backoff settings for transient upstream failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Local,
    S3,
}

/// Durable archive settings.
///
/// `root` applies to the `local` backend; `bucket`, `region`, `endpoint`
/// and `allow_http` apply to `s3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub root: Option<PathBuf>,
    /// Falls back to `WEATHER_BUCKET_NAME`.
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    /// First path segment under `raw/`
    pub subject: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            root: None,
            bucket: None,
            region: None,
            endpoint: None,
            allow_http: false,
            subject: "weather".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Table name accepted in `FROM`
    pub table: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            table: "weather_data".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file location and the environment.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(Some(&path))
    }

    /// Load configuration layered as defaults, optional TOML file, then
    /// `FITTED_*` variables, then the legacy `WEATHER_*` variables.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
            .context("Failed to read configuration")?;

        let mut config: Config = layered
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
            .context("Failed to parse configuration")?;

        config.apply_legacy_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()).into());
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Fill unset settings from `WEATHER_API_KEY` and `WEATHER_BUCKET_NAME`.
    pub fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.upstream.api_key.is_none() {
            self.upstream.api_key = lookup("WEATHER_API_KEY").filter(|v| !v.is_empty());
        }
        if self.store.bucket.is_none() {
            if let Some(bucket) = lookup("WEATHER_BUCKET_NAME").filter(|v| !v.is_empty()) {
                self.store.bucket = Some(bucket);
                if self.store.backend == StoreBackend::Memory {
                    self.store.backend = StoreBackend::S3;
                }
            }
        }
    }

    /// The provider API key, or an error naming the setting.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.upstream
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingSetting("upstream.api_key".to_string()))
    }

    /// Validate the configuration
    ///
    /// Returns a ValidationResult containing any errors or warnings.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.upstream.base_url, "upstream.base_url", &mut result);

        if self.upstream.timeout_secs == 0 {
            result.add_error("upstream.timeout_secs", "Timeout must be greater than 0");
        }
        if self.upstream.max_forecast_days == 0 {
            result.add_error(
                "upstream.max_forecast_days",
                "Maximum forecast horizon must be at least 1 day",
            );
        }

        if self.cache.ttl_secs == 0 {
            result.add_error("cache.ttl_secs", "Cache TTL must be greater than 0");
        } else if self.cache.ttl_secs > self.cache.max_stale_secs {
            result.add_warning(
                "cache.max_stale_secs",
                "Stale window is shorter than the TTL; stale fallback from the archive is disabled",
            );
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            result.add_warning(
                "retry.initial_delay_ms",
                "Initial retry delay exceeds the maximum delay",
            );
        }

        match self.store.backend {
            StoreBackend::Memory => {
                result.add_warning(
                    "store.backend",
                    "In-memory archive is not shared and is lost on exit",
                );
            }
            StoreBackend::Local => {
                if self.store.root.is_none() {
                    result.add_error("store.root", "Local archive requires a root directory");
                }
            }
            StoreBackend::S3 => {
                if self.store.bucket.as_deref().map_or(true, str::is_empty) {
                    result.add_error("store.bucket", "S3 archive requires a bucket name");
                }
                if let Some(endpoint) = &self.store.endpoint {
                    self.validate_url(endpoint, "store.endpoint", &mut result);
                }
            }
        }

        if self.store.subject.is_empty() || self.store.subject.contains('/') {
            result.add_error(
                "store.subject",
                "Subject must be a single non-empty path segment",
            );
        }

        if self.analytics.table.is_empty() {
            result.add_error("analytics.table", "Table name must not be empty");
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }

                if url.port() == Some(0) {
                    result.add_error(field_name, "Port cannot be 0");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Write the configuration as TOML, creating the parent directory.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("fitted");

        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        let result = config.validate();
        // In-memory backend is only a warning
        assert!(result.is_valid(), "Default config should be valid: {:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.field == "store.backend"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.ttl(), Duration::from_secs(900));
        assert_eq!(config.upstream.max_forecast_days, 14);
        assert_eq!(config.store.subject, "weather");
        assert_eq!(config.analytics.table, "weather_data");
    }

    #[test]
    fn test_invalid_url_scheme() {
        let mut config = Config::default();
        config.upstream.base_url = "ftp://api.example.com".to_string();
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.message.contains("http or https")));
    }

    #[test]
    fn test_invalid_url() {
        let mut config = Config::default();
        config.upstream.base_url = "not-a-url".to_string();
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.field == "upstream.base_url"));
    }

    #[test]
    fn test_zero_ttl_is_error() {
        let mut config = Config::default();
        config.cache.ttl_secs = 0;
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.field == "cache.ttl_secs"));
    }

    #[test]
    fn test_ttl_longer_than_stale_window_warns() {
        let mut config = Config::default();
        config.cache.ttl_secs = 600;
        config.cache.max_stale_secs = 300;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.field == "cache.max_stale_secs"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::S3;
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.field == "store.bucket"));

        config.store.bucket = Some("weather-archive".to_string());
        assert!(config.validate().is_valid());
    }

    #[test]
    fn test_local_requires_root() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Local;
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn test_zero_timeout_is_error() {
        let mut config = Config::default();
        config.upstream.timeout_secs = 0;
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.field == "upstream.timeout_secs"));
    }

    #[test]
    fn test_legacy_env_fills_unset_values() {
        let vars: HashMap<&str, &str> = [
            ("WEATHER_API_KEY", "secret"),
            ("WEATHER_BUCKET_NAME", "archive"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_legacy_env(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.upstream.api_key.as_deref(), Some("secret"));
        assert_eq!(config.store.bucket.as_deref(), Some("archive"));
        assert_eq!(config.store.backend, StoreBackend::S3);
    }

    #[test]
    fn test_legacy_env_does_not_override_explicit_values() {
        let mut config = Config::default();
        config.upstream.api_key = Some("from-file".to_string());
        config.apply_legacy_env(|_| Some("from-env".to_string()));
        assert_eq!(config.upstream.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_require_api_key() {
        let mut config = Config::default();
        assert!(matches!(
            config.require_api_key(),
            Err(ConfigError::MissingSetting(_))
        ));
        config.upstream.api_key = Some("k".to_string());
        assert_eq!(config.require_api_key().unwrap(), "k");
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[cache]
ttl_secs = 300

[store]
backend = "local"
root = "/var/lib/fitted"

[analytics]
table = "observations"
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.cache.ttl_secs, 300);
        // Unset keys keep their defaults
        assert_eq!(config.cache.max_stale_secs, 86_400);
        assert_eq!(config.store.backend, StoreBackend::Local);
        assert_eq!(config.store.root, Some(PathBuf::from("/var/lib/fitted")));
        assert_eq!(config.analytics.table, "observations");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.cache.ttl_secs = 600;
        config.store.backend = StoreBackend::Local;
        config.store.root = Some(dir.path().join("archive"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.cache.ttl_secs, 600);
        assert_eq!(loaded.store.backend, StoreBackend::Local);
        assert_eq!(loaded.store.root, Some(dir.path().join("archive")));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.upstream.base_url, "https://api.weatherapi.com/v1");
    }

    #[test]
    fn test_validation_result_error_summary() {
        let mut result = ValidationResult::default();
        result.add_error("field1", "error1");
        result.add_error("field2", "error2");
        let summary = result.error_summary();
        assert!(summary.contains("field1"));
        assert!(summary.contains("field2"));
    }
}
