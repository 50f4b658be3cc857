//! HTTP client for the weather provider.
//!
//! Pure request/response: the client validates what it receives and reports
//! whether a failure is worth retrying, but never retries or archives anything
//! itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fitted_core::{FetchError, ReqwestErrorExt, UpstreamConfig};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::instrument;

use crate::clock::{Clock, SystemClock};
use crate::types::{clamp_forecast_days, normalize_key, FetchOptions, Record, WeatherPayload};

const WEATHERAPI_BASE: &str = "https://api.weatherapi.com/v1";
const DEFAULT_MAX_FORECAST_DAYS: u8 = 14;

/// Anything that can produce a validated weather record for a location.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch_upstream(
        &self,
        location: &str,
        options: &FetchOptions,
    ) -> Result<Record, FetchError>;
}

/// Error body returned by the provider on 4xx responses
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: ProviderError,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    code: Option<i64>,
    message: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
    timeout: Duration,
    max_forecast_days: u8,
    clock: Arc<dyn Clock>,
}

impl UpstreamClient {
    pub fn new(api_key: &str) -> Result<Self, FetchError> {
        Self::new_with_base_url(api_key, WEATHERAPI_BASE)
    }

    pub fn new_with_base_url(api_key: &str, base_url: &str) -> Result<Self, FetchError> {
        Self::build(
            api_key,
            base_url,
            Duration::from_secs(10),
            DEFAULT_MAX_FORECAST_DAYS,
        )
    }

    pub fn from_config(config: &UpstreamConfig, api_key: &str) -> Result<Self, FetchError> {
        Self::build(
            api_key,
            &config.base_url,
            config.timeout(),
            config.max_forecast_days,
        )
    }

    fn build(
        api_key: &str,
        base_url: &str,
        timeout: Duration,
        max_forecast_days: u8,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
            max_forecast_days,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` to stamp `fetched_at` on returned records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_forecast_days(&self) -> u8 {
        self.max_forecast_days
    }

    /// Map a non-2xx response onto the error taxonomy.
    async fn classify_failure(response: reqwest::Response) -> FetchError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ProviderErrorBody>(&text)
            .map(|body| match body.error.code {
                Some(code) => format!("{} (code {code})", body.error.message),
                None => body.error.message,
            })
            .unwrap_or(text);

        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            FetchError::transient(Some(status.as_u16()), detail)
        } else {
            FetchError::InvalidRequest(format!("{status}: {detail}"))
        }
    }
}

#[async_trait]
impl WeatherSource for UpstreamClient {
    #[instrument(skip(self), level = "info")]
    async fn fetch_upstream(
        &self,
        location: &str,
        options: &FetchOptions,
    ) -> Result<Record, FetchError> {
        let key = normalize_key(location)?;
        let days = clamp_forecast_days(options.forecast_days, self.max_forecast_days);

        let (endpoint, mut query) = match days {
            Some(days) => ("forecast.json", vec![("days", days.to_string())]),
            None => ("current.json", Vec::new()),
        };
        query.push(("key", self.api_key.clone()));
        query.push(("q", location.trim().to_string()));

        let timeout = options
            .deadline
            .map_or(self.timeout, |d| d.min(self.timeout));
        if timeout.is_zero() {
            return Err(FetchError::DeadlineExceeded(Duration::ZERO));
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(timeout)
            .send()
            .await
            .map_err(ReqwestErrorExt::into_fetch_error)?;

        if !response.status().is_success() {
            let error = Self::classify_failure(response).await;
            tracing::warn!(key = %key, error = %error, "Upstream request failed");
            return Err(error);
        }

        let body = response
            .bytes()
            .await
            .map_err(ReqwestErrorExt::into_fetch_error)?;
        let payload = WeatherPayload::parse(&body)?;

        tracing::debug!(key = %key, ?days, "Fetched weather from upstream");
        Record::new(key, days, self.clock.now(), payload)
    }
}
