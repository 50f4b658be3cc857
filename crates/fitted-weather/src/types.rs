use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use fitted_core::FetchError;
use serde::{Deserialize, Serialize};

/// Weather condition as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub name: String,
    pub region: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub tz_id: String,
    pub localtime_epoch: i64,
    pub localtime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub last_updated_epoch: i64,
    pub last_updated: String,
    pub temp_c: f64,
    pub temp_f: f64,
    pub is_day: i32,
    pub condition: Condition,
    pub wind_mph: f64,
    pub wind_kph: f64,
    pub humidity: i32,
    pub cloud: i32,
    pub feelslike_c: f64,
    pub feelslike_f: f64,
    pub uv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    pub maxtemp_c: f64,
    pub mintemp_c: f64,
    pub avgtemp_c: f64,
    pub maxwind_kph: f64,
    pub totalprecip_mm: f64,
    pub avghumidity: f64,
    pub daily_chance_of_rain: i32,
    pub daily_chance_of_snow: i32,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Astro {
    pub sunrise: String,
    pub sunset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourForecast {
    pub time_epoch: i64,
    pub time: String,
    pub temp_c: f64,
    pub humidity: i32,
    pub chance_of_rain: i32,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub date: NaiveDate,
    pub date_epoch: i64,
    pub day: DaySummary,
    pub astro: Astro,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<Vec<HourForecast>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub forecastday: Vec<ForecastDay>,
}

/// Provider response body: current conditions plus an optional forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherPayload {
    pub location: LocationInfo,
    pub current: CurrentConditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Forecast>,
}

/// Collects schema violations so one message can name all of them.
#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn range(&mut self, field: &str, value: f64, min: f64, max: f64) {
        if !value.is_finite() || value < min || value > max {
            self.0.push(format!("{field}={value} outside [{min}, {max}]"));
        }
    }

    fn non_negative(&mut self, field: &str, value: f64) {
        if !value.is_finite() || value < 0.0 {
            self.0.push(format!("{field}={value} must be >= 0"));
        }
    }

    fn percentage(&mut self, field: &str, value: impl Into<f64>) {
        self.range(field, value.into(), 0.0, 100.0);
    }
}

impl WeatherPayload {
    /// Deserialize and validate a provider body. Never yields a partial payload.
    pub fn parse(body: &[u8]) -> Result<Self, FetchError> {
        let payload: WeatherPayload = serde_json::from_slice(body)
            .map_err(|e| FetchError::MalformedUpstreamData(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check the bounded ranges of the schema.
    pub fn validate(&self) -> Result<(), FetchError> {
        let mut v = Violations::default();

        v.range("location.lat", self.location.lat, -90.0, 90.0);
        v.range("location.lon", self.location.lon, -180.0, 180.0);

        let c = &self.current;
        v.range("current.temp_c", c.temp_c, -100.0, 60.0);
        if c.is_day != 0 && c.is_day != 1 {
            v.0.push(format!("current.is_day={} must be 0 or 1", c.is_day));
        }
        v.non_negative("current.wind_mph", c.wind_mph);
        v.non_negative("current.wind_kph", c.wind_kph);
        v.percentage("current.humidity", c.humidity);
        v.percentage("current.cloud", c.cloud);
        v.non_negative("current.uv", c.uv);
        if DateTime::from_timestamp(c.last_updated_epoch, 0).is_none() {
            v.0.push(format!(
                "current.last_updated_epoch={} is not a valid timestamp",
                c.last_updated_epoch
            ));
        }

        if let Some(forecast) = &self.forecast {
            for (i, fd) in forecast.forecastday.iter().enumerate() {
                let d = &fd.day;
                let prefix = format!("forecast.forecastday[{i}].day");
                if d.maxtemp_c < d.mintemp_c {
                    v.0.push(format!(
                        "{prefix}.maxtemp_c={} below mintemp_c={}",
                        d.maxtemp_c, d.mintemp_c
                    ));
                }
                v.range(&format!("{prefix}.avgtemp_c"), d.avgtemp_c, -100.0, 60.0);
                v.non_negative(&format!("{prefix}.maxwind_kph"), d.maxwind_kph);
                v.non_negative(&format!("{prefix}.totalprecip_mm"), d.totalprecip_mm);
                v.percentage(&format!("{prefix}.avghumidity"), d.avghumidity);
                v.percentage(&format!("{prefix}.daily_chance_of_rain"), d.daily_chance_of_rain);
                v.percentage(&format!("{prefix}.daily_chance_of_snow"), d.daily_chance_of_snow);

                for (j, h) in fd.hour.iter().flatten().enumerate() {
                    let prefix = format!("forecast.forecastday[{i}].hour[{j}]");
                    v.range(&format!("{prefix}.temp_c"), h.temp_c, -100.0, 60.0);
                    v.percentage(&format!("{prefix}.humidity"), h.humidity);
                    v.percentage(&format!("{prefix}.chance_of_rain"), h.chance_of_rain);
                }
            }
        }

        if v.0.is_empty() {
            Ok(())
        } else {
            Err(FetchError::MalformedUpstreamData(v.0.join("; ")))
        }
    }

    /// Time the provider says the current conditions are valid for.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.current.last_updated_epoch, 0)
    }
}

/// A validated weather fetch for one location and horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Normalized location key
    pub key: String,
    /// Forecast horizon in days; `None` for current conditions only
    pub forecast_days: Option<u8>,
    pub observed_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub payload: WeatherPayload,
}

impl Record {
    /// Build a record from a validated payload.
    pub fn new(
        key: impl Into<String>,
        forecast_days: Option<u8>,
        fetched_at: DateTime<Utc>,
        payload: WeatherPayload,
    ) -> Result<Self, FetchError> {
        let observed_at = payload.observed_at().ok_or_else(|| {
            FetchError::MalformedUpstreamData("current.last_updated_epoch out of range".into())
        })?;
        Ok(Self {
            key: key.into(),
            forecast_days,
            observed_at,
            fetched_at,
            payload,
        })
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            key: self.key.clone(),
            forecast_days: self.forecast_days,
        }
    }
}

/// Normalize a caller-supplied location into a stable key.
///
/// `"  New York "` becomes `"new-york"`. Only ASCII alphanumerics, `-` and `_`
/// survive, so the key is safe to use as a path segment.
pub fn normalize_key(raw: &str) -> Result<String, FetchError> {
    let mut key = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            pending_dash = true;
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            if pending_dash && !key.is_empty() {
                key.push('-');
            }
            pending_dash = false;
            key.push(ch.to_ascii_lowercase());
        }
    }
    if key.is_empty() {
        return Err(FetchError::InvalidRequest(format!(
            "location {raw:?} contains no usable characters"
        )));
    }
    Ok(key)
}

/// Clamp a requested horizon into `1..=max`. `None` stays `None`.
pub fn clamp_forecast_days(days: Option<u8>, max: u8) -> Option<u8> {
    days.map(|d| d.clamp(1, max.max(1)))
}

/// L1 cache key. The forecast horizon is always part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub forecast_days: Option<u8>,
}

impl CacheKey {
    pub fn new(key: impl Into<String>, forecast_days: Option<u8>) -> Self {
        Self {
            key: key.into(),
            forecast_days,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.forecast_days {
            Some(days) => write!(f, "{}[{}d]", self.key, days),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Per-call fetch options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub forecast_days: Option<u8>,
    /// Upper bound on the upstream phase, retries included
    pub deadline: Option<Duration>,
}

impl FetchOptions {
    pub fn forecast(days: u8) -> Self {
        Self {
            forecast_days: Some(days),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Tier a fetch was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    L1,
    L2,
    Upstream,
}

/// Caller-facing fetch result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedRecord {
    pub record: Record,
    pub source: RecordSource,
    /// Set only when an expired record is served because upstream failed
    pub stale: bool,
}
