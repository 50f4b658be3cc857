//! Centralized error types for the Fitted weather archive.
//!
//! This module provides a typed error hierarchy that:
//! - Separates retryable upstream failures from permanent ones
//! - Keeps store failures soft so callers can degrade instead of failing
//! - Provides user-friendly messages for the HTTP layer sitting on top

use std::time::Duration;

use thiserror::Error;

/// Top-level application error type.
///
/// All errors in the workspace should be convertible to this type.
/// Use `user_message()` to get a caller-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for an API response body.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Fetch(e) => e.user_message(),
            AppError::Store(e) => e.user_message(),
            AppError::Query(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Io(_) => "A file operation failed. Please try again.",
            AppError::Other(_) => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Errors raised while resolving a weather record for a caller.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Bad input or a 4xx (other than 429) from the provider. Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider rate-limited (429), failing (5xx) or unreachable.
    #[error("Upstream temporarily unavailable{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Transient { status: Option<u16>, message: String },

    /// Provider answered 2xx with a body that does not match the payload schema.
    #[error("Malformed upstream data: {0}")]
    MalformedUpstreamData(String),

    /// The caller-supplied deadline elapsed before the provider answered.
    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl FetchError {
    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Transient {
            status,
            message: message.into(),
        }
    }

    /// Whether a stale record may be served instead of this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. } | FetchError::DeadlineExceeded(_)
        )
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            FetchError::InvalidRequest(_) => "Location not found. Check and try again.",
            FetchError::Transient { status: Some(429), .. } => {
                "Weather provider rate limit reached. Please try again shortly."
            }
            FetchError::Transient { .. } => {
                "Weather service unavailable. Please try again later."
            }
            FetchError::MalformedUpstreamData(_) => {
                "Weather provider returned unexpected data. Please try again later."
            }
            FetchError::DeadlineExceeded(_) => "The request timed out. Please try again.",
        }
    }
}

/// Durable object store errors. Treated as soft failures by the fetch path.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    /// An archived body no longer passes payload validation.
    #[error("Corrupt object: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(message.to_string())
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "Weather archive unavailable. Data may be outdated.",
            StoreError::Serialization(_) => "Archived weather data could not be read.",
            StoreError::InvalidPath(_) => "Archived weather data has an unexpected layout.",
            StoreError::Corrupt(_) => "Archived weather data could not be read.",
        }
    }
}

/// Analytics query errors.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Unparsable SQL, unsupported construct or unknown field.
    #[error("Query rejected at `{clause}`: {reason}")]
    Rejected { clause: String, reason: String },
}

impl QueryError {
    pub fn rejected(clause: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::Rejected {
            clause: clause.into(),
            reason: reason.into(),
        }
    }

    /// The part of the query that caused the rejection.
    pub fn clause(&self) -> &str {
        match self {
            QueryError::Rejected { clause, .. } => clause,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            QueryError::Rejected { .. } => "The query could not be run. Check fields and syntax.",
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("Missing required setting: {0}")]
    MissingSetting(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
            ConfigError::MissingSetting(_) => "A required setting is missing. Check your settings.",
        }
    }
}

/// Extension trait for converting reqwest errors to our error types.
pub trait ReqwestErrorExt {
    fn into_fetch_error(self) -> FetchError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_fetch_error(self) -> FetchError {
        if self.is_timeout() || self.is_connect() {
            FetchError::transient(None, self.to_string())
        } else if let Some(status) = self.status() {
            if status.as_u16() == 429 || status.is_server_error() {
                FetchError::transient(Some(status.as_u16()), self.to_string())
            } else {
                FetchError::InvalidRequest(self.to_string())
            }
        } else if self.is_decode() {
            FetchError::MalformedUpstreamData(self.to_string())
        } else {
            FetchError::transient(None, self.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::transient(Some(429), "slow down").is_transient());
        assert!(FetchError::transient(Some(503), "down").is_transient());
        assert!(FetchError::DeadlineExceeded(Duration::from_secs(1)).is_transient());
        assert!(!FetchError::InvalidRequest("bad".into()).is_transient());
        assert!(!FetchError::MalformedUpstreamData("bad".into()).is_transient());
    }

    #[test]
    fn test_transient_display_includes_status() {
        let err = FetchError::transient(Some(429), "rate limited");
        assert_eq!(
            err.to_string(),
            "Upstream temporarily unavailable (429): rate limited"
        );

        let err = FetchError::transient(None, "connection reset");
        assert_eq!(
            err.to_string(),
            "Upstream temporarily unavailable: connection reset"
        );
    }

    #[test]
    fn test_rate_limit_has_specific_message() {
        let err = FetchError::transient(Some(429), "x");
        assert!(err.user_message().contains("rate limit"));
    }

    #[test]
    fn test_query_rejection_names_clause() {
        let err = QueryError::rejected("payload.current.tempurature", "unknown field");
        assert_eq!(err.clause(), "payload.current.tempurature");
        assert!(err.to_string().contains("payload.current.tempurature"));
    }

    #[test]
    fn test_app_error_conversion() {
        let store_err = StoreError::unavailable("connection refused");
        let app_err: AppError = store_err.into();
        assert!(matches!(app_err, AppError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_user_message_propagation() {
        let app_err = AppError::Fetch(FetchError::DeadlineExceeded(Duration::from_secs(2)));
        assert_eq!(
            app_err.user_message(),
            "The request timed out. Please try again."
        );
    }
}
