//! Fetch orchestration across L1, the archive (L2) and the provider.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fitted_core::{Config, FetchError};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::cache::{Lookup, MemoryCache};
use crate::clock::Clock;
use crate::provider::WeatherSource;
use crate::retry::{with_retry, RetryConfig};
use crate::store::RecordStore;
use crate::types::{
    clamp_forecast_days, normalize_key, CacheKey, FetchOptions, FetchedRecord, Record,
    RecordSource,
};

const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_MAX_STALE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SUBJECT: &str = "weather";
const DEFAULT_MAX_FORECAST_DAYS: u8 = 14;

/// Counters for each way a fetch can be resolved.
#[derive(Debug, Default)]
pub struct FetchStats {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    upstream_calls: AtomicU64,
    stale_served: AtomicU64,
    store_write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStatsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    /// Every provider request, retries included
    pub upstream_calls: u64,
    pub stale_served: u64,
    pub store_write_failures: u64,
}

impl FetchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// A caller deadline, fixed when `fetch` starts.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn starting_now(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }
}

/// Run `fut` to completion, or give up with `None` once `deadline` passes.
async fn bounded<F: Future>(deadline: Option<Deadline>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(d) => tokio::time::timeout_at(d.at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Resolves `fetch` calls: L1, then a fresh archived object, then the provider.
///
/// Archive failures never fail a fetch. Transient provider failures are
/// masked with the newest stale record when one exists.
pub struct FetchOrchestrator {
    source: Arc<dyn WeatherSource>,
    store: Arc<dyn RecordStore>,
    cache: MemoryCache,
    subject: String,
    max_stale: Duration,
    max_forecast_days: u8,
    retry: RetryConfig,
    writes: TaskTracker,
    stats: Arc<FetchStats>,
}

impl FetchOrchestrator {
    pub fn new(
        source: Arc<dyn WeatherSource>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            store,
            cache: MemoryCache::new(DEFAULT_TTL, clock),
            subject: DEFAULT_SUBJECT.to_string(),
            max_stale: DEFAULT_MAX_STALE,
            max_forecast_days: DEFAULT_MAX_FORECAST_DAYS,
            retry: RetryConfig::default(),
            writes: TaskTracker::new(),
            stats: Arc::new(FetchStats::default()),
        }
    }

    pub fn from_config(
        config: &Config,
        source: Arc<dyn WeatherSource>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(source, store, clock)
            .with_ttl(config.cache.ttl())
            .with_max_stale(config.cache.max_stale())
            .with_retry(RetryConfig::from(&config.retry))
            .with_subject(&config.store.subject)
            .with_max_forecast_days(config.upstream.max_forecast_days)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let clock = self.cache_clock();
        self.cache = MemoryCache::new(ttl, clock);
        self
    }

    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = max_stale;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn with_max_forecast_days(mut self, max: u8) -> Self {
        self.max_forecast_days = max;
        self
    }

    fn cache_clock(&self) -> Arc<dyn Clock> {
        self.cache.clock()
    }

    pub fn ttl(&self) -> Duration {
        self.cache.ttl()
    }

    pub fn stats(&self) -> FetchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve weather for `location`.
    ///
    /// A caller deadline bounds the whole resolution: archive lookups that
    /// run out of time count as misses, and the provider call fails with
    /// `DeadlineExceeded`.
    #[instrument(skip(self), level = "info")]
    pub async fn fetch(
        &self,
        location: &str,
        options: FetchOptions,
    ) -> Result<FetchedRecord, FetchError> {
        let deadline = options.deadline.map(Deadline::starting_now);
        let key = CacheKey::new(
            normalize_key(location)?,
            clamp_forecast_days(options.forecast_days, self.max_forecast_days),
        );

        let expired = match self.cache.lookup(&key) {
            Lookup::Fresh(record) => {
                FetchStats::bump(&self.stats.l1_hits);
                tracing::debug!(key = %key, "L1 hit");
                return Ok(FetchedRecord {
                    record,
                    source: RecordSource::L1,
                    stale: false,
                });
            }
            Lookup::Expired(entry) => Some(entry.record),
            Lookup::Miss => None,
        };

        let lookup = self.store.most_recent(&self.subject, &key, self.ttl());
        match bounded(deadline, lookup).await {
            Some(Ok(Some(record))) => {
                FetchStats::bump(&self.stats.l2_hits);
                tracing::debug!(key = %key, "L2 hit");
                self.cache.insert_at(record.clone(), record.fetched_at);
                return Ok(FetchedRecord {
                    record,
                    source: RecordSource::L2,
                    stale: false,
                });
            }
            Some(Ok(None)) => {}
            Some(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "Archive lookup failed, asking upstream");
            }
            None => {
                tracing::warn!(key = %key, "Archive lookup ran out of time, asking upstream");
            }
        }

        match self.call_upstream(location, key.forecast_days, deadline).await {
            Ok(record) => {
                tracing::info!(key = %key, "Fetched fresh weather from upstream");
                self.write_through(record.clone());
                self.cache.insert(record.clone());
                Ok(FetchedRecord {
                    record,
                    source: RecordSource::Upstream,
                    stale: false,
                })
            }
            Err(error) if error.is_transient() => {
                match self.stale_fallback(&key, expired, deadline).await {
                    Some((record, source)) => {
                        FetchStats::bump(&self.stats.stale_served);
                        tracing::warn!(
                            key = %key,
                            error = %error,
                            fetched_at = %record.fetched_at,
                            "Upstream unavailable, serving stale record"
                        );
                        Ok(FetchedRecord {
                            record,
                            source,
                            stale: true,
                        })
                    }
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Provider call with retries, bounded by the caller's deadline.
    async fn call_upstream(
        &self,
        location: &str,
        forecast_days: Option<u8>,
        deadline: Option<Deadline>,
    ) -> Result<Record, FetchError> {
        let attempts = with_retry(&self.retry, deadline.map(|d| d.at), |_attempt, remaining| {
            FetchStats::bump(&self.stats.upstream_calls);
            let source = Arc::clone(&self.source);
            let attempt_options = FetchOptions {
                forecast_days,
                deadline: remaining,
            };
            async move { source.fetch_upstream(location, &attempt_options).await }
        });

        match deadline {
            Some(d) => tokio::time::timeout_at(d.at, attempts)
                .await
                .map_err(|_| FetchError::DeadlineExceeded(d.limit))?,
            None => attempts.await,
        }
    }

    /// Newest of the expired L1 entry and the newest archived object within `max_stale`.
    async fn stale_fallback(
        &self,
        key: &CacheKey,
        expired: Option<Record>,
        deadline: Option<Deadline>,
    ) -> Option<(Record, RecordSource)> {
        let archived = if self.max_stale > self.ttl() {
            let lookup = self.store.most_recent(&self.subject, key, self.max_stale);
            match bounded(deadline, lookup).await {
                Some(Ok(found)) => found,
                Some(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Archive lookup for stale fallback failed");
                    None
                }
                None => {
                    tracing::debug!(key = %key, "No time left for a stale archive lookup");
                    None
                }
            }
        } else {
            None
        };

        match (expired, archived) {
            (Some(l1), Some(l2)) if l2.fetched_at > l1.fetched_at => Some((l2, RecordSource::L2)),
            (Some(l1), _) => Some((l1, RecordSource::L1)),
            (None, Some(l2)) => Some((l2, RecordSource::L2)),
            (None, None) => None,
        }
    }

    /// Archive `record` in the background. Failures are logged and counted.
    fn write_through(&self, record: Record) {
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let subject = self.subject.clone();
        self.writes.spawn(async move {
            match store.put(&subject, &record).await {
                Ok(object) => tracing::debug!(path = %object, "Write-through complete"),
                Err(e) => {
                    FetchStats::bump(&stats.store_write_failures);
                    tracing::warn!(key = %record.key, error = %e, "Archive write failed");
                }
            }
        });
    }

    /// Wait for every pending background write.
    pub async fn flush(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Drop the L1 entry for one location and horizon.
    pub fn invalidate(&self, location: &str, forecast_days: Option<u8>) -> Result<bool, FetchError> {
        let key = CacheKey::new(
            normalize_key(location)?,
            clamp_forecast_days(forecast_days, self.max_forecast_days),
        );
        Ok(self.cache.invalidate(&key))
    }

    /// Drop every L1 entry.
    pub fn clear(&self) {
        self.cache.clear();
    }
}
