//! Date/location partitioned archive on top of `object_store`.
//!
//! Writes are pure appends of uniquely named objects, so concurrent writers
//! from independent processes never need to coordinate. Reads list first and
//! only fetch bodies that can actually be used.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use fitted_core::{StoreBackend, StoreConfig, StoreError};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload,
};
use tracing::instrument;

use crate::clock::{age, Clock};
use crate::partition::{
    date_prefix, kind_prefix, location_prefix, parse_date_segment, subject_prefix,
    PartitionKind, PartitionPath,
};
use crate::types::{CacheKey, Record, WeatherPayload};

/// Object bodies fetched concurrently during a scan
const SCAN_READ_CONCURRENCY: usize = 8;

/// Handle to a written object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub path: Path,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// A record read back from the archive together with where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub partition: PartitionPath,
    pub path: Path,
    pub record: Record,
}

/// Which `dt` partitions a scan may touch. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DateFilter {
    #[default]
    Unbounded,
    Dates(BTreeSet<NaiveDate>),
    Range {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    /// Any of several filters, e.g. from `dt = a OR dt BETWEEN b AND c`
    Union(Vec<DateFilter>),
}

impl DateFilter {
    pub fn matches(&self, dt: NaiveDate) -> bool {
        match self {
            DateFilter::Unbounded => true,
            DateFilter::Dates(dates) => dates.contains(&dt),
            DateFilter::Range { start, end } => {
                start.map_or(true, |s| dt >= s) && end.map_or(true, |e| dt <= e)
            }
            DateFilter::Union(parts) => parts.iter().any(|part| part.matches(dt)),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        match self {
            DateFilter::Unbounded | DateFilter::Range { start: None, end: None } => true,
            DateFilter::Union(parts) => parts.iter().any(DateFilter::is_unbounded),
            DateFilter::Dates(_) | DateFilter::Range { .. } => false,
        }
    }
}

/// Partition predicate pushed down to listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFilter {
    pub dates: DateFilter,
    /// `None` means every location
    pub locations: Option<BTreeSet<String>>,
}

impl PartitionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn date_range(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            dates: DateFilter::Range {
                start: Some(start),
                end: Some(end),
            },
            locations: None,
        }
    }

    pub fn on(date: NaiveDate) -> Self {
        Self {
            dates: DateFilter::Dates(BTreeSet::from([date])),
            locations: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.locations
            .get_or_insert_with(BTreeSet::new)
            .insert(location.into());
        self
    }

    pub fn matches_location(&self, location: &str) -> bool {
        self.locations
            .as_ref()
            .map_or(true, |set| set.contains(location))
    }
}

/// One `kind/dt/location` leaf of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub dt: NaiveDate,
    pub kind: PartitionKind,
    pub location: String,
    pub prefix: Path,
}

/// The archive operations the fetch path depends on.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append `record` under its partition. Never overwrites an existing object.
    async fn put(&self, subject: &str, record: &Record) -> Result<ObjectRef, StoreError>;

    /// Newest record for `key` written less than `within` ago, if any.
    async fn most_recent(
        &self,
        subject: &str,
        key: &CacheKey,
        within: Duration,
    ) -> Result<Option<Record>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PartitionedStore {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    attributes: Attributes,
}

impl PartitionedStore {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            attributes: Attributes::new(),
        }
    }

    /// Tag written objects as `application/json`.
    ///
    /// Only for backends that persist attributes; the local filesystem
    /// backend rejects them.
    pub fn with_json_content_type(mut self) -> Self {
        self.attributes
            .insert(Attribute::ContentType, "application/json".into());
        self
    }

    pub fn from_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::new(Arc::new(InMemory::new()), clock)),
            StoreBackend::Local => {
                let root = config
                    .root
                    .as_ref()
                    .ok_or_else(|| StoreError::unavailable("store.root is not set"))?;
                std::fs::create_dir_all(root).map_err(StoreError::unavailable)?;
                let local =
                    LocalFileSystem::new_with_prefix(root).map_err(StoreError::unavailable)?;
                Ok(Self::new(Arc::new(local), clock))
            }
            StoreBackend::S3 => {
                let bucket = config
                    .bucket
                    .as_deref()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| StoreError::unavailable("store.bucket is not set"))?;
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_conditional_put(S3ConditionalPut::ETagMatch)
                    .with_allow_http(config.allow_http);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let s3 = builder.build().map_err(StoreError::unavailable)?;
                Ok(Self::new(Arc::new(s3), clock).with_json_content_type())
            }
        }
    }

    async fn write(
        &self,
        path: &Path,
        payload: PutPayload,
        mode: PutMode,
    ) -> object_store::Result<()> {
        let opts = PutOptions {
            mode,
            attributes: self.attributes.clone(),
            ..Default::default()
        };
        self.store.put_opts(path, payload, opts).await.map(|_| ())
    }

    /// Fetch and validate one object body.
    pub async fn read_object(&self, path: &Path) -> Result<StoredRecord, StoreError> {
        let partition = PartitionPath::parse(path)?;
        let bytes = self
            .store
            .get(path)
            .await
            .map_err(StoreError::unavailable)?
            .bytes()
            .await
            .map_err(StoreError::unavailable)?;
        let payload: WeatherPayload = serde_json::from_slice(&bytes)?;
        payload
            .validate()
            .map_err(|e| StoreError::Corrupt(format!("{path}: {e}")))?;
        let record = Record::new(
            partition.location.clone(),
            partition.kind.forecast_days(),
            partition.timestamp(),
            payload,
        )
        .map_err(|e| StoreError::Corrupt(format!("{path}: {e}")))?;

        Ok(StoredRecord {
            partition,
            path: path.clone(),
            record,
        })
    }

    /// Child prefixes one level below `prefix`.
    async fn child_prefixes(&self, prefix: &Path) -> Result<Vec<Path>, StoreError> {
        let listing = self
            .store
            .list_with_delimiter(Some(prefix))
            .await
            .map_err(StoreError::unavailable)?;
        Ok(listing.common_prefixes)
    }

    /// Partitions matching `filter`, found from listings alone.
    #[instrument(skip(self), level = "debug")]
    pub async fn partitions(
        &self,
        subject: &str,
        filter: &PartitionFilter,
    ) -> Result<Vec<Partition>, StoreError> {
        let mut partitions = Vec::new();

        for kind_path in self.child_prefixes(&subject_prefix(subject)).await? {
            let Some(kind) = kind_path
                .filename()
                .and_then(|name| name.parse::<PartitionKind>().ok())
            else {
                continue;
            };

            for date_path in self.child_prefixes(&kind_prefix(subject, kind)).await? {
                let Some(dt) = date_path.filename().and_then(parse_date_segment) else {
                    continue;
                };
                if !filter.dates.matches(dt) {
                    continue;
                }

                for location_path in self.child_prefixes(&date_prefix(subject, kind, dt)).await? {
                    let Some(location) = location_path
                        .filename()
                        .and_then(|name| name.strip_prefix("location="))
                    else {
                        continue;
                    };
                    if !filter.matches_location(location) {
                        continue;
                    }
                    partitions.push(Partition {
                        dt,
                        kind,
                        location: location.to_string(),
                        prefix: location_prefix(subject, kind, dt, location),
                    });
                }
            }
        }

        partitions.sort_by(|a, b| (a.dt, a.kind, &a.location).cmp(&(b.dt, b.kind, &b.location)));
        tracing::debug!(count = partitions.len(), "Resolved partitions");
        Ok(partitions)
    }

    /// Lazily read every valid object in one partition.
    ///
    /// Listing or read failures are logged and skipped.
    pub fn scan_partition(&self, partition: &Partition) -> BoxStream<'_, StoredRecord> {
        let prefix = partition.prefix.clone();
        self.store
            .list(Some(&prefix))
            .filter_map(move |meta| {
                let meta = match meta {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "Listing failed during scan");
                        None
                    }
                };
                futures::future::ready(meta)
            })
            .map(move |meta: ObjectMeta| async move {
                match self.read_object(&meta.location).await {
                    Ok(stored) => Some(stored),
                    Err(e) => {
                        tracing::warn!(path = %meta.location, error = %e, "Skipping unreadable object");
                        None
                    }
                }
            })
            .buffered(SCAN_READ_CONCURRENCY)
            .filter_map(futures::future::ready)
            .boxed()
    }

    /// Lazy, restartable sequence of records whose partitions match `filter`.
    ///
    /// Each call lists afresh, so objects written since the last scan are seen.
    pub fn scan(&self, subject: &str, filter: &PartitionFilter) -> BoxStream<'_, StoredRecord> {
        let subject = subject.to_string();
        let filter = filter.clone();
        stream::once(async move { self.partitions(&subject, &filter).await })
            .flat_map(|partitions| {
                let partitions = partitions.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Partition listing failed, scanning nothing");
                    Vec::new()
                });
                stream::iter(partitions)
            })
            .flat_map(move |partition| self.scan_partition(&partition))
            .boxed()
    }

    /// Newest valid object for `location` in one `dt` partition.
    /// Objects for one location and day, newest first.
    async fn newest_first(
        &self,
        subject: &str,
        kind: PartitionKind,
        dt: NaiveDate,
        location: &str,
    ) -> Result<Vec<PartitionPath>, StoreError> {
        let prefix = location_prefix(subject, kind, dt, location);
        let objects: Vec<ObjectMeta> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(StoreError::unavailable)?;

        let mut paths: Vec<PartitionPath> = objects
            .iter()
            .filter_map(|meta| PartitionPath::parse(&meta.location).ok())
            .collect();
        paths.sort_by(|a, b| (b.time, &b.suffix).cmp(&(a.time, &a.suffix)));
        Ok(paths)
    }
}

#[async_trait]
impl RecordStore for PartitionedStore {
    #[instrument(skip(self, record), fields(key = %record.key), level = "debug")]
    async fn put(&self, subject: &str, record: &Record) -> Result<ObjectRef, StoreError> {
        let partition = PartitionPath::new(
            subject,
            PartitionKind::for_horizon(record.forecast_days),
            &record.key,
            record.fetched_at,
        );
        let payload = PutPayload::from(serde_json::to_vec(&record.payload)?);

        let path = partition.to_path();
        match self.write(&path, payload.clone(), PutMode::Create).await {
            Ok(()) => {
                tracing::debug!(path = %path, "Archived record");
                return Ok(ObjectRef { path });
            }
            Err(object_store::Error::AlreadyExists { .. } | object_store::Error::NotImplemented) => {
                tracing::debug!(path = %path, "Object name taken, writing with a unique suffix");
            }
            Err(e) => return Err(StoreError::unavailable(format!("{path}: {e}"))),
        }

        let mut suffix = uuid::Uuid::new_v4().simple().to_string();
        suffix.truncate(8);
        let path = partition.with_suffix(suffix).to_path();
        self.write(&path, payload, PutMode::Overwrite)
            .await
            .map_err(|e| StoreError::unavailable(format!("{path}: {e}")))?;
        tracing::debug!(path = %path, "Archived record");
        Ok(ObjectRef { path })
    }

    #[instrument(skip(self), fields(key = %key), level = "debug")]
    async fn most_recent(
        &self,
        subject: &str,
        key: &CacheKey,
        within: Duration,
    ) -> Result<Option<Record>, StoreError> {
        let now = self.clock.now();
        let kind = PartitionKind::for_horizon(key.forecast_days);
        let oldest_day = chrono::Duration::from_std(within)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .map_or(NaiveDate::MIN, |t| t.date_naive());

        // Writes are partitioned by write date, so days are visited newest
        // first. An unreadable object falls through to the next newest.
        let mut day = now.date_naive();
        loop {
            for candidate in self.newest_first(subject, kind, day, &key.key).await? {
                if age(now, candidate.timestamp()) >= within {
                    return Ok(None);
                }
                let path = candidate.to_path();
                match self.read_object(&path).await {
                    Ok(stored) => return Ok(Some(stored.record)),
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "Skipping unreadable object");
                    }
                }
            }
            match day.checked_sub_days(Days::new(1)) {
                Some(previous) if previous >= oldest_day => day = previous,
                _ => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::clock::ManualClock;
    use crate::types::fixtures::payload;
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemory>, Arc<ManualClock>, PartitionedStore) {
        let memory = Arc::new(InMemory::new());
        let clock = Arc::new(ManualClock::new(start()));
        let store = PartitionedStore::new(memory.clone(), clock.clone());
        (memory, clock, store)
    }

    fn record(key: &str, temp_c: f64, fetched_at: DateTime<Utc>) -> Record {
        Record::new(key, None, fetched_at, payload(key, temp_c)).unwrap()
    }

    async fn object_count(memory: &InMemory) -> usize {
        memory.list(None).try_collect::<Vec<_>>().await.unwrap().len()
    }

    #[tokio::test]
    async fn test_put_writes_partitioned_path() {
        let (memory, _, store) = setup();
        let written = store.put("weather", &record("paris", 14.0, start())).await.unwrap();
        assert_eq!(
            written.path.as_ref(),
            "raw/weather/current/dt=2024-01-15/location=paris/10-00-00.json"
        );
        assert_eq!(object_count(&memory).await, 1);
    }

    #[tokio::test]
    async fn test_same_second_writes_do_not_collide() {
        let (memory, _, store) = setup();
        let a = store.put("weather", &record("paris", 14.0, start())).await.unwrap();
        let b = store.put("weather", &record("paris", 15.0, start())).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(object_count(&memory).await, 2);

        let first = store.read_object(&a.path).await.unwrap();
        assert_eq!(first.record.payload.current.temp_c, 14.0);
    }

    #[tokio::test]
    async fn test_most_recent_returns_fresh_write() {
        let (_, _, store) = setup();
        let original = record("paris", 14.0, start());
        store.put("weather", &original).await.unwrap();

        let found = store
            .most_recent("weather", &CacheKey::new("paris", None), Duration::from_secs(900))
            .await
            .unwrap()
            .expect("fresh record");
        assert_eq!(found.payload, original.payload);
        assert_eq!(found.key, "paris");
    }

    #[tokio::test]
    async fn test_most_recent_ignores_old_objects() {
        let (_, clock, store) = setup();
        store.put("weather", &record("paris", 14.0, start())).await.unwrap();

        clock.advance(Duration::from_secs(901));
        let found = store
            .most_recent("weather", &CacheKey::new("paris", None), Duration::from_secs(900))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_most_recent_picks_latest() {
        let (_, clock, store) = setup();
        store.put("weather", &record("paris", 10.0, start())).await.unwrap();
        let later = start() + chrono::Duration::minutes(5);
        store.put("weather", &record("paris", 12.0, later)).await.unwrap();
        clock.set(later + chrono::Duration::minutes(1));

        let found = store
            .most_recent("weather", &CacheKey::new("paris", None), Duration::from_secs(900))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.payload.current.temp_c, 12.0);
    }

    #[tokio::test]
    async fn test_most_recent_crosses_midnight() {
        let (_, clock, store) = setup();
        let late = Utc.with_ymd_and_hms(2024, 1, 15, 23, 55, 0).unwrap();
        store.put("weather", &record("paris", 4.0, late)).await.unwrap();
        clock.set(Utc.with_ymd_and_hms(2024, 1, 16, 0, 5, 0).unwrap());

        let found = store
            .most_recent("weather", &CacheKey::new("paris", None), Duration::from_secs(900))
            .await
            .unwrap();
        assert!(found.is_some(), "yesterday's partition should be consulted");
    }

    #[tokio::test]
    async fn test_most_recent_separates_horizons() {
        let (_, _, store) = setup();
        store.put("weather", &record("paris", 14.0, start())).await.unwrap();

        let found = store
            .most_recent("weather", &CacheKey::new("paris", Some(3)), Duration::from_secs(900))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_scan_date_range_ignores_dimension() {
        let (_, _, store) = setup();
        let day1 = start();
        let day2 = start() + chrono::Duration::days(1);
        let day3 = start() + chrono::Duration::days(2);
        store.put("weather", &record("paris", 1.0, day1)).await.unwrap();
        store.put("weather", &record("london", 2.0, day2)).await.unwrap();
        store.put("weather", &record("paris", 3.0, day2)).await.unwrap();
        store.put("weather", &record("paris", 4.0, day3)).await.unwrap();

        let filter = PartitionFilter::date_range(day1.date_naive(), day2.date_naive());
        let mut temps: Vec<f64> = store
            .scan("weather", &filter)
            .map(|s| s.record.payload.current.temp_c)
            .collect()
            .await;
        temps.sort_by(f64::total_cmp);
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_scan_empty_range_is_empty() {
        let (_, _, store) = setup();
        store.put("weather", &record("paris", 1.0, start())).await.unwrap();

        let empty_day = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let found: Vec<_> = store
            .scan("weather", &PartitionFilter::on(empty_day))
            .collect()
            .await;
        assert!(found.is_empty());

        let nothing: Vec<_> = store.scan("other", &PartitionFilter::all()).collect().await;
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn test_scan_location_filter_prunes_partitions() {
        let (_, _, store) = setup();
        store.put("weather", &record("paris", 1.0, start())).await.unwrap();
        store.put("weather", &record("london", 2.0, start())).await.unwrap();

        let filter = PartitionFilter::all().with_location("london");
        let partitions = store.partitions("weather", &filter).await.unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].location, "london");
    }

    #[tokio::test]
    async fn test_scan_skips_invalid_objects() {
        let (memory, _, store) = setup();
        store.put("weather", &record("paris", 1.0, start())).await.unwrap();
        memory
            .put(
                &Path::from("raw/weather/current/dt=2024-01-15/location=paris/11-00-00.json"),
                PutPayload::from_static(b"{\"not\": \"weather\"}"),
            )
            .await
            .unwrap();
        memory
            .put(
                &Path::from("raw/weather/current/dt=2024-01-15/location=paris/README"),
                PutPayload::from_static(b"notes"),
            )
            .await
            .unwrap();

        let found: Vec<_> = store.scan("weather", &PartitionFilter::all()).collect().await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_most_recent_skips_corrupt_newest_object() {
        let (memory, clock, store) = setup();
        store.put("weather", &record("paris", 8.0, start())).await.unwrap();
        memory
            .put(
                &Path::from("raw/weather/current/dt=2024-01-15/location=paris/10-05-00.json"),
                PutPayload::from_static(b"{\"truncated"),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6 * 60));

        let found = store
            .most_recent("weather", &CacheKey::new("paris", None), Duration::from_secs(900))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.payload.current.temp_c, 8.0);
        assert_eq!(found.fetched_at, start());
    }

    #[tokio::test]
    async fn test_scan_is_restartable() {
        let (_, _, store) = setup();
        store.put("weather", &record("paris", 1.0, start())).await.unwrap();
        let first: Vec<_> = store.scan("weather", &PartitionFilter::all()).collect().await;

        store
            .put("weather", &record("paris", 2.0, start() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let second: Vec<_> = store.scan("weather", &PartitionFilter::all()).collect().await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_local_filesystem_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Local,
            root: Some(dir.path().join("archive")),
            ..StoreConfig::default()
        };
        let clock = Arc::new(ManualClock::new(start()));
        let store = PartitionedStore::from_config(&config, clock).unwrap();

        let original = record("paris", 14.0, start());
        store.put("weather", &original).await.unwrap();
        store.put("weather", &original).await.unwrap();

        assert!(dir
            .path()
            .join("archive/raw/weather/current/dt=2024-01-15/location=paris/10-00-00.json")
            .exists());
        let found: Vec<_> = store.scan("weather", &PartitionFilter::all()).collect().await;
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.record.payload == original.payload));
    }
}
