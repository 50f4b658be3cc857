//! In-process (L1) record cache.
//!
//! Advisory only: each process has its own copy and nothing relies on it
//! for consistency. Expired entries are dropped lazily on lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::{age, Clock};
use crate::types::{CacheKey, Record};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Record,
    pub inserted_at: DateTime<Utc>,
}

/// Outcome of an L1 lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Record),
    /// Past its TTL. Already evicted, but still usable as a stale fallback.
    Expired(CacheEntry),
    Miss,
}

#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return Lookup::Miss;
        };
        if age(now, entry.inserted_at) < self.ttl {
            return Lookup::Fresh(entry.record.clone());
        }
        entries.remove(key).map_or(Lookup::Miss, Lookup::Expired)
    }

    /// Insert or replace the entry for the record's key, stamped with the current time.
    pub fn insert(&self, record: Record) {
        self.insert_at(record, self.clock.now());
    }

    /// Insert with an explicit timestamp. Records loaded from the archive
    /// pass their `fetched_at` so L1 never outlives their real age.
    pub fn insert_at(&self, record: Record, inserted_at: DateTime<Utc>) {
        let entry = CacheEntry {
            inserted_at: inserted_at.min(self.clock.now()),
            record,
        };
        self.entries.lock().insert(entry.record.cache_key(), entry);
    }

    /// Drop one `(key, horizon)` entry. Returns whether it was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop every horizon cached for a location key.
    pub fn invalidate_location(&self, key: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| k.key != key);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::clock::ManualClock;
    use crate::types::fixtures::payload;
    use chrono::TimeZone;

    fn setup() -> (Arc<ManualClock>, MemoryCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        ));
        let cache = MemoryCache::new(Duration::from_secs(900), clock.clone());
        (clock, cache)
    }

    fn record(key: &str, days: Option<u8>, clock: &ManualClock) -> Record {
        Record::new(key, days, clock.now(), payload(key, 14.0)).unwrap()
    }

    #[test]
    fn test_fresh_within_ttl() {
        let (clock, cache) = setup();
        cache.insert(record("paris", None, &clock));
        clock.advance(Duration::from_secs(899));

        assert!(matches!(
            cache.lookup(&CacheKey::new("paris", None)),
            Lookup::Fresh(_)
        ));
    }

    #[test]
    fn test_expired_at_ttl_and_evicted() {
        let (clock, cache) = setup();
        cache.insert(record("paris", None, &clock));
        clock.advance(Duration::from_secs(900));

        let key = CacheKey::new("paris", None);
        match cache.lookup(&key) {
            Lookup::Expired(entry) => assert_eq!(entry.record.key, "paris"),
            other => panic!("expected expired entry, got {other:?}"),
        }
        assert!(cache.is_empty());
        assert!(matches!(cache.lookup(&key), Lookup::Miss));
    }

    #[test]
    fn test_insert_at_keeps_original_age() {
        let (clock, cache) = setup();
        let archived = record("paris", None, &clock);
        clock.advance(Duration::from_secs(14 * 60));
        cache.insert_at(archived.clone(), archived.fetched_at);

        let key = CacheKey::new("paris", None);
        assert!(matches!(cache.lookup(&key), Lookup::Fresh(_)));

        clock.advance(Duration::from_secs(60));
        assert!(matches!(cache.lookup(&key), Lookup::Expired(_)));
    }

    #[test]
    fn test_horizon_is_part_of_key() {
        let (clock, cache) = setup();
        cache.insert(record("paris", Some(3), &clock));

        assert!(matches!(
            cache.lookup(&CacheKey::new("paris", None)),
            Lookup::Miss
        ));
        assert!(matches!(
            cache.lookup(&CacheKey::new("paris", Some(3))),
            Lookup::Fresh(_)
        ));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (clock, cache) = setup();
        cache.insert(record("paris", None, &clock));
        cache.insert(record("paris", Some(3), &clock));
        cache.insert(record("london", None, &clock));

        assert!(cache.invalidate(&CacheKey::new("london", None)));
        assert!(!cache.invalidate(&CacheKey::new("london", None)));
        assert_eq!(cache.invalidate_location("paris"), 2);
        assert!(cache.is_empty());

        cache.insert(record("rome", None, &clock));
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
