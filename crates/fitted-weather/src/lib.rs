//! Weather fetching for Fitted
//!
//! Serves weather records through an in-process cache (L1) backed by a
//! date/location partitioned object store (L2), calling the provider only
//! when neither has a fresh copy.

pub mod cache;
pub mod clock;
pub mod partition;
pub mod provider;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;

pub use cache::MemoryCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use partition::{PartitionKind, PartitionPath};
pub use provider::{UpstreamClient, WeatherSource};
pub use retry::RetryConfig;
pub use service::{FetchOrchestrator, FetchStatsSnapshot};
pub use store::{
    DateFilter, ObjectRef, Partition, PartitionFilter, PartitionedStore, RecordStore,
    StoredRecord,
};
pub use types::*;
