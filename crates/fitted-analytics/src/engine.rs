//! Query engine over the partitioned weather archive.

use std::sync::Arc;

use fitted_core::{Config, QueryError};
use fitted_weather::partition::DATE_COLUMN;
use fitted_weather::PartitionedStore;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::exec::Executor;
use crate::plan;

/// How much of the archive a query touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryMetadata {
    pub partitions_scanned: usize,
    pub objects_scanned: usize,
    /// No `dt` predicate narrowed the scan
    pub full_scan: bool,
    pub warnings: Vec<String>,
}

/// Tabular query result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub metadata: QueryMetadata,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)
    }
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: Arc<PartitionedStore>,
    subject: String,
    table: String,
}

impl QueryEngine {
    pub fn new(
        store: Arc<PartitionedStore>,
        subject: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            store,
            subject: subject.into(),
            table: table.into(),
        }
    }

    pub fn from_config(config: &Config, store: Arc<PartitionedStore>) -> Self {
        Self::new(store, &config.store.subject, &config.analytics.table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Run one `SELECT` against the archive.
    ///
    /// Only partitions that can satisfy the `dt`/`location` predicates are
    /// listed and read. Store failures degrade to fewer rows plus a warning.
    ///
    /// # Errors
    ///
    /// `QueryError::Rejected` when the SQL cannot be parsed, references an
    /// unknown table or column, or uses an unsupported construct.
    #[instrument(skip(self), level = "info")]
    pub async fn query(&self, sql: &str) -> Result<Rows, QueryError> {
        let plan = plan::plan(sql, &self.table)?;

        let mut metadata = QueryMetadata {
            full_scan: plan.full_scan(),
            ..QueryMetadata::default()
        };
        if metadata.full_scan {
            tracing::warn!("Query has no {} predicate, scanning the full archive", DATE_COLUMN);
            metadata
                .warnings
                .push(format!("no usable {DATE_COLUMN} predicate: scanned the full archive"));
        }

        let partitions = match self
            .store
            .partitions(&self.subject, &plan.partition_filter)
            .await
        {
            Ok(partitions) => partitions,
            Err(e) => {
                tracing::warn!(error = %e, "Partition listing failed");
                metadata.warnings.push(format!("archive listing failed: {e}"));
                Vec::new()
            }
        };

        let mut executor = Executor::new(&plan);
        for partition in &partitions {
            if executor.is_saturated() {
                break;
            }
            metadata.partitions_scanned += 1;

            let mut records = self.store.scan_partition(partition);
            while let Some(stored) = records.next().await {
                metadata.objects_scanned += 1;
                executor.push(stored);
                if executor.is_saturated() {
                    break;
                }
            }
        }

        let rows = executor.finish();
        tracing::info!(
            partitions = metadata.partitions_scanned,
            objects = metadata.objects_scanned,
            rows = rows.len(),
            "Query complete"
        );

        Ok(Rows {
            columns: plan.columns(),
            rows,
            metadata,
        })
    }
}
