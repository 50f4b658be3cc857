//! SQL analytics over the Fitted weather archive
//!
//! Queries run directly against the partitioned object store. Partition
//! columns are projected from object paths, so `dt` and `location`
//! predicates prune what is listed and read.

pub mod catalog;
pub mod engine;
mod exec;
pub mod expr;
pub mod plan;
mod prune;
pub mod value;

pub use catalog::{ColumnType, Field};
pub use engine::{QueryEngine, QueryMetadata, Rows};
pub use plan::{plan, QueryPlan};
pub use value::Scalar;
