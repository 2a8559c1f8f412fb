#![doc = include_str!("../README.md")]
// Declare modules
pub mod bitset;
pub mod core;
pub mod dictionary;
pub mod error;
pub mod filter;
pub mod guard;
pub mod query;
pub mod record;
pub mod schema;
pub mod store;
pub mod table;
pub mod telemetry;
pub mod time;
pub mod types;
pub mod upsert;

/// Configuration options for the database core.
pub use crate::core::DbConfig;
/// Main entry point: table catalog plus the shared dictionary registry.
pub use crate::core::DbCore;
/// Error type for database operations.
pub use crate::error::DbError;
/// Filter tree accepted by queries.
pub use crate::filter::{CompositeOp, Filter, RelOp};
/// Group-by query and its rendered result.
pub use crate::query::{AggregateQuery, QueryResult, QueryStats};
/// Deserializable table configuration.
pub use crate::schema::{DimensionConfig, MetricConfig, TableConfig};
/// A single table and the outcome of loading a batch into it.
pub use crate::table::{LoadReport, Table};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener};
/// Per-batch ingestion counters.
pub use crate::upsert::UpsertStats;
