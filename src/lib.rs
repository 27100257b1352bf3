//! Query compilation for a columnar, time-partitioned event store
//!
//! This crate turns request parameters, selected columns and parsed search
//! terms into validated, executable queries. Two backends are supported: the
//! raw event store, and a pre-aggregated metrics store whose strings are
//! interned and whose metrics live in per-type storage entities.
//!
//! # Example
//!
//! ```no_run
//! use chrono::{Duration, Utc};
//! use sift::{BuilderConfig, EventsQueryBuilder, FilterTerm, Project, QueryParams};
//!
//! # fn main() -> sift::Result<()> {
//! let end = Utc::now();
//! let params = QueryParams::new(
//!     Some(1),
//!     vec![Project::new(1, "backend")],
//!     end - Duration::hours(24),
//!     end,
//! )?;
//!
//! let query = EventsQueryBuilder::new(&params, BuilderConfig::default())?
//!     .select(["transaction", "count()"])
//!     .terms([FilterTerm::eq("environment", "prod").into()])
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod builder;
pub mod conditions;
pub mod config;
pub mod entity;
pub mod error;
pub mod expr;
pub mod fields;
pub mod filter;
pub mod functions;
pub mod granularity;
pub mod indexer;
pub mod params;
pub mod router;
pub mod value;

pub use adapter::{ExecutionAdapter, MockAdapter, QueryResult, ResultMeta, ResultRow};
pub use builder::{
    EventsQueryBuilder, MetricsQueryBuilder, QueryOptions, TimeseriesMetricsQueryBuilder,
};
pub use config::BuilderConfig;
pub use entity::{MetricEntity, MetricTable};
pub use error::{Error, Result};
pub use expr::{Cond, Condition, Direction, Expr, Op, OrderBy, StructuredQuery};
pub use fields::{Dataset, FieldResolver};
pub use filter::{AggregateFilter, AggregateTerm, FilterTerm, SearchOp, SearchTerm};
pub use functions::{FunctionResolver, ResolvedFunction};
pub use indexer::{CachedIndexer, MemoryIndexer, StringIndexer};
pub use params::{Project, QueryParams};
pub use value::{Value, ValueType};
