//! Physical storage entities of the tag-indexed metrics backend
//!
//! Pre-aggregated metric values live in one of several physically distinct
//! storage families. Every resolved aggregate is tagged with exactly one
//! entity; aggregates from different entities must be issued as separate
//! sub-queries and merged (see [`crate::router`]).

use std::collections::HashMap;
use std::fmt;

/// A physical storage family for pre-aggregated metric values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEntity {
    /// Distribution-of-values family (percentiles, averages)
    Distributions,
    /// Unique-set family (distinct counts)
    Sets,
    /// Monotonic-counter family (sums of counter metrics)
    Counters,
}

impl MetricEntity {
    /// Storage table this entity is read from
    pub fn table_name(&self) -> &'static str {
        match self {
            MetricEntity::Distributions => "metrics_distributions",
            MetricEntity::Sets => "metrics_sets",
            MetricEntity::Counters => "metrics_counters",
        }
    }
}

impl fmt::Display for MetricEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_name())
    }
}

/// Immutable metric-name → storage-entity table
///
/// Injected into the resolvers rather than read from ambient global state.
/// The built-in table covers the standard transaction and session metrics;
/// deployments with custom metrics construct their own.
#[derive(Debug, Clone)]
pub struct MetricTable {
    entries: HashMap<String, MetricEntity>,
}

impl MetricTable {
    /// Build a table from explicit entries
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, MetricEntity)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, entity)| (name.into(), entity))
                .collect(),
        }
    }

    /// The storage entity a metric is written to, if the metric is known
    pub fn entity_of(&self, metric: &str) -> Option<MetricEntity> {
        self.entries.get(metric).copied()
    }

    /// Whether a metric name is known to the table
    pub fn contains(&self, metric: &str) -> bool {
        self.entries.contains_key(metric)
    }

    /// All known metric names
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }
}

impl Default for MetricTable {
    fn default() -> Self {
        use MetricEntity::*;
        Self::new([
            ("transaction.duration", Distributions),
            ("measurements.lcp", Distributions),
            ("measurements.fcp", Distributions),
            ("measurements.fid", Distributions),
            ("measurements.cls", Distributions),
            ("measurements.fp", Distributions),
            ("user", Sets),
            ("session", Counters),
            ("session.duration", Distributions),
            ("session.error", Sets),
        ])
    }
}
