//! Builder limits and retention configuration
//!
//! Loaded from TOML or built in code; every field has a default so an empty
//! table deserializes to a working configuration.

use serde::{Deserialize, Serialize};

/// Limits applied during query assembly
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuilderConfig {
    /// Maximum age of queryable data in days
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Row limit applied when the caller does not provide one (metrics backend)
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Ceiling for caller-provided row limits (metrics backend)
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,

    /// Maximum number of selected columns/functions in one query
    #[serde(default = "default_max_columns")]
    pub max_columns: usize,
}

fn default_retention_days() -> i64 {
    90
}
fn default_limit() -> u64 {
    50
}
fn default_max_limit() -> u64 {
    5_000
}
fn default_max_columns() -> usize {
    100
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_columns: default_max_columns(),
        }
    }
}
