//! Execution seam between compiled queries and the storage engine
//!
//! The builders compile to [`StructuredQuery`](crate::expr::StructuredQuery)
//! and hand it to an [`ExecutionAdapter`]; everything behind that trait
//! (transport, serialization, the engine itself) is out of scope here. The
//! in-crate implementation is a test double.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::expr::StructuredQuery;
use crate::value::{Value, ValueType};

/// One result row: output alias to value
pub type ResultRow = HashMap<String, Value>;

/// Column metadata of a result set, in select-list order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultMeta {
    /// `(alias, declared type)` per output column
    pub columns: Vec<(String, ValueType)>,
}

impl ResultMeta {
    /// Metadata from `(alias, type)` pairs
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, ValueType)>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(alias, vt)| (alias.into(), vt))
                .collect(),
        }
    }

    /// Whether an output column with this alias is declared
    pub fn contains(&self, alias: &str) -> bool {
        self.columns.iter().any(|(a, _)| a == alias)
    }
}

/// Rows plus column metadata returned by one execution
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Result rows keyed by output alias
    pub rows: Vec<ResultRow>,
    /// Column metadata
    pub meta: ResultMeta,
}

/// Executes compiled queries against a storage engine
///
/// `referrer` labels the request for the engine's accounting; it never
/// affects results.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Execute one compiled query
    async fn execute(&self, query: &StructuredQuery, referrer: &str) -> Result<QueryResult>;
}

// ============================================================================
// Test double
// ============================================================================

/// Canned-response adapter for tests
///
/// Responses are keyed by entity name and handed out in registration order;
/// an entity with no remaining responses is an execution error.
#[derive(Default)]
pub struct MockAdapter {
    responses: parking_lot::Mutex<HashMap<String, Vec<QueryResult>>>,
    executed: parking_lot::Mutex<Vec<StructuredQuery>>,
}

impl MockAdapter {
    /// Create an adapter with no canned responses
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for queries against an entity
    pub fn respond(&self, entity: impl Into<String>, result: QueryResult) {
        self.responses
            .lock()
            .entry(entity.into())
            .or_default()
            .push(result);
    }

    /// Queries executed so far, in execution order
    pub fn executed(&self) -> Vec<StructuredQuery> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl ExecutionAdapter for MockAdapter {
    async fn execute(&self, query: &StructuredQuery, _referrer: &str) -> Result<QueryResult> {
        self.executed.lock().push(query.clone());
        let mut responses = self.responses.lock();
        let queue = responses
            .get_mut(&query.entity)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                Error::Execution(format!("no canned response for entity {}", query.entity))
            })?;
        Ok(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_hands_out_responses_in_order() {
        let adapter = MockAdapter::new();
        let mut first = QueryResult::default();
        first.meta = ResultMeta::new([("count", ValueType::UInt64)]);
        adapter.respond("events", first.clone());
        adapter.respond("events", QueryResult::default());

        let query = StructuredQuery::new("events");
        let got = adapter.execute(&query, "test").await.unwrap();
        assert_eq!(got.meta, first.meta);
        let got = adapter.execute(&query, "test").await.unwrap();
        assert_eq!(got.meta, ResultMeta::default());

        assert!(adapter.execute(&query, "test").await.is_err());
        assert_eq!(adapter.executed().len(), 3);
    }
}
