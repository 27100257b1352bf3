//! Typed filter terms consumed by the condition builder
//!
//! The raw search-string lexer lives outside this crate; it produces these
//! typed terms. Field terms compare a field or tag against literal values,
//! aggregate terms compare a function result against a literal and end up in
//! the `having` clause.

use crate::value::Value;

/// Comparison operator of a parsed search term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    /// `key:value`
    Eq,
    /// `!key:value`
    Neq,
    /// `key:[a, b]`
    In,
    /// `!key:[a, b]`
    NotIn,
    /// `key:>value`
    Gt,
    /// `key:>=value`
    Gte,
    /// `key:<value`
    Lt,
    /// `key:<=value`
    Lte,
}

/// A filter on a field or tag
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    /// Field or tag name as written by the user
    pub key: String,
    /// Comparison operator
    pub op: SearchOp,
    /// One or more literal values (several only for `In`/`NotIn`)
    pub values: Vec<String>,
}

impl FilterTerm {
    /// `key:value`
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: SearchOp::Eq,
            values: vec![value.into()],
        }
    }

    /// `!key:value`
    pub fn neq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: SearchOp::Neq,
            values: vec![value.into()],
        }
    }

    /// `key:[a, b, ...]`
    pub fn is_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            op: SearchOp::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// A filter on an aggregate function result, e.g. `count_unique(user):>10`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFilter {
    /// Raw function call text, e.g. `count_unique(user)`
    pub function: String,
    /// Comparison operator
    pub op: SearchOp,
    /// Literal to compare against
    pub value: Value,
}

impl AggregateFilter {
    /// Create an aggregate filter
    pub fn new(function: impl Into<String>, op: SearchOp, value: impl Into<Value>) -> Self {
        Self {
            function: function.into(),
            op,
            value: value.into(),
        }
    }
}

/// An aggregate filter term, possibly an alternation the parser generated
/// from an explicit boolean search (`f():>10 OR f():<5`)
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateTerm {
    /// Single comparison
    Leaf(AggregateFilter),
    /// Alternation over comparisons
    Or(Vec<AggregateFilter>),
}

/// One parsed search term
#[derive(Debug, Clone, PartialEq)]
pub enum SearchTerm {
    /// Field/tag filter
    Filter(FilterTerm),
    /// Aggregate (post-aggregation) filter
    Aggregate(AggregateTerm),
}

impl From<FilterTerm> for SearchTerm {
    fn from(t: FilterTerm) -> Self {
        SearchTerm::Filter(t)
    }
}

impl From<AggregateFilter> for SearchTerm {
    fn from(t: AggregateFilter) -> Self {
        SearchTerm::Aggregate(AggregateTerm::Leaf(t))
    }
}
