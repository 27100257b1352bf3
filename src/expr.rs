//! Structured-expression vocabulary emitted by the builders
//!
//! These types are the compiled form of a query: physical columns, function
//! expressions, boolean conditions, ordering, and the final
//! [`StructuredQuery`] handed to the execution adapter. The builders only
//! construct and validate this representation; executing it is the storage
//! engine's job.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Expressions
// ============================================================================

/// A physical column reference
///
/// The name is the storage-level identifier: a direct column (`email`), a
/// string tag slot (`tags[foo]`) or an interned tag slot (`tags[9]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Physical column name
    pub name: String,
}

impl Column {
    /// Create a column reference
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A function expression with positional arguments and an output alias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExpr {
    /// Physical function name (e.g. `countIf`, `quantilesMergeIf(0.95)`)
    pub name: String,
    /// Ordered arguments
    pub args: Vec<Expr>,
    /// Output alias, when the expression is projected
    pub alias: Option<String>,
}

impl FunctionExpr {
    /// Create a function expression without an alias
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
            alias: None,
        }
    }

    /// Create a function expression with an output alias
    pub fn aliased(name: impl Into<String>, args: Vec<Expr>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args,
            alias: Some(alias.into()),
        }
    }
}

/// Any expression that can appear in a select list, condition, or group-by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Bare column reference
    Column(Column),
    /// Column projected under a different name
    Aliased {
        /// Underlying column
        column: Column,
        /// Human-facing alias
        alias: String,
    },
    /// Function call
    Function(FunctionExpr),
    /// Scalar literal argument
    Literal(Value),
    /// Literal list argument (e.g. a transform lookup table)
    List(Vec<Value>),
}

impl Expr {
    /// Column reference shorthand
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(Column::new(name))
    }

    /// The output alias of this expression, if it carries one
    pub fn alias(&self) -> Option<&str> {
        match self {
            Expr::Aliased { alias, .. } => Some(alias),
            Expr::Function(f) => f.alias.as_deref(),
            _ => None,
        }
    }

    /// The name this expression is addressable by in results: its alias if
    /// present, otherwise the column name
    pub fn output_name(&self) -> Option<&str> {
        match self {
            Expr::Column(c) => Some(&c.name),
            Expr::Aliased { alias, .. } => Some(alias),
            Expr::Function(f) => f.alias.as_deref(),
            _ => None,
        }
    }
}

impl From<Column> for Expr {
    fn from(c: Column) -> Self {
        Expr::Column(c)
    }
}

impl From<FunctionExpr> for Expr {
    fn from(f: FunctionExpr) -> Self {
        Expr::Function(f)
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Comparison operators usable in conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Equal
    Eq,
    /// Not equal
    Neq,
    /// Member of a value list
    In,
    /// Not a member of a value list
    NotIn,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Column is null
    IsNull,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Eq => "=",
            Op::Neq => "!=",
            Op::In => "IN",
            Op::NotIn => "NOT IN",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::IsNull => "IS NULL",
        };
        write!(f, "{}", s)
    }
}

/// Right-hand side of a leaf condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Single scalar
    Scalar(Value),
    /// Value list, for `In`/`NotIn`
    List(Vec<Value>),
    /// No operand (`IsNull`)
    None,
}

/// A leaf condition: `lhs op operand`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Left-hand expression (column or aggregate)
    pub lhs: Expr,
    /// Comparison operator
    pub op: Op,
    /// Right-hand operand
    pub rhs: Operand,
}

impl Condition {
    /// `column op scalar`
    pub fn new(lhs: impl Into<Expr>, op: Op, rhs: impl Into<Value>) -> Self {
        Self {
            lhs: lhs.into(),
            op,
            rhs: Operand::Scalar(rhs.into()),
        }
    }

    /// `column IN (values...)` (or `NOT IN`)
    pub fn with_list(lhs: impl Into<Expr>, op: Op, values: Vec<Value>) -> Self {
        Self {
            lhs: lhs.into(),
            op,
            rhs: Operand::List(values),
        }
    }

    /// `column IS NULL`
    pub fn is_null(lhs: impl Into<Expr>) -> Self {
        Self {
            lhs: lhs.into(),
            op: Op::IsNull,
            rhs: Operand::None,
        }
    }
}

/// A node in the boolean condition tree
///
/// A `where` clause is a list of these, combined with implicit AND. `Or` is
/// the only explicit combinator; it exists as a tagged variant because
/// downstream consumers pattern-match on condition shape (the null-safe
/// environment alternation relies on this).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cond {
    /// Single leaf condition
    Leaf(Condition),
    /// Explicit alternation over nested conditions
    Or(Vec<Cond>),
}

impl From<Condition> for Cond {
    fn from(c: Condition) -> Self {
        Cond::Leaf(c)
    }
}

// ============================================================================
// Ordering and limits
// ============================================================================

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// One entry in the order-by list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Expression to sort by
    pub expr: Expr,
    /// Sort direction
    pub direction: Direction,
}

impl OrderBy {
    /// Create an order-by entry
    pub fn new(expr: impl Into<Expr>, direction: Direction) -> Self {
        Self {
            expr: expr.into(),
            direction,
        }
    }
}

/// Per-distinct-key row cap, orthogonal to the overall limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitBy {
    /// Column whose distinct values are capped
    pub column: Column,
    /// Maximum rows per distinct value
    pub count: u64,
}

// ============================================================================
// Structured query
// ============================================================================

/// A validated, executable query against one storage entity
///
/// Built once per logical request, immutable after validation, handed to the
/// execution adapter and discarded. The metrics time-series variant produces
/// one of these per storage entity, sharing filters and group-by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    /// Storage entity/table to read (`events`, `metrics_distributions`, ...)
    pub entity: String,
    /// Projected expressions
    pub select: Vec<Expr>,
    /// Pre-aggregation conditions (implicit AND)
    pub where_clause: Vec<Cond>,
    /// Grouping expressions
    pub groupby: Vec<Expr>,
    /// Post-aggregation conditions (implicit AND)
    pub having: Vec<Cond>,
    /// Ordering
    pub orderby: Vec<OrderBy>,
    /// Row limit
    pub limit: Option<u64>,
    /// Per-key row cap
    pub limitby: Option<LimitBy>,
    /// Sampling fraction in `(0, 1]`
    pub sample_rate: Option<f64>,
    /// Fast-path execution flag (best-effort sampled execution)
    pub turbo: bool,
    /// Explicit array-join clause
    pub array_join: Option<Column>,
    /// Time-bucket width in seconds, for time-bucketed queries
    pub granularity: Option<u64>,
}

impl StructuredQuery {
    /// Create an empty query against an entity
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            select: Vec::new(),
            where_clause: Vec::new(),
            groupby: Vec::new(),
            having: Vec::new(),
            orderby: Vec::new(),
            limit: None,
            limitby: None,
            sample_rate: None,
            turbo: false,
            array_join: None,
            granularity: None,
        }
    }
}
