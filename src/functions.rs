//! Function resolution: `name(args)` syntax to structured aggregates
//!
//! A static registry maps each function name to a typed definition (arity,
//! privacy, behavior); resolution is a table lookup followed by per-kind
//! argument validation. Private functions are rejected unless the request's
//! allow-list names them. Aliases are derived deterministically from the call
//! text so repeated resolution of identical input yields identical aliases.

use std::collections::HashMap;

use lazy_static::lazy_static;
use tracing::debug;

use crate::entity::{MetricEntity, MetricTable};
use crate::error::{Error, Result};
use crate::expr::{Column, Expr, FunctionExpr};
use crate::fields::{Dataset, FieldResolver};
use crate::indexer::StringIndexer;
use crate::params::QueryParams;
use crate::value::{Value, ValueType};

/// Metric every zero-argument transaction aggregate implicitly reads
const DEFAULT_METRIC: &str = "transaction.duration";

/// Transaction statuses counted as successful by `failure_count`
const NON_FAILURE_STATUSES: &[&str] = &["ok", "cancelled", "unknown"];

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Count,
    CountUnique,
    CountIf,
    Percentile(f64),
    Avg,
    Sum,
    Max,
    Min,
    /// Events-per-interval rate; divisor is the interval in this many seconds
    Rate(u64),
    FailureCount,
    FailureRate,
    ArrayJoin,
    /// Array combinator over a base aggregate
    SumArray,
}

struct FunctionDef {
    kind: FunctionKind,
    private: bool,
    min_args: usize,
    max_args: usize,
}

impl FunctionDef {
    const fn new(kind: FunctionKind, min_args: usize, max_args: usize) -> Self {
        Self {
            kind,
            private: false,
            min_args,
            max_args,
        }
    }

    const fn private(kind: FunctionKind, min_args: usize, max_args: usize) -> Self {
        Self {
            kind,
            private: true,
            min_args,
            max_args,
        }
    }
}

lazy_static! {
    static ref FUNCTIONS: HashMap<&'static str, FunctionDef> = {
        use FunctionKind::*;
        let mut m = HashMap::new();
        m.insert("count", FunctionDef::new(Count, 0, 0));
        m.insert("count_unique", FunctionDef::new(CountUnique, 1, 1));
        m.insert("count_if", FunctionDef::new(CountIf, 3, 3));
        m.insert("p50", FunctionDef::new(Percentile(0.5), 0, 1));
        m.insert("p75", FunctionDef::new(Percentile(0.75), 0, 1));
        m.insert("p90", FunctionDef::new(Percentile(0.9), 0, 1));
        m.insert("p95", FunctionDef::new(Percentile(0.95), 0, 1));
        m.insert("p99", FunctionDef::new(Percentile(0.99), 0, 1));
        m.insert("avg", FunctionDef::new(Avg, 1, 1));
        m.insert("sum", FunctionDef::new(Sum, 1, 1));
        m.insert("max", FunctionDef::new(Max, 1, 1));
        m.insert("min", FunctionDef::new(Min, 1, 1));
        m.insert("eps", FunctionDef::new(Rate(1), 0, 0));
        m.insert("epm", FunctionDef::new(Rate(60), 0, 0));
        m.insert("tps", FunctionDef::new(Rate(1), 0, 0));
        m.insert("tpm", FunctionDef::new(Rate(60), 0, 0));
        m.insert("failure_count", FunctionDef::new(FailureCount, 0, 0));
        m.insert("failure_rate", FunctionDef::new(FailureRate, 0, 0));
        m.insert("array_join", FunctionDef::private(ArrayJoin, 1, 1));
        m.insert("sum_array", FunctionDef::private(SumArray, 1, 1));
        m
    };
}

// ============================================================================
// Call parsing and alias derivation
// ============================================================================

/// A raw positional argument from call text
#[derive(Debug, Clone, PartialEq)]
struct RawArg {
    /// Argument text with surrounding quotes stripped
    value: String,
    /// Whether the argument was double-quoted in the call text
    quoted: bool,
}

/// Whether a selected-column string is function-call syntax
pub fn is_function_call(text: &str) -> bool {
    text.contains('(') && text.ends_with(')')
}

fn parse_call(text: &str) -> Result<(String, Vec<RawArg>)> {
    let open = text
        .find('(')
        .filter(|_| text.ends_with(')'))
        .ok_or_else(|| Error::UnknownFunction(text.to_string()))?;
    let name = text[..open].trim().to_string();
    let inner = &text[open + 1..text.len() - 1];

    let mut args = Vec::new();
    if !inner.trim().is_empty() {
        // Commas inside a double-quoted literal do not separate arguments
        let mut pieces = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        for c in inner.chars() {
            match c {
                '"' => {
                    in_quotes = !in_quotes;
                    current.push(c);
                }
                ',' if !in_quotes => pieces.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        pieces.push(current);

        for piece in pieces {
            let piece = piece.trim();
            let quoted = piece.len() >= 2 && piece.starts_with('"') && piece.ends_with('"');
            let value = if quoted {
                piece[1..piece.len() - 1].to_string()
            } else {
                piece.to_string()
            };
            args.push(RawArg { value, quoted });
        }
    }
    Ok((name, args))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Derive the deterministic output alias for a call
///
/// `name_arg1_arg2...` with non-alphanumerics replaced; a quoted literal
/// contributes one extra separator, so `f(x)` and `f("x")` never collide.
fn derive_alias(name: &str, args: &[RawArg]) -> String {
    let mut alias = sanitize(name);
    for arg in args {
        alias.push('_');
        if arg.quoted {
            alias.push('_');
        }
        alias.push_str(&sanitize(&arg.value));
    }
    alias
}

// ============================================================================
// Resolved aggregates
// ============================================================================

/// A fully resolved aggregate/transform expression
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFunction {
    /// The physical expression, alias included
    pub expr: Expr,
    /// Output alias (unique within one query's select list)
    pub alias: String,
    /// Declared output type
    pub value_type: ValueType,
    /// Storage entity this aggregate reads (metrics backend only)
    pub entity: Option<MetricEntity>,
    /// Metric ids the expression references (metrics backend only)
    pub metric_ids: Vec<u64>,
    /// Whether the expression must also join the group-by list
    pub requires_groupby: bool,
}

/// Resolves function-call syntax for one build
pub struct FunctionResolver<'a> {
    fields: &'a FieldResolver<'a>,
    params: &'a QueryParams,
    metric_table: Option<&'a MetricTable>,
    indexer: Option<&'a dyn StringIndexer>,
    acl: &'a [String],
}

impl<'a> FunctionResolver<'a> {
    /// Create a resolver for the events dataset
    pub fn events(
        fields: &'a FieldResolver<'a>,
        params: &'a QueryParams,
        acl: &'a [String],
    ) -> Self {
        Self {
            fields,
            params,
            metric_table: None,
            indexer: None,
            acl,
        }
    }

    /// Create a resolver for the tag-indexed metrics dataset
    pub fn metrics(
        fields: &'a FieldResolver<'a>,
        params: &'a QueryParams,
        metric_table: &'a MetricTable,
        indexer: &'a dyn StringIndexer,
        acl: &'a [String],
    ) -> Self {
        Self {
            fields,
            params,
            metric_table: Some(metric_table),
            indexer: Some(indexer),
            acl,
        }
    }

    /// Resolve one function-call string
    pub fn resolve(&self, call: &str) -> Result<ResolvedFunction> {
        let (name, args) = parse_call(call)?;
        let def = FUNCTIONS
            .get(name.as_str())
            .ok_or_else(|| Error::UnknownFunction(name.clone()))?;

        if def.private && !self.acl.iter().any(|allowed| allowed == &name) {
            return Err(Error::invalid(format!(
                "{}: no access to private function",
                name
            )));
        }
        if args.len() < def.min_args || args.len() > def.max_args {
            return Err(Error::invalid(format!(
                "{} expects between {} and {} arguments, got {}",
                name,
                def.min_args,
                def.max_args,
                args.len()
            )));
        }

        let alias = derive_alias(&name, &args);
        debug!(function = %name, alias = %alias, "resolving function");
        match self.fields.dataset() {
            Dataset::Events => self.resolve_events(def.kind, &args, alias),
            Dataset::Metrics => self.resolve_metrics(def.kind, &name, &args, alias),
        }
    }

    // ------------------------------------------------------------------
    // Events dataset
    // ------------------------------------------------------------------

    fn resolve_events(
        &self,
        kind: FunctionKind,
        args: &[RawArg],
        alias: String,
    ) -> Result<ResolvedFunction> {
        let done = |expr: Expr, value_type, requires_groupby| ResolvedFunction {
            expr,
            alias: alias.clone(),
            value_type,
            entity: None,
            metric_ids: Vec::new(),
            requires_groupby,
        };

        match kind {
            FunctionKind::Count => Ok(done(
                FunctionExpr::aliased("count", vec![], &alias).into(),
                ValueType::UInt64,
                false,
            )),
            FunctionKind::CountUnique => {
                let column = self.fields.resolve(&args[0].value)?;
                Ok(done(
                    FunctionExpr::aliased("uniq", vec![strip_alias(column.expr)], &alias).into(),
                    ValueType::UInt64,
                    false,
                ))
            }
            FunctionKind::CountIf => {
                let condition = self.count_if_condition(args)?;
                Ok(done(
                    FunctionExpr::aliased("countIf", vec![condition], &alias).into(),
                    ValueType::UInt64,
                    false,
                ))
            }
            FunctionKind::Percentile(q) => {
                let field = args
                    .first()
                    .map(|a| a.value.as_str())
                    .unwrap_or(DEFAULT_METRIC);
                let column = self.fields.resolve(field)?;
                Ok(done(
                    FunctionExpr::aliased(
                        format!("quantile({})", q),
                        vec![strip_alias(column.expr)],
                        &alias,
                    )
                    .into(),
                    ValueType::Float64,
                    false,
                ))
            }
            FunctionKind::Avg | FunctionKind::Sum | FunctionKind::Max | FunctionKind::Min => {
                let physical = match kind {
                    FunctionKind::Avg => "avg",
                    FunctionKind::Sum => "sum",
                    FunctionKind::Max => "max",
                    _ => "min",
                };
                let column = self.fields.resolve(&args[0].value)?;
                Ok(done(
                    FunctionExpr::aliased(physical, vec![strip_alias(column.expr)], &alias).into(),
                    ValueType::Float64,
                    false,
                ))
            }
            FunctionKind::Rate(per) => Ok(done(
                self.rate_expr(FunctionExpr::new("count", vec![]).into(), per, &alias),
                ValueType::Float64,
                false,
            )),
            FunctionKind::FailureCount => Ok(done(
                FunctionExpr::aliased(
                    "countIf",
                    vec![self.events_failure_condition()],
                    &alias,
                )
                .into(),
                ValueType::UInt64,
                false,
            )),
            FunctionKind::FailureRate => Ok(done(
                FunctionExpr::aliased(
                    "divide",
                    vec![
                        FunctionExpr::new("countIf", vec![self.events_failure_condition()]).into(),
                        FunctionExpr::new("count", vec![]).into(),
                    ],
                    &alias,
                )
                .into(),
                ValueType::Float64,
                false,
            )),
            FunctionKind::ArrayJoin => {
                let column = self.fields.resolve_array(&args[0].value)?;
                Ok(done(
                    FunctionExpr::aliased("arrayJoin", vec![column.expr.clone()], &alias).into(),
                    column.value_type,
                    true,
                ))
            }
            FunctionKind::SumArray => {
                let column = self.fields.resolve_array(&args[0].value)?;
                Ok(done(
                    FunctionExpr::aliased(
                        "sum",
                        vec![FunctionExpr::new("arrayJoin", vec![column.expr]).into()],
                        &alias,
                    )
                    .into(),
                    ValueType::Float64,
                    false,
                ))
            }
        }
    }

    /// `op(resolved_column, literal)` for the `count_if` family
    fn count_if_condition(&self, args: &[RawArg]) -> Result<Expr> {
        let column = self.fields.resolve(&args[0].value)?;
        let op = args[1].value.as_str();
        if !matches!(
            op,
            "equals" | "notEquals" | "less" | "lessOrEquals" | "greater" | "greaterOrEquals"
        ) {
            return Err(Error::invalid(format!(
                "{} is not a valid condition operator",
                op
            )));
        }

        let literal = match column.value_type {
            ValueType::Float64 | ValueType::UInt64 | ValueType::Int64 => {
                let parsed: f64 = args[2].value.parse().map_err(|_| {
                    Error::invalid(format!("{} is not a valid number", args[2].value))
                })?;
                Value::Float(parsed)
            }
            _ => Value::Str(args[2].value.clone()),
        };

        Ok(FunctionExpr::new(
            op,
            vec![strip_alias(column.expr), Expr::Literal(literal)],
        )
        .into())
    }

    fn events_failure_condition(&self) -> Expr {
        FunctionExpr::new(
            "notIn",
            vec![
                Expr::column("transaction_status"),
                Expr::List(
                    NON_FAILURE_STATUSES
                        .iter()
                        .map(|s| Value::Str((*s).to_string()))
                        .collect(),
                ),
            ],
        )
        .into()
    }

    /// `divide(count_expr, interval / per)` for rate functions
    fn rate_expr(&self, count_expr: Expr, per: u64, alias: &str) -> Expr {
        let interval = (self.params.end - self.params.start).num_seconds() as f64;
        FunctionExpr::aliased(
            "divide",
            vec![count_expr, Expr::Literal(Value::Float(interval / per as f64))],
            alias,
        )
        .into()
    }

    // ------------------------------------------------------------------
    // Metrics dataset
    // ------------------------------------------------------------------

    fn resolve_metrics(
        &self,
        kind: FunctionKind,
        name: &str,
        args: &[RawArg],
        alias: String,
    ) -> Result<ResolvedFunction> {
        match kind {
            FunctionKind::Count => {
                let (metric_id, _) = self.metric(DEFAULT_METRIC)?;
                Ok(ResolvedFunction {
                    expr: FunctionExpr::aliased(
                        "countIf",
                        vec![Expr::column("value"), metric_match(&[metric_id])],
                        &alias,
                    )
                    .into(),
                    alias,
                    value_type: ValueType::UInt64,
                    entity: Some(MetricEntity::Distributions),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::CountUnique => {
                let (metric_id, entity) = self.metric(&args[0].value)?;
                if entity != MetricEntity::Sets {
                    return Err(Error::incompatible(format!(
                        "count_unique requires a set metric, {} is not one",
                        args[0].value
                    )));
                }
                Ok(ResolvedFunction {
                    expr: FunctionExpr::aliased(
                        "uniqIf",
                        vec![Expr::column("value"), metric_match(&[metric_id])],
                        &alias,
                    )
                    .into(),
                    alias,
                    value_type: ValueType::UInt64,
                    entity: Some(entity),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::Percentile(q) => {
                let field = args
                    .first()
                    .map(|a| a.value.as_str())
                    .unwrap_or(DEFAULT_METRIC);
                let (metric_id, entity) = self.metric(field)?;
                if entity != MetricEntity::Distributions {
                    return Err(Error::incompatible(format!(
                        "percentiles require a distribution metric, {} is not one",
                        field
                    )));
                }
                // Merge the pre-aggregated quantile sketch, then take the
                // single requested quantile out of the result array.
                let merged = FunctionExpr::new(
                    format!("quantilesMergeIf({})", q),
                    vec![Expr::column("percentiles"), metric_match(&[metric_id])],
                );
                Ok(ResolvedFunction {
                    expr: FunctionExpr::aliased(
                        "arrayElement",
                        vec![merged.into(), Expr::Literal(Value::Int(1))],
                        &alias,
                    )
                    .into(),
                    alias,
                    value_type: ValueType::Float64,
                    entity: Some(entity),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::Avg | FunctionKind::Sum | FunctionKind::Max | FunctionKind::Min => {
                let physical = match kind {
                    FunctionKind::Avg => "avgIf",
                    FunctionKind::Sum => "sumIf",
                    FunctionKind::Max => "maxIf",
                    _ => "minIf",
                };
                let (metric_id, entity) = self.metric(&args[0].value)?;
                if entity == MetricEntity::Sets {
                    return Err(Error::incompatible(format!(
                        "{} cannot aggregate the set metric {}",
                        name, args[0].value
                    )));
                }
                Ok(ResolvedFunction {
                    expr: FunctionExpr::aliased(
                        physical,
                        vec![Expr::column("value"), metric_match(&[metric_id])],
                        &alias,
                    )
                    .into(),
                    alias,
                    value_type: ValueType::Float64,
                    entity: Some(entity),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::Rate(per) => {
                let (metric_id, _) = self.metric(DEFAULT_METRIC)?;
                let count = FunctionExpr::new(
                    "countIf",
                    vec![Expr::column("value"), metric_match(&[metric_id])],
                );
                Ok(ResolvedFunction {
                    expr: self.rate_expr(count.into(), per, &alias),
                    alias,
                    value_type: ValueType::Float64,
                    entity: Some(MetricEntity::Distributions),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::FailureCount => {
                let (metric_id, condition) = self.metrics_failure_condition()?;
                Ok(ResolvedFunction {
                    expr: FunctionExpr::aliased(
                        "countIf",
                        vec![Expr::column("value"), condition],
                        &alias,
                    )
                    .into(),
                    alias,
                    value_type: ValueType::UInt64,
                    entity: Some(MetricEntity::Distributions),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::FailureRate => {
                let (metric_id, condition) = self.metrics_failure_condition()?;
                let failures =
                    FunctionExpr::new("countIf", vec![Expr::column("value"), condition]);
                let total = FunctionExpr::new(
                    "countIf",
                    vec![Expr::column("value"), metric_match(&[metric_id])],
                );
                Ok(ResolvedFunction {
                    expr: FunctionExpr::aliased(
                        "divide",
                        vec![failures.into(), total.into()],
                        &alias,
                    )
                    .into(),
                    alias,
                    value_type: ValueType::Float64,
                    entity: Some(MetricEntity::Distributions),
                    metric_ids: vec![metric_id],
                    requires_groupby: false,
                })
            }
            FunctionKind::CountIf | FunctionKind::ArrayJoin | FunctionKind::SumArray => {
                Err(Error::incompatible(format!(
                    "{} is not supported by the metrics backend",
                    name
                )))
            }
        }
    }

    /// Resolve a metric name to its indexer id and storage entity
    fn metric(&self, metric: &str) -> Result<(u64, MetricEntity)> {
        let table = self
            .metric_table
            .ok_or_else(|| Error::Indexer("metrics resolver constructed without metric table".into()))?;
        let entity = table
            .entity_of(metric)
            .ok_or_else(|| Error::incompatible(format!("{} is not a known metric", metric)))?;
        let indexer = self
            .indexer
            .ok_or_else(|| Error::Indexer("metrics resolver constructed without indexer".into()))?;
        let metric_id = indexer
            .lookup(metric)
            .ok_or_else(|| Error::invalid(format!("Metric {} could not be resolved", metric)))?;
        Ok((metric_id, entity))
    }

    /// `and(equals(metric_id, <duration>), notIn(tags[status], <ok ids>))`
    fn metrics_failure_condition(&self) -> Result<(u64, Expr)> {
        let (metric_id, _) = self.metric(DEFAULT_METRIC)?;
        let indexer = self
            .indexer
            .ok_or_else(|| Error::Indexer("metrics resolver constructed without indexer".into()))?;
        let status_key = indexer
            .lookup("transaction.status")
            .ok_or_else(|| Error::TagKeyNotFound("transaction.status".to_string()))?;
        // Status values never interned cannot appear in stored rows, so only
        // the interned ones participate in the exclusion list.
        let ok_ids: Vec<Value> = NON_FAILURE_STATUSES
            .iter()
            .filter_map(|s| indexer.lookup(s))
            .map(Value::UInt)
            .collect();
        let condition = FunctionExpr::new(
            "and",
            vec![
                metric_match(&[metric_id]),
                FunctionExpr::new(
                    "notIn",
                    vec![
                        Expr::column(format!("tags[{}]", status_key)),
                        Expr::List(ok_ids),
                    ],
                )
                .into(),
            ],
        );
        Ok((metric_id, condition.into()))
    }
}

/// `equals(metric_id, id)` or `in(metric_id, ids)` selector
fn metric_match(metric_ids: &[u64]) -> Expr {
    if metric_ids.len() == 1 {
        FunctionExpr::new(
            "equals",
            vec![
                Expr::column("metric_id"),
                Expr::Literal(Value::UInt(metric_ids[0])),
            ],
        )
        .into()
    } else {
        FunctionExpr::new(
            "in",
            vec![
                Expr::column("metric_id"),
                Expr::List(metric_ids.iter().map(|id| Value::UInt(*id)).collect()),
            ],
        )
        .into()
    }
}

/// Drop a projection alias when the expression is used as an argument
fn strip_alias(expr: Expr) -> Expr {
    match expr {
        Expr::Aliased { column, .. } => Expr::Column(column),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::MemoryIndexer;
    use crate::params::Project;
    use chrono::{TimeZone, Utc};

    fn params() -> QueryParams {
        QueryParams::new(
            Some(1),
            vec![Project::new(1, "backend")],
            Utc.with_ymd_and_hms(2015, 5, 18, 10, 15, 1).unwrap(),
            Utc.with_ymd_and_hms(2015, 5, 19, 10, 15, 1).unwrap(),
        )
        .unwrap()
    }

    fn seeded_indexer() -> MemoryIndexer {
        let indexer = MemoryIndexer::new();
        indexer.bulk_record([
            "transaction",
            "transaction.duration",
            "transaction.status",
            "user",
            "session",
            "ok",
            "cancelled",
            "unknown",
        ]);
        indexer
    }

    #[test]
    fn test_alias_derivation() {
        let (name, args) = parse_call("count_if(event.type,equals,transaction)").unwrap();
        assert_eq!(
            derive_alias(&name, &args),
            "count_if_event_type_equals_transaction"
        );

        // The quoted literal contributes an extra separator
        let (name, args) = parse_call(r#"count_if(event.type,notEquals,"transaction")"#).unwrap();
        assert_eq!(
            derive_alias(&name, &args),
            "count_if_event_type_notEquals__transaction"
        );
    }

    #[test]
    fn test_quoted_literal_may_contain_commas() {
        let (name, args) = parse_call(r#"count_if(transaction,equals,"a,b")"#).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[2].value, "a,b");
        assert!(args[2].quoted);
        assert_eq!(
            derive_alias(&name, &args),
            "count_if_transaction_equals__a_b"
        );

        let params = params();
        let fields = FieldResolver::events(&params);
        let resolver = FunctionResolver::events(&fields, &params, &[]);
        let resolved = resolver
            .resolve(r#"count_if(transaction,equals,"a,b")"#)
            .unwrap();
        assert_eq!(resolved.alias, "count_if_transaction_equals__a_b");
    }

    #[test]
    fn test_identical_calls_share_alias() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let resolver = FunctionResolver::events(&fields, &params, &[]);
        let a = resolver.resolve("count_unique(user)").unwrap();
        let b = resolver.resolve("count_unique(user)").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.alias, "count_unique_user");
    }

    #[test]
    fn test_unknown_function() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let resolver = FunctionResolver::events(&fields, &params, &[]);
        assert!(matches!(
            resolver.resolve("made_up()"),
            Err(Error::UnknownFunction(_))
        ));
        // Bare field names are not function calls
        assert!(matches!(
            resolver.resolve("release"),
            Err(Error::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_count_if_with_tag_fallback() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let resolver = FunctionResolver::events(&fields, &params, &[]);
        let resolved = resolver.resolve("count_if(foo,equals,bar)").unwrap();
        assert_eq!(
            resolved.expr,
            Expr::Function(FunctionExpr::aliased(
                "countIf",
                vec![Expr::Function(FunctionExpr::new(
                    "equals",
                    vec![
                        Expr::column("tags[foo]"),
                        Expr::Literal(Value::Str("bar".into()))
                    ],
                ))],
                "count_if_foo_equals_bar",
            ))
        );
    }

    #[test]
    fn test_count_if_rejects_bad_operator() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let resolver = FunctionResolver::events(&fields, &params, &[]);
        assert!(matches!(
            resolver.resolve("count_if(foo,almost,bar)"),
            Err(Error::InvalidSearchQuery(_))
        ));
    }

    #[test]
    fn test_private_function_requires_acl() {
        let params = params();
        let fields = FieldResolver::events(&params);

        let resolver = FunctionResolver::events(&fields, &params, &[]);
        match resolver.resolve("sum_array(measurements_value)") {
            Err(Error::InvalidSearchQuery(msg)) => {
                assert_eq!(msg, "sum_array: no access to private function")
            }
            other => panic!("expected private-function rejection, got {:?}", other),
        }

        let acl = vec!["sum_array".to_string()];
        let resolver = FunctionResolver::events(&fields, &params, &acl);
        let resolved = resolver.resolve("sum_array(measurements_value)").unwrap();
        assert_eq!(
            resolved.expr,
            Expr::Function(FunctionExpr::aliased(
                "sum",
                vec![Expr::Function(FunctionExpr::new(
                    "arrayJoin",
                    vec![Expr::column("measurements.value")],
                ))],
                "sum_array_measurements_value",
            ))
        );
    }

    #[test]
    fn test_array_combinator_rejects_non_array_argument() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let acl = vec!["sum_array".to_string()];
        let resolver = FunctionResolver::events(&fields, &params, &acl);
        match resolver.resolve("sum_array(stuff)") {
            Err(Error::InvalidSearchQuery(msg)) => {
                assert_eq!(msg, "stuff is not a valid array column")
            }
            other => panic!("expected InvalidSearchQuery, got {:?}", other),
        }
    }

    #[test]
    fn test_array_join_requires_grouping() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let acl = vec!["array_join".to_string()];
        let resolver = FunctionResolver::events(&fields, &params, &acl);
        let resolved = resolver.resolve("array_join(spans_op)").unwrap();
        assert!(resolved.requires_groupby);
        assert_eq!(resolved.alias, "array_join_spans_op");
    }

    #[test]
    fn test_metrics_percentile_entity() {
        let params = params();
        let table = MetricTable::default();
        let indexer = seeded_indexer();
        let fields = FieldResolver::metrics(&params, &indexer);
        let resolver = FunctionResolver::metrics(&fields, &params, &table, &indexer, &[]);

        let resolved = resolver.resolve("p95(transaction.duration)").unwrap();
        assert_eq!(resolved.alias, "p95_transaction_duration");
        assert_eq!(resolved.entity, Some(MetricEntity::Distributions));
        assert_eq!(resolved.value_type, ValueType::Float64);
        assert_eq!(
            resolved.metric_ids,
            vec![indexer.lookup("transaction.duration").unwrap()]
        );

        let unique = resolver.resolve("count_unique(user)").unwrap();
        assert_eq!(unique.entity, Some(MetricEntity::Sets));

        let session = resolver.resolve("sum(session)").unwrap();
        assert_eq!(session.entity, Some(MetricEntity::Counters));
    }

    #[test]
    fn test_metrics_percentile_requires_distribution() {
        let params = params();
        let table = MetricTable::default();
        let indexer = seeded_indexer();
        let fields = FieldResolver::metrics(&params, &indexer);
        let resolver = FunctionResolver::metrics(&fields, &params, &table, &indexer, &[]);
        assert!(matches!(
            resolver.resolve("p95(user)"),
            Err(Error::IncompatibleMetricsQuery(_))
        ));
    }

    #[test]
    fn test_metrics_rejects_events_only_functions() {
        let params = params();
        let table = MetricTable::default();
        let indexer = seeded_indexer();
        let fields = FieldResolver::metrics(&params, &indexer);
        let resolver = FunctionResolver::metrics(&fields, &params, &table, &indexer, &[]);
        assert!(matches!(
            resolver.resolve("count_if(foo,equals,bar)"),
            Err(Error::IncompatibleMetricsQuery(_))
        ));
    }
}
