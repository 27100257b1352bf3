//! Condition building: default scoping, environments, and user filters
//!
//! Every query carries non-removable default conditions derived from the
//! request parameters (time window, project selection, tenant). User filter
//! terms are translated on top of those; they can only narrow the result set,
//! never widen it past the defaults.
//!
//! Building runs in two phases to keep borrows simple: field filters first
//! (they may narrow the project set held by the field resolver), aggregate
//! filters second, once the select list is known.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{Error, Result};
use crate::expr::{Cond, Condition, Expr, Op};
use crate::fields::{Dataset, FieldResolver};
use crate::filter::{AggregateTerm, FilterTerm, SearchOp};
use crate::functions::{FunctionResolver, ResolvedFunction};
use crate::indexer::StringIndexer;
use crate::params::QueryParams;
use crate::value::{Value, ValueType};

fn comparison_op(op: SearchOp, multi: bool) -> Op {
    match op {
        SearchOp::Eq => {
            if multi {
                Op::In
            } else {
                Op::Eq
            }
        }
        SearchOp::Neq => {
            if multi {
                Op::NotIn
            } else {
                Op::Neq
            }
        }
        SearchOp::In => Op::In,
        SearchOp::NotIn => Op::NotIn,
        SearchOp::Gt => Op::Gt,
        SearchOp::Gte => Op::Gte,
        SearchOp::Lt => Op::Lt,
        SearchOp::Lte => Op::Lte,
    }
}

// ============================================================================
// Pre-aggregation conditions
// ============================================================================

/// Builds the `where` clause for one query
pub struct WhereBuilder<'a> {
    params: &'a QueryParams,
    indexer: Option<&'a dyn StringIndexer>,
}

impl<'a> WhereBuilder<'a> {
    /// Create a builder; the indexer is required only for the metrics dataset
    pub fn new(params: &'a QueryParams, indexer: Option<&'a dyn StringIndexer>) -> Self {
        Self { params, indexer }
    }

    /// The non-removable conditions every query starts with
    ///
    /// Time window, project selection, and on the metrics backend the tenant
    /// id (its tables are shared across organizations).
    pub fn default_conditions(&self, dataset: Dataset) -> Result<Vec<Cond>> {
        let mut conditions = vec![
            Condition::new(
                Expr::column("timestamp"),
                Op::Gte,
                Value::Str(self.params.start.to_rfc3339()),
            )
            .into(),
            Condition::new(
                Expr::column("timestamp"),
                Op::Lt,
                Value::Str(self.params.end.to_rfc3339()),
            )
            .into(),
            Condition::with_list(
                Expr::column("project_id"),
                Op::In,
                self.params
                    .project_ids()
                    .into_iter()
                    .map(Value::UInt)
                    .collect(),
            )
            .into(),
        ];

        if dataset == Dataset::Metrics {
            let org_id = self.params.organization_id.ok_or_else(|| {
                Error::InvalidParams("organization_id is required for metrics queries".into())
            })?;
            conditions.push(Condition::new(Expr::column("org_id"), Op::Eq, Value::UInt(org_id)).into());
        }
        Ok(conditions)
    }

    /// Conditions for the requested environments, if any
    ///
    /// An empty-string entry means "events with no environment". Mixed with
    /// named environments it becomes a null-safe alternation so rows without
    /// the column still match.
    pub fn environment_conditions(&self, fields: &FieldResolver) -> Result<Vec<Cond>> {
        if self.params.environments.is_empty() {
            return Ok(Vec::new());
        }

        let resolved = fields.resolve("environment")?;
        let named: Vec<&str> = self
            .params
            .environments
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| e.as_str())
            .collect();
        let wants_unset = named.len() != self.params.environments.len();

        let named_cond = if named.is_empty() {
            None
        } else if named.len() == 1 {
            Some(Condition::new(
                resolved.expr.clone(),
                Op::Eq,
                self.environment_value(fields, named[0])?,
            ))
        } else {
            let values = named
                .iter()
                .map(|name| self.environment_value(fields, name))
                .collect::<Result<Vec<_>>>()?;
            Some(Condition::with_list(resolved.expr.clone(), Op::In, values))
        };

        let unset_cond = if wants_unset {
            Some(match fields.dataset() {
                Dataset::Events => Condition::is_null(resolved.expr.clone()),
                // An unset tag slot reads as id 0 on the metrics backend
                Dataset::Metrics => Condition::new(resolved.expr.clone(), Op::Eq, Value::UInt(0)),
            })
        } else {
            None
        };

        Ok(match (unset_cond, named_cond) {
            (Some(unset), Some(named)) => vec![Cond::Or(vec![unset.into(), named.into()])],
            (Some(unset), None) => vec![unset.into()],
            (None, Some(named)) => vec![named.into()],
            (None, None) => Vec::new(),
        })
    }

    /// Translate one user filter term into a condition
    ///
    /// Filters on `project` narrow the resolver's project set as a side
    /// effect, so the `project` transform enumerates only surviving projects.
    pub fn filter_condition(
        &self,
        fields: &mut FieldResolver,
        term: &FilterTerm,
    ) -> Result<Cond> {
        match term.key.as_str() {
            "project" => self.project_condition(fields, term),
            "project.id" | "project_id" => self.project_id_condition(fields, term),
            _ => self.field_condition(fields, term),
        }
    }

    fn project_condition(&self, fields: &mut FieldResolver, term: &FilterTerm) -> Result<Cond> {
        let mut ids = Vec::with_capacity(term.values.len());
        let mut missing = Vec::new();
        for slug in &term.values {
            match self.params.project_by_slug(slug) {
                Some(project) => ids.push(project.id),
                None => missing.push(slug.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::invalid(format!(
                "Project(s) {} do not exist or are not actively selected.",
                missing.join(", ")
            )));
        }
        self.narrowing_project_condition(fields, term.op, ids)
    }

    fn project_id_condition(&self, fields: &mut FieldResolver, term: &FilterTerm) -> Result<Cond> {
        let mut ids = Vec::with_capacity(term.values.len());
        let mut missing = Vec::new();
        for raw in &term.values {
            match raw.parse::<u64>().ok().filter(|id| self.params.contains_project_id(*id)) {
                Some(id) => ids.push(id),
                None => missing.push(raw.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::invalid(format!(
                "Project(s) {} do not exist or are not actively selected.",
                missing.join(", ")
            )));
        }
        self.narrowing_project_condition(fields, term.op, ids)
    }

    fn narrowing_project_condition(
        &self,
        fields: &mut FieldResolver,
        op: SearchOp,
        ids: Vec<u64>,
    ) -> Result<Cond> {
        // Only positive filters narrow; a negation keeps the remainder
        match op {
            SearchOp::Eq | SearchOp::In => fields.narrow_projects(&ids),
            SearchOp::Neq | SearchOp::NotIn => {
                let remaining: Vec<u64> = self
                    .params
                    .project_ids()
                    .into_iter()
                    .filter(|id| !ids.contains(id))
                    .collect();
                fields.narrow_projects(&remaining);
            }
            _ => {
                return Err(Error::invalid(
                    "project filters only support equality and membership".to_string(),
                ))
            }
        }

        let multi = ids.len() > 1;
        let op = comparison_op(op, multi);
        debug!(?op, projects = ids.len(), "project filter");
        Ok(if multi {
            Condition::with_list(
                Expr::column("project_id"),
                op,
                ids.into_iter().map(Value::UInt).collect(),
            )
            .into()
        } else {
            Condition::new(
                Expr::column("project_id"),
                op,
                Value::UInt(ids.into_iter().next().unwrap_or(0)),
            )
            .into()
        })
    }

    fn field_condition(&self, fields: &FieldResolver, term: &FilterTerm) -> Result<Cond> {
        let resolved = fields.resolve(&term.key)?;
        let values = term
            .values
            .iter()
            .map(|raw| self.filter_value(fields, &resolved.value_type, raw))
            .collect::<Result<Vec<_>>>()?;

        let multi = values.len() > 1;
        let op = comparison_op(term.op, multi);
        Ok(if multi {
            Condition::with_list(resolved.expr, op, values).into()
        } else {
            let value = values.into_iter().next().ok_or_else(|| {
                Error::invalid(format!("filter on {} has no value", term.key))
            })?;
            Condition {
                lhs: resolved.expr,
                op,
                rhs: crate::expr::Operand::Scalar(value),
            }
            .into()
        })
    }

    fn environment_value(&self, fields: &FieldResolver, name: &str) -> Result<Value> {
        match fields.dataset() {
            Dataset::Events => Ok(Value::Str(name.to_string())),
            Dataset::Metrics => self.interned_value(name),
        }
    }

    /// Coerce one raw filter value for the resolved column's type
    fn filter_value(
        &self,
        fields: &FieldResolver,
        value_type: &ValueType,
        raw: &str,
    ) -> Result<Value> {
        if fields.dataset() == Dataset::Metrics {
            // Tag values are interned; a never-seen value cannot match any
            // stored row and is treated as a user error.
            return self.interned_value(raw);
        }
        match value_type {
            ValueType::UInt64 => raw
                .parse::<u64>()
                .map(Value::UInt)
                .map_err(|_| Error::invalid(format!("{} is not a valid number", raw))),
            ValueType::Int64 => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::invalid(format!("{} is not a valid number", raw))),
            ValueType::Float64 => raw
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Error::invalid(format!("{} is not a valid number", raw))),
            _ => Ok(Value::Str(raw.to_string())),
        }
    }

    fn interned_value(&self, raw: &str) -> Result<Value> {
        let indexer = self
            .indexer
            .ok_or_else(|| Error::Indexer("metrics conditions require an indexer".into()))?;
        indexer
            .lookup(raw)
            .map(Value::UInt)
            .ok_or_else(|| Error::invalid("Tag value was not found"))
    }
}

// ============================================================================
// Post-aggregation conditions
// ============================================================================

/// Result of translating aggregate filter terms
pub struct HavingOutput {
    /// Conditions for the `having` clause
    pub having: Vec<Cond>,
    /// Aggregates referenced only by conditions, promoted into the select
    /// list when auto-aggregation is enabled
    pub promoted: Vec<ResolvedFunction>,
}

/// Translate aggregate filter terms into `having` conditions
///
/// Every referenced aggregate must appear in the select list; with
/// `auto_aggregations` enabled a missing one is added instead of rejected.
pub fn build_having(
    functions: &FunctionResolver,
    terms: &[AggregateTerm],
    selected_aliases: &HashSet<String>,
    auto_aggregations: bool,
) -> Result<HavingOutput> {
    let mut having = Vec::new();
    let mut promoted: Vec<ResolvedFunction> = Vec::new();
    let mut promoted_aliases = HashSet::new();

    let mut resolve_one = |call: &str| -> Result<ResolvedFunction> {
        let resolved = functions.resolve(call)?;
        if !selected_aliases.contains(&resolved.alias) && !promoted_aliases.contains(&resolved.alias)
        {
            if !auto_aggregations {
                return Err(Error::invalid(format!(
                    "Aggregate {} used in a condition but is not a selected column",
                    call
                )));
            }
            promoted_aliases.insert(resolved.alias.clone());
            promoted.push(resolved.clone());
        }
        Ok(resolved)
    };

    for term in terms {
        match term {
            AggregateTerm::Leaf(filter) => {
                let resolved = resolve_one(&filter.function)?;
                having.push(
                    Condition::new(resolved.expr, comparison_op(filter.op, false), filter.value.clone())
                        .into(),
                );
            }
            AggregateTerm::Or(filters) => {
                let mut children = Vec::with_capacity(filters.len());
                for filter in filters {
                    let resolved = resolve_one(&filter.function)?;
                    children.push(
                        Condition::new(
                            resolved.expr,
                            comparison_op(filter.op, false),
                            filter.value.clone(),
                        )
                        .into(),
                    );
                }
                having.push(Cond::Or(children));
            }
        }
    }

    Ok(HavingOutput { having, promoted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AggregateFilter;
    use crate::indexer::MemoryIndexer;
    use crate::params::Project;
    use chrono::{TimeZone, Utc};

    fn params() -> QueryParams {
        QueryParams::new(
            Some(1),
            vec![Project::new(1, "backend"), Project::new(2, "frontend")],
            Utc.with_ymd_and_hms(2015, 5, 18, 10, 15, 1).unwrap(),
            Utc.with_ymd_and_hms(2015, 5, 19, 10, 15, 1).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_default_conditions_events() {
        let params = params();
        let builder = WhereBuilder::new(&params, None);
        let conditions = builder.default_conditions(Dataset::Events).unwrap();
        assert_eq!(conditions.len(), 3);
        assert_eq!(
            conditions[0],
            Cond::Leaf(Condition::new(
                Expr::column("timestamp"),
                Op::Gte,
                Value::Str(params.start.to_rfc3339()),
            ))
        );
        assert_eq!(
            conditions[2],
            Cond::Leaf(Condition::with_list(
                Expr::column("project_id"),
                Op::In,
                vec![Value::UInt(1), Value::UInt(2)],
            ))
        );
    }

    #[test]
    fn test_default_conditions_metrics_require_org() {
        let mut params = params();
        let indexer = MemoryIndexer::new();
        {
            let builder = WhereBuilder::new(&params, Some(&indexer));
            let conditions = builder.default_conditions(Dataset::Metrics).unwrap();
            assert_eq!(conditions.len(), 4);
            assert_eq!(
                conditions[3],
                Cond::Leaf(Condition::new(Expr::column("org_id"), Op::Eq, Value::UInt(1)))
            );
        }

        params.organization_id = None;
        let builder = WhereBuilder::new(&params, Some(&indexer));
        assert!(matches!(
            builder.default_conditions(Dataset::Metrics),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_single_environment_is_plain_equality() {
        let params = params().with_environments(vec!["prod".to_string()]);
        let fields = FieldResolver::events(&params);
        let builder = WhereBuilder::new(&params, None);
        let conditions = builder.environment_conditions(&fields).unwrap();
        assert_eq!(
            conditions,
            vec![Cond::Leaf(Condition::new(
                Expr::column("environment"),
                Op::Eq,
                "prod",
            ))]
        );
    }

    #[test]
    fn test_unset_plus_named_environment_is_null_safe_or() {
        let params = params().with_environments(vec![String::new(), "prod".to_string()]);
        let fields = FieldResolver::events(&params);
        let builder = WhereBuilder::new(&params, None);
        let conditions = builder.environment_conditions(&fields).unwrap();
        assert_eq!(
            conditions,
            vec![Cond::Or(vec![
                Condition::is_null(Expr::column("environment")).into(),
                Condition::new(Expr::column("environment"), Op::Eq, "prod").into(),
            ])]
        );
    }

    #[test]
    fn test_multiple_environments_use_membership() {
        let params = params().with_environments(vec!["dev".to_string(), "prod".to_string()]);
        let fields = FieldResolver::events(&params);
        let builder = WhereBuilder::new(&params, None);
        let conditions = builder.environment_conditions(&fields).unwrap();
        assert_eq!(
            conditions,
            vec![Cond::Leaf(Condition::with_list(
                Expr::column("environment"),
                Op::In,
                vec![Value::Str("dev".into()), Value::Str("prod".into())],
            ))]
        );
    }

    #[test]
    fn test_project_slug_filter_narrows() {
        let params = params();
        let mut fields = FieldResolver::events(&params);
        let builder = WhereBuilder::new(&params, None);
        let cond = builder
            .filter_condition(&mut fields, &FilterTerm::eq("project", "backend"))
            .unwrap();
        assert_eq!(
            cond,
            Cond::Leaf(Condition::new(
                Expr::column("project_id"),
                Op::Eq,
                Value::UInt(1),
            ))
        );
        // The project transform now enumerates only the surviving project
        match fields.project_transform() {
            Expr::Function(f) => assert_eq!(f.args[1], Expr::List(vec![Value::UInt(1)])),
            other => panic!("expected transform, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_project_slug_fails() {
        let params = params();
        let mut fields = FieldResolver::events(&params);
        let builder = WhereBuilder::new(&params, None);
        match builder.filter_condition(&mut fields, &FilterTerm::eq("project", "mobile")) {
            Err(Error::InvalidSearchQuery(msg)) => assert_eq!(
                msg,
                "Project(s) mobile do not exist or are not actively selected."
            ),
            other => panic!("expected InvalidSearchQuery, got {:?}", other),
        }
    }

    #[test]
    fn test_tag_filter_on_events() {
        let params = params();
        let mut fields = FieldResolver::events(&params);
        let builder = WhereBuilder::new(&params, None);
        let cond = builder
            .filter_condition(&mut fields, &FilterTerm::eq("customer_tier", "gold"))
            .unwrap();
        match cond {
            Cond::Leaf(leaf) => {
                assert_eq!(leaf.op, Op::Eq);
                assert_eq!(leaf.lhs.output_name(), Some("customer_tier"));
            }
            other => panic!("expected leaf, got {:?}", other),
        }
    }

    #[test]
    fn test_metrics_tag_value_must_be_interned() {
        let params = params();
        let indexer = MemoryIndexer::new();
        indexer.record("transaction");
        indexer.record("foo_transaction");
        let mut fields = FieldResolver::metrics(&params, &indexer);
        let builder = WhereBuilder::new(&params, Some(&indexer));

        let cond = builder
            .filter_condition(&mut fields, &FilterTerm::eq("transaction", "foo_transaction"))
            .unwrap();
        match cond {
            Cond::Leaf(leaf) => assert_eq!(
                leaf.rhs,
                crate::expr::Operand::Scalar(Value::UInt(
                    indexer.lookup("foo_transaction").unwrap()
                ))
            ),
            other => panic!("expected leaf, got {:?}", other),
        }

        match builder.filter_condition(&mut fields, &FilterTerm::eq("transaction", "never_seen")) {
            Err(Error::InvalidSearchQuery(msg)) => assert_eq!(msg, "Tag value was not found"),
            other => panic!("expected InvalidSearchQuery, got {:?}", other),
        }
    }

    #[test]
    fn test_having_requires_selected_aggregate() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let functions = FunctionResolver::events(&fields, &params, &[]);
        let terms = vec![AggregateTerm::Leaf(AggregateFilter::new(
            "count_unique(user)",
            SearchOp::Gt,
            10i64,
        ))];

        let selected: HashSet<String> = HashSet::new();
        assert!(matches!(
            build_having(&functions, &terms, &selected, false),
            Err(Error::InvalidSearchQuery(_))
        ));

        // Auto-aggregation promotes instead of rejecting
        let output = build_having(&functions, &terms, &selected, true).unwrap();
        assert_eq!(output.having.len(), 1);
        assert_eq!(output.promoted.len(), 1);
        assert_eq!(output.promoted[0].alias, "count_unique_user");

        // Already-selected aggregates are not promoted again
        let selected: HashSet<String> = ["count_unique_user".to_string()].into_iter().collect();
        let output = build_having(&functions, &terms, &selected, false).unwrap();
        assert!(output.promoted.is_empty());
    }

    #[test]
    fn test_having_alternation() {
        let params = params();
        let fields = FieldResolver::events(&params);
        let functions = FunctionResolver::events(&fields, &params, &[]);
        let terms = vec![AggregateTerm::Or(vec![
            AggregateFilter::new("count()", SearchOp::Gt, 100i64),
            AggregateFilter::new("count()", SearchOp::Lt, 10i64),
        ])];
        let selected: HashSet<String> = ["count".to_string()].into_iter().collect();
        let output = build_having(&functions, &terms, &selected, false).unwrap();
        match &output.having[0] {
            Cond::Or(children) => assert_eq!(children.len(), 2),
            other => panic!("expected Or, got {:?}", other),
        }
    }
}
