//! Entity routing and result merging for the metrics backend
//!
//! Aggregates over different metric types live in physically separate storage
//! entities, so one logical query may fan out into several sub-queries. The
//! sub-query holding the first selected aggregate (or the ordered-by one) is
//! primary: it alone determines which group keys exist and in what order.
//! Secondary results only fill in columns for keys the primary produced.

use std::collections::HashMap;

use tracing::debug;

use crate::adapter::{QueryResult, ResultRow};
use crate::entity::MetricEntity;
use crate::error::{Error, Result};
use crate::expr::{Cond, Condition, Expr, Op, OrderBy, StructuredQuery};
use crate::functions::ResolvedFunction;
use crate::value::Value;

/// One sub-query bound for a single storage entity
#[derive(Debug, Clone)]
pub struct EntityQuery {
    /// Target entity
    pub entity: MetricEntity,
    /// Compiled sub-query
    pub query: StructuredQuery,
    /// Output aliases of the aggregates this sub-query computes
    pub aggregate_aliases: Vec<String>,
}

/// The fan-out plan: primary first, then secondaries
#[derive(Debug, Clone)]
pub struct RoutedQueries {
    /// Sub-queries in execution order
    pub queries: Vec<EntityQuery>,
}

/// Partition resolved aggregates into per-entity sub-queries
///
/// All sub-queries share the `where` clause, group-by, limit and granularity;
/// each additionally pins `metric_id` to the metrics it reads. Ordering by an
/// aggregate promotes that aggregate's entity to primary; ordering by
/// aggregates from two entities cannot be satisfied by any single sub-query
/// and is rejected.
#[allow(clippy::too_many_arguments)]
pub fn route_by_entity(
    aggregates: &[ResolvedFunction],
    groupby: &[Expr],
    where_clause: &[Cond],
    having: &[Cond],
    orderby: &[OrderBy],
    limit: Option<u64>,
    granularity: Option<u64>,
) -> Result<RoutedQueries> {
    // Group by entity, preserving first-seen select order
    let mut order: Vec<MetricEntity> = Vec::new();
    let mut by_entity: HashMap<MetricEntity, Vec<&ResolvedFunction>> = HashMap::new();
    for aggregate in aggregates {
        let entity = aggregate.entity.ok_or_else(|| {
            Error::incompatible(format!(
                "{} does not resolve to a metrics storage entity",
                aggregate.alias
            ))
        })?;
        if !order.contains(&entity) {
            order.push(entity);
        }
        by_entity.entry(entity).or_default().push(aggregate);
    }
    if order.is_empty() {
        return Err(Error::incompatible(
            "at least one aggregate is required".to_string(),
        ));
    }

    // An orderby on an aggregate pins the primary entity
    let mut ordered_entities: Vec<MetricEntity> = Vec::new();
    for entry in orderby {
        if let Some(alias) = entry.expr.alias() {
            if let Some(aggregate) = aggregates.iter().find(|a| a.alias == alias) {
                let entity = aggregate.entity.unwrap_or(order[0]);
                if !ordered_entities.contains(&entity) {
                    ordered_entities.push(entity);
                }
            }
        }
    }
    if ordered_entities.len() > 1 {
        return Err(Error::incompatible(
            "Ordering by aggregates from multiple storage entities is not supported".to_string(),
        ));
    }
    if let Some(&pinned) = ordered_entities.first() {
        order.retain(|e| *e != pinned);
        order.insert(0, pinned);
    }

    let mut queries = Vec::with_capacity(order.len());
    for (position, entity) in order.iter().enumerate() {
        let entity_aggregates = &by_entity[entity];
        let mut query = StructuredQuery::new(entity.table_name());
        query.select = groupby.to_vec();
        query
            .select
            .extend(entity_aggregates.iter().map(|a| a.expr.clone()));
        query.where_clause = where_clause.to_vec();

        let mut metric_ids: Vec<u64> = entity_aggregates
            .iter()
            .flat_map(|a| a.metric_ids.iter().copied())
            .collect();
        metric_ids.sort_unstable();
        metric_ids.dedup();
        query.where_clause.push(
            Condition::with_list(
                Expr::column("metric_id"),
                Op::In,
                metric_ids.into_iter().map(Value::UInt).collect(),
            )
            .into(),
        );

        query.groupby = groupby.to_vec();
        query.having = filter_having(having, entity_aggregates)?;
        // Only the primary carries the ordering; secondaries are merged by
        // group key, so their row order is irrelevant
        if position == 0 {
            query.orderby = orderby.to_vec();
        }
        query.limit = limit;
        query.granularity = granularity;

        queries.push(EntityQuery {
            entity: *entity,
            query,
            aggregate_aliases: entity_aggregates.iter().map(|a| a.alias.clone()).collect(),
        });
    }

    debug!(entities = queries.len(), "routed metrics query");
    Ok(RoutedQueries { queries })
}

/// Keep the having conditions whose aggregates this sub-query computes
fn filter_having(having: &[Cond], aggregates: &[&ResolvedFunction]) -> Result<Vec<Cond>> {
    let mut kept = Vec::new();
    for cond in having {
        match cond {
            Cond::Leaf(leaf) => {
                if references_aggregate(&leaf.lhs, aggregates) {
                    kept.push(cond.clone());
                }
            }
            Cond::Or(children) => {
                let matching = children
                    .iter()
                    .filter(|child| match child {
                        Cond::Leaf(leaf) => references_aggregate(&leaf.lhs, aggregates),
                        Cond::Or(_) => false,
                    })
                    .count();
                // An alternation split across entities would change meaning
                // if evaluated partially in each sub-query
                if matching == children.len() {
                    kept.push(cond.clone());
                } else if matching > 0 {
                    return Err(Error::incompatible(
                        "Aggregate alternations must reference a single storage entity"
                            .to_string(),
                    ));
                }
            }
        }
    }
    Ok(kept)
}

fn references_aggregate(expr: &Expr, aggregates: &[&ResolvedFunction]) -> bool {
    expr.alias()
        .map(|alias| aggregates.iter().any(|a| a.alias == alias))
        .unwrap_or(false)
}

// ============================================================================
// Result merging
// ============================================================================

/// Merge per-entity results into one result set
///
/// Rows are keyed by the group-by output columns. The first result (the
/// primary) fixes the key set and row order; secondary results fill in their
/// aggregate columns for existing keys and are dropped for keys the primary
/// never produced. Aggregates absent from a row are padded with null.
pub fn merge_entity_results(
    groupby_names: &[String],
    results: Vec<QueryResult>,
) -> Result<QueryResult> {
    let mut iter = results.into_iter();
    let primary = match iter.next() {
        Some(primary) => primary,
        None => return Ok(QueryResult::default()),
    };

    let mut meta = primary.meta.clone();
    let mut rows: Vec<ResultRow> = primary.rows;
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    for (position, row) in rows.iter().enumerate() {
        index.insert(group_key(groupby_names, row)?, position);
    }

    for secondary in iter {
        for (alias, value_type) in &secondary.meta.columns {
            if !meta.contains(alias) {
                meta.columns.push((alias.clone(), *value_type));
            }
        }
        let mut dropped = 0usize;
        for row in secondary.rows {
            match index.get(&group_key(groupby_names, &row)?) {
                Some(&position) => {
                    for (alias, value) in row {
                        rows[position].entry(alias).or_insert(value);
                    }
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!(dropped, "dropped secondary-only group keys");
        }
    }

    // Null-pad columns a row's entity never computed
    for row in &mut rows {
        for (alias, _) in &meta.columns {
            row.entry(alias.clone()).or_insert(Value::Null);
        }
    }

    Ok(QueryResult { rows, meta })
}

/// Stable string key for a row's group-by values
fn group_key(groupby_names: &[String], row: &ResultRow) -> Result<String> {
    let values: Vec<&Value> = groupby_names
        .iter()
        .map(|name| row.get(name).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&values).map_err(|e| Error::Execution(e.to_string()))
}
