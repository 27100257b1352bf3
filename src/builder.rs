//! Query builders: the public assembly surface
//!
//! A builder takes request parameters, selected columns and parsed search
//! terms, runs the resolvers in a fixed order, and produces an executable
//! query. Field filters run before select resolution so a project filter can
//! narrow the `project` transform; aggregate filters run after, once the
//! select aliases are known.
//!
//! [`EventsQueryBuilder`] compiles against the raw event store,
//! [`MetricsQueryBuilder`] against the pre-aggregated metrics entities (with
//! per-entity fan-out), and [`TimeseriesMetricsQueryBuilder`] produces
//! time-bucketed series from the same entities.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::adapter::{ExecutionAdapter, QueryResult};
use crate::conditions::{build_having, WhereBuilder};
use crate::config::BuilderConfig;
use crate::entity::MetricTable;
use crate::error::{Error, Result};
use crate::expr::{Column, Direction, Expr, LimitBy, OrderBy, StructuredQuery};
use crate::fields::{Dataset, FieldResolver};
use crate::filter::{AggregateTerm, FilterTerm, SearchTerm};
use crate::functions::{is_function_call, FunctionResolver, ResolvedFunction};
use crate::granularity::select_granularity;
use crate::indexer::StringIndexer;
use crate::params::QueryParams;
use crate::router::{merge_entity_results, route_by_entity, RoutedQueries};

/// Per-request assembly options shared by all builders
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Order-by entries: an output name, `-` prefix for descending
    pub orderby: Vec<String>,
    /// Row limit; the configured default applies when absent
    pub limit: Option<u64>,
    /// Per-distinct-key row cap as `(output name, count)`
    pub limitby: Option<(String, u64)>,
    /// Sampling fraction in `(0, 1]`
    pub sample_rate: Option<f64>,
    /// Best-effort sampled execution flag, passed through unchanged
    pub turbo: bool,
    /// Explicit array-join column
    pub array_join: Option<String>,
    /// Private functions this request may use
    pub functions_acl: Vec<String>,
    /// Promote aggregates referenced only by conditions into the select list
    pub auto_aggregations: bool,
    /// Translate aggregate filter terms at all; off drops them silently
    pub use_aggregate_conditions: bool,
}

impl QueryOptions {
    /// Options with aggregate conditions enabled, the common interactive case
    pub fn with_aggregate_conditions() -> Self {
        Self {
            use_aggregate_conditions: true,
            ..Self::default()
        }
    }
}

fn check_retention(params: &QueryParams, config: &BuilderConfig) -> Result<()> {
    let horizon = Utc::now() - Duration::days(config.retention_days);
    if params.start < horizon {
        return Err(Error::QueryOutsideRetention {
            start: params.start.to_rfc3339(),
            retention_days: config.retention_days,
        });
    }
    Ok(())
}

fn validated_limit(requested: Option<u64>, config: &BuilderConfig) -> Result<u64> {
    match requested {
        None => Ok(config.default_limit),
        Some(0) => Err(Error::invalid("Limit must be a positive integer".to_string())),
        // The ceiling exists because the merge model cannot page past it, so
        // exceeding it is an incompatibility rather than a malformed query
        Some(limit) if limit > config.max_limit => Err(Error::incompatible(format!(
            "Invalid limit of {}, the maximum is {}",
            limit, config.max_limit
        ))),
        Some(limit) => Ok(limit),
    }
}

fn validated_sample_rate(rate: Option<f64>) -> Result<Option<f64>> {
    match rate {
        Some(rate) if !(rate > 0.0 && rate <= 1.0) => Err(Error::InvalidParams(format!(
            "sample rate {} is outside (0, 1]",
            rate
        ))),
        other => Ok(other),
    }
}

/// Deduplicate raw column names, keeping first-seen order
fn dedup_columns(columns: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    columns
        .iter()
        .map(|c| c.as_str())
        .filter(|c| seen.insert(*c))
        .collect()
}

fn split_terms(terms: &[SearchTerm]) -> (Vec<&FilterTerm>, Vec<AggregateTerm>) {
    let mut filters = Vec::new();
    let mut aggregates = Vec::new();
    for term in terms {
        match term {
            SearchTerm::Filter(f) => filters.push(f),
            SearchTerm::Aggregate(a) => aggregates.push(a.clone()),
        }
    }
    (filters, aggregates)
}

/// Parse one orderby entry into `(name, direction)`
fn orderby_parts(entry: &str) -> (&str, Direction) {
    match entry.strip_prefix('-') {
        Some(name) => (name, Direction::Desc),
        None => (entry, Direction::Asc),
    }
}

// ============================================================================
// Events
// ============================================================================

/// Builds queries against the raw event store
pub struct EventsQueryBuilder<'a> {
    params: &'a QueryParams,
    config: BuilderConfig,
    selected: Vec<String>,
    terms: Vec<SearchTerm>,
    options: QueryOptions,
}

impl<'a> EventsQueryBuilder<'a> {
    /// Create a builder; fails when the window starts outside retention
    pub fn new(params: &'a QueryParams, config: BuilderConfig) -> Result<Self> {
        check_retention(params, &config)?;
        Ok(Self {
            params,
            config,
            selected: Vec::new(),
            terms: Vec::new(),
            options: QueryOptions::with_aggregate_conditions(),
        })
    }

    /// Set the selected columns and function calls
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the parsed search terms
    pub fn terms<I>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = SearchTerm>,
    {
        self.terms = terms.into_iter().collect();
        self
    }

    /// Set the assembly options
    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Compile into a single executable query
    pub fn build(&self) -> Result<StructuredQuery> {
        let mut fields = FieldResolver::events(self.params);
        let where_builder = WhereBuilder::new(self.params, None);

        let mut query = StructuredQuery::new("events");
        query.where_clause = where_builder.default_conditions(Dataset::Events)?;
        query
            .where_clause
            .extend(where_builder.environment_conditions(&fields)?);

        // Field filters first: a project filter narrows the transform the
        // select phase emits for the `project` field
        let (filters, aggregate_terms) = split_terms(&self.terms);
        for term in &filters {
            query
                .where_clause
                .push(where_builder.filter_condition(&mut fields, term)?);
        }

        let functions = FunctionResolver::events(&fields, self.params, &self.options.functions_acl);
        let columns = dedup_columns(&self.selected);
        if columns.len() > self.config.max_columns {
            return Err(Error::invalid(format!(
                "{} columns selected, the maximum is {}",
                columns.len(),
                self.config.max_columns
            )));
        }

        let mut aggregates: Vec<ResolvedFunction> = Vec::new();
        let mut plain: Vec<Expr> = Vec::new();
        let mut seen_outputs = HashSet::new();
        for column in columns {
            if is_function_call(column) {
                let resolved = functions.resolve(column)?;
                if seen_outputs.insert(resolved.alias.clone()) {
                    aggregates.push(resolved);
                }
            } else {
                let resolved = fields.resolve_select(column)?;
                let output = resolved.expr.output_name().unwrap_or(column).to_string();
                if seen_outputs.insert(output) {
                    plain.push(resolved.expr);
                }
            }
        }

        let selected_aliases: HashSet<String> =
            aggregates.iter().map(|a| a.alias.clone()).collect();
        let aggregate_terms = if self.options.use_aggregate_conditions {
            aggregate_terms
        } else {
            Vec::new()
        };
        let having_output = build_having(
            &functions,
            &aggregate_terms,
            &selected_aliases,
            self.options.auto_aggregations,
        )?;
        aggregates.extend(having_output.promoted);
        query.having = having_output.having;

        query.select = plain.clone();
        query
            .select
            .extend(aggregates.iter().map(|a| a.expr.clone()));

        // Aggregation groups by every plain column; array joins group by
        // their own expression as well
        if !aggregates.is_empty() {
            query.groupby = plain;
            query.groupby.extend(
                aggregates
                    .iter()
                    .filter(|a| a.requires_groupby)
                    .map(|a| a.expr.clone()),
            );
        }

        query.orderby = self.resolve_orderby(&query.select)?;
        query.limit = Some(validated_limit(self.options.limit, &self.config)?);
        query.limitby = self.resolve_limitby(&query.select)?;
        query.sample_rate = validated_sample_rate(self.options.sample_rate)?;
        query.turbo = self.options.turbo;
        if let Some(array_column) = &self.options.array_join {
            let resolved = fields.resolve_array(array_column)?;
            if let Expr::Column(column) = resolved.expr {
                query.array_join = Some(column);
            }
        }

        debug!(
            select = query.select.len(),
            conditions = query.where_clause.len(),
            "compiled events query"
        );
        Ok(query)
    }

    /// Compile and execute
    pub async fn run_query(
        &self,
        adapter: &dyn ExecutionAdapter,
        referrer: &str,
    ) -> Result<QueryResult> {
        let query = self.build()?;
        info!(referrer, "running events query");
        adapter.execute(&query, referrer).await
    }

    fn resolve_orderby(&self, select: &[Expr]) -> Result<Vec<OrderBy>> {
        let mut seen = HashSet::new();
        let mut orderby = Vec::new();
        for entry in &self.options.orderby {
            let (name, direction) = orderby_parts(entry);
            if !seen.insert(name) {
                continue;
            }
            let expr = select
                .iter()
                .find(|e| e.output_name() == Some(name))
                .ok_or_else(|| {
                    Error::invalid(format!("Cannot order by {}, it is not selected", name))
                })?;
            orderby.push(OrderBy::new(expr.clone(), direction));
        }
        Ok(orderby)
    }

    fn resolve_limitby(&self, select: &[Expr]) -> Result<Option<LimitBy>> {
        match &self.options.limitby {
            None => Ok(None),
            Some((name, count)) => {
                if !select.iter().any(|e| e.output_name() == Some(name)) {
                    return Err(Error::invalid(format!(
                        "Cannot limit by {}, it is not selected",
                        name
                    )));
                }
                Ok(Some(LimitBy {
                    column: Column::new(name.clone()),
                    count: *count,
                }))
            }
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Shared compilation for the metrics builders
struct MetricsCompilation {
    routed: RoutedQueries,
    groupby_names: Vec<String>,
}

/// Builds grouped queries against the pre-aggregated metrics entities
pub struct MetricsQueryBuilder<'a> {
    params: &'a QueryParams,
    config: BuilderConfig,
    indexer: &'a dyn StringIndexer,
    metric_table: &'a MetricTable,
    selected: Vec<String>,
    terms: Vec<SearchTerm>,
    options: QueryOptions,
}

impl<'a> MetricsQueryBuilder<'a> {
    /// Create a builder; fails when the window starts outside retention
    pub fn new(
        params: &'a QueryParams,
        config: BuilderConfig,
        indexer: &'a dyn StringIndexer,
        metric_table: &'a MetricTable,
    ) -> Result<Self> {
        check_retention(params, &config)?;
        Ok(Self {
            params,
            config,
            indexer,
            metric_table,
            selected: Vec::new(),
            terms: Vec::new(),
            options: QueryOptions::with_aggregate_conditions(),
        })
    }

    /// Set the selected columns and function calls
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the parsed search terms
    pub fn terms<I>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = SearchTerm>,
    {
        self.terms = terms.into_iter().collect();
        self
    }

    /// Set the assembly options
    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    fn compile(&self, bucket: Option<u64>) -> Result<MetricsCompilation> {
        let mut fields = FieldResolver::metrics(self.params, self.indexer);
        let where_builder = WhereBuilder::new(self.params, Some(self.indexer));

        let mut where_clause = where_builder.default_conditions(Dataset::Metrics)?;
        where_clause.extend(where_builder.environment_conditions(&fields)?);

        let (filters, aggregate_terms) = split_terms(&self.terms);
        for term in &filters {
            where_clause.push(where_builder.filter_condition(&mut fields, term)?);
        }

        let functions = FunctionResolver::metrics(
            &fields,
            self.params,
            self.metric_table,
            self.indexer,
            &self.options.functions_acl,
        );

        let columns = dedup_columns(&self.selected);
        if columns.len() > self.config.max_columns {
            return Err(Error::invalid(format!(
                "{} columns selected, the maximum is {}",
                columns.len(),
                self.config.max_columns
            )));
        }

        let mut aggregates: Vec<ResolvedFunction> = Vec::new();
        let mut groupby: Vec<Expr> = Vec::new();
        let mut groupby_names: Vec<String> = Vec::new();
        let mut seen_outputs = HashSet::new();
        for column in columns {
            if is_function_call(column) {
                let resolved = functions.resolve(column)?;
                if seen_outputs.insert(resolved.alias.clone()) {
                    aggregates.push(resolved);
                }
            } else {
                let resolved = fields.resolve_select(column)?;
                let output = resolved.expr.output_name().unwrap_or(column).to_string();
                if seen_outputs.insert(output.clone()) {
                    groupby.push(resolved.expr);
                    groupby_names.push(output);
                }
            }
        }

        // Time-bucketed series group by the bucket column
        if bucket.is_some() {
            let time = Expr::Aliased {
                column: Column::new("timestamp"),
                alias: "time".to_string(),
            };
            groupby.insert(0, time);
            groupby_names.insert(0, "time".to_string());
        }

        if aggregates.is_empty() {
            return Err(Error::incompatible(
                "metrics queries require at least one aggregate".to_string(),
            ));
        }

        let selected_aliases: HashSet<String> =
            aggregates.iter().map(|a| a.alias.clone()).collect();
        let aggregate_terms = if self.options.use_aggregate_conditions {
            aggregate_terms
        } else {
            Vec::new()
        };
        let having_output = build_having(
            &functions,
            &aggregate_terms,
            &selected_aliases,
            self.options.auto_aggregations,
        )?;
        aggregates.extend(having_output.promoted);

        let orderby = self.resolve_orderby(&groupby, &aggregates)?;
        let limit = validated_limit(self.options.limit, &self.config)?;
        let granularity =
            bucket.unwrap_or_else(|| select_granularity(self.params.start, self.params.end));

        let routed = route_by_entity(
            &aggregates,
            &groupby,
            &where_clause,
            &having_output.having,
            &orderby,
            Some(limit),
            Some(granularity),
        )?;
        Ok(MetricsCompilation {
            routed,
            groupby_names,
        })
    }

    /// Compile into per-entity sub-queries, primary first
    pub fn build(&self) -> Result<RoutedQueries> {
        Ok(self.compile(None)?.routed)
    }

    /// Compile and execute, merging per-entity results
    pub async fn run_query(
        &self,
        adapter: &dyn ExecutionAdapter,
        referrer: &str,
    ) -> Result<QueryResult> {
        let compilation = self.compile(None)?;
        run_routed(compilation, adapter, referrer).await
    }

    fn resolve_orderby(
        &self,
        groupby: &[Expr],
        aggregates: &[ResolvedFunction],
    ) -> Result<Vec<OrderBy>> {
        let mut seen = HashSet::new();
        let mut orderby = Vec::new();
        for entry in &self.options.orderby {
            let (name, direction) = orderby_parts(entry);
            if !seen.insert(name) {
                continue;
            }
            if let Some(aggregate) = aggregates.iter().find(|a| a.alias == name) {
                orderby.push(OrderBy::new(aggregate.expr.clone(), direction));
                continue;
            }
            let expr = groupby
                .iter()
                .find(|e| e.output_name() == Some(name))
                .ok_or_else(|| {
                    Error::invalid(format!("Cannot order by {}, it is not selected", name))
                })?;
            orderby.push(OrderBy::new(expr.clone(), direction));
        }
        Ok(orderby)
    }
}

async fn run_routed(
    compilation: MetricsCompilation,
    adapter: &dyn ExecutionAdapter,
    referrer: &str,
) -> Result<QueryResult> {
    let mut results = Vec::with_capacity(compilation.routed.queries.len());
    for entity_query in &compilation.routed.queries {
        info!(referrer, entity = %entity_query.entity, "running metrics sub-query");
        results.push(adapter.execute(&entity_query.query, referrer).await?);
    }
    merge_entity_results(&compilation.groupby_names, results)
}

// ============================================================================
// Metrics time series
// ============================================================================

/// Builds time-bucketed series from the pre-aggregated metrics entities
///
/// Aggregate filter terms make no sense against a series and are dropped;
/// results are keyed and merged by the `time` bucket column.
pub struct TimeseriesMetricsQueryBuilder<'a> {
    inner: MetricsQueryBuilder<'a>,
    interval: u64,
}

impl<'a> TimeseriesMetricsQueryBuilder<'a> {
    /// Create a builder for buckets of `interval` seconds
    pub fn new(
        params: &'a QueryParams,
        config: BuilderConfig,
        indexer: &'a dyn StringIndexer,
        metric_table: &'a MetricTable,
        interval: u64,
    ) -> Result<Self> {
        if interval == 0 {
            return Err(Error::InvalidParams(
                "interval must be a positive number of seconds".into(),
            ));
        }
        let mut inner = MetricsQueryBuilder::new(params, config, indexer, metric_table)?;
        inner.options.use_aggregate_conditions = false;
        Ok(Self { inner, interval })
    }

    /// Set the selected function calls
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner = self.inner.select(columns);
        self
    }

    /// Set the parsed search terms; aggregate terms are dropped
    pub fn terms<I>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = SearchTerm>,
    {
        self.inner = self.inner.terms(terms);
        self
    }

    /// Set the assembly options; aggregate conditions stay disabled
    pub fn options(mut self, options: QueryOptions) -> Self {
        self.inner = self.inner.options(QueryOptions {
            use_aggregate_conditions: false,
            ..options
        });
        self
    }

    /// Compile into per-entity sub-queries, primary first
    pub fn build(&self) -> Result<RoutedQueries> {
        Ok(self.inner.compile(Some(self.interval))?.routed)
    }

    /// Compile and execute, merging per-entity series by time bucket
    pub async fn run_query(
        &self,
        adapter: &dyn ExecutionAdapter,
        referrer: &str,
    ) -> Result<QueryResult> {
        let compilation = self.inner.compile(Some(self.interval))?;
        run_routed(compilation, adapter, referrer).await
    }
}
