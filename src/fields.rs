//! Field resolution: human field names to physical columns
//!
//! Each dataset exposes a table of first-class columns; anything outside the
//! table falls back to tag storage. On the events backend tags are string
//! slots (`tags[foo]`); on the tag-indexed metrics backend the slot is keyed
//! by the integer the indexer assigned to the tag key, and an unknown key is
//! a hard error.
//!
//! `project` is special: it resolves to a transform that maps `project_id`
//! back to the slug, restricted to the projects still in play after any
//! user filter narrowed the selection.

use std::collections::HashMap;

use lazy_static::lazy_static;
use tracing::debug;

use crate::error::{Error, Result};
use crate::expr::{Column, Expr, FunctionExpr};
use crate::indexer::StringIndexer;
use crate::params::QueryParams;
use crate::value::{Value, ValueType};

/// Dataset/backend a query is compiled against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    /// Raw event rows with native and string-tag columns
    Events,
    /// Pre-aggregated, tag-indexed metrics entities
    Metrics,
}

/// A field resolved to its physical representation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn {
    /// Physical expression to select or filter on
    pub expr: Expr,
    /// Declared output type
    pub value_type: ValueType,
    /// Whether the underlying column is array-typed
    pub is_array: bool,
}

impl ResolvedColumn {
    fn scalar(expr: Expr, value_type: ValueType) -> Self {
        Self {
            expr,
            value_type,
            is_array: false,
        }
    }
}

struct FieldDef {
    physical: &'static str,
    value_type: ValueType,
}

lazy_static! {
    /// First-class columns of the events dataset, human name → physical
    static ref EVENTS_FIELDS: HashMap<&'static str, FieldDef> = {
        let mut m = HashMap::new();
        m.insert("user.email", FieldDef { physical: "email", value_type: ValueType::String });
        m.insert("release", FieldDef { physical: "release", value_type: ValueType::String });
        m.insert("message", FieldDef { physical: "message", value_type: ValueType::String });
        m.insert("environment", FieldDef { physical: "environment", value_type: ValueType::String });
        m.insert("event.type", FieldDef { physical: "type", value_type: ValueType::String });
        m.insert("transaction", FieldDef { physical: "transaction", value_type: ValueType::String });
        m.insert("user", FieldDef { physical: "user", value_type: ValueType::String });
        m.insert("timestamp", FieldDef { physical: "timestamp", value_type: ValueType::DateTime });
        m
    };

    /// Array-family fields, human name → flattened dotted physical form
    static ref ARRAY_FIELDS: HashMap<&'static str, FieldDef> = {
        let mut m = HashMap::new();
        m.insert("measurements_key", FieldDef { physical: "measurements.key", value_type: ValueType::String });
        m.insert("measurements_value", FieldDef { physical: "measurements.value", value_type: ValueType::Float64 });
        m.insert("spans_op", FieldDef { physical: "spans.op", value_type: ValueType::String });
        m.insert("spans_group", FieldDef { physical: "spans.group", value_type: ValueType::String });
        m.insert("spans_exclusive_time", FieldDef { physical: "spans.exclusive_time", value_type: ValueType::Float64 });
        m
    };
}

/// Resolves field names for one build
///
/// Holds the dataset, the request parameters and (for the metrics backend)
/// the indexer. The project narrowing set starts as the full selection and
/// shrinks when the condition builder reports an equality/IN filter on
/// project; narrower always wins.
pub struct FieldResolver<'a> {
    dataset: Dataset,
    params: &'a QueryParams,
    indexer: Option<&'a dyn StringIndexer>,
    narrowed_project_ids: Vec<u64>,
}

impl<'a> FieldResolver<'a> {
    /// Create a resolver for the events dataset
    pub fn events(params: &'a QueryParams) -> Self {
        Self {
            dataset: Dataset::Events,
            params,
            indexer: None,
            narrowed_project_ids: params.project_ids(),
        }
    }

    /// Create a resolver for the tag-indexed metrics dataset
    pub fn metrics(params: &'a QueryParams, indexer: &'a dyn StringIndexer) -> Self {
        Self {
            dataset: Dataset::Metrics,
            params,
            indexer: Some(indexer),
            narrowed_project_ids: params.project_ids(),
        }
    }

    /// Active dataset
    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    /// Narrow the project set after a user filter on project
    ///
    /// The transform emitted for the `project` field only enumerates the
    /// surviving projects.
    pub fn narrow_projects(&mut self, ids: &[u64]) {
        let narrowed: Vec<u64> = self
            .narrowed_project_ids
            .iter()
            .copied()
            .filter(|id| ids.contains(id))
            .collect();
        debug!(before = self.narrowed_project_ids.len(), after = narrowed.len(), "narrowed project set");
        self.narrowed_project_ids = narrowed;
    }

    /// Resolve a field for the select list
    ///
    /// Bare selection of an array-family field is rejected; those are only
    /// reachable through an array-join or array-combinator function.
    pub fn resolve_select(&self, field: &str) -> Result<ResolvedColumn> {
        if ARRAY_FIELDS.contains_key(field) {
            return Err(Error::InvalidField(format!(
                "{} is an array column and cannot be selected directly",
                field
            )));
        }
        self.resolve(field)
    }

    /// Resolve a field appearing as a filter key or function argument
    pub fn resolve(&self, field: &str) -> Result<ResolvedColumn> {
        match field {
            "project" => Ok(ResolvedColumn::scalar(
                self.project_transform(),
                ValueType::String,
            )),
            "project.id" | "project_id" => Ok(ResolvedColumn::scalar(
                Expr::column("project_id"),
                ValueType::UInt64,
            )),
            _ => match self.dataset {
                Dataset::Events => self.resolve_events_field(field),
                Dataset::Metrics => self.resolve_metrics_field(field),
            },
        }
    }

    /// Resolve an array-family field for use inside an array function
    ///
    /// Fails when the field is not array-typed.
    pub fn resolve_array(&self, field: &str) -> Result<ResolvedColumn> {
        match ARRAY_FIELDS.get(field) {
            Some(def) => Ok(ResolvedColumn {
                expr: Expr::column(def.physical),
                value_type: def.value_type,
                is_array: true,
            }),
            None => Err(Error::invalid(format!(
                "{} is not a valid array column",
                field
            ))),
        }
    }

    fn resolve_events_field(&self, field: &str) -> Result<ResolvedColumn> {
        if let Some(def) = EVENTS_FIELDS.get(field) {
            let expr = if def.physical == field {
                Expr::column(def.physical)
            } else {
                Expr::Aliased {
                    column: Column::new(def.physical),
                    alias: field.to_string(),
                }
            };
            return Ok(ResolvedColumn::scalar(expr, def.value_type));
        }

        // Anything else is a string tag slot
        Ok(ResolvedColumn::scalar(
            Expr::Aliased {
                column: Column::new(format!("tags[{}]", field)),
                alias: field.to_string(),
            },
            ValueType::String,
        ))
    }

    fn resolve_metrics_field(&self, field: &str) -> Result<ResolvedColumn> {
        match field {
            "timestamp" => {
                return Ok(ResolvedColumn::scalar(
                    Expr::column("timestamp"),
                    ValueType::DateTime,
                ))
            }
            "org_id" | "metric_id" => {
                return Ok(ResolvedColumn::scalar(
                    Expr::column(field),
                    ValueType::UInt64,
                ))
            }
            _ => {}
        }

        // Everything else is an interned tag slot; the key must have been
        // seen by the indexer before it can be queried.
        let indexer = self
            .indexer
            .ok_or_else(|| Error::Indexer("metrics resolver constructed without indexer".into()))?;
        let id = indexer
            .lookup(field)
            .ok_or_else(|| Error::TagKeyNotFound(field.to_string()))?;
        Ok(ResolvedColumn::scalar(
            Expr::Aliased {
                column: Column::new(format!("tags[{}]", id)),
                alias: field.to_string(),
            },
            ValueType::UInt64,
        ))
    }

    /// The id → slug transform emitted for the `project` field
    ///
    /// Enumerates only the projects surviving narrowing: filtering to a
    /// single project leaves a single-entry lookup table.
    pub fn project_transform(&self) -> Expr {
        let projects: Vec<_> = self
            .params
            .projects
            .iter()
            .filter(|p| self.narrowed_project_ids.contains(&p.id))
            .collect();
        let ids: Vec<Value> = projects.iter().map(|p| Value::UInt(p.id)).collect();
        let slugs: Vec<Value> = projects
            .iter()
            .map(|p| Value::Str(p.slug.clone()))
            .collect();
        Expr::Function(FunctionExpr::aliased(
            "transform",
            vec![
                Expr::column("project_id"),
                Expr::List(ids),
                Expr::List(slugs),
                Expr::Literal(Value::Str(String::new())),
            ],
            "project",
        ))
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
            vec![Project::new(1, "backend"), Project::new(2, "frontend")],
            Utc.with_ymd_and_hms(2015, 5, 18, 10, 15, 1).unwrap(),
            Utc.with_ymd_and_hms(2015, 5, 19, 10, 15, 1).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let params = params();
        let resolver = FieldResolver::events(&params);
        assert_eq!(
            resolver.resolve("user.email").unwrap(),
            resolver.resolve("user.email").unwrap()
        );
    }

    #[test]
    fn test_aliased_first_class_field() {
        let params = params();
        let resolver = FieldResolver::events(&params);
        let resolved = resolver.resolve("user.email").unwrap();
        assert_eq!(
            resolved.expr,
            Expr::Aliased {
                column: Column::new("email"),
                alias: "user.email".to_string(),
            }
        );

        // A field whose physical name matches stays bare
        let release = resolver.resolve("release").unwrap();
        assert_eq!(release.expr, Expr::column("release"));
    }

    #[test]
    fn test_unknown_events_field_is_string_tag() {
        let params = params();
        let resolver = FieldResolver::events(&params);
        let resolved = resolver.resolve("customer_tier").unwrap();
        assert_eq!(
            resolved.expr,
            Expr::Aliased {
                column: Column::new("tags[customer_tier]"),
                alias: "customer_tier".to_string(),
            }
        );
        assert_eq!(resolved.value_type, ValueType::String);
    }

    #[test]
    fn test_metrics_tag_requires_interned_key() {
        let params = params();
        let indexer = MemoryIndexer::new();
        let transaction_id = indexer.record("transaction");
        let resolver = FieldResolver::metrics(&params, &indexer);

        let resolved = resolver.resolve("transaction").unwrap();
        assert_eq!(
            resolved.expr,
            Expr::Aliased {
                column: Column::new(format!("tags[{}]", transaction_id)),
                alias: "transaction".to_string(),
            }
        );

        match resolver.resolve("never_interned") {
            Err(Error::TagKeyNotFound(key)) => assert_eq!(key, "never_interned"),
            other => panic!("expected TagKeyNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_array_field_selection_rejected() {
        let params = params();
        let resolver = FieldResolver::events(&params);
        assert!(matches!(
            resolver.resolve_select("measurements_key"),
            Err(Error::InvalidField(_))
        ));
        // But the array resolution path accepts it
        let resolved = resolver.resolve_array("measurements_key").unwrap();
        assert!(resolved.is_array);
        assert_eq!(resolved.expr, Expr::column("measurements.key"));
    }

    #[test]
    fn test_non_array_field_rejected_by_array_resolution() {
        let params = params();
        let resolver = FieldResolver::events(&params);
        match resolver.resolve_array("stuff") {
            Err(Error::InvalidSearchQuery(msg)) => {
                assert_eq!(msg, "stuff is not a valid array column")
            }
            other => panic!("expected InvalidSearchQuery, got {:?}", other),
        }
    }

    #[test]
    fn test_project_transform_narrowing() {
        let params = params();
        let mut resolver = FieldResolver::events(&params);

        // Unnarrowed: both projects enumerated
        match resolver.project_transform() {
            Expr::Function(f) => {
                assert_eq!(f.args[1], Expr::List(vec![Value::UInt(1), Value::UInt(2)]));
            }
            other => panic!("expected transform function, got {:?}", other),
        }

        resolver.narrow_projects(&[1]);
        match resolver.project_transform() {
            Expr::Function(f) => {
                assert_eq!(f.args[1], Expr::List(vec![Value::UInt(1)]));
                assert_eq!(f.args[2], Expr::List(vec![Value::Str("backend".into())]));
            }
            other => panic!("expected transform function, got {:?}", other),
        }
    }
}
