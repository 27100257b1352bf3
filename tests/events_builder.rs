//! Integration tests for the events query builder

use chrono::{Duration, Utc};
use sift::{
    AggregateFilter, BuilderConfig, Cond, Condition, Error, EventsQueryBuilder, Expr, FilterTerm,
    MockAdapter, Op, Project, QueryOptions, QueryParams, QueryResult, ResultMeta, SearchOp, Value,
    ValueType,
};

fn params() -> QueryParams {
    let end = Utc::now();
    QueryParams::new(
        Some(1),
        vec![Project::new(1, "backend"), Project::new(2, "frontend")],
        end - Duration::hours(24),
        end,
    )
    .unwrap()
}

fn builder(params: &QueryParams) -> EventsQueryBuilder<'_> {
    EventsQueryBuilder::new(params, BuilderConfig::default()).unwrap()
}

#[test]
fn test_default_conditions_scope_every_query() {
    let params = params();
    let query = builder(&params).select(["transaction"]).build().unwrap();

    assert_eq!(query.entity, "events");
    assert_eq!(
        query.where_clause[0],
        Cond::Leaf(Condition::new(
            Expr::column("timestamp"),
            Op::Gte,
            Value::Str(params.start.to_rfc3339()),
        ))
    );
    assert_eq!(
        query.where_clause[1],
        Cond::Leaf(Condition::new(
            Expr::column("timestamp"),
            Op::Lt,
            Value::Str(params.end.to_rfc3339()),
        ))
    );
    assert_eq!(
        query.where_clause[2],
        Cond::Leaf(Condition::with_list(
            Expr::column("project_id"),
            Op::In,
            vec![Value::UInt(1), Value::UInt(2)],
        ))
    );
}

#[test]
fn test_environment_mixes_unset_and_named() {
    let params = params().with_environments(vec![String::new(), "prod".to_string()]);
    let query = builder(&params).select(["transaction"]).build().unwrap();

    assert_eq!(
        query.where_clause[3],
        Cond::Or(vec![
            Condition::is_null(Expr::column("environment")).into(),
            Condition::new(Expr::column("environment"), Op::Eq, "prod").into(),
        ])
    );
}

#[test]
fn test_project_slug_filter_narrows_the_transform() {
    let params = params();
    let query = builder(&params)
        .select(["project", "count()"])
        .terms([FilterTerm::eq("project", "frontend").into()])
        .build()
        .unwrap();

    // Only the surviving project is enumerated in the slug transform
    match &query.select[0] {
        Expr::Function(f) => {
            assert_eq!(f.name, "transform");
            assert_eq!(f.args[1], Expr::List(vec![Value::UInt(2)]));
            assert_eq!(f.args[2], Expr::List(vec![Value::Str("frontend".into())]));
        }
        other => panic!("expected transform function, got {:?}", other),
    }
}

#[test]
fn test_unselected_project_slug_is_rejected() {
    let params = params();
    let err = builder(&params)
        .select(["count()"])
        .terms([FilterTerm::eq("project", "mobile").into()])
        .build()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid query. Project(s) mobile do not exist or are not actively selected."
    );
}

#[test]
fn test_count_if_alias_distinguishes_quoted_literals() {
    let params = params();
    let query = builder(&params)
        .select([
            "count_if(event.type,equals,transaction)",
            r#"count_if(event.type,notEquals,"transaction")"#,
        ])
        .build()
        .unwrap();

    let aliases: Vec<_> = query
        .select
        .iter()
        .filter_map(|e| e.output_name())
        .collect();
    assert_eq!(
        aliases,
        vec![
            "count_if_event_type_equals_transaction",
            "count_if_event_type_notEquals__transaction",
        ]
    );
}

#[test]
fn test_array_combinator_needs_acl_and_array_column() {
    let params = params();

    let err = builder(&params)
        .select(["sum_array(measurements_value)"])
        .build()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid query. sum_array: no access to private function"
    );

    let mut options = QueryOptions::with_aggregate_conditions();
    options.functions_acl = vec!["sum_array".to_string()];
    let query = builder(&params)
        .select(["sum_array(measurements_value)"])
        .options(options.clone())
        .build()
        .unwrap();
    assert_eq!(
        query.select[0].output_name(),
        Some("sum_array_measurements_value")
    );

    let err = builder(&params)
        .select(["sum_array(transaction)"])
        .options(options)
        .build()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid query. transaction is not a valid array column"
    );
}

#[test]
fn test_array_join_function_joins_the_groupby() {
    let params = params();
    let mut options = QueryOptions::with_aggregate_conditions();
    options.functions_acl = vec!["array_join".to_string()];
    let query = builder(&params)
        .select(["array_join(measurements_key)", "count()"])
        .options(options)
        .build()
        .unwrap();

    assert!(query
        .groupby
        .iter()
        .any(|e| e.output_name() == Some("array_join_measurements_key")));
}

#[test]
fn test_aggregate_condition_promotes_when_auto_aggregation_on() {
    let params = params();
    let terms = [AggregateFilter::new("count_unique(user)", SearchOp::Gt, 10i64).into()];

    let err = builder(&params)
        .select(["transaction", "count()"])
        .terms(terms.clone())
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSearchQuery(_)));

    let mut options = QueryOptions::with_aggregate_conditions();
    options.auto_aggregations = true;
    let query = builder(&params)
        .select(["transaction", "count()"])
        .terms(terms)
        .options(options)
        .build()
        .unwrap();

    assert!(query
        .select
        .iter()
        .any(|e| e.output_name() == Some("count_unique_user")));
    assert_eq!(query.having.len(), 1);
}

#[test]
fn test_aggregate_conditions_can_be_disabled() {
    let params = params();
    let options = QueryOptions::default();
    assert!(!options.use_aggregate_conditions);
    let query = builder(&params)
        .select(["transaction", "count()"])
        .terms([AggregateFilter::new("count()", SearchOp::Gt, 10i64).into()])
        .options(options)
        .build()
        .unwrap();
    assert!(query.having.is_empty());
}

#[test]
fn test_limitby_must_reference_a_selected_column() {
    let params = params();
    let mut options = QueryOptions::with_aggregate_conditions();
    options.limitby = Some(("transaction".to_string(), 5));
    let query = builder(&params)
        .select(["transaction", "count()"])
        .options(options)
        .build()
        .unwrap();
    let limitby = query.limitby.unwrap();
    assert_eq!(limitby.column.name, "transaction");
    assert_eq!(limitby.count, 5);

    let mut options = QueryOptions::with_aggregate_conditions();
    options.limitby = Some(("message".to_string(), 5));
    assert!(matches!(
        builder(&params)
            .select(["transaction", "count()"])
            .options(options)
            .build(),
        Err(Error::InvalidSearchQuery(_))
    ));
}

#[test]
fn test_turbo_and_sample_rate_pass_through() {
    let params = params();
    let mut options = QueryOptions::with_aggregate_conditions();
    options.turbo = true;
    options.sample_rate = Some(0.25);
    let query = builder(&params)
        .select(["transaction"])
        .options(options)
        .build()
        .unwrap();
    assert!(query.turbo);
    assert_eq!(query.sample_rate, Some(0.25));
}

#[tokio::test]
async fn test_run_query_hands_the_compiled_query_to_the_adapter() {
    let params = params();
    let adapter = MockAdapter::new();
    let mut canned = QueryResult::default();
    canned.meta = ResultMeta::new([
        ("transaction", ValueType::String),
        ("count", ValueType::UInt64),
    ]);
    canned.rows = vec![[
        ("transaction".to_string(), Value::Str("/checkout".into())),
        ("count".to_string(), Value::UInt(41)),
    ]
    .into_iter()
    .collect()];
    adapter.respond("events", canned);

    let result = builder(&params)
        .select(["transaction", "count()"])
        .run_query(&adapter, "api.performance.summary")
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["count"], Value::UInt(41));

    let executed = adapter.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].entity, "events");
    assert_eq!(executed[0].limit, Some(50));
}
