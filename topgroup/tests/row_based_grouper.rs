//! Row based limited grouper end to end

use std::num::NonZeroU16;
use std::sync::Arc;

use topgroup::common::config::GroupByQueryConfig;
use topgroup::common::query_context::QueryContext;
use topgroup::exec::aggregator::AggregatorFactory;
use topgroup::exec::aggregator::count::Count;
use topgroup::exec::aggregator::sum::LongSum;
use topgroup::exec::grouper::GrouperError;
use topgroup::exec::grouper::row_based::{
    ResultRow, create_grouper_accumulator_pair, make_grouper_iterator,
};
use topgroup::exec::query::{
    DefaultLimitSpec, DimensionSpec, Granularity, GroupByQuery, OrderByColumnSpec,
};
use topgroup::exec::row::{Row, Value};
use tracing_subscriber::EnvFilter;

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn group_by(
    dimensions: Vec<DimensionSpec>,
    aggregators: Vec<Arc<dyn AggregatorFactory>>,
    limit_spec: Option<DefaultLimitSpec>,
) -> GroupByQuery {
    GroupByQuery {
        dimensions,
        aggregators,
        granularity: Granularity::All,
        interval_start: None,
        limit_spec,
        context: QueryContext::default(),
    }
}

fn page_row(timestamp: i64, page: &str) -> Row {
    Row::new(timestamp, [("page", Value::String(page.to_string()))])
}

fn page_counts(rows: &[ResultRow]) -> Vec<(Value, Value)> {
    rows.iter()
        .map(|row| {
            (
                row.get("page").cloned().unwrap_or(Value::Null),
                row.get("count").cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

fn string(value: &str) -> Value {
    Value::String(value.to_string())
}

#[test]
fn test_limit_by_dimension() {
    init_logger();
    let query = group_by(
        vec![DimensionSpec::new("page")],
        vec![Arc::new(Count::new("count"))],
        Some(DefaultLimitSpec::new(
            vec![OrderByColumnSpec::desc("page")],
            2,
        )),
    );
    let mut buffer = vec![0; 332];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, true, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();
    assert_eq!(grouper.buckets(), 8);

    let pages = ["a"; 5].into_iter().chain(["b"; 3]).chain(["c"; 9]);
    for page in pages {
        assert!(accumulator.accumulate(&mut grouper, page_row(0, page)).unwrap());
    }

    let rows = make_grouper_iterator(&mut grouper, &query, true).collect::<Vec<_>>();
    assert_eq!(
        page_counts(&rows),
        vec![
            (string("c"), Value::Long(9)),
            (string("b"), Value::Long(3)),
        ]
    );
}

#[test]
fn test_limit_by_aggregator_with_swaps() {
    init_logger();
    let mut query = group_by(
        vec![DimensionSpec::new("page")],
        vec![Arc::new(Count::new("count"))],
        Some(DefaultLimitSpec::new(
            vec![OrderByColumnSpec::desc("count")],
            2,
        )),
    );
    query.context.push_down_limit = true;
    let mut buffer = vec![0; 212];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, true, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();
    assert_eq!(grouper.buckets(), 5);
    assert_eq!(grouper.max_size(), 3);

    let pages = ["a", "b", "c", "c", "c", "c", "c", "d", "b", "b", "b"];
    for page in pages {
        assert!(accumulator.accumulate(&mut grouper, page_row(0, page)).unwrap());
    }
    assert_eq!(grouper.growth_count(), 2);

    // Best groups by count, ordered by their keys
    let rows = make_grouper_iterator(&mut grouper, &query, true).collect::<Vec<_>>();
    assert_eq!(
        page_counts(&rows),
        vec![
            (string("b"), Value::Long(3)),
            (string("c"), Value::Long(5)),
        ]
    );
}

#[test]
fn test_dictionary_budget_exhausted() {
    init_logger();
    let mut query = group_by(
        vec![DimensionSpec::new("page")],
        vec![Arc::new(Count::new("count"))],
        Some(DefaultLimitSpec::new(vec![OrderByColumnSpec::asc("page")], 10)),
    );
    // "ab" and "cd" cost 48 bytes each
    query.context.max_merging_dictionary_size = Some(100);
    let mut buffer = vec![0; 4096];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, true, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();

    assert!(accumulator.accumulate(&mut grouper, page_row(0, "ab")).unwrap());
    assert!(accumulator.accumulate(&mut grouper, page_row(0, "cd")).unwrap());
    assert!(!accumulator.accumulate(&mut grouper, page_row(0, "ef")).unwrap());
    assert!(accumulator.accumulate(&mut grouper, page_row(0, "ab")).unwrap());
    assert_eq!(grouper.key_serde().dictionary_estimated_size(), 96);

    let rows = make_grouper_iterator(&mut grouper, &query, true).collect::<Vec<_>>();
    assert_eq!(
        page_counts(&rows),
        vec![
            (string("ab"), Value::Long(2)),
            (string("cd"), Value::Long(1)),
        ]
    );
}

#[test]
fn test_dictionary_budget_is_shared_by_concurrent_groupers() {
    let mut query = group_by(
        vec![DimensionSpec::new("page")],
        vec![Arc::new(Count::new("count"))],
        Some(DefaultLimitSpec::new(vec![OrderByColumnSpec::asc("page")], 10)),
    );
    query.context.max_merging_dictionary_size = Some(100);
    query.context.concurrency = NonZeroU16::new(2).unwrap();
    let mut buffer = vec![0; 4096];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, true, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();

    assert!(accumulator.accumulate(&mut grouper, page_row(0, "ab")).unwrap());
    assert!(!accumulator.accumulate(&mut grouper, page_row(0, "cd")).unwrap());
}

#[test]
fn test_limit_push_down_not_applicable() {
    let config = GroupByQueryConfig::default();
    let mut buffer = vec![0; 4096];

    let mut query = group_by(
        vec![DimensionSpec::new("page")],
        vec![Arc::new(Count::new("count"))],
        None,
    );
    query.context.push_down_limit = true;
    let err = create_grouper_accumulator_pair(&query, true, &config, &mut buffer).unwrap_err();
    assert!(matches!(err, GrouperError::LimitPushDownWithoutLimit));

    query.context.push_down_limit = false;
    let err = create_grouper_accumulator_pair(&query, true, &config, &mut buffer).unwrap_err();
    assert!(matches!(err, GrouperError::LimitPushDownNotApplicable));

    // Ordering by an aggregator needs the explicit flag
    query.limit_spec = Some(DefaultLimitSpec::new(
        vec![OrderByColumnSpec::desc("count")],
        10,
    ));
    let err = create_grouper_accumulator_pair(&query, true, &config, &mut buffer).unwrap_err();
    assert!(matches!(err, GrouperError::LimitPushDownNotApplicable));

    query.context.push_down_limit = true;
    query.limit_spec = Some(DefaultLimitSpec::new(
        vec![OrderByColumnSpec::desc("count")],
        usize::MAX,
    ));
    let err = create_grouper_accumulator_pair(&query, true, &config, &mut buffer).unwrap_err();
    assert!(matches!(err, GrouperError::LimitPushDownNotApplicable));
}

#[test]
fn test_granularity_truncates_raw_rows() {
    init_logger();
    let mut query = group_by(
        vec![DimensionSpec::new("page")],
        vec![
            Arc::new(Count::new("count")),
            Arc::new(LongSum::new("added", "delta")),
        ],
        Some(DefaultLimitSpec::new(vec![OrderByColumnSpec::asc("page")], 10)),
    );
    query.granularity = Granularity::Hour;
    let mut buffer = vec![0; 4096];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, true, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();

    let rows = [
        (600_000, 1),
        (3_000_000, 2),
        (3_900_000, 4),
    ];
    for (timestamp, delta) in rows {
        let row = Row::new(
            timestamp,
            [
                ("page", string("x")),
                ("delta", Value::Long(delta)),
            ],
        );
        assert!(accumulator.accumulate(&mut grouper, row).unwrap());
    }

    let rows = make_grouper_iterator(&mut grouper, &query, true).collect::<Vec<_>>();
    assert_eq!(
        rows,
        vec![
            ResultRow {
                timestamp: Some(0),
                event: vec![
                    ("page".to_string(), string("x")),
                    ("count".to_string(), Value::Long(2)),
                    ("added".to_string(), Value::Long(3)),
                ],
            },
            ResultRow {
                timestamp: Some(3_600_000),
                event: vec![
                    ("page".to_string(), string("x")),
                    ("count".to_string(), Value::Long(1)),
                    ("added".to_string(), Value::Long(4)),
                ],
            },
        ]
    );
}

#[test]
fn test_missing_and_multi_valued_dimensions() {
    init_logger();
    let mut query = group_by(
        vec![DimensionSpec::new("page")],
        vec![Arc::new(Count::new("count"))],
        Some(DefaultLimitSpec::new(vec![OrderByColumnSpec::asc("page")], 10)),
    );
    query.interval_start = Some(1_000);
    let mut buffer = vec![0; 4096];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, true, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();

    let rows = [
        Row::new(5, [("page", Value::Strings(vec!["x".into(), "y".into()]))]),
        Row::new(6, [("page", string("x"))]),
        Row::new(7, [("other", string("z"))]),
        Row::new(8, [("page", Value::Strings(vec![]))]),
    ];
    for row in rows {
        assert!(accumulator.accumulate(&mut grouper, row).unwrap());
    }

    let rows = make_grouper_iterator(&mut grouper, &query, true).collect::<Vec<_>>();
    assert_eq!(
        page_counts(&rows),
        vec![(Value::Null, Value::Long(2)), (string("x"), Value::Long(2))]
    );
    assert!(rows.iter().all(|row| row.timestamp == Some(1_000)));
}

#[test]
fn test_non_raw_input_uses_output_names() {
    init_logger();
    let mut query = group_by(
        vec![DimensionSpec::with_output_name("page", "p")],
        vec![Arc::new(Count::new("count"))],
        Some(DefaultLimitSpec::new(vec![OrderByColumnSpec::desc("p")], 10)),
    );
    query.granularity = Granularity::Hour;
    let mut buffer = vec![0; 4096];
    let (mut grouper, accumulator) =
        create_grouper_accumulator_pair(&query, false, &GroupByQueryConfig::default(), &mut buffer)
            .unwrap();

    let rows = [
        Row::new(12_345, [("p", string("x")), ("page", string("ignored"))]),
        Row::new(12_345, [("p", string("y"))]),
        Row::new(12_345, [("p", string("x"))]),
    ];
    for row in rows {
        assert!(accumulator.accumulate(&mut grouper, row).unwrap());
    }

    let rows = make_grouper_iterator(&mut grouper, &query, true).collect::<Vec<_>>();
    let groups = rows
        .iter()
        .map(|row| (row.timestamp, row.get("p").cloned(), row.get("count").cloned()))
        .collect::<Vec<_>>();
    assert_eq!(
        groups,
        vec![
            (Some(12_345), Some(string("y")), Some(Value::Long(1))),
            (Some(12_345), Some(string("x")), Some(Value::Long(2))),
        ]
    );
}
