//! Limited grouper

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use topgroup::common::config::GroupByQueryConfig;
use topgroup::common::query_context::QueryContext;
use topgroup::exec::aggregator::count::Count;
use topgroup::exec::aggregator::sum::LongSum;
use topgroup::exec::grouper::row_based::{create_grouper_accumulator_pair, make_grouper_iterator};
use topgroup::exec::query::{
    DefaultLimitSpec, DimensionSpec, Granularity, GroupByQuery, OrderByColumnSpec,
};
use topgroup::exec::row::{Row, Value};

const NUM_ROWS: usize = 100_000;
const BUFFER_SIZE: usize = 1 << 20;

fn make_rows(cardinality: u64) -> Vec<Row> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..NUM_ROWS)
        .map(|index| {
            Row::new(
                index as i64,
                [
                    (
                        "page",
                        Value::String(format!("page-{}", rng.gen_range(0..cardinality))),
                    ),
                    ("delta", Value::Long(rng.gen_range(0..1000))),
                ],
            )
        })
        .collect()
}

fn make_query(order_by: OrderByColumnSpec) -> GroupByQuery {
    let context = QueryContext {
        push_down_limit: true,
        ..Default::default()
    };
    GroupByQuery {
        dimensions: vec![DimensionSpec::new("page")],
        aggregators: vec![
            Arc::new(Count::new("count")),
            Arc::new(LongSum::new("added", "delta")),
        ],
        granularity: Granularity::All,
        interval_start: None,
        limit_spec: Some(DefaultLimitSpec::new(vec![order_by], 100)),
        context,
    }
}

fn grouper_benchmark(c: &mut Criterion) {
    let config = GroupByQueryConfig::default();
    let mut buffer = vec![0; BUFFER_SIZE];
    let mut group = c.benchmark_group("limited_grouper");
    for cardinality in [1_000, 100_000] {
        let rows = make_rows(cardinality);
        for (name, order_by) in [
            ("order_by_dimension", OrderByColumnSpec::asc("page")),
            ("order_by_count", OrderByColumnSpec::desc("count")),
        ] {
            let query = make_query(order_by);
            group.bench_with_input(BenchmarkId::new(name, cardinality), &rows, |b, rows| {
                b.iter(|| {
                    let (mut grouper, accumulator) =
                        create_grouper_accumulator_pair(&query, true, &config, &mut buffer)
                            .unwrap();
                    for row in rows {
                        accumulator.accumulate(&mut grouper, row.clone()).unwrap();
                    }
                    make_grouper_iterator(&mut grouper, &query, true).count()
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, grouper_benchmark);
criterion_main!(benches);
