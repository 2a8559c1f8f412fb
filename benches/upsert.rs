
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use strata::filter::FilterGenerator;
use strata::{AggregateQuery, DbConfig, DbCore, Filter, RelOp};

fn make_db(segment_size: usize) -> DbCore {
    DbCore::with_config(DbConfig {
        tables: vec![datasets::events_table("events", segment_size)],
        ..DbConfig::default()
    })
    .expect("db init")
}

fn bench_upsert_fixed_dataset(c: &mut Criterion) {
    let rows = datasets::generate_rows(datasets::DEFAULT_SEED, 50_000, 200, 5_000);

    let mut group = c.benchmark_group("upsert");
    group.bench_function("load_50k_rows", |b| {
        b.iter_batched(
            || make_db(65_536),
            |db| {
                let report = db.load("events", black_box(&rows)).unwrap();
                black_box(report.stats);
            },
            BatchSize::LargeInput,
        )
    });
    group.bench_function("merge_50k_rows_into_loaded_table", |b| {
        b.iter_batched(
            || {
                let db = make_db(65_536);
                db.load("events", &rows).unwrap();
                db
            },
            |db| {
                let report = db.load("events", black_box(&rows)).unwrap();
                black_box(report.stats);
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_query_fixed_dataset(c: &mut Criterion) {
    let rows = datasets::generate_rows(datasets::DEFAULT_SEED, 200_000, 200, 5_000);
    let db = make_db(4_096);
    db.load("events", &rows).expect("load");

    let mut group = c.benchmark_group("query");
    let by_country = AggregateQuery {
        dimensions: vec!["country".to_string()],
        metrics: vec!["count".to_string(), "revenue".to_string(), "users".to_string()],
        filter: None,
    };
    group.bench_function("group_by_country_full_scan", |b| {
        b.iter(|| black_box(db.query("events", black_box(&by_country)).unwrap()))
    });

    // Time is ascending in the dataset, so a narrow window prunes most segments.
    let windowed = AggregateQuery {
        filter: Some(Filter::and(vec![
            Filter::rel("time", RelOp::Ge, "2019-01-05 00:00:00"),
            Filter::rel("time", RelOp::Lt, "2019-01-06 00:00:00"),
            Filter::in_values("event_name", &["purchase", "install"]),
        ])),
        ..by_country.clone()
    };
    group.bench_function("group_by_country_time_window", |b| {
        b.iter(|| black_box(db.query("events", black_box(&windowed)).unwrap()))
    });
    group.finish();

    let table = db.table("events").expect("table");
    let filter = windowed.filter.clone().expect("filter");
    c.bench_function("filter_compile_and_pack", |b| {
        b.iter(|| {
            let generator = FilterGenerator::new(table.schema());
            let compiled = generator.generate(black_box(&filter)).unwrap();
            let args = generator.pack_args(&filter, db.dictionaries()).unwrap();
            black_box((compiled, args))
        })
    });
}

criterion_group!(benches, bench_upsert_fixed_dataset, bench_query_fixed_dataset);
criterion_main!(benches);
