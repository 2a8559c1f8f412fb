//! Aggregate query execution over a table's segment store.

use crate::dictionary::{Dictionaries, EXCEEDED_VALUE, OVERFLOW_CODE};
use crate::error::DbError;
use crate::filter::{CompiledFilter, Filter, FilterGenerator, FilterSpec};
use crate::record::{MetricLayout, MetricSlot, Record, RecordMerger};
use crate::schema::{deserialize_str, DimensionKind, Metric, TableSchema};
use crate::store::{Segment, SegmentStore};

use rayon::prelude::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Group-by aggregation: one output row per distinct combination of `dimensions`, with
/// `metrics` merged using each metric's own aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateQuery {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub filter: Option<Filter>,
}

/// Query as written in a query file.
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    pub filter: Option<FilterSpec>,
}

impl QuerySpec {
    pub fn from_toml_str(s: &str) -> Result<Self, DbError> {
        deserialize_str(s, config::FileFormat::Toml)
    }

    pub fn from_json_str(s: &str) -> Result<Self, DbError> {
        deserialize_str(s, config::FileFormat::Json)
    }

    /// Splits into the target table name and the query.
    pub fn into_query(self) -> Result<(String, AggregateQuery), DbError> {
        let filter = self.filter.map(Filter::try_from).transpose()?;
        Ok((
            self.table,
            AggregateQuery {
                dimensions: self.dimensions,
                metrics: self.metrics,
                filter,
            },
        ))
    }
}

/// Execution counters for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub scanned_segments: usize,
    pub skipped_segments: usize,
    pub scanned_records: usize,
    pub aggregated_records: usize,
    pub output_records: usize,
    pub compile_time: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Requested dimensions followed by requested metrics.
    pub columns: Vec<String>,
    /// Rendered rows, sorted.
    pub rows: Vec<Vec<String>>,
    pub stats: QueryStats,
}

/// Per-segment partial aggregate, reduced across rayon workers.
#[derive(Default)]
struct Partial {
    groups: HashMap<Box<[u64]>, Record>,
    scanned_segments: usize,
    skipped_segments: usize,
    scanned_records: usize,
    aggregated_records: usize,
}

impl Partial {
    fn absorb(mut self, other: Partial, merger: &RecordMerger) -> Partial {
        let (mut big, small) = if self.groups.len() >= other.groups.len() {
            (std::mem::take(&mut self.groups), other.groups)
        } else {
            (other.groups, std::mem::take(&mut self.groups))
        };
        for (key, record) in small {
            match big.get_mut(&key) {
                Some(existing) => merger.merge(existing, &record),
                None => {
                    big.insert(key, record);
                }
            }
        }
        Partial {
            groups: big,
            scanned_segments: self.scanned_segments + other.scanned_segments,
            skipped_segments: self.skipped_segments + other.skipped_segments,
            scanned_records: self.scanned_records + other.scanned_records,
            aggregated_records: self.aggregated_records + other.aggregated_records,
        }
    }
}

/// Runs `query` against `store`.
///
/// The filter is compiled and its literals decoded once; segments are then scanned in
/// parallel, skipping those whose statistics rule out any match.
pub fn execute_aggregate(
    schema: &TableSchema,
    dicts: &Dictionaries,
    store: &SegmentStore,
    query: &AggregateQuery,
) -> Result<QueryResult, DbError> {
    let started = Instant::now();

    let group_dims = query
        .dimensions
        .iter()
        .map(|name| {
            schema
                .dimension(name)
                .ok_or_else(|| DbError::ColumnNotFound(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let selected: Vec<Metric> = query
        .metrics
        .iter()
        .map(|name| {
            schema
                .metric(name)
                .cloned()
                .ok_or_else(|| DbError::ColumnNotFound(name.clone()))
        })
        .collect::<Result<_, _>>()?;

    let table_layout = MetricLayout::new(&schema.metrics);
    let layout = MetricLayout::new(&selected);
    let merger = RecordMerger::new(&selected, &layout);
    let projection: Vec<(MetricSlot, MetricSlot)> = selected
        .iter()
        .enumerate()
        .map(|(pos, m)| (table_layout.slot(m.index), layout.slot(pos)))
        .collect();
    let key_dims: Vec<usize> = group_dims.iter().map(|d| d.index).collect();

    let compiled = match &query.filter {
        Some(filter) => {
            let generator = FilterGenerator::new(schema);
            let compiled = generator.generate(filter)?;
            let args = generator.pack_args(filter, dicts)?;
            compiled.check_args(&args)?;
            Some((compiled, args))
        }
        None => None,
    };
    let compile_time = started.elapsed();

    let scan_segment = |segment: &Segment| -> Partial {
        let mut partial = Partial::default();
        if let Some((filter, args)) = &compiled {
            if !filter.may_match_segment(segment.stats(), args) {
                partial.skipped_segments = 1;
                return partial;
            }
        }
        partial.scanned_segments = 1;
        for record in segment.records() {
            partial.scanned_records += 1;
            if let Some((filter, args)) = &compiled {
                if !filter.matches(record, args) {
                    continue;
                }
            }
            partial.aggregated_records += 1;
            let row = project(record, &key_dims, &projection, &layout);
            match partial.groups.get_mut(&row.dims) {
                Some(existing) => merger.merge(existing, &row),
                None => {
                    partial.groups.insert(row.dims.clone(), row);
                }
            }
        }
        partial
    };

    let partial = store
        .segments()
        .par_iter()
        .map(scan_segment)
        .reduce(Partial::default, |a, b| a.absorb(b, &merger));

    let mut rows = Vec::with_capacity(partial.groups.len());
    for record in partial.groups.values() {
        let mut row = Vec::with_capacity(key_dims.len() + selected.len());
        for (pos, dim) in group_dims.iter().enumerate() {
            row.push(render_dimension(schema, dicts, dim.index, record.dims[pos])?);
        }
        for (pos, metric) in selected.iter().enumerate() {
            row.push(match layout.slot(pos) {
                MetricSlot::Value(i) => metric.num_type().render_raw(record.values[i]),
                MetricSlot::Set(i) => record.sets[i].cardinality().to_string(),
            });
        }
        rows.push(row);
    }
    rows.sort();

    let stats = QueryStats {
        scanned_segments: partial.scanned_segments,
        skipped_segments: partial.skipped_segments,
        scanned_records: partial.scanned_records,
        aggregated_records: partial.aggregated_records,
        output_records: rows.len(),
        compile_time,
        elapsed: started.elapsed(),
    };
    Ok(QueryResult {
        columns: query
            .dimensions
            .iter()
            .chain(query.metrics.iter())
            .cloned()
            .collect(),
        rows,
        stats,
    })
}

/// Compiles a filter without running it, for inspection.
pub fn explain_filter(schema: &TableSchema, filter: &Filter) -> Result<CompiledFilter, DbError> {
    FilterGenerator::new(schema).generate(filter)
}

fn project(
    record: &Record,
    key_dims: &[usize],
    projection: &[(MetricSlot, MetricSlot)],
    layout: &MetricLayout,
) -> Record {
    let key: Box<[u64]> = key_dims.iter().map(|&i| record.dims[i]).collect();
    let mut row = layout.blank(key);
    for &(src, dst) in projection {
        match (src, dst) {
            (MetricSlot::Value(s), MetricSlot::Value(d)) => row.values[d] = record.values[s],
            (MetricSlot::Set(s), MetricSlot::Set(d)) => row.sets[d] = record.sets[s].clone(),
            _ => {}
        }
    }
    row
}

fn render_dimension(
    schema: &TableSchema,
    dicts: &Dictionaries,
    index: usize,
    raw: u64,
) -> Result<String, DbError> {
    let dim = &schema.dimensions[index];
    Ok(match &dim.kind {
        DimensionKind::String(_) => match dicts.get(&schema.name, &dim.name)? {
            Some(dict) => match dict.value(raw)? {
                Some(value) => value,
                None => raw.to_string(),
            },
            None if raw == OVERFLOW_CODE => EXCEEDED_VALUE.to_string(),
            None => raw.to_string(),
        },
        DimensionKind::Bool => (raw != 0).to_string(),
        _ => dim.num_type().render_raw(raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_spec_from_toml() {
        let spec = QuerySpec::from_toml_str(
            r#"
table = "events"
dimensions = ["country"]
metrics = ["revenue"]

[filter]
op = "ne"
column = "country"
value = "IL"
"#,
        )
        .unwrap();
        let (table, query) = spec.into_query().unwrap();
        assert_eq!(table, "events");
        assert_eq!(query.dimensions, vec!["country".to_string()]);
        assert_eq!(query.filter, Some(Filter::ne("country", "IL")));
    }

    #[test]
    fn partials_merge_groups() {
        use crate::schema::{Aggregation, MetricKind};
        use crate::types::NumType;

        let metrics = vec![Metric {
            index: 0,
            name: "count".to_string(),
            kind: MetricKind::Value { num_type: NumType::ULong, agg: Aggregation::Count },
        }];
        let layout = MetricLayout::new(&metrics);
        let merger = RecordMerger::new(&metrics, &layout);
        let group = |k: u64, n: u64| {
            let mut r = layout.blank(vec![k].into_boxed_slice());
            r.values[0] = n;
            (r.dims.clone(), r)
        };

        let mut a = Partial { scanned_segments: 1, ..Partial::default() };
        a.groups.extend([group(1, 2), group(2, 1)]);
        let mut b = Partial { skipped_segments: 1, ..Partial::default() };
        b.groups.extend([group(1, 3)]);

        let merged = a.absorb(b, &merger);
        assert_eq!(merged.groups.len(), 2);
        assert_eq!(merged.groups[&[1u64][..]].values[0], 5);
        assert_eq!((merged.scanned_segments, merged.skipped_segments), (1, 1));
    }
}
