//! Upsert generator: turns a [`TableSchema`] into an [`UpsertProgram`], a set of closures
//! specialized per column that parse, encode and merge-or-append incoming rows.
//!
//! The program is immutable and shareable. All mutable ingestion state (bound dictionaries,
//! guard sets, the tuple-offset index, batch counters) lives in an [`UpsertContext`] created
//! by [`UpsertProgram::setup`] and passed explicitly to every operation.
//!
//! Per row, fields are consumed in schema order: one per dimension, then one per metric
//! except `count` metrics, which always contribute `1`.

use crate::dictionary::{Dictionaries, DimensionDict, EXCEEDED_VALUE, OVERFLOW_CODE};
use crate::error::DbError;
use crate::guard::CardinalityGuard;
use crate::record::{MetricLayout, MetricSlot, Record, RecordMerger};
use crate::schema::{
    Aggregation, CardinalityGuardSpec, Dimension, DimensionKind, Metric, MetricKind, TableSchema,
    TimeDimension,
};
use crate::store::{SegmentStats, SegmentStore};
use crate::telemetry::{db_metrics, DbEvent, DbEventListener};
use crate::time::{parse_epoch, parse_pattern, TimeFormat};
use crate::types::{with_num_type, CodeWidth, RawNum};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Merges between two optimize passes.
pub const DEFAULT_UPDATES_BEFORE_OPTIMIZE: u64 = 1_000_000;

/// Per-batch counters, reset by [`UpsertProgram::before_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub rows: u64,
    pub new_recs: u64,
    pub merged_recs: u64,
    pub dictionary_overflows: u64,
    pub guard_substitutions: u64,
    pub optimizations: u64,
}

/// Per-row view of the context handed to dimension parsers.
struct RowEnv<'a> {
    dicts: &'a [Option<Arc<DimensionDict>>],
    now_secs: u64,
}

type DimParser = Box<dyn Fn(&RowEnv<'_>, &str) -> Result<u64, DbError> + Send + Sync>;
type TimeParser = Box<dyn Fn(&str) -> Result<u64, DbError> + Send + Sync>;
type MetricWriter = Box<dyn Fn(&[&str], &mut Record) -> Result<(), DbError> + Send + Sync>;
type StatsUpdater = Box<dyn Fn(&mut SegmentStats, &[u64]) + Send + Sync>;

#[derive(Debug, Clone)]
struct StringBinding {
    index: usize,
    name: String,
    width: CodeWidth,
    cardinality: u64,
}

/// Explicit per-table ingestion state.
#[derive(Debug)]
pub struct UpsertContext {
    table: String,
    dicts: Vec<Option<Arc<DimensionDict>>>,
    guards: Vec<CardinalityGuard>,
    tuple_offsets: HashMap<Box<[u64]>, usize>,
    stats: UpsertStats,
    batch_clock: u64,
    optimize_interval: u64,
    updates_before_optimize: u64,
    events: Arc<dyn DbEventListener>,
}

impl UpsertContext {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn stats(&self) -> UpsertStats {
        self.stats
    }

    /// Number of distinct dimension tuples seen so far.
    pub fn tuple_count(&self) -> usize {
        self.tuple_offsets.len()
    }

    /// Global offset of the record holding `dims`, if any.
    pub fn offset_of(&self, dims: &[u64]) -> Option<usize> {
        self.tuple_offsets.get(dims).copied()
    }

    /// Dictionary bound to the dimension at `index` (string dimensions only).
    pub fn dictionary(&self, index: usize) -> Option<&Arc<DimensionDict>> {
        self.dicts.get(index).and_then(Option::as_ref)
    }

    pub fn guard(&self, dim: usize) -> Option<&CardinalityGuard> {
        self.guards.iter().find(|g| g.dim() == dim)
    }

    pub fn batch_clock(&self) -> u64 {
        self.batch_clock
    }

    fn emit(&self, event: DbEvent) {
        self.events.on_event(event);
    }
}

/// Walks a schema once and emits the specialized row logic.
pub struct UpsertGenerator<'a> {
    schema: &'a TableSchema,
}

impl<'a> UpsertGenerator<'a> {
    pub fn new(schema: &'a TableSchema) -> Self {
        Self { schema }
    }

    pub fn generate(&self) -> Result<UpsertProgram, DbError> {
        let schema = self.schema;
        let layout = MetricLayout::new(&schema.metrics);

        let dim_parsers = schema
            .dimensions
            .iter()
            .map(dimension_parser)
            .collect::<Vec<_>>();

        let mut field = schema.dimensions.len();
        let mut metric_writers = Vec::with_capacity(schema.metrics.len());
        for (pos, metric) in schema.metrics.iter().enumerate() {
            let position = if metric.reads_field() {
                field += 1;
                Some(field - 1)
            } else {
                None
            };
            metric_writers.push(metric_writer(metric, layout.slot(pos), position)?);
        }

        let stats_updaters = schema
            .dimensions
            .iter()
            .filter(|d| d.has_stats())
            .map(stats_updater)
            .collect();

        let string_dims = schema
            .dimensions
            .iter()
            .filter_map(|d| match &d.kind {
                DimensionKind::String(s) => Some(StringBinding {
                    index: d.index,
                    name: d.name.clone(),
                    width: s.width,
                    cardinality: s.cardinality,
                }),
                _ => None,
            })
            .collect();

        let merger = RecordMerger::new(&schema.metrics, &layout);
        Ok(UpsertProgram {
            table: schema.name.clone(),
            dimension_names: schema.dimensions.iter().map(|d| d.name.clone()).collect(),
            field_count: field,
            dim_parsers,
            metric_writers,
            stats_updaters,
            string_dims,
            guard_specs: schema.guards.clone(),
            needs_optimize: schema.has_bitset_metrics() || !schema.guards.is_empty(),
            layout,
            merger,
        })
    }
}

/// The four ingestion operations generated for one schema.
pub struct UpsertProgram {
    table: String,
    dimension_names: Vec<String>,
    field_count: usize,
    dim_parsers: Vec<DimParser>,
    metric_writers: Vec<MetricWriter>,
    stats_updaters: Vec<StatsUpdater>,
    string_dims: Vec<StringBinding>,
    guard_specs: Vec<CardinalityGuardSpec>,
    needs_optimize: bool,
    layout: MetricLayout,
    merger: RecordMerger,
}

impl std::fmt::Debug for UpsertProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsertProgram")
            .field("table", &self.table)
            .field("field_count", &self.field_count)
            .field("stats_dimensions", &self.stats_updaters.len())
            .field("needs_optimize", &self.needs_optimize)
            .finish()
    }
}

impl UpsertProgram {
    /// Number of input fields each row must carry.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn needs_optimize(&self) -> bool {
        self.needs_optimize
    }

    /// Binds the program to the table's dictionaries and creates fresh guard state.
    pub fn setup(
        &self,
        dictionaries: &Dictionaries,
        events: Arc<dyn DbEventListener>,
        updates_before_optimize: u64,
    ) -> Result<UpsertContext, DbError> {
        let mut dicts = vec![None; self.dim_parsers.len()];
        for binding in &self.string_dims {
            dicts[binding.index] = Some(dictionaries.get_or_create(
                &self.table,
                &binding.name,
                binding.width,
                binding.cardinality,
            )?);
        }
        let interval = updates_before_optimize.max(1);
        Ok(UpsertContext {
            table: self.table.clone(),
            dicts,
            guards: self.guard_specs.iter().map(CardinalityGuard::new).collect(),
            tuple_offsets: HashMap::new(),
            stats: UpsertStats::default(),
            batch_clock: now_secs(),
            optimize_interval: interval,
            updates_before_optimize: interval,
            events,
        })
    }

    /// Resets the batch counters and captures the wall clock used by rollup rules.
    pub fn before_batch(&self, ctx: &mut UpsertContext) {
        self.before_batch_at(ctx, now_secs());
    }

    /// Like [`before_batch`](Self::before_batch) with an explicit clock (epoch seconds).
    pub fn before_batch_at(&self, ctx: &mut UpsertContext, now_secs: u64) {
        ctx.stats = UpsertStats::default();
        ctx.batch_clock = now_secs;
    }

    /// Parses one row and merges it into the store.
    ///
    /// Capacity overflows are absorbed (the field becomes the overflow code); malformed
    /// fields fail the row without touching the store.
    pub fn process_row<S: AsRef<str>>(
        &self,
        ctx: &mut UpsertContext,
        store: &mut SegmentStore,
        row: &[S],
    ) -> Result<(), DbError> {
        if row.len() != self.field_count {
            return Err(DbError::RowArity {
                expected: self.field_count,
                actual: row.len(),
            });
        }
        let fields: Vec<&str> = row.iter().map(AsRef::as_ref).collect();

        let env = RowEnv {
            dicts: &ctx.dicts,
            now_secs: ctx.batch_clock,
        };
        let dims = self
            .dim_parsers
            .iter()
            .zip(fields.iter().copied())
            .map(|(parse, field)| parse(&env, field))
            .collect::<Result<Box<[u64]>, DbError>>()?;

        let mut record = self.layout.blank(dims);
        for write in &self.metric_writers {
            write(fields.as_slice(), &mut record)?;
        }

        for binding in &self.string_dims {
            let overflowed = record.dims[binding.index] == OVERFLOW_CODE
                && fields[binding.index] != EXCEEDED_VALUE;
            if overflowed {
                ctx.stats.dictionary_overflows += 1;
                ctx.emit(DbEvent::DictionaryOverflow {
                    table: self.table.clone(),
                    dimension: binding.name.clone(),
                    value: fields[binding.index].to_string(),
                });
            }
        }

        let mut substituted = Vec::new();
        for guard in ctx.guards.iter_mut() {
            if guard.protect(&mut record.dims) {
                substituted.push(guard.dim());
            }
        }
        for dim in substituted {
            ctx.stats.guard_substitutions += 1;
            ctx.emit(DbEvent::CardinalityGuardApplied {
                table: self.table.clone(),
                dimension: self.dimension_names[dim].clone(),
            });
        }

        ctx.stats.rows += 1;
        match ctx.tuple_offsets.get(&record.dims).copied() {
            Some(offset) => {
                let existing = store.get_mut(offset).ok_or_else(|| {
                    DbError::Internal(format!("tuple offset {offset} points past the store"))
                })?;
                self.merger.merge(existing, &record);
                ctx.stats.merged_recs += 1;
                if self.needs_optimize {
                    ctx.updates_before_optimize -= 1;
                    if ctx.updates_before_optimize == 0 {
                        self.optimize(ctx, store);
                    }
                }
            }
            None => {
                let key = record.dims.clone();
                let offset = store.append(record, |stats, dims| {
                    for update in &self.stats_updaters {
                        update(stats, dims);
                    }
                });
                ctx.tuple_offsets.insert(key, offset);
                ctx.stats.new_recs += 1;
            }
        }
        Ok(())
    }

    /// Runs the final optimize pass and returns the batch counters.
    pub fn after_batch(&self, ctx: &mut UpsertContext, store: &mut SegmentStore) -> UpsertStats {
        self.optimize(ctx, store);
        db_metrics::record_upsert_batch(&self.table, &ctx.stats);
        for binding in &self.string_dims {
            if let Some(Ok(size)) = ctx.dicts[binding.index].as_ref().map(|d| d.len()) {
                db_metrics::record_dictionary_size(&self.table, &binding.name, size);
            }
        }
        ctx.stats
    }

    /// Compacts guard sets and stored bitset metrics. No-op for schemas without either.
    pub fn optimize(&self, ctx: &mut UpsertContext, store: &mut SegmentStore) {
        if !self.needs_optimize {
            return;
        }
        let started = Instant::now();
        for guard in ctx.guards.iter_mut() {
            guard.optimize();
        }
        if !self.layout.is_empty() {
            for segment in store.segments_mut() {
                for record in segment.records_mut() {
                    for set in record.sets.iter_mut() {
                        set.optimize();
                    }
                }
            }
        }
        ctx.updates_before_optimize = ctx.optimize_interval;
        ctx.stats.optimizations += 1;

        let duration = started.elapsed();
        db_metrics::record_optimize(&self.table, duration);
        ctx.emit(DbEvent::Optimized {
            table: self.table.clone(),
            duration,
        });
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn invalid_value(column: &str, value: &str) -> DbError {
    DbError::InvalidValue {
        column: column.to_string(),
        value: value.to_string(),
    }
}

/// Longest prefix of `value` that fits `max_len` bytes without splitting a character.
fn truncate_str(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn dimension_parser(dim: &Dimension) -> DimParser {
    let index = dim.index;
    let name = dim.name.clone();
    match &dim.kind {
        DimensionKind::String(s) => {
            let max_length = s.max_length;
            Box::new(move |env: &RowEnv<'_>, value: &str| -> Result<u64, DbError> {
                let value = match max_length {
                    Some(len) => truncate_str(value, len),
                    None => value,
                };
                let dict = env.dicts[index].as_ref().ok_or_else(|| {
                    DbError::Internal(format!("dictionary for {name:?} is not bound"))
                })?;
                Ok(dict.encode_or_create(value)?.unwrap_or(OVERFLOW_CODE))
            })
        }
        DimensionKind::Numeric(num_type) => with_num_type!(*num_type, T => {
            Box::new(move |_: &RowEnv<'_>, value: &str| -> Result<u64, DbError> {
                T::parse(value)
                    .map(RawNum::to_raw)
                    .ok_or_else(|| invalid_value(&name, value))
            }) as DimParser
        }),
        DimensionKind::Bool => {
            Box::new(|_: &RowEnv<'_>, value: &str| -> Result<u64, DbError> {
                Ok(u64::from(value == "true"))
            })
        }
        DimensionKind::Time(time) => time_parser(time, name),
    }
}

fn time_parser(time: &TimeDimension, name: String) -> DimParser {
    let micro = time.micro_precision;
    let parse: TimeParser = match &time.format {
        TimeFormat::Epoch(unit) => {
            let unit = *unit;
            Box::new(move |value: &str| parse_epoch(value, unit, micro))
        }
        TimeFormat::Pattern(pattern) => {
            let pattern = pattern.clone();
            Box::new(move |value: &str| parse_pattern(value, &pattern, micro))
        }
    };
    let check_range = move |ts: u64, value: &str| -> Result<u64, DbError> {
        if !micro && ts > u32::MAX as u64 {
            return Err(invalid_value(&name, value));
        }
        Ok(ts)
    };

    if time.reduction.is_empty() {
        Box::new(move |_: &RowEnv<'_>, value: &str| -> Result<u64, DbError> {
            check_range(parse(value)?, value)
        })
    } else {
        let reduction = time.reduction.clone();
        Box::new(move |env: &RowEnv<'_>, value: &str| -> Result<u64, DbError> {
            let ts = reduction.apply(parse(value)?, env.now_secs, micro);
            check_range(ts, value)
        })
    }
}

fn metric_writer(
    metric: &Metric,
    slot: MetricSlot,
    position: Option<usize>,
) -> Result<MetricWriter, DbError> {
    let name = metric.name.clone();
    let field = |pos: Option<usize>| {
        pos.ok_or_else(|| DbError::Internal(format!("metric {:?} reads no field", metric.name)))
    };
    let writer: MetricWriter = match (&metric.kind, slot) {
        (
            MetricKind::Value {
                agg: Aggregation::Count,
                ..
            },
            MetricSlot::Value(i),
        ) => Box::new(move |_: &[&str], record: &mut Record| -> Result<(), DbError> {
            record.values[i] = 1;
            Ok(())
        }),
        (MetricKind::Value { num_type, .. }, MetricSlot::Value(i)) => {
            let pos = field(position)?;
            with_num_type!(*num_type, T => {
                Box::new(move |fields: &[&str], record: &mut Record| -> Result<(), DbError> {
                    let value = fields[pos];
                    record.values[i] = T::parse(value)
                        .map(RawNum::to_raw)
                        .ok_or_else(|| invalid_value(&name, value))?;
                    Ok(())
                }) as MetricWriter
            })
        }
        (MetricKind::Bitset { num_type }, MetricSlot::Set(s)) => {
            let pos = field(position)?;
            with_num_type!(*num_type, T => {
                Box::new(move |fields: &[&str], record: &mut Record| -> Result<(), DbError> {
                    let value = fields[pos];
                    let raw = T::parse(value)
                        .map(RawNum::to_raw)
                        .ok_or_else(|| invalid_value(&name, value))?;
                    record.sets[s].add(raw);
                    Ok(())
                }) as MetricWriter
            })
        }
        _ => {
            return Err(DbError::Internal(format!(
                "metric {:?} has no storage slot",
                metric.name
            )))
        }
    };
    Ok(writer)
}

fn stats_updater(dim: &Dimension) -> StatsUpdater {
    let i = dim.index;
    with_num_type!(dim.num_type(), T => {
        Box::new(move |stats: &mut SegmentStats, dims: &[u64]| {
            let v = T::from_raw(dims[i]);
            if v < T::from_raw(stats.min[i]) {
                stats.min[i] = dims[i];
            }
            if v > T::from_raw(stats.max[i]) {
                stats.max[i] = dims[i];
            }
        }) as StatsUpdater
    })
}
