//! Filter generator.
//!
//! A [`Filter`] tree is compiled against a table schema into three pieces that share one
//! positional argument contract:
//!
//! 1. argument bindings: one typed local `farg{i}` per leaf operand, in traversal order
//!    (membership leaves contribute one per listed value);
//! 2. the full per-record predicate;
//! 3. the segment-skip predicate, evaluated on per-segment min/max statistics only.
//!
//! Literal operands are decoded once per query by [`FilterGenerator::pack_args`], which
//! walks the tree in the same order and produces the raw argument array the compiled
//! predicates index into.
//!
//! The skip predicate is conservative: it only ever returns `false` for a segment when no
//! record in it can satisfy the full predicate. Negations are pushed down to the leaves
//! (De Morgan) so that a negated range test never excludes a segment it should keep.

use crate::dictionary::Dictionaries;
use crate::error::DbError;
use crate::record::{MetricLayout, MetricSlot, Record};
use crate::schema::{deserialize_str, Column, DimensionKind, MetricKind, TableSchema};
use crate::store::SegmentStats;
use crate::time::parse_time_literal;
use crate::types::{with_num_type, NumType, RawNum};

use serde::Deserialize;
use std::fmt;

/// Relational operator of a leaf filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    /// Accepts the short names (`eq`, `ne`, ...) and the symbols (`=`, `!=`, ...).
    pub fn parse(op: &str) -> Option<RelOp> {
        Some(match op {
            "eq" | "=" | "==" => RelOp::Eq,
            "ne" | "!=" | "<>" => RelOp::Ne,
            "lt" | "<" => RelOp::Lt,
            "le" | "<=" => RelOp::Le,
            "gt" | ">" => RelOp::Gt,
            "ge" | ">=" => RelOp::Ge,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            RelOp::Eq => "==",
            RelOp::Ne => "!=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
        }
    }

    /// Operator of `!(x op v)`.
    pub fn negate(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Ne,
            RelOp::Ne => RelOp::Eq,
            RelOp::Lt => RelOp::Ge,
            RelOp::Le => RelOp::Gt,
            RelOp::Gt => RelOp::Le,
            RelOp::Ge => RelOp::Lt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeOp {
    And,
    Or,
}

impl CompositeOp {
    fn symbol(self) -> &'static str {
        match self {
            CompositeOp::And => " & ",
            CompositeOp::Or => " | ",
        }
    }

    fn flip(self) -> CompositeOp {
        match self {
            CompositeOp::And => CompositeOp::Or,
            CompositeOp::Or => CompositeOp::And,
        }
    }
}

/// Filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    RelOp {
        column: String,
        op: RelOp,
        value: String,
    },
    In {
        column: String,
        values: Vec<String>,
    },
    Composite {
        op: CompositeOp,
        filters: Vec<Filter>,
    },
    Not(Box<Filter>),
}

impl Filter {
    pub fn rel(column: &str, op: RelOp, value: &str) -> Filter {
        Filter::RelOp {
            column: column.to_string(),
            op,
            value: value.to_string(),
        }
    }

    pub fn eq(column: &str, value: &str) -> Filter {
        Self::rel(column, RelOp::Eq, value)
    }

    pub fn ne(column: &str, value: &str) -> Filter {
        Self::rel(column, RelOp::Ne, value)
    }

    pub fn in_values<S: AsRef<str>>(column: &str, values: &[S]) -> Filter {
        Filter::In {
            column: column.to_string(),
            values: values.iter().map(|v| v.as_ref().to_string()).collect(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Filter {
        Filter::Composite {
            op: CompositeOp::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Filter {
        Filter::Composite {
            op: CompositeOp::Or,
            filters,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Filter {
        Filter::Not(Box::new(filter))
    }
}

/// Filter as written in a query file: `{op, column, value}`, `{op = "in", column, values}`,
/// `{op = "and"|"or", filters}` or `{op = "not", filter}`.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSpec {
    pub op: String,
    pub column: Option<String>,
    pub value: Option<String>,
    pub values: Option<Vec<String>>,
    pub filters: Option<Vec<FilterSpec>>,
    pub filter: Option<Box<FilterSpec>>,
}

impl FilterSpec {
    pub fn from_toml_str(s: &str) -> Result<Self, DbError> {
        deserialize_str(s, config::FileFormat::Toml)
    }

    pub fn from_json_str(s: &str) -> Result<Self, DbError> {
        deserialize_str(s, config::FileFormat::Json)
    }
}

impl TryFrom<FilterSpec> for Filter {
    type Error = DbError;

    fn try_from(spec: FilterSpec) -> Result<Self, Self::Error> {
        let missing = |field: &str| {
            DbError::InvalidFilter(format!("operator {:?} requires `{}`", spec.op, field))
        };
        let filter = match spec.op.as_str() {
            "in" => Filter::In {
                column: spec.column.clone().ok_or_else(|| missing("column"))?,
                values: spec.values.clone().ok_or_else(|| missing("values"))?,
            },
            "and" | "or" => {
                let children = spec.filters.clone().ok_or_else(|| missing("filters"))?;
                let filters = children
                    .into_iter()
                    .map(Filter::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                if spec.op == "and" {
                    Filter::and(filters)
                } else {
                    Filter::or(filters)
                }
            }
            "not" => {
                let child = spec.filter.clone().ok_or_else(|| missing("filter"))?;
                Filter::not(Filter::try_from(*child)?)
            }
            other => match RelOp::parse(other) {
                Some(op) => Filter::RelOp {
                    column: spec.column.clone().ok_or_else(|| missing("column"))?,
                    op,
                    value: spec.value.clone().ok_or_else(|| missing("value"))?,
                },
                None => return Err(DbError::UnsupportedOperator(other.to_string())),
            },
        };
        Ok(filter)
    }
}

/// Raw operand values, one slot per binding.
pub type FilterArgs = Vec<u64>;

/// Typed local produced by the unpack pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgBinding {
    pub position: usize,
    pub column: String,
    pub num_type: NumType,
}

impl ArgBinding {
    pub fn name(&self) -> String {
        format!("farg{}", self.position)
    }
}

type RowPredicate = Box<dyn Fn(&Record, &[u64]) -> bool + Send + Sync>;
type SkipTest = Box<dyn Fn(&SegmentStats, &[u64]) -> bool + Send + Sync>;

/// Output of [`FilterGenerator::generate`].
pub struct CompiledFilter {
    bindings: Vec<ArgBinding>,
    predicate: RowPredicate,
    predicate_source: String,
    skip: Option<SkipTest>,
    skip_source: String,
}

impl fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("bindings", &self.bindings)
            .field("predicate", &self.predicate_source)
            .field("skip", &self.skip_source)
            .finish()
    }
}

impl CompiledFilter {
    pub fn bindings(&self) -> &[ArgBinding] {
        &self.bindings
    }

    /// One line per binding: `farg{i}: <type> = fargs[{i}]`.
    pub fn unpack_source(&self) -> String {
        self.bindings
            .iter()
            .map(|b| format!("{}: {} = fargs[{}]", b.name(), b.num_type.name(), b.position))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn predicate_source(&self) -> &str {
        &self.predicate_source
    }

    pub fn skip_source(&self) -> &str {
        &self.skip_source
    }

    /// `true` when the skip predicate is constant and never excludes a segment.
    pub fn scans_all_segments(&self) -> bool {
        self.skip.is_none()
    }

    /// Verifies that packed arguments line up with the bindings.
    pub fn check_args(&self, args: &[u64]) -> Result<(), DbError> {
        if args.len() != self.bindings.len() {
            return Err(DbError::ArgumentMismatch {
                position: args.len().min(self.bindings.len()),
                details: format!(
                    "{} arguments packed, {} bound",
                    args.len(),
                    self.bindings.len()
                ),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn matches(&self, record: &Record, args: &[u64]) -> bool {
        (self.predicate)(record, args)
    }

    /// `false` only if no record of a segment with these statistics can match.
    #[inline]
    pub fn may_match_segment(&self, stats: &SegmentStats, args: &[u64]) -> bool {
        self.skip.as_ref().map_or(true, |skip| skip(stats, args))
    }
}

/// Where a filtered column lives in a stored record.
#[derive(Debug, Clone, Copy)]
enum Access {
    Dim(usize),
    Value(usize),
}

impl Access {
    fn source(self, index: usize) -> String {
        match self {
            Access::Dim(_) => format!("dims._{index}"),
            Access::Value(_) => format!("metrics._{index}"),
        }
    }
}

/// Compiles filters for one table schema.
pub struct FilterGenerator<'a> {
    schema: &'a TableSchema,
    layout: MetricLayout,
}

impl<'a> FilterGenerator<'a> {
    pub fn new(schema: &'a TableSchema) -> Self {
        Self {
            schema,
            layout: MetricLayout::new(&schema.metrics),
        }
    }

    pub fn generate(&self, filter: &Filter) -> Result<CompiledFilter, DbError> {
        let mut bindings = Vec::new();
        self.unpack(filter, &mut bindings)?;

        let mut cursor = 0;
        let (predicate, predicate_source) = self.predicate(filter, &bindings, &mut cursor)?;
        self.expect_consumed(cursor, &bindings)?;

        let mut cursor = 0;
        let skip = self.skip(filter, false, &bindings, &mut cursor)?;
        self.expect_consumed(cursor, &bindings)?;
        let (skip, skip_source) = match skip {
            SkipNode::Always => (None, "true".to_string()),
            SkipNode::Test(test, source) => (Some(test), source),
        };

        Ok(CompiledFilter {
            bindings,
            predicate,
            predicate_source,
            skip,
            skip_source,
        })
    }

    /// Decodes the literal operands of `filter` into raw argument slots.
    ///
    /// String literals go through the dictionary's read path; a value never ingested maps to
    /// the maximum code of the dimension's width, which no stored record carries.
    pub fn pack_args(&self, filter: &Filter, dicts: &Dictionaries) -> Result<FilterArgs, DbError> {
        let mut args = Vec::new();
        self.pack(filter, dicts, &mut args)?;
        Ok(args)
    }

    fn pack(&self, filter: &Filter, dicts: &Dictionaries, args: &mut FilterArgs) -> Result<(), DbError> {
        match filter {
            Filter::RelOp { column, value, .. } => {
                args.push(self.decode(column, value, dicts)?);
            }
            Filter::In { column, values } => {
                for value in values {
                    args.push(self.decode(column, value, dicts)?);
                }
            }
            Filter::Composite { filters, .. } => {
                for f in filters {
                    self.pack(f, dicts, args)?;
                }
            }
            Filter::Not(inner) => self.pack(inner, dicts, args)?,
        }
        Ok(())
    }

    fn decode(&self, column: &str, value: &str, dicts: &Dictionaries) -> Result<u64, DbError> {
        let invalid = || DbError::InvalidValue {
            column: column.to_string(),
            value: value.to_string(),
        };
        match self.filterable(column)? {
            Column::Dimension(dim) => match &dim.kind {
                DimensionKind::String(s) => match dicts.get(&self.schema.name, &dim.name)? {
                    Some(dict) => dict.decode(value),
                    None => Ok(s.width.max_code()),
                },
                DimensionKind::Numeric(num_type) => num_type.parse_raw(value).ok_or_else(invalid),
                DimensionKind::Time(t) => parse_time_literal(value, &t.format, t.micro_precision),
                DimensionKind::Bool => Ok(u64::from(value == "true")),
            },
            Column::Metric(metric) => metric.num_type().parse_raw(value).ok_or_else(invalid),
        }
    }

    /// Resolves `name`, rejecting columns that cannot be compared against a scalar.
    fn filterable(&self, name: &str) -> Result<Column<'a>, DbError> {
        let column = self.schema.column(name)?;
        if let Column::Metric(m) = column {
            if let MetricKind::Bitset { .. } = m.kind {
                return Err(DbError::InvalidFilter(format!(
                    "bitset metric {name:?} cannot be filtered on"
                )));
            }
        }
        Ok(column)
    }

    fn access(&self, column: Column<'_>) -> Result<(Access, usize), DbError> {
        match column {
            Column::Dimension(d) => Ok((Access::Dim(d.index), d.index)),
            Column::Metric(m) => match self.layout.slot(m.index) {
                MetricSlot::Value(slot) => Ok((Access::Value(slot), m.index)),
                MetricSlot::Set(_) => Err(DbError::InvalidFilter(format!(
                    "bitset metric {:?} cannot be filtered on",
                    m.name
                ))),
            },
        }
    }

    fn unpack(&self, filter: &Filter, bindings: &mut Vec<ArgBinding>) -> Result<(), DbError> {
        let bind = |column: &str, bindings: &mut Vec<ArgBinding>| -> Result<(), DbError> {
            let col = self.filterable(column)?;
            bindings.push(ArgBinding {
                position: bindings.len(),
                column: col.name().to_string(),
                num_type: col.num_type(),
            });
            Ok(())
        };
        match filter {
            Filter::RelOp { column, .. } => bind(column, bindings)?,
            Filter::In { column, values } => {
                for _ in values {
                    bind(column, bindings)?;
                }
            }
            Filter::Composite { filters, .. } => {
                for f in filters {
                    self.unpack(f, bindings)?;
                }
            }
            Filter::Not(inner) => self.unpack(inner, bindings)?,
        }
        Ok(())
    }

    /// Takes the binding under the cursor and checks it belongs to `column`.
    fn take<'b>(
        &self,
        column: Column<'_>,
        bindings: &'b [ArgBinding],
        cursor: &mut usize,
    ) -> Result<&'b ArgBinding, DbError> {
        let binding = bindings.get(*cursor).ok_or_else(|| DbError::ArgumentMismatch {
            position: *cursor,
            details: format!("no binding left for column {:?}", column.name()),
        })?;
        if binding.column != column.name() || binding.num_type != column.num_type() {
            return Err(DbError::ArgumentMismatch {
                position: *cursor,
                details: format!(
                    "bound to {:?} ({}), used for {:?} ({})",
                    binding.column,
                    binding.num_type.name(),
                    column.name(),
                    column.num_type().name()
                ),
            });
        }
        *cursor += 1;
        Ok(binding)
    }

    fn expect_consumed(&self, cursor: usize, bindings: &[ArgBinding]) -> Result<(), DbError> {
        if cursor != bindings.len() {
            return Err(DbError::ArgumentMismatch {
                position: cursor,
                details: format!("{} of {} bindings used", cursor, bindings.len()),
            });
        }
        Ok(())
    }

    fn predicate(
        &self,
        filter: &Filter,
        bindings: &[ArgBinding],
        cursor: &mut usize,
    ) -> Result<(RowPredicate, String), DbError> {
        match filter {
            Filter::RelOp { column, op, .. } => {
                let col = self.filterable(column)?;
                let (access, index) = self.access(col)?;
                let pos = self.take(col, bindings, cursor)?.position;
                let source = format!("({}{}farg{})", access.source(index), op.symbol(), pos);
                let test = with_num_type!(col.num_type(), T => rel_predicate::<T>(*op, access, pos));
                Ok((test, source))
            }
            Filter::In { column, values } => {
                let col = self.filterable(column)?;
                let (access, index) = self.access(col)?;
                let mut positions = Vec::with_capacity(values.len());
                for _ in values {
                    positions.push(self.take(col, bindings, cursor)?.position);
                }
                let field = access.source(index);
                let source = format!(
                    "({})",
                    positions
                        .iter()
                        .map(|p| format!("{field}==farg{p}"))
                        .collect::<Vec<_>>()
                        .join(" | ")
                );
                let test = with_num_type!(col.num_type(), T => in_predicate::<T>(access, positions));
                Ok((test, source))
            }
            Filter::Composite { op, filters } => {
                let mut children = Vec::with_capacity(filters.len());
                let mut sources = Vec::with_capacity(filters.len());
                for f in filters {
                    let (test, source) = self.predicate(f, bindings, cursor)?;
                    children.push(test);
                    sources.push(source);
                }
                let source = format!("({})", sources.join(op.symbol()));
                let test: RowPredicate = match op {
                    CompositeOp::And => Box::new(move |r: &Record, a: &[u64]| children.iter().all(|c| c(r, a))),
                    CompositeOp::Or => Box::new(move |r: &Record, a: &[u64]| children.iter().any(|c| c(r, a))),
                };
                Ok((test, source))
            }
            Filter::Not(inner) => {
                let (child, source) = self.predicate(inner, bindings, cursor)?;
                Ok((
                    Box::new(move |r: &Record, a: &[u64]| !child(r, a)),
                    format!("!{source}"),
                ))
            }
        }
    }

    /// Builds the skip predicate for `filter`, or for its negation when `negated` is set.
    fn skip(
        &self,
        filter: &Filter,
        negated: bool,
        bindings: &[ArgBinding],
        cursor: &mut usize,
    ) -> Result<SkipNode, DbError> {
        match filter {
            Filter::RelOp { column, op, .. } => {
                let col = self.filterable(column)?;
                let pos = self.take(col, bindings, cursor)?.position;
                let Some(dim) = stats_dimension(col) else {
                    return Ok(SkipNode::Always);
                };
                // NaN never reaches the segment bounds but satisfies every negated comparison.
                if negated && col.num_type().is_float() {
                    return Ok(SkipNode::Always);
                }
                let op = if negated { op.negate() } else { *op };
                Ok(with_num_type!(col.num_type(), T => rel_skip::<T>(op, dim, pos)))
            }
            Filter::In { column, values } => {
                let col = self.filterable(column)?;
                let mut positions = Vec::with_capacity(values.len());
                for _ in values {
                    positions.push(self.take(col, bindings, cursor)?.position);
                }
                match stats_dimension(col) {
                    Some(dim) if !negated => {
                        Ok(with_num_type!(col.num_type(), T => in_skip::<T>(dim, positions)))
                    }
                    _ => Ok(SkipNode::Always),
                }
            }
            Filter::Composite { op, filters } => {
                let op = if negated { op.flip() } else { *op };
                let mut tests = Vec::new();
                let mut sources = Vec::new();
                let mut always = false;
                for f in filters {
                    match self.skip(f, negated, bindings, cursor)? {
                        SkipNode::Always => always = true,
                        SkipNode::Test(test, source) => {
                            tests.push(test);
                            sources.push(source);
                        }
                    }
                }
                // An always-true child decides an OR and drops out of an AND.
                if op == CompositeOp::Or && always {
                    return Ok(SkipNode::Always);
                }
                if tests.is_empty() {
                    return Ok(match op {
                        CompositeOp::And => SkipNode::Always,
                        CompositeOp::Or => SkipNode::Test(
                            Box::new(|_: &SegmentStats, _: &[u64]| false),
                            "false".to_string(),
                        ),
                    });
                }
                let source = format!("({})", sources.join(op.symbol()));
                let test: SkipTest = match op {
                    CompositeOp::And => Box::new(move |s: &SegmentStats, a: &[u64]| tests.iter().all(|t| t(s, a))),
                    CompositeOp::Or => Box::new(move |s: &SegmentStats, a: &[u64]| tests.iter().any(|t| t(s, a))),
                };
                Ok(SkipNode::Test(test, source))
            }
            Filter::Not(inner) => self.skip(inner, !negated, bindings, cursor),
        }
    }
}

enum SkipNode {
    /// The segment cannot be excluded.
    Always,
    Test(SkipTest, String),
}

/// Index of the dimension behind `column` when it carries segment statistics.
fn stats_dimension(column: Column<'_>) -> Option<usize> {
    match column {
        Column::Dimension(d) if d.has_stats() => Some(d.index),
        _ => None,
    }
}

fn rel_predicate<T: RawNum>(op: RelOp, access: Access, pos: usize) -> RowPredicate {
    match op {
        RelOp::Eq => field_test::<T, _>(access, move |v: T, a: &[u64]| v == T::from_raw(a[pos])),
        RelOp::Ne => field_test::<T, _>(access, move |v: T, a: &[u64]| v != T::from_raw(a[pos])),
        RelOp::Lt => field_test::<T, _>(access, move |v: T, a: &[u64]| v < T::from_raw(a[pos])),
        RelOp::Le => field_test::<T, _>(access, move |v: T, a: &[u64]| v <= T::from_raw(a[pos])),
        RelOp::Gt => field_test::<T, _>(access, move |v: T, a: &[u64]| v > T::from_raw(a[pos])),
        RelOp::Ge => field_test::<T, _>(access, move |v: T, a: &[u64]| v >= T::from_raw(a[pos])),
    }
}

fn in_predicate<T: RawNum>(access: Access, positions: Vec<usize>) -> RowPredicate {
    field_test::<T, _>(access, move |v: T, a: &[u64]| {
        positions.iter().any(|&p| v == T::from_raw(a[p]))
    })
}

fn field_test<T, F>(access: Access, test: F) -> RowPredicate
where
    T: RawNum,
    F: Fn(T, &[u64]) -> bool + Send + Sync + 'static,
{
    match access {
        Access::Dim(i) => Box::new(move |r: &Record, a: &[u64]| test(T::from_raw(r.dims[i]), a)),
        Access::Value(i) => Box::new(move |r: &Record, a: &[u64]| test(T::from_raw(r.values[i]), a)),
    }
}

fn overlaps<T: RawNum>(stats: &SegmentStats, dim: usize, v: T) -> bool {
    T::from_raw(stats.min[dim]) <= v && T::from_raw(stats.max[dim]) >= v
}

fn rel_skip<T: RawNum>(op: RelOp, dim: usize, pos: usize) -> SkipNode {
    match op {
        RelOp::Eq => SkipNode::Test(
            Box::new(move |s: &SegmentStats, a: &[u64]| overlaps(s, dim, T::from_raw(a[pos]))),
            format!("(stats.dmin{dim}<=farg{pos} & stats.dmax{dim}>=farg{pos})"),
        ),
        RelOp::Lt | RelOp::Le => SkipNode::Test(
            Box::new(move |s: &SegmentStats, a: &[u64]| T::from_raw(s.min[dim]) <= T::from_raw(a[pos])),
            format!("(stats.dmin{dim}<=farg{pos})"),
        ),
        RelOp::Gt | RelOp::Ge => SkipNode::Test(
            Box::new(move |s: &SegmentStats, a: &[u64]| T::from_raw(s.max[dim]) >= T::from_raw(a[pos])),
            format!("(stats.dmax{dim}>=farg{pos})"),
        ),
        RelOp::Ne => SkipNode::Always,
    }
}

fn in_skip<T: RawNum>(dim: usize, positions: Vec<usize>) -> SkipNode {
    let source = format!(
        "({})",
        positions
            .iter()
            .map(|p| format!("(stats.dmin{dim}<=farg{p} & stats.dmax{dim}>=farg{p})"))
            .collect::<Vec<_>>()
            .join(" | ")
    );
    SkipNode::Test(
        Box::new(move |s: &SegmentStats, a: &[u64]| {
            positions.iter().any(|&p| overlaps(s, dim, T::from_raw(a[p])))
        }),
        source,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DimensionConfig, MetricConfig, TableConfig};

    fn schema() -> TableSchema {
        let mut time = DimensionConfig::new("time", "time");
        time.format = Some("posix".to_string());
        let cfg = TableConfig {
            name: "events".to_string(),
            dimensions: vec![
                DimensionConfig::new("country", "string"),
                DimensionConfig::new("age", "numeric"),
                time,
            ],
            metrics: vec![
                MetricConfig::new("count", "count"),
                MetricConfig::new("users", "bitset"),
                MetricConfig::new("revenue", "double_sum"),
            ],
            segment_size: None,
        };
        TableSchema::from_config(&cfg, 16).unwrap()
    }

    fn stats(min: u64, max: u64) -> SegmentStats {
        SegmentStats {
            min: vec![0, min, 0].into_boxed_slice(),
            max: vec![0, max, 0].into_boxed_slice(),
        }
    }

    #[test]
    fn generated_sources_share_argument_positions() {
        let schema = schema();
        let gen = FilterGenerator::new(&schema);
        let filter = Filter::and(vec![
            Filter::ne("country", "IL"),
            Filter::in_values("age", &["20", "30"]),
            Filter::not(Filter::rel("revenue", RelOp::Gt, "1.5")),
        ]);
        let compiled = gen.generate(&filter).unwrap();

        assert_eq!(compiled.bindings().len(), 4);
        assert_eq!(
            compiled.unpack_source(),
            "farg0: uint = fargs[0]\nfarg1: ulong = fargs[1]\nfarg2: ulong = fargs[2]\nfarg3: double = fargs[3]"
        );
        assert_eq!(
            compiled.predicate_source(),
            "((dims._0!=farg0) & (dims._1==farg1 | dims._1==farg2) & !(metrics._2>farg3))"
        );
        assert_eq!(
            compiled.skip_source(),
            "(((stats.dmin1<=farg1 & stats.dmax1>=farg1) | (stats.dmin1<=farg2 & stats.dmax1>=farg2)))"
        );
    }

    #[test]
    fn string_only_filters_never_skip() {
        let schema = schema();
        let compiled = FilterGenerator::new(&schema)
            .generate(&Filter::eq("country", "US"))
            .unwrap();
        assert!(compiled.scans_all_segments());
        assert_eq!(compiled.skip_source(), "true");
        assert!(compiled.may_match_segment(&stats(5, 6), &[1]));
    }

    #[test]
    fn negation_is_pushed_down() {
        let schema = schema();
        let gen = FilterGenerator::new(&schema);
        // !(age < 10) == age >= 10
        let compiled = gen.generate(&Filter::not(Filter::rel("age", RelOp::Lt, "10"))).unwrap();
        assert_eq!(compiled.skip_source(), "(stats.dmax1>=farg0)");
        assert!(!compiled.may_match_segment(&stats(1, 9), &[10]));
        assert!(compiled.may_match_segment(&stats(1, 10), &[10]));

        // A negated equality cannot prune.
        let compiled = gen.generate(&Filter::not(Filter::eq("age", "5"))).unwrap();
        assert!(compiled.scans_all_segments());

        // !(age != 5) == age == 5
        let compiled = gen.generate(&Filter::not(Filter::ne("age", "5"))).unwrap();
        assert!(!compiled.may_match_segment(&stats(6, 9), &[5]));
    }

    #[test]
    fn or_with_unprunable_branch_scans_everything() {
        let schema = schema();
        let compiled = FilterGenerator::new(&schema)
            .generate(&Filter::or(vec![Filter::eq("age", "3"), Filter::eq("country", "US")]))
            .unwrap();
        assert!(compiled.scans_all_segments());
    }

    #[test]
    fn bitset_metrics_and_unknown_columns_are_rejected() {
        let schema = schema();
        let gen = FilterGenerator::new(&schema);
        assert!(matches!(
            gen.generate(&Filter::eq("users", "1")),
            Err(DbError::InvalidFilter(_))
        ));
        assert!(matches!(
            gen.generate(&Filter::eq("city", "x")),
            Err(DbError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn packs_literals_per_column_type() {
        let schema = schema();
        let gen = FilterGenerator::new(&schema);
        let dicts = Dictionaries::new();
        let filter = Filter::and(vec![
            Filter::eq("country", "US"),
            Filter::eq("time", "2019-01-01"),
            Filter::eq("revenue", "1.5"),
        ]);
        let args = gen.pack_args(&filter, &dicts).unwrap();
        assert_eq!(args, vec![u32::MAX as u64, 1_546_300_800, 1.5f64.to_raw()]);

        let bad = Filter::eq("time", "last tuesday");
        assert!(matches!(
            gen.pack_args(&bad, &dicts),
            Err(DbError::InvalidTimeFormat { .. })
        ));
    }

    #[test]
    fn argument_count_is_checked() {
        let schema = schema();
        let compiled = FilterGenerator::new(&schema)
            .generate(&Filter::in_values("age", &["1", "2"]))
            .unwrap();
        assert!(compiled.check_args(&[1, 2]).is_ok());
        assert!(matches!(
            compiled.check_args(&[1]),
            Err(DbError::ArgumentMismatch { .. })
        ));
    }

    #[test]
    fn filter_spec_parsing() {
        let spec = FilterSpec::from_json_str(
            r#"{"op": "and", "filters": [
                {"op": "ne", "column": "country", "value": "IL"},
                {"op": "not", "filter": {"op": "in", "column": "age", "values": ["1", "2"]}}
            ]}"#,
        )
        .unwrap();
        let filter = Filter::try_from(spec).unwrap();
        assert_eq!(
            filter,
            Filter::and(vec![
                Filter::ne("country", "IL"),
                Filter::not(Filter::in_values("age", &["1", "2"])),
            ])
        );

        let spec = FilterSpec::from_toml_str(
            r#"
op = "like"
column = "country"
value = "U%"
"#,
        )
        .unwrap();
        assert!(matches!(
            Filter::try_from(spec),
            Err(DbError::UnsupportedOperator(op)) if op == "like"
        ));
    }
}
