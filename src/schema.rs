//! Table schema: the configuration form (deserialized with serde) and the resolved form
//! handed to the upsert and filter generators.

use crate::error::DbError;
use crate::time::{parse_duration_secs, RollupRule, TimeFormat, TimeReduction, TimeUnit};
use crate::types::{CodeWidth, NumType};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;

/// Segment capacity used when a table does not configure one.
pub const DEFAULT_SEGMENT_SIZE: usize = 65_536;

/// Cardinality cap of string dimensions that do not configure one.
pub const DEFAULT_STRING_CARDINALITY: u64 = u32::MAX as u64 - 1;

// ---------- Configuration form ----------

/// Table definition as read from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    pub segment_size: Option<usize>,
}

/// Dimension definition. `type` is one of `string` (default), `numeric`, `time`,
/// `microtime` or `boolean`; the remaining fields apply to some types only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// String: values longer than this many bytes are truncated.
    pub length: Option<usize>,
    /// String: maximum number of distinct values.
    pub cardinality: Option<u64>,
    pub cardinality_guard: Option<CardinalityGuardConfig>,
    /// Numeric: largest expected value, picks the narrowest unsigned type.
    pub max: Option<u64>,
    /// Numeric: explicit value type, wins over `max`.
    pub num_type: Option<NumType>,
    /// Time: `posix`, `millis`, `micros` or a strptime pattern.
    pub format: Option<String>,
    /// Time: truncation unit.
    pub granularity: Option<TimeUnit>,
    #[serde(default)]
    pub rollup_rules: Vec<RollupRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardinalityGuardConfig {
    pub dimensions: Vec<String>,
    pub limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupRuleConfig {
    pub granularity: TimeUnit,
    /// Duration literal, e.g. `"7 days"`.
    pub after: String,
}

/// Metric definition. `type` is `count`, `bitset` or `<num>_<agg>` such as `double_sum`.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Bitset: element type (defaults to `uint`).
    pub num_type: Option<NumType>,
}

impl TableConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, DbError> {
        deserialize_str(s, config::FileFormat::Toml)
    }

    pub fn from_json_str(s: &str) -> Result<Self, DbError> {
        deserialize_str(s, config::FileFormat::Json)
    }
}

/// Deserializes a whole TOML/JSON document through the `config` crate.
pub(crate) fn deserialize_str<T: DeserializeOwned>(
    s: &str,
    format: config::FileFormat,
) -> Result<T, DbError> {
    config::Config::builder()
        .add_source(config::File::from_str(s, format))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| DbError::Config(e.to_string()))
}

impl DimensionConfig {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: Some(kind.to_string()),
            ..Self::default()
        }
    }
}

impl MetricConfig {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            num_type: None,
        }
    }
}

// ---------- Resolved form ----------

#[derive(Debug, Clone, PartialEq)]
pub struct StringDimension {
    pub max_length: Option<usize>,
    pub cardinality: u64,
    pub width: CodeWidth,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeDimension {
    pub format: TimeFormat,
    pub micro_precision: bool,
    pub reduction: TimeReduction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DimensionKind {
    String(StringDimension),
    Numeric(NumType),
    Time(TimeDimension),
    Bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub index: usize,
    pub name: String,
    pub kind: DimensionKind,
}

impl Dimension {
    /// Type of the value stored in the record field.
    pub fn num_type(&self) -> NumType {
        match &self.kind {
            DimensionKind::String(s) => s.width.num_type(),
            DimensionKind::Numeric(t) => *t,
            DimensionKind::Time(t) if t.micro_precision => NumType::ULong,
            DimensionKind::Time(_) => NumType::UInt,
            DimensionKind::Bool => NumType::UByte,
        }
    }

    /// Numeric and time dimensions carry per-segment min/max statistics.
    pub fn has_stats(&self) -> bool {
        matches!(self.kind, DimensionKind::Numeric(_) | DimensionKind::Time(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Value { num_type: NumType, agg: Aggregation },
    Bitset { num_type: NumType },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub index: usize,
    pub name: String,
    pub kind: MetricKind,
}

impl Metric {
    pub fn num_type(&self) -> NumType {
        match self.kind {
            MetricKind::Value { num_type, .. } | MetricKind::Bitset { num_type } => num_type,
        }
    }

    /// Count metrics contribute a constant 1 and read no input field.
    pub fn reads_field(&self) -> bool {
        !matches!(
            self.kind,
            MetricKind::Value {
                agg: Aggregation::Count,
                ..
            }
        )
    }

    pub fn is_bitset(&self) -> bool {
        matches!(self.kind, MetricKind::Bitset { .. })
    }
}

/// Caps distinct values of dimension `dim` to `limit` per tuple of `keys` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardinalityGuardSpec {
    pub dim: usize,
    pub keys: Vec<usize>,
    pub limit: u64,
}

/// A column reference resolved by name.
#[derive(Debug, Clone, Copy)]
pub enum Column<'a> {
    Dimension(&'a Dimension),
    Metric(&'a Metric),
}

impl<'a> Column<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Column::Dimension(d) => &d.name,
            Column::Metric(m) => &m.name,
        }
    }

    pub fn num_type(&self) -> NumType {
        match self {
            Column::Dimension(d) => d.num_type(),
            Column::Metric(m) => m.num_type(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<Metric>,
    pub guards: Vec<CardinalityGuardSpec>,
    pub segment_size: usize,
}

impl TableSchema {
    pub fn from_config(config: &TableConfig, default_segment_size: usize) -> Result<Self, DbError> {
        let mut seen = HashSet::new();
        for name in config
            .dimensions
            .iter()
            .map(|d| &d.name)
            .chain(config.metrics.iter().map(|m| &m.name))
        {
            if !seen.insert(name.as_str()) {
                return Err(DbError::Config(format!(
                    "duplicate column {:?} in table {:?}",
                    name, config.name
                )));
            }
        }

        let dimensions = config
            .dimensions
            .iter()
            .enumerate()
            .map(|(index, d)| resolve_dimension(index, d))
            .collect::<Result<Vec<_>, _>>()?;
        let metrics = config
            .metrics
            .iter()
            .enumerate()
            .map(|(index, m)| resolve_metric(index, m))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guards = Vec::new();
        for (index, d) in config.dimensions.iter().enumerate() {
            if let Some(g) = &d.cardinality_guard {
                let keys = g
                    .dimensions
                    .iter()
                    .map(|name| {
                        config
                            .dimensions
                            .iter()
                            .position(|other| &other.name == name && *name != d.name)
                            .ok_or_else(|| {
                                DbError::Config(format!(
                                    "cardinality guard of {:?} refers to unknown dimension {:?}",
                                    d.name, name
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                guards.push(CardinalityGuardSpec {
                    dim: index,
                    keys,
                    limit: g.limit,
                });
            }
        }

        let segment_size = config.segment_size.unwrap_or(default_segment_size);
        if segment_size == 0 {
            return Err(DbError::Config("segment_size must be positive".to_string()));
        }

        Ok(Self {
            name: config.name.clone(),
            dimensions,
            metrics,
            guards,
            segment_size,
        })
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn column(&self, name: &str) -> Result<Column<'_>, DbError> {
        self.dimension(name)
            .map(Column::Dimension)
            .or_else(|| self.metric(name).map(Column::Metric))
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
    }

    pub fn has_bitset_metrics(&self) -> bool {
        self.metrics.iter().any(Metric::is_bitset)
    }

    /// Number of input fields a row must carry.
    pub fn field_count(&self) -> usize {
        self.dimensions.len() + self.metrics.iter().filter(|m| m.reads_field()).count()
    }
}

fn resolve_dimension(index: usize, d: &DimensionConfig) -> Result<Dimension, DbError> {
    let kind = match d.kind.as_deref().unwrap_or("string") {
        "string" => {
            let cardinality = d.cardinality.unwrap_or(DEFAULT_STRING_CARDINALITY);
            if cardinality == 0 {
                return Err(DbError::Config(format!(
                    "dimension {:?}: cardinality must be positive",
                    d.name
                )));
            }
            DimensionKind::String(StringDimension {
                max_length: d.length,
                cardinality,
                width: CodeWidth::for_cardinality(cardinality),
            })
        }
        "numeric" => DimensionKind::Numeric(
            d.num_type
                .unwrap_or_else(|| NumType::unsigned_for_max(d.max.unwrap_or(u64::MAX))),
        ),
        kind @ ("time" | "microtime") => {
            let rollup_rules = d
                .rollup_rules
                .iter()
                .map(|r| {
                    Ok(RollupRule {
                        granularity: r.granularity,
                        after_secs: parse_duration_secs(&r.after)?,
                    })
                })
                .collect::<Result<Vec<_>, DbError>>()?;
            DimensionKind::Time(TimeDimension {
                format: TimeFormat::parse(d.format.as_deref()),
                micro_precision: kind == "microtime",
                reduction: TimeReduction::new(d.granularity, rollup_rules),
            })
        }
        "boolean" | "bool" => DimensionKind::Bool,
        other => {
            return Err(DbError::Config(format!(
                "dimension {:?}: unknown type {:?}",
                d.name, other
            )))
        }
    };
    Ok(Dimension {
        index,
        name: d.name.clone(),
        kind,
    })
}

fn resolve_metric(index: usize, m: &MetricConfig) -> Result<Metric, DbError> {
    let kind = match m.kind.as_str() {
        "count" => MetricKind::Value {
            num_type: NumType::ULong,
            agg: Aggregation::Count,
        },
        "bitset" => MetricKind::Bitset {
            num_type: m.num_type.unwrap_or(NumType::UInt),
        },
        other => {
            let invalid = || DbError::Config(format!("metric {:?}: unknown type {:?}", m.name, other));
            let (num, agg) = other.rsplit_once('_').ok_or_else(invalid)?;
            let num_type = NumType::from_name(num).ok_or_else(invalid)?;
            let agg = match agg {
                "sum" => Aggregation::Sum,
                "min" => Aggregation::Min,
                "max" => Aggregation::Max,
                _ => return Err(invalid()),
            };
            MetricKind::Value { num_type, agg }
        }
    };
    Ok(Metric {
        index,
        name: m.name.clone(),
        kind,
    })
}
