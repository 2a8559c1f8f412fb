//! Fixed-layout records and per-metric merge operations.

use crate::bitset::Bitset;
use crate::schema::{Aggregation, Metric, MetricKind};
use crate::types::{with_num_type, RawNum};

/// One stored tuple. `dims` holds one raw slot per dimension; scalar metrics live in
/// `values` and bitset metrics in `sets`, each addressed through a [`MetricLayout`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub dims: Box<[u64]>,
    pub values: Box<[u64]>,
    pub sets: Box<[Bitset]>,
}

/// Where a metric's state lives inside a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricSlot {
    Value(usize),
    Set(usize),
}

/// Slot assignment for an ordered list of metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLayout {
    slots: Vec<MetricSlot>,
    value_count: usize,
    set_count: usize,
}

impl MetricLayout {
    pub fn new<'a>(metrics: impl IntoIterator<Item = &'a Metric>) -> Self {
        let mut slots = Vec::new();
        let (mut value_count, mut set_count) = (0, 0);
        for metric in metrics {
            if metric.is_bitset() {
                slots.push(MetricSlot::Set(set_count));
                set_count += 1;
            } else {
                slots.push(MetricSlot::Value(value_count));
                value_count += 1;
            }
        }
        Self {
            slots,
            value_count,
            set_count,
        }
    }

    /// Slot of the metric at position `pos` of the list this layout was built from.
    pub fn slot(&self, pos: usize) -> MetricSlot {
        self.slots[pos]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// A record with `dims` and zeroed metric state.
    pub fn blank(&self, dims: Box<[u64]>) -> Record {
        Record {
            dims,
            values: vec![0; self.value_count].into_boxed_slice(),
            sets: vec![Bitset::new(); self.set_count].into_boxed_slice(),
        }
    }
}

type MergeOp = Box<dyn Fn(&mut Record, &Record) + Send + Sync>;

/// Folds the metrics of one record into another, one specialized operation per metric.
pub struct RecordMerger {
    ops: Vec<MergeOp>,
}

impl std::fmt::Debug for RecordMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordMerger").field("ops", &self.ops.len()).finish()
    }
}

impl RecordMerger {
    /// `metrics` must be the same list, in the same order, that built `layout`.
    pub fn new(metrics: &[Metric], layout: &MetricLayout) -> Self {
        let ops = metrics
            .iter()
            .enumerate()
            .map(|(pos, metric)| merge_op(metric, layout.slot(pos)))
            .collect();
        Self { ops }
    }

    #[inline]
    pub fn merge(&self, dst: &mut Record, src: &Record) {
        for op in &self.ops {
            op(dst, src);
        }
    }
}

fn merge_op(metric: &Metric, slot: MetricSlot) -> MergeOp {
    match (&metric.kind, slot) {
        (MetricKind::Bitset { .. }, MetricSlot::Set(s)) => {
            Box::new(move |dst: &mut Record, src: &Record| dst.sets[s].union_with(&src.sets[s]))
        }
        (MetricKind::Value { num_type, agg }, MetricSlot::Value(i)) => match agg {
            Aggregation::Sum | Aggregation::Count => with_num_type!(*num_type, T => {
                Box::new(move |dst: &mut Record, src: &Record| {
                    let sum = T::from_raw(dst.values[i]).sum(T::from_raw(src.values[i]));
                    dst.values[i] = sum.to_raw();
                }) as MergeOp
            }),
            Aggregation::Min => with_num_type!(*num_type, T => {
                Box::new(move |dst: &mut Record, src: &Record| {
                    if T::from_raw(src.values[i]) < T::from_raw(dst.values[i]) {
                        dst.values[i] = src.values[i];
                    }
                }) as MergeOp
            }),
            Aggregation::Max => with_num_type!(*num_type, T => {
                Box::new(move |dst: &mut Record, src: &Record| {
                    if T::from_raw(src.values[i]) > T::from_raw(dst.values[i]) {
                        dst.values[i] = src.values[i];
                    }
                }) as MergeOp
            }),
        },
        // MetricLayout::new assigns set slots to bitsets and value slots to everything else.
        _ => Box::new(|_: &mut Record, _: &Record| {}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NumType;

    fn metric(index: usize, kind: MetricKind) -> Metric {
        Metric {
            index,
            name: format!("m{index}"),
            kind,
        }
    }

    #[test]
    fn merges_each_aggregation() {
        let metrics = vec![
            metric(0, MetricKind::Value { num_type: NumType::ULong, agg: Aggregation::Count }),
            metric(1, MetricKind::Value { num_type: NumType::Double, agg: Aggregation::Sum }),
            metric(2, MetricKind::Bitset { num_type: NumType::UInt }),
            metric(3, MetricKind::Value { num_type: NumType::Int, agg: Aggregation::Min }),
            metric(4, MetricKind::Value { num_type: NumType::Int, agg: Aggregation::Max }),
        ];
        let layout = MetricLayout::new(&metrics);
        assert_eq!(layout.slot(2), MetricSlot::Set(0));
        assert_eq!(layout.slot(3), MetricSlot::Value(2));
        let merger = RecordMerger::new(&metrics, &layout);

        let mut a = layout.blank(vec![1].into_boxed_slice());
        a.values.copy_from_slice(&[1, 0.1f64.to_raw(), (-3i32).to_raw(), (-3i32).to_raw()]);
        a.sets[0].add(7);
        let mut b = layout.blank(vec![1].into_boxed_slice());
        b.values.copy_from_slice(&[1, 1.1f64.to_raw(), (-5i32).to_raw(), 4i32.to_raw()]);
        b.sets[0].add(8);

        merger.merge(&mut a, &b);
        assert_eq!(a.values[0], 2);
        assert_eq!(f64::from_raw(a.values[1]).render(), "1.2");
        assert_eq!(i32::from_raw(a.values[2]), -5);
        assert_eq!(i32::from_raw(a.values[3]), 4);
        assert_eq!(a.sets[0].cardinality(), 2);
    }
}
