//! Segmented in-memory record store.
//!
//! Records are addressed by a global offset: `segment = offset / segment_size`,
//! `slot = offset % segment_size`. Only the last segment accepts appends.

use crate::record::Record;
use crate::schema::TableSchema;

/// Running min/max per dimension. Only numeric and time dimensions are maintained;
/// the remaining entries keep their initial values and are never consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub min: Box<[u64]>,
    pub max: Box<[u64]>,
}

impl SegmentStats {
    /// Empty statistics: every min at the type's highest value, every max at its lowest.
    pub fn initial(schema: &TableSchema) -> Self {
        Self {
            min: schema
                .dimensions
                .iter()
                .map(|d| d.num_type().highest_raw())
                .collect(),
            max: schema
                .dimensions
                .iter()
                .map(|d| d.num_type().lowest_raw())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    records: Vec<Record>,
    stats: SegmentStats,
}

impl Segment {
    fn new(capacity: usize, stats: SegmentStats) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            stats,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn stats(&self) -> &SegmentStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Ordered sequence of fixed-capacity segments owned by one table.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    segment_size: usize,
    initial_stats: SegmentStats,
    segments: Vec<Segment>,
    record_count: usize,
}

impl SegmentStore {
    pub fn new(segment_size: usize, initial_stats: SegmentStats) -> Self {
        Self {
            segment_size: segment_size.max(1),
            initial_stats,
            segments: Vec::new(),
            record_count: 0,
        }
    }

    pub fn for_schema(schema: &TableSchema) -> Self {
        Self::new(schema.segment_size, SegmentStats::initial(schema))
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// The segment accepting the next append, allocating a new one when the last is full.
    pub fn last_for_insert(&mut self) -> &mut Segment {
        let full = self
            .segments
            .last()
            .map_or(true, |s| s.len() >= self.segment_size);
        if full {
            self.segments
                .push(Segment::new(self.segment_size, self.initial_stats.clone()));
        }
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Appends `record` to the last segment, lets `update_stats` widen that segment's
    /// statistics, and returns the record's global offset.
    pub fn append<F>(&mut self, record: Record, update_stats: F) -> usize
    where
        F: FnOnce(&mut SegmentStats, &[u64]),
    {
        let segment_size = self.segment_size;
        self.last_for_insert();
        let segment_idx = self.segments.len() - 1;
        let segment = &mut self.segments[segment_idx];
        let offset = segment_idx * segment_size + segment.records.len();
        update_stats(&mut segment.stats, &record.dims);
        segment.records.push(record);
        self.record_count += 1;
        offset
    }

    pub fn get(&self, offset: usize) -> Option<&Record> {
        self.segments
            .get(offset / self.segment_size)
            .and_then(|s| s.records.get(offset % self.segment_size))
    }

    pub fn get_mut(&mut self, offset: usize) -> Option<&mut Record> {
        self.segments
            .get_mut(offset / self.segment_size)
            .and_then(|s| s.records.get_mut(offset % self.segment_size))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(d: u64) -> Record {
        Record {
            dims: vec![d].into_boxed_slice(),
            values: Box::new([]),
            sets: Box::new([]),
        }
    }

    fn widen(stats: &mut SegmentStats, dims: &[u64]) {
        stats.min[0] = stats.min[0].min(dims[0]);
        stats.max[0] = stats.max[0].max(dims[0]);
    }

    #[test]
    fn appends_roll_over_into_new_segments() {
        let stats = SegmentStats {
            min: vec![u64::MAX].into_boxed_slice(),
            max: vec![0].into_boxed_slice(),
        };
        let mut store = SegmentStore::new(2, stats);
        let offsets: Vec<usize> = [5, 3, 9].iter().map(|&d| store.append(record(d), widen)).collect();

        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(store.segment_count(), 2);
        assert_eq!(store.record_count(), 3);
        assert_eq!(store.segments()[0].stats().min[0], 3);
        assert_eq!(store.segments()[0].stats().max[0], 5);
        assert_eq!(store.segments()[1].stats().min[0], 9);
        assert_eq!(store.get(2).map(|r| r.dims[0]), Some(9));

        store.get_mut(1).unwrap().dims[0] = 4;
        assert_eq!(store.get(1).unwrap().dims[0], 4);
        assert!(store.get(3).is_none());
    }
}
