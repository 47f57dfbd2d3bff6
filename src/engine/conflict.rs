use chrono::{DateTime, Duration, Utc};

use crate::limits::BUCKET_MINUTES;
use crate::model::BusyEvent;

const BUCKET_SECS: i64 = BUCKET_MINUTES * 60;

/// Per-day occupancy discretized into fixed-width buckets.
///
/// Bucket `i` covers `[origin + i*w, origin + (i+1)*w)`. A bucket is occupied
/// when any busy interval overlaps it. A span is checked by probing every
/// bucket-width boundary from its start, so a slot is rejected as soon as one
/// probe lands in an occupied bucket. Coarse by construction: a busy interval
/// that only touches part of a bucket blocks the whole bucket.
#[derive(Debug, Clone)]
pub struct ConflictIndex {
    origin: DateTime<Utc>,
    occupied: Vec<bool>,
}

impl ConflictIndex {
    /// An index with every bucket free.
    pub fn empty(day_start: DateTime<Utc>, day_end: DateTime<Utc>) -> Self {
        let span = (day_end - day_start).num_seconds().max(0);
        let buckets = (span + BUCKET_SECS - 1) / BUCKET_SECS;
        Self {
            origin: day_start,
            occupied: vec![false; buckets as usize],
        }
    }

    /// Build from a day's busy events. Callers drop ignorable events first.
    pub fn build<'a>(
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        events: impl IntoIterator<Item = &'a BusyEvent>,
    ) -> Self {
        let mut index = Self::empty(day_start, day_end);
        for event in events {
            index.mark(event.start, event.end);
        }
        index
    }

    fn mark(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let len = self.occupied.len() as i64;
        let from = (start - self.origin).num_seconds();
        let to = (end - self.origin).num_seconds();
        if to <= 0 || from >= len * BUCKET_SECS || from >= to {
            return;
        }
        let first = from.max(0).div_euclid(BUCKET_SECS);
        // Last bucket whose start lies before `end`.
        let last = ((to + BUCKET_SECS - 1) / BUCKET_SECS).min(len) - 1;
        for i in first..=last {
            self.occupied[i as usize] = true;
        }
    }

    /// O(1). Instants outside the indexed day are free.
    pub fn is_occupied(&self, at: DateTime<Utc>) -> bool {
        let offset = (at - self.origin).num_seconds();
        if offset < 0 {
            return false;
        }
        self.occupied
            .get((offset / BUCKET_SECS) as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Probe `start`, `start + w`, … while `< end`.
    pub fn span_is_free(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let step = Duration::minutes(BUCKET_MINUTES);
        let mut probe = start;
        while probe < end {
            if self.is_occupied(probe) {
                return false;
            }
            probe += step;
        }
        true
    }

    pub fn occupied_buckets(&self) -> usize {
        self.occupied.iter().filter(|b| **b).count()
    }

    pub fn bucket_count(&self) -> usize {
        self.occupied.len()
    }
}
