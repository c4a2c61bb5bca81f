// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! `IntervalSet` is an efficient structure for storing sets of consecutive
//! byte offsets. Instead of an entry per value, only the half-open bounds
//! `[start, end)` of each run are stored. Adjacent and overlapping runs are
//! merged on insert, so the set is always sorted, disjoint and minimal.

use std::collections::VecDeque;
use core::{fmt, ops::Range};

#[derive(Clone, Copy, PartialEq, Eq)]
struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    #[inline]
    fn as_range(&self) -> Range<u64> {
        self.start..self.end
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: VecDeque<Interval>,
}

impl IntervalSet {
    /// Creates an empty `IntervalSet`
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the set contains no values
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Returns the number of stored intervals (not values)
    #[inline]
    pub fn interval_len(&self) -> usize {
        self.intervals.len()
    }

    /// Returns the total number of values in the set
    #[inline]
    pub fn total_len(&self) -> u64 {
        self.intervals.iter().map(|iv| iv.end - iv.start).sum()
    }

    /// Returns the lowest interval in the set
    #[inline]
    pub fn first(&self) -> Option<Range<u64>> {
        self.intervals.front().map(Interval::as_range)
    }

    /// Returns the highest interval in the set
    #[inline]
    pub fn last(&self) -> Option<Range<u64>> {
        self.intervals.back().map(Interval::as_range)
    }

    /// Removes all values from the set
    #[inline]
    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// Iterates over the stored intervals in ascending order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.intervals.iter().map(Interval::as_range)
    }

    /// Inserts `range`, merging it with any overlapping or adjacent runs
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // `first..last` spans every interval that overlaps or abuts the
        // inserted range
        let first = self.intervals.partition_point(|iv| iv.end < start);
        let last = self.intervals.partition_point(|iv| iv.start <= end);
        if first < last {
            start = start.min(self.intervals[first].start);
            end = end.max(self.intervals[last - 1].end);
            self.intervals.drain(first..last);
        }
        self.intervals.insert(first, Interval { start, end });
    }

    /// Inserts `range`, optimized for the common case where new data lands
    /// at or after the end of the set
    pub fn insert_optimized_for_append(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        match self.intervals.back_mut() {
            Some(last) if range.start == last.end => last.end = last.end.max(range.end),
            Some(last) if range.start > last.end => {
                self.intervals.push_back(Interval {
                    start: range.start,
                    end: range.end,
                });
            }
            None => self.intervals.push_back(Interval {
                start: range.start,
                end: range.end,
            }),
            _ => self.insert(range),
        }
    }

    /// Removes `range` from the set, trimming or splitting runs as needed
    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end || self.intervals.is_empty() {
            return;
        }
        let start = range.start;
        let end = range.end;

        let first = self.intervals.partition_point(|iv| iv.end <= start);
        let last = self.intervals.partition_point(|iv| iv.start < end);
        if first >= last {
            return;
        }

        if last - first == 1 {
            let iv = self.intervals[first];
            match (iv.start < start, iv.end > end) {
                (true, true) => {
                    // removal is strictly inside a single run
                    self.intervals[first].end = start;
                    self.intervals.insert(
                        first + 1,
                        Interval {
                            start: end,
                            end: iv.end,
                        },
                    );
                }
                (true, false) => self.intervals[first].end = start,
                (false, true) => self.intervals[first].start = end,
                (false, false) => {
                    self.intervals.remove(first);
                }
            }
            return;
        }

        let mut drain_start = first;
        if self.intervals[first].start < start {
            self.intervals[first].end = start;
            drain_start += 1;
        }
        let mut drain_end = last;
        if self.intervals[last - 1].end > end {
            self.intervals[last - 1].start = end;
            drain_end -= 1;
        }
        self.intervals.drain(drain_start..drain_end);
    }

    /// Returns true if every value in `range` is in the set
    pub fn contains(&self, range: &Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        let idx = self.intervals.partition_point(|iv| iv.start <= range.start);
        if idx == 0 {
            return false;
        }
        self.intervals[idx - 1].end >= range.end
    }

    /// Returns true if the set contains `value`
    #[inline]
    pub fn contains_value(&self, value: u64) -> bool {
        self.contains(&(value..value + 1))
    }

    /// Returns true if no value in `range` is in the set
    pub fn is_disjoint(&self, range: &Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        let idx = self.intervals.partition_point(|iv| iv.end <= range.start);
        match self.intervals.get(idx) {
            Some(iv) => iv.start >= range.end,
            None => true,
        }
    }

    /// Returns the parts of `range` that are not in the set, in ascending
    /// order
    pub fn difference_of(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut result = Vec::new();
        if range.start >= range.end {
            return result;
        }
        let mut cursor = range.start;
        let first = self.intervals.partition_point(|iv| iv.end <= range.start);
        for iv in self.intervals.iter().skip(first) {
            if iv.start >= range.end {
                break;
            }
            if iv.start > cursor {
                result.push(cursor..iv.start);
            }
            cursor = cursor.max(iv.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            result.push(cursor..range.end);
        }
        result
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.intervals.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(ranges: &[Range<u64>]) -> IntervalSet {
        let mut set = IntervalSet::new();
        for range in ranges {
            set.insert(range.clone());
        }
        set
    }

    #[test]
    fn insert_merges_adjacent_and_overlapping() {
        let mut set = IntervalSet::new();
        set.insert(0..4);
        set.insert(8..12);
        assert_eq!(set.interval_len(), 2);

        // adjacent on both sides
        set.insert(4..8);
        assert_eq!(set.interval_len(), 1);
        assert_eq!(set.first(), Some(0..12));

        // overlapping extension
        set.insert(10..20);
        assert_eq!(set.first(), Some(0..20));
        assert_eq!(set.total_len(), 20);
    }

    #[test]
    fn insert_optimized_for_append_matches_insert() {
        let mut fast = IntervalSet::new();
        let mut slow = IntervalSet::new();
        for range in [0..5, 5..9, 20..25, 3..6, 30..31] {
            fast.insert_optimized_for_append(range.clone());
            slow.insert(range);
            assert_eq!(fast, slow);
        }
    }

    #[test]
    fn remove_trims_and_splits() {
        let mut set = set_of(&[0..10, 20..30]);

        // split the first run
        set.remove(2..4);
        assert_eq!(set.iter().collect::<Vec<_>>(), [0..2, 4..10, 20..30]);

        // trim across multiple runs
        set.remove(5..25);
        assert_eq!(set.iter().collect::<Vec<_>>(), [0..2, 4..5, 25..30]);

        // remove everything
        set.remove(0..100);
        assert!(set.is_empty());
    }

    #[test]
    fn contains_and_disjoint() {
        let set = set_of(&[10..20, 30..40]);
        assert!(set.contains(&(10..20)));
        assert!(set.contains(&(12..18)));
        assert!(!set.contains(&(15..25)));
        assert!(!set.contains(&(0..5)));
        assert!(set.contains_value(10));
        assert!(!set.contains_value(20));

        assert!(set.is_disjoint(&(0..10)));
        assert!(set.is_disjoint(&(20..30)));
        assert!(!set.is_disjoint(&(19..21)));
        assert!(!set.is_disjoint(&(35..50)));
    }

    #[test]
    fn difference_of_reports_holes() {
        let set = set_of(&[10..20, 30..40]);
        assert_eq!(set.difference_of(0..50), [0..10, 20..30, 40..50]);
        assert_eq!(set.difference_of(10..20), Vec::<Range<u64>>::new());
        assert_eq!(set.difference_of(15..35), [20..30]);
        assert_eq!(set.difference_of(40..45), [40..45]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn model_check() {
        use std::collections::BTreeSet;

        bolero::check!()
            .with_type::<Vec<(u8, u8, bool)>>()
            .for_each(|ops| {
                let mut set = IntervalSet::new();
                let mut model: BTreeSet<u64> = BTreeSet::new();

                for (start, len, is_insert) in ops {
                    let start = *start as u64;
                    let end = start + (*len as u64);
                    if *is_insert {
                        set.insert(start..end);
                        model.extend(start..end);
                    } else {
                        set.remove(start..end);
                        for value in start..end {
                            model.remove(&value);
                        }
                    }

                    assert_eq!(set.total_len(), model.len() as u64);
                    for range in set.iter() {
                        assert!(range.start < range.end);
                        for value in range {
                            assert!(model.contains(&value));
                        }
                    }
                }
            });
    }
}
