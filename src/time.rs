//! Interval algebra over kernel absolute time
//!
//! Every other part of the reconstruction stores time as [`AbsTime`] points
//! and half-open [`AbsInterval`] ranges. Sequences of intervals that describe
//! non-overlapping observations are kept sorted and non-overlapping; the two
//! sweep helpers [`union_of`] and [`intersect_of`] rely on that and never
//! re-sort.
//!
//! # Example
//!
//! ```
//! use kdscope::time::{union_of, intersect_of, AbsInterval, AbsTime};
//!
//! let a = vec![AbsInterval::from_bounds(AbsTime(0), AbsTime(10))];
//! let b = vec![AbsInterval::from_bounds(AbsTime(5), AbsTime(20))];
//!
//! assert_eq!(union_of(&a, &b), vec![AbsInterval::from_bounds(AbsTime(0), AbsTime(20))]);
//! assert_eq!(intersect_of(&a, &b), vec![AbsInterval::from_bounds(AbsTime(5), AbsTime(10))]);
//! ```

use serde::Serialize;
use std::fmt;
use std::ops::{Add, Sub};

/// Opaque monotonic kernel timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AbsTime(pub u64);

impl AbsTime {
    pub const ZERO: AbsTime = AbsTime(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Add<u64> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: u64) -> AbsTime {
        AbsTime(self.0.saturating_add(rhs))
    }
}

impl Sub<u64> for AbsTime {
    type Output = AbsTime;

    fn sub(self, rhs: u64) -> AbsTime {
        AbsTime(self.0.saturating_sub(rhs))
    }
}

impl Sub<AbsTime> for AbsTime {
    type Output = u64;

    fn sub(self, rhs: AbsTime) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for AbsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open time range `[location, location + length)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct AbsInterval {
    location: AbsTime,
    length: u64,
}

impl AbsInterval {
    pub fn new(location: AbsTime, length: u64) -> Self {
        assert!(
            location.0.checked_add(length).is_some(),
            "interval [{}, +{}) overflows AbsTime",
            location,
            length
        );
        Self { location, length }
    }

    /// Build `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `end < start`.
    pub fn from_bounds(start: AbsTime, end: AbsTime) -> Self {
        assert!(end >= start, "interval end {} precedes start {}", end, start);
        Self {
            location: start,
            length: end.0 - start.0,
        }
    }

    pub fn location(&self) -> AbsTime {
        self.location
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// First instant past the end of the interval
    pub fn max(&self) -> AbsTime {
        AbsTime(self.location.0 + self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, point: AbsTime) -> bool {
        point >= self.location && point < self.max()
    }

    /// True when `other` lies entirely inside `self`. An empty `other` is
    /// contained if its location is inside or at the end of `self`.
    pub fn contains_interval(&self, other: &AbsInterval) -> bool {
        other.location >= self.location && other.max() <= self.max()
    }

    /// True when the two intervals share at least one instant.
    pub fn intersects(&self, other: &AbsInterval) -> bool {
        self.location < other.max() && other.location < self.max()
    }

    /// Overlapping region of two intersecting intervals.
    ///
    /// # Panics
    ///
    /// Panics if the intervals do not intersect; check [`intersects`](Self::intersects) first.
    pub fn intersection(&self, other: &AbsInterval) -> AbsInterval {
        assert!(
            self.intersects(other),
            "intersection of disjoint intervals {} and {}",
            self,
            other
        );
        AbsInterval::from_bounds(
            self.location.max(other.location),
            self.max().min(other.max()),
        )
    }

    /// Smallest interval covering both, valid only when they overlap or touch.
    ///
    /// # Panics
    ///
    /// Panics if there is a gap between the two intervals.
    pub fn union(&self, other: &AbsInterval) -> AbsInterval {
        assert!(
            self.location <= other.max() && other.location <= self.max(),
            "union of separated intervals {} and {}",
            self,
            other
        );
        AbsInterval::from_bounds(
            self.location.min(other.location),
            self.max().max(other.max()),
        )
    }

    /// The part of `self` inside `window`, if any.
    pub fn clipped_to(&self, window: &AbsInterval) -> Option<AbsInterval> {
        if self.intersects(window) {
            Some(self.intersection(window))
        } else {
            None
        }
    }
}

impl fmt::Display for AbsInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.location, self.max())
    }
}

/// Check the sorted & non-overlapping invariant. Adjacent intervals are allowed.
pub fn is_sorted_non_overlapping(intervals: &[AbsInterval]) -> bool {
    intervals
        .windows(2)
        .all(|pair| pair[0].max() <= pair[1].location())
}

pub fn total_length(intervals: &[AbsInterval]) -> u64 {
    intervals.iter().map(AbsInterval::length).sum()
}

fn push_coalesced(out: &mut Vec<AbsInterval>, next: AbsInterval) {
    if next.is_empty() {
        return;
    }
    match out.last_mut() {
        Some(last) if last.max() >= next.location() => {
            *last = last.union(&next);
        }
        _ => out.push(next),
    }
}

/// Merge two sorted non-overlapping sequences into one sorted non-overlapping
/// sequence. Overlapping and adjacent intervals coalesce.
pub fn union_of(a: &[AbsInterval], b: &[AbsInterval]) -> Vec<AbsInterval> {
    debug_assert!(is_sorted_non_overlapping(a));
    debug_assert!(is_sorted_non_overlapping(b));

    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let take_a = match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) => x.location() <= y.location(),
            (Some(_), None) => true,
            _ => false,
        };
        if take_a {
            push_coalesced(&mut out, a[i]);
            i += 1;
        } else {
            push_coalesced(&mut out, b[j]);
            j += 1;
        }
    }
    out
}

/// Overlap regions of two sorted non-overlapping sequences.
pub fn intersect_of(a: &[AbsInterval], b: &[AbsInterval]) -> Vec<AbsInterval> {
    debug_assert!(is_sorted_non_overlapping(a));
    debug_assert!(is_sorted_non_overlapping(b));

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].intersects(&b[j]) {
            out.push(a[i].intersection(&b[j]));
        }
        // Advance whichever ends first; the other may still overlap the next one.
        if a[i].max() <= b[j].max() {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// Union of any number of sorted non-overlapping sequences, folded pairwise.
pub fn union_all(lists: &[Vec<AbsInterval>]) -> Vec<AbsInterval> {
    lists
        .iter()
        .fold(Vec::new(), |acc, list| union_of(&acc, list))
}

/// Intersection of every sequence. An empty input yields an empty result.
pub fn intersect_all(lists: &[Vec<AbsInterval>]) -> Vec<AbsInterval> {
    let mut iter = lists.iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    iter.fold(first.clone(), |acc, list| intersect_of(&acc, list))
}

/// Append-only list of sorted, non-overlapping intervals.
///
/// `push` is the only mutator and rejects anything that would break ordering,
/// so the invariant holds by construction for every holder of an `IntervalList`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntervalList {
    intervals: Vec<AbsInterval>,
}

impl IntervalList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interval starting at or after the current last `max()`.
    ///
    /// # Panics
    ///
    /// Panics if `interval` would overlap or precede the last stored interval.
    pub fn push(&mut self, interval: AbsInterval) {
        if let Some(last) = self.intervals.last() {
            assert!(
                interval.location() >= last.max(),
                "interval {} overlaps or precedes {}",
                interval,
                last
            );
        }
        self.intervals.push(interval);
    }

    pub fn as_slice(&self) -> &[AbsInterval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AbsInterval> {
        self.intervals.iter()
    }

    /// Intervals clipped to `window`, in order.
    pub fn clipped(&self, window: &AbsInterval) -> Vec<AbsInterval> {
        let start = self
            .intervals
            .partition_point(|i| i.max() <= window.location());
        self.intervals[start..]
            .iter()
            .take_while(|i| i.location() < window.max())
            .filter_map(|i| i.clipped_to(window))
            .collect()
    }

    /// Total length of the parts inside `window`.
    pub fn overlap_with(&self, window: &AbsInterval) -> u64 {
        total_length(&self.clipped(window))
    }

    /// Number of intervals that begin inside `window`.
    pub fn count_starting_in(&self, window: &AbsInterval) -> usize {
        self.intervals
            .iter()
            .filter(|i| window.contains(i.location()))
            .count()
    }

    /// First interval whose start is at or after `t`.
    pub fn first_starting_at_or_after(&self, t: AbsTime) -> Option<&AbsInterval> {
        let idx = self.intervals.partition_point(|i| i.location() < t);
        self.intervals.get(idx)
    }

    /// Interval containing `t`, if any.
    pub fn containing(&self, t: AbsTime) -> Option<&AbsInterval> {
        let idx = self.intervals.partition_point(|i| i.max() <= t);
        self.intervals.get(idx).filter(|i| i.contains(t))
    }
}
