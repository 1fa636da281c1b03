//! Time, interval and slot arithmetic for family windows.
//!
//! A family covers one interval-aligned time window. Inside the window,
//! timestamps are bucketed into `u16` slots: slot 0 is the window start,
//! each slot spans one storage interval.

use serde::{Deserialize, Serialize};

/// A storage interval in milliseconds (e.g. 10s, 5m).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval(i64);

impl Interval {
    pub const fn from_millis(millis: i64) -> Self {
        Interval(millis)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Interval(secs * 1_000)
    }

    pub const fn from_mins(mins: i64) -> Self {
        Interval(mins * 60_000)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Calculator bound to this interval.
    pub fn calculator(&self) -> IntervalCalculator {
        IntervalCalculator { interval: *self }
    }
}

/// Half-open time range `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        TimeRange { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Inclusive slot range `[start, end]` within a family window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        SlotRange { start, end }
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn union(&self, other: &SlotRange) -> SlotRange {
        SlotRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Slot and window arithmetic for one storage interval.
#[derive(Debug, Clone, Copy)]
pub struct IntervalCalculator {
    interval: Interval,
}

impl IntervalCalculator {
    /// Slot index of `timestamp` inside the family window starting at
    /// `family_time`. The caller guarantees the timestamp was routed into
    /// this window, so the result fits a `u16`.
    pub fn calc_slot(&self, timestamp: i64, family_time: i64) -> u16 {
        ((timestamp - family_time) / self.interval.as_millis()) as u16
    }

    /// Window start for `timestamp` given the family window width.
    pub fn calc_family_time(&self, timestamp: i64, window: Interval) -> i64 {
        timestamp - timestamp.rem_euclid(window.as_millis())
    }

    /// The query's slot window inside the family starting at `family_time`,
    /// clamped to the family window. `None` when the query misses the
    /// window entirely.
    pub fn slot_range(
        &self,
        family_time: i64,
        family_range: &TimeRange,
        query: &TimeRange,
    ) -> Option<SlotRange> {
        if !family_range.overlaps(query) {
            return None;
        }
        let start = query.start.max(family_range.start);
        // end is exclusive; the last covered slot holds `end - 1`
        let end = (query.end - 1).min(family_range.end - 1);
        Some(SlotRange {
            start: self.calc_slot(start, family_time),
            end: self.calc_slot(end, family_time),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_slot() {
        let calc = Interval::from_secs(10).calculator();
        assert_eq!(calc.calc_slot(0, 0), 0);
        assert_eq!(calc.calc_slot(1_000, 0), 0);
        assert_eq!(calc.calc_slot(9_999, 0), 0);
        assert_eq!(calc.calc_slot(10_000, 0), 1);
        assert_eq!(calc.calc_slot(95_000, 0), 9);
        // non-zero family time
        assert_eq!(calc.calc_slot(3_610_000, 3_600_000), 1);
    }

    #[test]
    fn test_calc_family_time_aligns_down() {
        let calc = Interval::from_secs(10).calculator();
        let hour = Interval::from_mins(60);
        assert_eq!(calc.calc_family_time(0, hour), 0);
        assert_eq!(calc.calc_family_time(3_599_999, hour), 0);
        assert_eq!(calc.calc_family_time(3_600_000, hour), 3_600_000);
        assert_eq!(calc.calc_family_time(5_400_000, hour), 3_600_000);
    }

    #[test]
    fn test_time_range_overlap() {
        let a = TimeRange::new(0, 100);
        assert!(a.overlaps(&TimeRange::new(50, 150)));
        assert!(a.overlaps(&TimeRange::new(99, 100)));
        assert!(!a.overlaps(&TimeRange::new(100, 200)));
        assert!(!a.overlaps(&TimeRange::new(-50, 0)));
    }

    #[test]
    fn test_slot_range_overlap_and_union() {
        let a = SlotRange::new(0, 10);
        assert!(a.overlaps(&SlotRange::new(10, 20)));
        assert!(!a.overlaps(&SlotRange::new(11, 20)));
        assert_eq!(a.union(&SlotRange::new(5, 20)), SlotRange::new(0, 20));
    }

    #[test]
    fn test_slot_range_for_query() {
        let calc = Interval::from_secs(10).calculator();
        let family = TimeRange::new(0, 3_600_000);
        // query fully inside the window
        let range = calc
            .slot_range(0, &family, &TimeRange::new(20_000, 40_000))
            .unwrap();
        assert_eq!(range, SlotRange::new(2, 3));
        // query sticking out both sides clamps to the window
        let range = calc
            .slot_range(0, &family, &TimeRange::new(-10_000, 7_200_000))
            .unwrap();
        assert_eq!(range, SlotRange::new(0, 359));
        // disjoint query
        assert!(calc
            .slot_range(0, &family, &TimeRange::new(3_600_000, 7_200_000))
            .is_none());
    }
}
