//! Integer sets built from mixed range specifications.
//!
//! Commodity codes and table availability are written in metadata as bare
//! integers, lists, `{start, end, step}` mappings, or nested groups of those.
//! [`NumberSet`] stores them as a union of half-open stepped ranges.

use std::collections::BTreeSet;

use hbs_model::{HbsError, Result};

use crate::value::{MetaKey, MetaValue};

/// Half-open range `[start, end)` taking every `step`-th integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepRange {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl StepRange {
    pub fn new(start: i64, end: i64, step: i64) -> Result<Self> {
        if step <= 0 {
            return Err(HbsError::InvalidRange {
                reason: format!("step must be positive, got {step}"),
            });
        }
        Ok(Self { start, end, step })
    }

    fn single(value: i64) -> Result<Self> {
        let end = value.checked_add(1).ok_or_else(|| HbsError::InvalidRange {
            reason: format!("{value} is too large"),
        })?;
        Ok(Self {
            start: value,
            end,
            step: 1,
        })
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.start
            && value < self.end
            && value.abs_diff(self.start) % self.step.unsigned_abs() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let span = self.end.abs_diff(self.start);
        let count = span.div_ceil(self.step.unsigned_abs());
        usize::try_from(count).unwrap_or(usize::MAX)
    }

    /// Largest member. The range must not be empty.
    fn last(&self) -> i64 {
        let span = self.end.abs_diff(self.start) - 1;
        let offset = span - span % self.step.unsigned_abs();
        self.start.saturating_add_unsigned(offset)
    }

    /// Same members, with `end` one past the last member.
    fn canonical(self) -> Self {
        if self.is_empty() {
            return self;
        }
        let last = self.last();
        // last < end, so last + 1 cannot overflow
        let step = if last == self.start { 1 } else { self.step };
        Self {
            start: self.start,
            end: last + 1,
            step,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        (self.start..self.end).step_by(usize::try_from(self.step).unwrap_or(usize::MAX))
    }
}

/// Parsing options for [`NumberSet::parse_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeOptions {
    pub default_start: Option<i64>,
    pub default_end: Option<i64>,
    pub default_step: i64,
    /// When set, mappings contribute only these entries (plus `start`/`end`).
    pub keywords: Vec<String>,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            default_start: None,
            default_end: None,
            default_step: 1,
            keywords: Vec::new(),
        }
    }
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_start(mut self, start: i64) -> Self {
        self.default_start = Some(start);
        self
    }

    pub fn with_default_end(mut self, end: i64) -> Self {
        self.default_end = Some(end);
        self
    }

    pub fn with_default_step(mut self, step: i64) -> Self {
        self.default_step = step;
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }
}

/// A set of integers stored as a union of stepped ranges.
#[derive(Debug, Clone, Default)]
pub struct NumberSet {
    ranges: Vec<StepRange>,
    min: Option<i64>,
    max: Option<i64>,
}

impl NumberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a range definition with default options.
    pub fn parse(input: &MetaValue) -> Result<Self> {
        Self::parse_with(input, &RangeOptions::default())
    }

    pub fn parse_with(input: &MetaValue, options: &RangeOptions) -> Result<Self> {
        let mut ranges = Vec::new();
        collect(input, options, &mut ranges)?;
        Ok(Self::from_ranges(ranges))
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = StepRange>) -> Self {
        let mut set = Self {
            ranges: ranges.into_iter().filter(|r| !r.is_empty()).collect(),
            min: None,
            max: None,
        };
        set.normalize();
        set
    }

    pub fn contains(&self, value: i64) -> bool {
        match (self.min, self.max) {
            (Some(min), Some(max)) if value >= min && value <= max => {
                self.ranges.iter().any(|range| range.contains(value))
            }
            _ => false,
        }
    }

    pub fn union(&self, other: &NumberSet) -> NumberSet {
        Self::from_ranges(self.ranges.iter().chain(other.ranges.iter()).copied())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[StepRange] {
        &self.ranges
    }

    pub fn min(&self) -> Option<i64> {
        self.min
    }

    pub fn max(&self) -> Option<i64> {
        self.max
    }

    /// Every member in ascending order.
    pub fn values(&self) -> BTreeSet<i64> {
        self.ranges.iter().flat_map(StepRange::iter).collect()
    }

    /// Sorts the ranges and coalesces overlapping or touching unit-step ranges.
    fn normalize(&mut self) {
        let mut ranges: Vec<StepRange> = self
            .ranges
            .iter()
            .map(|range| range.canonical())
            .collect();
        ranges.sort();
        ranges.dedup();

        let (unit, stepped): (Vec<StepRange>, Vec<StepRange>) =
            ranges.into_iter().partition(|range| range.step == 1);
        let mut merged: Vec<StepRange> = Vec::with_capacity(unit.len());
        for range in unit {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        merged.extend(stepped);
        merged.sort();

        self.min = merged.iter().map(|range| range.start).min();
        self.max = merged.iter().map(StepRange::last).max();
        self.ranges = merged;
    }
}

/// Residue classes checked before [`NumberSet::covers`] falls back to a
/// member-by-member walk.
const MAX_RESIDUE_CLASSES: i128 = 1 << 12;

impl NumberSet {
    /// Whether every member of `range` belongs to the set.
    ///
    /// With `l` the least common multiple of all steps involved, members are
    /// split by residue modulo `l`. Within one class every range is a plain
    /// interval, so coverage is a sweep over sorted intervals.
    fn covers(&self, range: &StepRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let step = i128::from(range.step);
        let modulus = self
            .ranges
            .iter()
            .try_fold(step, |acc, own| lcm(acc, i128::from(own.step)));
        let Some(modulus) = modulus.filter(|l| l / step <= MAX_RESIDUE_CLASSES) else {
            return range.iter().all(|value| self.contains(value));
        };

        let last = i128::from(range.last());
        let mut class_start = i128::from(range.start);
        while class_start <= last && class_start < i128::from(range.start) + modulus {
            let class_last = class_start + (last - class_start) / modulus * modulus;
            let mut intervals: Vec<(i128, i128)> = self
                .ranges
                .iter()
                .filter_map(|own| {
                    let own_start = i128::from(own.start);
                    let own_last = i128::from(own.last());
                    if (class_start - own_start).rem_euclid(i128::from(own.step)) != 0 {
                        return None;
                    }
                    let first = own_start + (class_start - own_start).rem_euclid(modulus);
                    (first <= own_last)
                        .then(|| (first, first + (own_last - first) / modulus * modulus))
                })
                .collect();
            intervals.sort_unstable();

            let mut cursor = class_start;
            for (first, end) in intervals {
                if first > cursor || cursor > class_last {
                    break;
                }
                cursor = cursor.max(end + modulus);
            }
            if cursor <= class_last {
                return false;
            }
            class_start += step;
        }
        true
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: i128, b: i128) -> Option<i128> {
    (a / gcd(a, b)).checked_mul(b)
}

impl PartialEq for NumberSet {
    fn eq(&self, other: &Self) -> bool {
        if self.ranges == other.ranges {
            return true;
        }
        if self.min != other.min || self.max != other.max {
            return false;
        }
        let all_unit = |set: &NumberSet| set.ranges.iter().all(|range| range.step == 1);
        if all_unit(self) && all_unit(other) {
            // normalized unit ranges are canonical
            return false;
        }
        self.ranges.iter().all(|range| other.covers(range))
            && other.ranges.iter().all(|range| self.covers(range))
    }
}

impl std::ops::Add for &NumberSet {
    type Output = NumberSet;

    fn add(self, rhs: &NumberSet) -> NumberSet {
        self.union(rhs)
    }
}

fn collect(input: &MetaValue, options: &RangeOptions, out: &mut Vec<StepRange>) -> Result<()> {
    match input {
        MetaValue::Int(value) => out.push(StepRange::single(*value)?),
        MetaValue::Float(_) => {
            if let Some(value) = input.as_i64() {
                out.push(StepRange::single(value)?);
            }
        }
        MetaValue::Seq(items) => {
            for item in items {
                collect(item, options, out)?;
            }
        }
        MetaValue::Map(map) => {
            let mut matched_keyword = false;
            for keyword in &options.keywords {
                if let Some(value) = map.get(&MetaKey::Str(keyword.clone())) {
                    matched_keyword = true;
                    collect(value, options, out)?;
                }
            }
            let has_bounds = input.contains_key("start") || input.contains_key("end");
            if has_bounds {
                out.push(parse_bounds(input, options)?);
            } else if !matched_keyword {
                return Err(HbsError::InvalidRange {
                    reason: "start or end must be specified".to_string(),
                });
            }
        }
        MetaValue::Null | MetaValue::Bool(_) | MetaValue::Str(_) => {}
    }
    Ok(())
}

fn parse_bounds(input: &MetaValue, options: &RangeOptions) -> Result<StepRange> {
    let bound = |key: &str, default: Option<i64>| -> Result<i64> {
        match input.get(key) {
            Some(value) => value.as_i64().ok_or_else(|| HbsError::InvalidRange {
                reason: format!("{key} must be an integer, found {}", value.type_name()),
            }),
            None => default.ok_or_else(|| HbsError::InvalidRange {
                reason: format!("{key} must be specified"),
            }),
        }
    };
    let start = bound("start", options.default_start)?;
    let end = bound("end", options.default_end)?;
    let step = bound("step", Some(options.default_step))?;
    StepRange::new(start, end, step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> MetaValue {
        MetaValue::from_yaml_str(text, "test").unwrap()
    }

    #[test]
    fn single_integer() {
        let set = NumberSet::parse(&MetaValue::Int(2)).unwrap();
        assert!(set.contains(2));
        assert!(!set.contains(4));
    }

    #[test]
    fn list_of_integers() {
        let set = NumberSet::parse(&yaml("[2, 4, 5, 6, 6, 9, 11]")).unwrap();
        for v in [2, 4, 5, 6, 9, 11] {
            assert!(set.contains(v), "{v} should be a member");
        }
        for v in [1, 3, 7, 13] {
            assert!(!set.contains(v), "{v} should not be a member");
        }
    }

    #[test]
    fn mapping_without_bounds_fails() {
        for text in ["{begin: 10, finish: 20}", "{a: 12, c: [8, 9, 10]}", "[1, {}]"] {
            let err = NumberSet::parse(&yaml(text)).unwrap_err();
            assert_eq!(err.to_string(), "invalid range: start or end must be specified", "{text}");
        }
    }

    #[test]
    fn non_integer_bound_fails() {
        let err = NumberSet::parse(&yaml("{start: first, end: 20}")).unwrap_err();
        assert!(matches!(err, HbsError::InvalidRange { .. }));
        let err = NumberSet::parse(&yaml("{start: 1, end: 20, step: [2]}")).unwrap_err();
        assert!(matches!(err, HbsError::InvalidRange { .. }));
        let err = NumberSet::parse(&yaml("{start: 1, end: 20, step: 0}")).unwrap_err();
        assert!(matches!(err, HbsError::InvalidRange { .. }));
    }

    #[test]
    fn extreme_values() {
        let err = NumberSet::parse(&MetaValue::Int(i64::MAX)).unwrap_err();
        assert!(matches!(err, HbsError::InvalidRange { .. }));

        let wide = StepRange::new(i64::MIN, i64::MAX, 1).unwrap();
        assert_eq!(wide.len(), usize::try_from(u64::MAX).unwrap_or(usize::MAX));
        assert!(wide.contains(i64::MAX - 1));
        assert!(wide.contains(i64::MIN));

        let set = NumberSet::from_ranges([StepRange::new(i64::MIN, i64::MAX, 3).unwrap()]);
        assert!(set.contains(i64::MIN + 3));
        assert!(!set.contains(i64::MIN + 4));
        assert_eq!(set.max(), Some(i64::MAX - 3));
    }

    #[test]
    fn large_stepped_ranges_compare_without_expansion() {
        let one = NumberSet::from_ranges([StepRange::new(0, 4_000_000_000_000, 2).unwrap()]);
        let same = NumberSet::from_ranges([StepRange::new(0, 3_999_999_999_999, 2).unwrap()]);
        assert_eq!(one, same);

        let halves = NumberSet::from_ranges([
            StepRange::new(0, 2_000_000_000_000, 2).unwrap(),
            StepRange::new(2_000_000_000_000, 4_000_000_000_000, 2).unwrap(),
        ]);
        assert_eq!(one, halves);

        let fours = NumberSet::from_ranges([
            StepRange::new(0, 4_000_000_000_000, 4).unwrap(),
            StepRange::new(2, 4_000_000_000_000, 4).unwrap(),
        ]);
        assert_eq!(one, fours);

        let shifted = NumberSet::from_ranges([
            StepRange::new(0, 4_000_000_000_000, 4).unwrap(),
            StepRange::new(2, 3_000_000_000_000, 4).unwrap(),
            StepRange::new(3_000_000_000_001, 4_000_000_000_000, 4).unwrap(),
            StepRange::new(3_999_999_999_998, 3_999_999_999_999, 1).unwrap(),
        ]);
        assert_ne!(one, shifted);
    }

    #[test]
    fn half_open_range() {
        let set = NumberSet::parse(&yaml("{start: 1000, end: 2000}")).unwrap();
        assert!(!set.contains(500));
        assert!(set.contains(1000));
        assert!(set.contains(1999));
        assert!(!set.contains(2000));
    }

    #[test]
    fn defaults_fill_missing_bounds() {
        let options = RangeOptions::new()
            .with_default_start(1000)
            .with_default_end(2000);
        let set = NumberSet::parse_with(&yaml("{end: 1500}"), &options).unwrap();
        assert!(set.contains(1000));
        assert!(!set.contains(1500));
        let set = NumberSet::parse_with(&yaml("{start: 1500}"), &options).unwrap();
        assert!(set.contains(1999));
        assert!(!set.contains(2000));
    }

    #[test]
    fn missing_bound_without_default_fails() {
        let err = NumberSet::parse(&yaml("{start: 10}")).unwrap_err();
        assert!(matches!(err, HbsError::InvalidRange { .. }));
    }

    #[test]
    fn stepped_range() {
        let set = NumberSet::parse(&yaml("{start: 1000, end: 2000, step: 5}")).unwrap();
        assert!(set.contains(1500));
        assert!(!set.contains(1234));
        assert!(!set.contains(1999));
        assert_eq!(set.max(), Some(1995));
    }

    #[test]
    fn keywords_select_entries() {
        let options = RangeOptions::new().with_keyword("code");
        let set =
            NumberSet::parse_with(&yaml("{code: [11111, {start: 11120, end: 11130}]}"), &options)
                .unwrap();
        assert!(set.contains(11111));
        assert!(set.contains(11125));
        assert!(!set.contains(11130));
        let err = NumberSet::parse_with(&yaml("{other: 5}"), &options).unwrap_err();
        assert!(matches!(err, HbsError::InvalidRange { .. }));
    }

    #[test]
    fn equality_by_members() {
        let listed = NumberSet::parse(&yaml("[1, 2, 3, 4, 5, 6, 7, 8, 9]")).unwrap();
        let ranged = NumberSet::parse(&yaml("{start: 1, end: 10}")).unwrap();
        assert_eq!(listed, ranged);

        let stepped = NumberSet::parse(&yaml("{start: 1, end: 10, step: 2}")).unwrap();
        let odd = NumberSet::parse(&yaml("[1, 3, 5, 7, 9]")).unwrap();
        assert_eq!(stepped, odd);
        assert_ne!(stepped, listed);
    }

    #[test]
    fn union_of_adjacent_ranges() {
        let a = NumberSet::parse(&yaml("{start: 1, end: 10}")).unwrap();
        let b = NumberSet::parse(&yaml("{start: 10, end: 20}")).unwrap();
        let c = NumberSet::parse(&yaml("{start: 1, end: 20}")).unwrap();
        let sum = &a + &b;
        assert_eq!(sum, c);
        assert_eq!(sum.ranges().len(), 1);

        let ints = NumberSet::parse(&yaml("[1, 2, 3, 4]")).unwrap();
        let six = NumberSet::parse(&MetaValue::Int(6)).unwrap();
        let expected = NumberSet::parse(&yaml("[1, 2, 3, 4, 6]")).unwrap();
        assert_eq!(ints.union(&six), expected);
    }
}
