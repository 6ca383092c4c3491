//! Partial volume descriptors - strided selections over a series' image numbers

use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default number of terms rendered by [`PartialVolumeDescriptor::describe`]
pub const DEFAULT_DESCRIBE_TERMS: usize = 4;

/// Arithmetic progression `start, start + delta, ..., end` over image numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialVolumeDescriptor {
    pub start: i32,
    pub end: i32,
    pub delta: i32,
}

impl PartialVolumeDescriptor {
    pub fn new(start: i32, end: i32, delta: i32) -> Self {
        Self { start, end, delta }
    }

    /// Check the descriptor invariants.
    ///
    /// `start == end` is only accepted with `delta == 1`.
    pub fn is_valid(&self) -> bool {
        let Self { start, end, delta } = *self;
        if start <= 0 || end <= 0 || delta == 0 {
            return false;
        }
        if start == end {
            return delta == 1;
        }
        let span = end as i64 - start as i64;
        span.signum() == (delta as i64).signum() && span % delta as i64 == 0
    }

    /// Fail with a validation error unless the descriptor is valid
    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(VolumeError::Validation(format!(
                "Invalid partial volume descriptor: start={}, end={}, delta={}",
                self.start, self.end, self.delta
            )))
        }
    }

    /// Number of selected images
    pub fn count(&self) -> Result<usize> {
        self.validate()?;
        Ok(self.count_unchecked())
    }

    fn count_unchecked(&self) -> usize {
        ((self.end as i64 - self.start as i64) / self.delta as i64 + 1) as usize
    }

    fn nth_unchecked(&self, index: usize) -> i32 {
        (self.start as i64 + index as i64 * self.delta as i64) as i32
    }

    /// Expand to the explicit ordered list of image numbers
    pub fn to_sequence(&self) -> Result<Vec<i32>> {
        let count = self.count()?;
        Ok((0..count).map(|i| self.nth_unchecked(i)).collect())
    }

    /// Position of `image_number` within the selection, if selected
    pub fn index_of(&self, image_number: i32) -> Option<usize> {
        if !self.is_valid() {
            return None;
        }
        let offset = image_number as i64 - self.start as i64;
        if offset % self.delta as i64 != 0 {
            return None;
        }
        let index = offset / self.delta as i64;
        if index < 0 || index as usize >= self.count_unchecked() {
            return None;
        }
        Some(index as usize)
    }

    /// Smallest and largest selected image numbers
    pub fn bounds(&self) -> (i32, i32) {
        (self.start.min(self.end), self.start.max(self.end))
    }

    /// Render as a human readable list.
    ///
    /// Sequences longer than `max_terms` show the first `max_terms - 1`
    /// terms, an ellipsis and the final term. Invalid descriptors render as
    /// `"Invalid"`.
    pub fn describe(&self, max_terms: usize) -> String {
        if !self.is_valid() {
            return "Invalid".to_string();
        }
        let count = self.count_unchecked();
        let max_terms = max_terms.max(2);
        let mut terms: Vec<String> = Vec::new();
        if count <= max_terms {
            terms.extend((0..count).map(|i| self.nth_unchecked(i).to_string()));
        } else {
            terms.extend((0..max_terms - 1).map(|i| self.nth_unchecked(i).to_string()));
            terms.push("...".to_string());
            terms.push(self.end.to_string());
        }
        terms.join(", ")
    }
}

impl fmt::Display for PartialVolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(DEFAULT_DESCRIBE_TERMS))
    }
}

/// Check whether every image selected by `descriptor` is in `present`.
///
/// The contiguous span between the descriptor bounds is tested first; for
/// strides wider than one each stepped image is checked individually.
pub fn range_contains(present: &ImageRanges, descriptor: &PartialVolumeDescriptor) -> Result<bool> {
    descriptor.validate()?;
    let (lo, hi) = descriptor.bounds();
    if present.contains_range(lo as u32, hi as u32) {
        return Ok(true);
    }
    if descriptor.delta.abs() == 1 {
        return Ok(false);
    }
    Ok(descriptor
        .to_sequence()?
        .into_iter()
        .all(|n| present.contains(n as u32)))
}

/// Sorted set of disjoint inclusive ranges, e.g. `1-50,53,60-62`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ImageRanges {
    ranges: Vec<(u32, u32)>,
}

impl ImageRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a single inclusive range
    pub fn from_range(lo: u32, hi: u32) -> Self {
        let mut set = Self::new();
        set.insert_range(lo, hi);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of values in the set
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo) as usize + 1)
            .sum()
    }

    /// Disjoint inclusive ranges in ascending order
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    pub fn insert(&mut self, value: u32) {
        self.insert_range(value, value);
    }

    /// Insert `lo..=hi`, merging with touching or overlapping ranges
    pub fn insert_range(&mut self, lo: u32, hi: u32) {
        let (mut lo, mut hi) = (lo.min(hi), lo.max(hi));
        // First range that could touch [lo, hi]
        let first = self
            .ranges
            .partition_point(|&(_, h)| h.saturating_add(1) < lo);
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].0 <= hi.saturating_add(1) {
            lo = lo.min(self.ranges[last].0);
            hi = hi.max(self.ranges[last].1);
            last += 1;
        }
        self.ranges.splice(first..last, std::iter::once((lo, hi)));
    }

    pub fn contains(&self, value: u32) -> bool {
        self.contains_range(value, value)
    }

    /// Check that every value in `lo..=hi` is present
    pub fn contains_range(&self, lo: u32, hi: u32) -> bool {
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let idx = self.ranges.partition_point(|&(_, h)| h < lo);
        self.ranges
            .get(idx)
            .is_some_and(|&(l, h)| l <= lo && hi <= h)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(lo, hi)| lo..=hi)
    }
}

impl FromStr for ImageRanges {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = ImageRanges::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parse = |v: &str| {
                v.trim().parse::<u32>().map_err(|_| {
                    VolumeError::Validation(format!("Invalid image range element: {}", part))
                })
            };
            match part.split_once('-') {
                Some((lo, hi)) => set.insert_range(parse(lo)?, parse(hi)?),
                None => set.insert(parse(part)?),
            }
        }
        Ok(set)
    }
}

impl fmt::Display for ImageRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|&(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{}-{}", lo, hi)
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl Serialize for ImageRanges {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageRanges {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromIterator<u32> for ImageRanges {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = ImageRanges::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}
