//! Half-open depth ranges.
//!
//! A [`DepthRange`] names a contiguous run of slices `[start, end)` along the
//! depth axis of a volume. Ranges handed out during a run partition
//! `[0, depth)`: they are ordered by `start` only.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open interval `[start, end)` of slices. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthRange {
    start: usize,
    end: usize,
}

impl DepthRange {
    /// Creates a range, rejecting `start >= end`.
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First slice in the range.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last slice.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of slices, always at least one.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True if the range lies inside a volume of `depth` slices.
    #[inline]
    pub fn is_within(&self, depth: usize) -> bool {
        self.end <= depth
    }

    /// True if the two ranges share at least one slice.
    pub fn overlaps(&self, other: &DepthRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Extends the range by `halo` slices on both sides, clamped to `[0, depth)`.
    pub fn expand(&self, halo: usize, depth: usize) -> DepthRange {
        DepthRange {
            start: self.start.saturating_sub(halo),
            end: self.end.saturating_add(halo).min(depth).max(self.end),
        }
    }
}

impl PartialOrd for DepthRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DepthRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start).then(self.end.cmp(&other.end))
    }
}

impl fmt::Display for DepthRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty() {
        assert!(DepthRange::new(3, 3).is_err());
        assert!(DepthRange::new(5, 2).is_err());
        assert_eq!(DepthRange::new(2, 5).unwrap().len(), 3);
    }

    #[test]
    fn test_expand_clamps() {
        let r = DepthRange::new(10, 20).unwrap();
        assert_eq!(r.expand(4, 50), DepthRange::new(6, 24).unwrap());

        let head = DepthRange::new(0, 20).unwrap();
        assert_eq!(head.expand(4, 50), DepthRange::new(0, 24).unwrap());

        let tail = DepthRange::new(40, 50).unwrap();
        assert_eq!(tail.expand(4, 50), DepthRange::new(36, 50).unwrap());
    }

    #[test]
    fn test_overlaps() {
        let a = DepthRange::new(0, 10).unwrap();
        let b = DepthRange::new(10, 20).unwrap();
        let c = DepthRange::new(9, 11).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_ordering_by_start() {
        let mut ranges = vec![
            DepthRange::new(20, 30).unwrap(),
            DepthRange::new(0, 10).unwrap(),
            DepthRange::new(10, 20).unwrap(),
        ];
        ranges.sort();
        let starts: Vec<usize> = ranges.iter().map(|r| r.start()).collect();
        assert_eq!(starts, vec![0, 10, 20]);
    }
}
