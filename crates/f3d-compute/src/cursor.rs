//! Shared allocator of depth ranges.
//!
//! Workers pull ranges of their own preferred size from one
//! [`ChunkCursor`]. The cursor only moves forward, so ranges handed out in a
//! run never overlap and together cover `[0, depth)`. Halos are added later,
//! when a worker loads its chunk.

use std::sync::{Mutex, PoisonError};

use f3d_core::DepthRange;

/// Thread-safe, monotonic range allocator over `[0, depth)`.
#[derive(Debug)]
pub struct ChunkCursor {
    depth: usize,
    next: Mutex<usize>,
}

impl ChunkCursor {
    /// Cursor at slice 0 of a volume with `depth` slices.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            next: Mutex::new(0),
        }
    }

    /// Total slices covered.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Claims the next `chunk_depth` slices (fewer at the tail).
    ///
    /// Returns `None` once the volume is exhausted. A `chunk_depth` of 0 is
    /// treated as 1.
    pub fn next_range(&self, chunk_depth: usize) -> Option<DepthRange> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        if *next >= self.depth {
            return None;
        }
        let start = *next;
        let end = start.saturating_add(chunk_depth.max(1)).min(self.depth);
        *next = end;
        DepthRange::new(start, end).ok()
    }

    /// Slices not yet handed out.
    pub fn remaining(&self) -> usize {
        let next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        self.depth.saturating_sub(*next)
    }

    /// Rewinds to slice 0. Needs exclusive access, so never races a run.
    pub fn reset(&mut self) {
        *self.next.get_mut().unwrap_or_else(PoisonError::into_inner) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequential_ranges() {
        let cursor = ChunkCursor::new(37);
        let mut got = Vec::new();
        while let Some(r) = cursor.next_range(10) {
            got.push((r.start(), r.end()));
        }
        assert_eq!(got, vec![(0, 10), (10, 20), (20, 30), (30, 37)]);
        assert_eq!(cursor.next_range(10), None);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_mixed_sizes() {
        let cursor = ChunkCursor::new(37);
        assert_eq!(cursor.next_range(100), Some(DepthRange::new(0, 37).unwrap()));
        assert_eq!(cursor.next_range(10), None);
    }

    #[test]
    fn test_zero_depth_request_progresses() {
        let cursor = ChunkCursor::new(3);
        assert_eq!(cursor.next_range(0).map(|r| r.len()), Some(1));
        assert_eq!(cursor.remaining(), 2);
    }

    #[test]
    fn test_empty_volume() {
        let cursor = ChunkCursor::new(0);
        assert_eq!(cursor.next_range(4), None);
    }

    #[test]
    fn test_reset() {
        let mut cursor = ChunkCursor::new(5);
        while cursor.next_range(2).is_some() {}
        cursor.reset();
        assert_eq!(cursor.next_range(2), Some(DepthRange::new(0, 2).unwrap()));
    }

    #[test]
    fn test_concurrent_partition() {
        let depth = 10_007;
        let cursor = Arc::new(ChunkCursor::new(depth));
        let handles: Vec<_> = [1usize, 3, 7, 64]
            .into_iter()
            .map(|size| {
                let cursor = Arc::clone(&cursor);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(r) = cursor.next_range(size) {
                        assert!(r.len() <= size);
                        mine.push(r);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<DepthRange> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let mut expected_start = 0;
        for r in &all {
            assert_eq!(r.start(), expected_start);
            expected_start = r.end();
        }
        assert_eq!(expected_start, depth);
    }
}
