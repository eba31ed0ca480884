//! Accumulation and reassembly of per-chunk results.
//!
//! Workers push [`ResultChunk`]s in whatever order they finish. Once every
//! worker has returned, [`reconstruct`] sorts them by start slice, checks
//! they tile the volume and concatenates them.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use f3d_core::{DepthRange, Volume, VolumeDims};

use crate::{ComputeError, ComputeResult};

/// Filtered slices of one range, halo stripped.
#[derive(Clone, PartialEq, Eq)]
pub struct ResultChunk {
    /// Slices the data covers.
    pub range: DepthRange,
    /// `range.len() * slice_len` samples.
    pub data: Vec<u8>,
    /// Name of the device that produced it.
    pub device: String,
    /// Time spent in the pipeline stages.
    pub elapsed: Duration,
}

impl fmt::Debug for ResultChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultChunk")
            .field("range", &self.range)
            .field("bytes", &self.data.len())
            .field("device", &self.device)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

/// Append-only store shared by the workers of one run.
#[derive(Debug, Default)]
pub struct ResultCollector {
    chunks: Mutex<Vec<ResultChunk>>,
}

impl ResultCollector {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Safe to call from any worker.
    pub fn push(&self, chunk: ResultChunk) {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);
    }

    /// Chunks collected so far.
    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True until the first chunk arrives.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the chunks in arrival order.
    pub fn into_chunks(self) -> Vec<ResultChunk> {
        self.chunks.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes the collector and reassembles the volume.
    pub fn reconstruct(self, dims: VolumeDims) -> ComputeResult<Volume> {
        reconstruct(self.into_chunks(), dims)
    }
}

/// Sorts `chunks` by start slice and concatenates them into one volume.
///
/// Fails with [`ComputeError::Reconstruction`] when there are no chunks,
/// when the ranges leave a gap, overlap or do not span `[0, depth)`, or
/// when a chunk carries the wrong number of samples.
pub fn reconstruct(mut chunks: Vec<ResultChunk>, dims: VolumeDims) -> ComputeResult<Volume> {
    if chunks.is_empty() {
        return Err(ComputeError::Reconstruction("no result chunks".into()));
    }
    chunks.sort_by_key(|c| c.range.start());

    let slice_len = dims.slice_len();
    let mut expected = 0;
    for chunk in &chunks {
        let range = chunk.range;
        if range.start() != expected {
            let what = if range.start() < expected { "overlaps" } else { "leaves a gap before" };
            return Err(ComputeError::Reconstruction(format!(
                "chunk {range} {what} slice {expected}"
            )));
        }
        let want = range.len() * slice_len;
        if chunk.data.len() != want {
            return Err(ComputeError::Reconstruction(format!(
                "chunk {range} from '{}' carries {} bytes, expected {want}",
                chunk.device,
                chunk.data.len()
            )));
        }
        expected = range.end();
    }
    if expected != dims.depth {
        return Err(ComputeError::Reconstruction(format!(
            "chunks cover [0, {expected}) of {} slices",
            dims.depth
        )));
    }

    Ok(Volume::from_slabs(dims, chunks.iter().map(|c| c.data.as_slice()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: usize, end: usize, slice_len: usize) -> ResultChunk {
        let data = (start..end)
            .flat_map(|z| std::iter::repeat_n(z as u8, slice_len))
            .collect();
        ResultChunk {
            range: DepthRange::new(start, end).unwrap(),
            data,
            device: "test".into(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_order_independent() {
        let dims = VolumeDims::new(37, 2, 3);
        let collector = ResultCollector::new();
        for (s, e) in [(30, 37), (0, 10), (20, 30), (10, 20)] {
            collector.push(chunk(s, e, 6));
        }
        assert_eq!(collector.len(), 4);

        let vol = collector.reconstruct(dims).unwrap();
        for z in 0..37 {
            assert_eq!(vol.get(z, 1, 2), Some(z as u8));
        }
    }

    #[test]
    fn test_empty_fails() {
        let err = reconstruct(Vec::new(), VolumeDims::new(4, 1, 1)).unwrap_err();
        assert!(matches!(err, ComputeError::Reconstruction(_)));
    }

    #[test]
    fn test_gap_overlap_and_coverage() {
        let dims = VolumeDims::new(10, 1, 1);
        let gap = vec![chunk(0, 4, 1), chunk(5, 10, 1)];
        assert!(reconstruct(gap, dims).unwrap_err().to_string().contains("gap"));

        let overlap = vec![chunk(0, 5, 1), chunk(4, 10, 1)];
        assert!(reconstruct(overlap, dims).unwrap_err().to_string().contains("overlaps"));

        let short = vec![chunk(0, 6, 1)];
        assert!(matches!(reconstruct(short, dims), Err(ComputeError::Reconstruction(_))));

        let head = vec![chunk(1, 10, 1)];
        assert!(reconstruct(head, dims).is_err());
    }

    #[test]
    fn test_wrong_size() {
        let mut bad = chunk(0, 2, 4);
        bad.data.pop();
        let err = reconstruct(vec![bad], VolumeDims::new(2, 2, 2)).unwrap_err();
        assert!(matches!(err, ComputeError::Reconstruction(_)));
    }
}
