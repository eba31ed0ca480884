//! Dense greyscale volumes.
//!
//! A [`Volume`] stores `depth * height * width` unsigned 8-bit samples in
//! depth-major order: slice `z` occupies the contiguous block
//! `[z * height * width, (z + 1) * height * width)`. Because slices are
//! contiguous, any run of slices is a borrowed slab with no copying.
//!
//! # Example
//!
//! ```rust
//! use f3d_core::{Volume, VolumeDims};
//!
//! let dims = VolumeDims::new(4, 2, 3);
//! let vol = Volume::zeros(dims).unwrap();
//! assert_eq!(vol.data().len(), 24);
//! assert_eq!(vol.slab(1, 3).unwrap().len(), 12);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::range::DepthRange;

/// Volume dimensions in `(depth, height, width)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeDims {
    /// Number of slices.
    pub depth: usize,
    /// Rows per slice.
    pub height: usize,
    /// Samples per row.
    pub width: usize,
}

impl VolumeDims {
    /// Creates dimensions without validation.
    pub const fn new(depth: usize, height: usize, width: usize) -> Self {
        Self { depth, height, width }
    }

    /// Samples per slice (`width * height`).
    #[inline]
    pub fn slice_len(&self) -> usize {
        self.width * self.height
    }

    /// Total sample count.
    #[inline]
    pub fn len(&self) -> usize {
        self.slice_len() * self.depth
    }

    /// True if any axis is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.depth == 0 || self.height == 0 || self.width == 0
    }

    /// Checked total sample count; fails on zero axes or overflow.
    pub fn checked_len(&self) -> Result<usize> {
        if self.is_empty() {
            return Err(Error::invalid_dimensions(
                self.depth,
                self.height,
                self.width,
                "all axes must be > 0",
            ));
        }
        self.width
            .checked_mul(self.height)
            .and_then(|v| v.checked_mul(self.depth))
            .ok_or_else(|| {
                Error::invalid_dimensions(self.depth, self.height, self.width, "size overflows usize")
            })
    }
}

impl fmt::Display for VolumeDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.depth, self.height, self.width)
    }
}

/// Dense 3-D array of `u8` samples, one channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Volume {
    dims: VolumeDims,
    data: Vec<u8>,
}

impl Volume {
    /// Wraps existing samples, validating the length against `dims`.
    pub fn new(dims: VolumeDims, data: Vec<u8>) -> Result<Self> {
        let expected = dims.checked_len()?;
        if data.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    /// Creates a zero-filled volume.
    pub fn zeros(dims: VolumeDims) -> Result<Self> {
        let len = dims.checked_len()?;
        Ok(Self {
            dims,
            data: vec![0; len],
        })
    }

    /// Builds a volume by evaluating `f(z, y, x)` at every sample.
    pub fn from_fn(dims: VolumeDims, mut f: impl FnMut(usize, usize, usize) -> u8) -> Result<Self> {
        let len = dims.checked_len()?;
        let mut data = Vec::with_capacity(len);
        for z in 0..dims.depth {
            for y in 0..dims.height {
                for x in 0..dims.width {
                    data.push(f(z, y, x));
                }
            }
        }
        Ok(Self { dims, data })
    }

    /// Concatenates slabs along depth.
    ///
    /// Every slab must hold a whole number of `height * width` slices, and
    /// together they must make up exactly `dims`.
    pub fn from_slabs<'a, I>(dims: VolumeDims, slabs: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let expected = dims.checked_len()?;
        let mut data = Vec::with_capacity(expected);
        for slab in slabs {
            if slab.len() % dims.slice_len() != 0 {
                return Err(Error::SizeMismatch {
                    expected: slab.len().next_multiple_of(dims.slice_len()),
                    actual: slab.len(),
                });
            }
            data.extend_from_slice(slab);
        }
        Self::new(dims, data)
    }

    /// Volume dimensions.
    #[inline]
    pub fn dims(&self) -> VolumeDims {
        self.dims
    }

    /// Number of slices.
    #[inline]
    pub fn depth(&self) -> usize {
        self.dims.depth
    }

    /// All samples, depth-major.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable samples.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the volume, returning its samples.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Borrows slices `[start, end)` as one contiguous slab.
    pub fn slab(&self, start: usize, end: usize) -> Result<&[u8]> {
        if start >= end || end > self.dims.depth {
            return Err(Error::OutOfBounds {
                start,
                end,
                depth: self.dims.depth,
            });
        }
        let s = self.dims.slice_len();
        Ok(&self.data[start * s..end * s])
    }

    /// Borrows the slab covered by `range`.
    pub fn range_slab(&self, range: DepthRange) -> Result<&[u8]> {
        self.slab(range.start(), range.end())
    }

    /// Sample at `(z, y, x)`, or `None` outside the volume.
    pub fn get(&self, z: usize, y: usize, x: usize) -> Option<u8> {
        if z >= self.dims.depth || y >= self.dims.height || x >= self.dims.width {
            return None;
        }
        Some(self.data[self.index(z, y, x)])
    }

    /// Writes the sample at `(z, y, x)`.
    pub fn set(&mut self, z: usize, y: usize, x: usize, value: u8) -> Result<()> {
        if z >= self.dims.depth || y >= self.dims.height || x >= self.dims.width {
            return Err(Error::OutOfBounds {
                start: z,
                end: z + 1,
                depth: self.dims.depth,
            });
        }
        let idx = self.index(z, y, x);
        self.data[idx] = value;
        Ok(())
    }

    #[inline]
    fn index(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.dims.height + y) * self.dims.width + x
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("dims", &self.dims)
            .field("size_bytes", &self.data.len())
            .finish()
    }
}
