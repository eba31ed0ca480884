//! Error types for f3d-core operations.
//!
//! The [`Error`] enum covers the failure modes of building volumes,
//! addressing slabs of slices and forming depth ranges.
//!
//! # Usage
//!
//! ```rust
//! use f3d_core::{Error, Result};
//!
//! fn check_slice(z: usize, depth: usize) -> Result<()> {
//!     if z >= depth {
//!         return Err(Error::OutOfBounds { start: z, end: z + 1, depth });
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling volumes and ranges.
#[derive(Debug, Error)]
pub enum Error {
    /// Volume dimensions are zero or overflow `usize`.
    #[error("invalid dimensions: {depth}x{height}x{width} ({reason})")]
    InvalidDimensions {
        /// Requested depth (slices)
        depth: usize,
        /// Requested height
        height: usize,
        /// Requested width
        width: usize,
        /// Why the dimensions were rejected
        reason: String,
    },

    /// Buffer length does not match the declared dimensions.
    #[error("buffer size mismatch: expected {expected} samples, got {actual}")]
    SizeMismatch {
        /// Expected sample count
        expected: usize,
        /// Actual sample count
        actual: usize,
    },

    /// A depth range with `start >= end`.
    #[error("invalid depth range [{start}, {end})")]
    InvalidRange {
        /// Range start
        start: usize,
        /// Range end
        end: usize,
    },

    /// A slab reaches outside the volume.
    #[error("slices [{start}, {end}) out of bounds for depth {depth}")]
    OutOfBounds {
        /// First requested slice
        start: usize,
        /// One past the last requested slice
        end: usize,
        /// Volume depth
        depth: usize,
    },
}

impl Error {
    /// Creates an [`Error::InvalidDimensions`] error.
    #[inline]
    pub fn invalid_dimensions(
        depth: usize,
        height: usize,
        width: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidDimensions {
            depth,
            height,
            width,
            reason: reason.into(),
        }
    }
}
