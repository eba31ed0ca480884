//! # f3d-core
//!
//! Core types for chunked filtering of large 3-D greyscale volumes.
//!
//! - [`Volume`] - dense `u8` volume in depth-major order
//! - [`VolumeDims`] - `(depth, height, width)` extents
//! - [`DepthRange`] - half-open run of slices along depth
//! - [`Error`] - failures building volumes and ranges
//!
//! ## Crate Structure
//!
//! ```text
//! f3d-core (this crate)
//!    ^
//!    |
//!    +-- f3d-compute (chunked multi-device pipeline engine)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod range;
pub mod volume;

pub use error::{Error, Result};
pub use range::DepthRange;
pub use volume::{Volume, VolumeDims};
