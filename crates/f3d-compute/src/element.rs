//! Structuring elements for morphological stages.
//!
//! A [`StructuringElement`] is a small binary volume; non-zero voxels take
//! part in the max (dilation) or min (erosion). A [`MaskSpec`] names a
//! family of elements and expands to one or more sub-elements applied in
//! sequence:
//!
//! - `StructuredElementL` with radius `L`: three lines of `2L + 1` voxels
//!   along x, y and z. Applied one after the other they act like a
//!   `(2L + 1)^3` box at a fraction of the cost.
//! - `DiagonalWxHxD`: one `D x H x W` element holding the diagonal from the
//!   first corner to the opposite one.
//! - `Literal`: caller-supplied elements.
//!
//! Elements of `21^3` voxels or more are rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ComputeError, ComputeResult};

/// Exclusive upper bound on element voxels.
pub const MAX_ELEMENT_VOXELS: usize = 21 * 21 * 21;

/// Radius of the `StructuredElementL` family when none is given.
pub const DEFAULT_L: usize = 3;

/// Binary 3-D mask in `(depth, height, width)` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuringElement {
    depth: usize,
    height: usize,
    width: usize,
    data: Vec<u8>,
}

impl StructuringElement {
    /// Wraps `data`, checking its length against the dimensions.
    pub fn new(depth: usize, height: usize, width: usize, data: Vec<u8>) -> ComputeResult<Self> {
        let expected = depth
            .checked_mul(height)
            .and_then(|v| v.checked_mul(width))
            .filter(|&v| v > 0)
            .ok_or_else(|| {
                ComputeError::Configuration(format!(
                    "invalid element dimensions {depth}x{height}x{width}"
                ))
            })?;
        if data.len() != expected {
            return Err(ComputeError::Configuration(format!(
                "element {depth}x{height}x{width} needs {expected} voxels, got {}",
                data.len()
            )));
        }
        Ok(Self { depth, height, width, data })
    }

    /// Element with every voxel set.
    pub fn filled(depth: usize, height: usize, width: usize) -> ComputeResult<Self> {
        Self::new(depth, height, width, vec![1; depth * height * width])
    }

    /// Line of `len` voxels along x.
    pub fn line_x(len: usize) -> ComputeResult<Self> {
        Self::filled(1, 1, len)
    }

    /// Line of `len` voxels along y.
    pub fn line_y(len: usize) -> ComputeResult<Self> {
        Self::filled(1, len, 1)
    }

    /// Line of `len` voxels along z.
    pub fn line_z(len: usize) -> ComputeResult<Self> {
        Self::filled(len, 1, 1)
    }

    /// Diagonal from `(0, 0, 0)` to `(depth - 1, height - 1, width - 1)`.
    pub fn diagonal(width: usize, height: usize, depth: usize) -> ComputeResult<Self> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(ComputeError::Configuration(format!(
                "invalid diagonal {width}x{height}x{depth}"
            )));
        }
        let steps = width.max(height).max(depth);
        let mut data = vec![0u8; width * height * depth];
        let at = |t: usize, n: usize| -> usize {
            if steps == 1 {
                0
            } else {
                ((t * (n - 1)) as f64 / (steps - 1) as f64).round() as usize
            }
        };
        for t in 0..steps {
            let (z, y, x) = (at(t, depth), at(t, height), at(t, width));
            data[(z * height + y) * width + x] = 1;
        }
        Self::new(depth, height, width, data)
    }

    /// `(depth, height, width)`.
    #[inline]
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.depth, self.height, self.width)
    }

    /// Slices spanned along z.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total voxels.
    #[inline]
    pub fn voxels(&self) -> usize {
        self.data.len()
    }

    /// Raw voxels, depth-major.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Fails if the element reaches the size ceiling or its voxel count
    /// disagrees with its dimensions (possible after deserializing).
    pub fn check_size(&self) -> ComputeResult<()> {
        if self.voxels() != self.depth.saturating_mul(self.height).saturating_mul(self.width) {
            return Err(ComputeError::Configuration(format!(
                "element {}x{}x{} holds {} voxels",
                self.depth,
                self.height,
                self.width,
                self.voxels()
            )));
        }
        if self.voxels() >= MAX_ELEMENT_VOXELS {
            return Err(ComputeError::Configuration(format!(
                "structuring element {}x{}x{} has {} voxels, limit is below {}",
                self.depth,
                self.height,
                self.width,
                self.voxels(),
                MAX_ELEMENT_VOXELS
            )));
        }
        Ok(())
    }
}

/// Named family of structuring elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MaskSpec {
    /// Three orthogonal lines of radius `radius`.
    StructuredElementL {
        /// Half-length of each line.
        radius: usize,
    },
    /// Corner-to-corner diagonal in a `width x height x depth` box.
    Diagonal {
        /// Extent along x.
        width: usize,
        /// Extent along y.
        height: usize,
        /// Extent along z.
        depth: usize,
    },
    /// Explicit elements, applied in order.
    Literal {
        /// Sub-elements.
        elements: Vec<StructuringElement>,
    },
}

impl Default for MaskSpec {
    fn default() -> Self {
        Self::StructuredElementL { radius: DEFAULT_L }
    }
}

impl MaskSpec {
    /// `StructuredElementL` with the given radius.
    pub fn l(radius: usize) -> Self {
        Self::StructuredElementL { radius }
    }

    /// Expands the mask into the sub-elements to apply in order.
    pub fn build(&self) -> ComputeResult<Vec<StructuringElement>> {
        match self {
            Self::StructuredElementL { radius } => {
                let len = radius
                    .checked_mul(2)
                    .and_then(|v| v.checked_add(1))
                    .filter(|&len| len < MAX_ELEMENT_VOXELS)
                    .ok_or_else(|| ComputeError::Configuration(format!("radius {radius} too large")))?;
                Ok(vec![
                    StructuringElement::line_x(len)?,
                    StructuringElement::line_y(len)?,
                    StructuringElement::line_z(len)?,
                ])
            }
            Self::Diagonal { width, height, depth } => {
                // Refuse before allocating the box.
                let voxels = width.checked_mul(*height).and_then(|v| v.checked_mul(*depth));
                if voxels.is_none_or(|v| v >= MAX_ELEMENT_VOXELS) {
                    return Err(ComputeError::Configuration(format!(
                        "structuring element {self} reaches the limit of {MAX_ELEMENT_VOXELS} voxels"
                    )));
                }
                Ok(vec![StructuringElement::diagonal(*width, *height, *depth)?])
            }
            Self::Literal { elements } => {
                if elements.is_empty() {
                    return Err(ComputeError::Configuration("literal mask has no elements".into()));
                }
                Ok(elements.clone())
            }
        }
    }

    /// Builds the elements and checks each against the size ceiling.
    pub fn validate(&self) -> ComputeResult<Vec<StructuringElement>> {
        let elements = self.build()?;
        for element in &elements {
            element.check_size()?;
        }
        Ok(elements)
    }

    /// Halo slices one application of the mask needs.
    pub fn overlap(&self) -> usize {
        match self {
            Self::StructuredElementL { radius } => *radius,
            Self::Diagonal { depth, .. } => *depth,
            Self::Literal { elements } => elements.iter().map(|e| e.depth()).max().unwrap_or(0),
        }
    }
}

impl fmt::Display for MaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StructuredElementL { radius } => write!(f, "StructuredElementL(L={radius})"),
            Self::Diagonal { width, height, depth } => write!(f, "Diagonal{width}x{height}x{depth}"),
            Self::Literal { elements } => write!(f, "Literal({} elements)", elements.len()),
        }
    }
}

impl FromStr for MaskSpec {
    type Err = ComputeError;

    /// Parses `StructuredElementL` (radius 3) or `DiagonalWxHxD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("StructuredElementL") {
            return Ok(Self::default());
        }
        let bad = || ComputeError::Configuration(format!("unknown mask '{s}'"));
        let dims = s.strip_prefix("Diagonal").ok_or_else(bad)?;
        let parts: Vec<usize> = dims
            .split('x')
            .map(|p| p.parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|_| bad())?;
        match parts.as_slice() {
            &[width, height, depth] => Ok(Self::Diagonal { width, height, depth }),
            _ => Err(bad()),
        }
    }
}
