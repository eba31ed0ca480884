//! Serializable pipeline descriptions.
//!
//! ```json
//! {
//!   "stages": [
//!     { "stage": "Median" },
//!     { "stage": "Bilateral", "spatial_radius": 3, "range_radius": 30 },
//!     { "stage": "Open", "mask": { "kind": "StructuredElementL", "radius": 2 } }
//!   ]
//! }
//! ```
//!
//! Mask volumes are data, not configuration, so [`MaskApply`](super::MaskApply)
//! stages are built in code.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::bilateral::{DEFAULT_RANGE_RADIUS, DEFAULT_SPATIAL_RADIUS};
use super::{Bilateral, Close, Dilate, Direction, Erode, Fft, FilterStage, Identity, Median, Open};
use crate::element::MaskSpec;
use crate::{ComputeError, ComputeResult};

fn default_spatial() -> usize {
    DEFAULT_SPATIAL_RADIUS
}

fn default_range() -> usize {
    DEFAULT_RANGE_RADIUS
}

/// One stage of a pipeline description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage")]
pub enum StageConfig {
    /// [`Median`] 3x3x3.
    Median,
    /// [`Bilateral`] with its two radii.
    Bilateral {
        /// Neighbourhood radius in voxels.
        #[serde(default = "default_spatial")]
        spatial_radius: usize,
        /// Intensity radius.
        #[serde(default = "default_range")]
        range_radius: usize,
    },
    /// [`Fft`] in one direction.
    Fft {
        /// Transform direction.
        #[serde(default)]
        direction: Direction,
    },
    /// [`Dilate`] by a structuring element.
    Dilate {
        /// Structuring element.
        #[serde(default)]
        mask: MaskSpec,
    },
    /// [`Erode`] by a structuring element.
    Erode {
        /// Structuring element.
        #[serde(default)]
        mask: MaskSpec,
    },
    /// [`Open`]: erode then dilate.
    Open {
        /// Structuring element.
        #[serde(default)]
        mask: MaskSpec,
    },
    /// [`Close`]: dilate then erode.
    Close {
        /// Structuring element.
        #[serde(default)]
        mask: MaskSpec,
    },
    /// [`Identity`].
    Identity,
}

impl StageConfig {
    /// Instantiates the stage.
    pub fn build(&self) -> Box<dyn FilterStage> {
        match self {
            Self::Median => Box::new(Median::new()),
            Self::Bilateral {
                spatial_radius,
                range_radius,
            } => Box::new(Bilateral::new(*spatial_radius, *range_radius)),
            Self::Fft { direction } => Box::new(Fft::new(*direction)),
            Self::Dilate { mask } => Box::new(Dilate::new(mask.clone())),
            Self::Erode { mask } => Box::new(Erode::new(mask.clone())),
            Self::Open { mask } => Box::new(Open::new(mask.clone())),
            Self::Close { mask } => Box::new(Close::new(mask.clone())),
            Self::Identity => Box::new(Identity::new()),
        }
    }
}

/// Ordered list of stage descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in execution order.
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Wraps a list of descriptions.
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self { stages }
    }

    /// Describes existing stages; fails for stages with no description.
    pub fn from_stages(pipeline: &[Box<dyn FilterStage>]) -> ComputeResult<Self> {
        let stages = pipeline
            .iter()
            .map(|stage| {
                stage.to_config().ok_or_else(|| {
                    ComputeError::Config(format!("stage '{}' cannot be serialized", stage.name()))
                })
            })
            .collect::<ComputeResult<_>>()?;
        Ok(Self { stages })
    }

    /// Parses a JSON description.
    pub fn from_json(json: &str) -> ComputeResult<Self> {
        serde_json::from_str(json).map_err(|e| ComputeError::Config(format!("invalid pipeline JSON: {e}")))
    }

    /// Serializes to pretty-printed JSON.
    pub fn to_json(&self) -> ComputeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ComputeError::Config(e.to_string()))
    }

    /// Reads a JSON description from disk.
    pub fn from_file(path: impl AsRef<Path>) -> ComputeResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ComputeError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Writes the JSON description to disk.
    pub fn to_file(&self, path: impl AsRef<Path>) -> ComputeResult<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)
            .map_err(|e| ComputeError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Instantiates every stage in order.
    pub fn build(&self) -> Vec<Box<dyn FilterStage>> {
        self.stages.iter().map(StageConfig::build).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_parse_with_defaults() {
        let config = PipelineConfig::from_json(
            r#"{ "stages": [
                { "stage": "Median" },
                { "stage": "Bilateral" },
                { "stage": "Fft", "direction": "Inverse" },
                { "stage": "Dilate", "mask": { "kind": "Diagonal", "width": 3, "height": 3, "depth": 3 } },
                { "stage": "Close" }
            ] }"#,
        )
        .unwrap();

        assert_eq!(
            config.stages[1],
            StageConfig::Bilateral { spatial_radius: 3, range_radius: 30 }
        );
        assert_eq!(config.stages[2], StageConfig::Fft { direction: Direction::Inverse });
        assert_eq!(config.stages[4], StageConfig::Close { mask: MaskSpec::l(3) });

        let names: Vec<String> = config.build().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["Median", "Bilateral", "InverseFFT", "Dilation", "Closing"]);
    }

    #[test]
    fn test_rejects_unknown_stage() {
        let err = PipelineConfig::from_json(r#"{ "stages": [ { "stage": "Sharpen" } ] }"#).unwrap_err();
        assert!(matches!(err, ComputeError::Config(_)));
    }

    #[test]
    fn test_from_stages() {
        let pipeline: Vec<Box<dyn FilterStage>> = vec![
            Box::new(Median::new()),
            Box::new(Erode::new(MaskSpec::l(2))),
        ];
        let config = PipelineConfig::from_stages(&pipeline).unwrap();
        assert_eq!(
            config.stages,
            vec![StageConfig::Median, StageConfig::Erode { mask: MaskSpec::l(2) }]
        );

        let mask = f3d_core::Volume::zeros(f3d_core::VolumeDims::new(1, 1, 1)).unwrap();
        let with_mask: Vec<Box<dyn FilterStage>> = vec![Box::new(super::super::MaskApply::new(Arc::new(mask)))];
        assert!(PipelineConfig::from_stages(&with_mask).is_err());
    }
}
