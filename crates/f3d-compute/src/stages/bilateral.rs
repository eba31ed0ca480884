//! Bilateral (edge-preserving) smoothing.
//!
//! The spatial Gaussian is tabulated on the host once per worker and kept
//! on the device between chunks, which makes the stage stateful.

use tracing::trace;

use super::{FilterStage, ProgramSlot, StageConfig, StageInfo, dispatch, extent_args};
use crate::backend::{BufferHandle, CommandQueue, KernelArg};
use crate::buffers::{BufferSet, LoadedChunk};
use crate::element::MAX_ELEMENT_VOXELS;
use crate::{ComputeError, ComputeResult};
use f3d_core::VolumeDims;

/// Default spatial radius in voxels.
pub const DEFAULT_SPATIAL_RADIUS: usize = 3;
/// Default range radius in grey levels.
pub const DEFAULT_RANGE_RADIUS: usize = 30;

/// Bilateral filter over a `(2r + 1)^3` window.
#[derive(Debug)]
pub struct Bilateral {
    spatial_radius: usize,
    range_radius: usize,
    program: ProgramSlot,
    weights: Option<BufferHandle>,
}

impl Bilateral {
    /// Bilateral filter over a `(2 * spatial_radius + 1)` window.
    pub fn new(spatial_radius: usize, range_radius: usize) -> Self {
        Self {
            spatial_radius,
            range_radius,
            program: ProgramSlot::new("bilateral"),
            weights: None,
        }
    }

    /// Neighbourhood radius in voxels.
    pub fn spatial_radius(&self) -> usize {
        self.spatial_radius
    }

    /// Intensity radius of the range kernel.
    pub fn range_radius(&self) -> usize {
        self.range_radius
    }

    /// Spatial Gaussian with sigma = radius / 2, z-major.
    fn spatial_weights(&self) -> Vec<f32> {
        let r = self.spatial_radius as isize;
        let sigma = (self.spatial_radius as f32 / 2.0).max(0.5);
        let denom = 2.0 * sigma * sigma;
        let mut weights = Vec::new();
        for dz in -r..=r {
            for dy in -r..=r {
                for dx in -r..=r {
                    let d2 = (dz * dz + dy * dy + dx * dx) as f32;
                    weights.push((-d2 / denom).exp());
                }
            }
        }
        weights
    }
}

impl Default for Bilateral {
    fn default() -> Self {
        Self::new(DEFAULT_SPATIAL_RADIUS, DEFAULT_RANGE_RADIUS)
    }
}

impl Clone for Bilateral {
    fn clone(&self) -> Self {
        Self::new(self.spatial_radius, self.range_radius)
    }
}

impl FilterStage for Bilateral {
    fn name(&self) -> &str {
        "Bilateral"
    }

    fn info(&self) -> StageInfo {
        StageInfo::uniform(self.spatial_radius, false)
    }

    fn validate(&self, _dims: VolumeDims) -> ComputeResult<()> {
        let side = self.spatial_radius.saturating_mul(2).saturating_add(1);
        if side.saturating_mul(side).saturating_mul(side) >= MAX_ELEMENT_VOXELS {
            return Err(ComputeError::Configuration(format!(
                "bilateral spatial radius {} is too large",
                self.spatial_radius
            )));
        }
        if self.range_radius == 0 {
            return Err(ComputeError::Configuration("bilateral range radius must be > 0".into()));
        }
        Ok(())
    }

    fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        self.program.load(queue)?;
        if self.weights.is_none() {
            let bytes: Vec<u8> = self.spatial_weights().into_iter().flat_map(f32::to_le_bytes).collect();
            let buffer = queue.allocate(bytes.len())?;
            if let Err(e) = queue.write(buffer, 0, &bytes) {
                queue.release(buffer);
                return Err(e);
            }
            self.weights = Some(buffer);
        }
        Ok(())
    }

    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        let program = self.program.get()?;
        let weights = self
            .weights
            .ok_or_else(|| ComputeError::Dispatch("bilateral weights are not uploaded".into()))?;
        let [w, h, d] = extent_args(chunk)?;
        let args = [
            KernelArg::Buffer(buffers.input()),
            KernelArg::Buffer(buffers.output()),
            KernelArg::Buffer(weights),
            w,
            h,
            d,
            KernelArg::size(self.spatial_radius)?,
            KernelArg::Float(self.range_radius as f32),
        ];
        trace!(range = %chunk.range, radius = self.spatial_radius, "bilateral");
        dispatch(buffers, program, "bilateral3d", &args, chunk)?;
        buffers.commit()
    }

    fn release_program(&mut self, queue: &mut dyn CommandQueue) {
        if let Some(buffer) = self.weights.take() {
            queue.release(buffer);
        }
        self.program.release(queue);
    }

    fn clone_stage(&self) -> Box<dyn FilterStage> {
        Box::new(self.clone())
    }

    fn to_config(&self) -> Option<StageConfig> {
        Some(StageConfig::Bilateral {
            spatial_radius: self.spatial_radius,
            range_radius: self.range_radius,
        })
    }
}
