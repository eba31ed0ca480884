//! Masking by a full-size volume.

use std::sync::Arc;

use f3d_core::{Volume, VolumeDims};
use tracing::trace;

use super::{FilterStage, ProgramSlot, StageInfo, dispatch, extent_args};
use crate::backend::{CommandQueue, KernelArg};
use crate::buffers::{BufferSet, LoadedChunk};
use crate::{ComputeError, ComputeResult};

/// Zeroes every sample whose mask sample is zero.
///
/// The mask has the same dimensions as the filtered volume. For each chunk
/// the matching slab of the mask, halo included, is uploaded next to the
/// input.
#[derive(Debug, Clone)]
pub struct MaskApply {
    mask: Arc<Volume>,
    program: ProgramSlot,
}

impl MaskApply {
    /// Stage keeping voxels where `mask` is non-zero.
    pub fn new(mask: Arc<Volume>) -> Self {
        Self {
            mask,
            program: ProgramSlot::new("mask"),
        }
    }

    /// Mask volume; must match the filtered volume's dimensions.
    pub fn mask(&self) -> &Volume {
        &self.mask
    }
}

impl FilterStage for MaskApply {
    fn name(&self) -> &str {
        "Mask"
    }

    fn info(&self) -> StageInfo {
        StageInfo::uniform(0, false)
    }

    fn validate(&self, dims: VolumeDims) -> ComputeResult<()> {
        if self.mask.dims() != dims {
            return Err(ComputeError::Configuration(format!(
                "mask dimensions {} differ from volume dimensions {}",
                self.mask.dims(),
                dims
            )));
        }
        Ok(())
    }

    fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        self.program.load(queue)
    }

    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        let program = self.program.get()?;
        let [w, h, d] = extent_args(chunk)?;
        let slab = self.mask.range_slab(chunk.window)?;

        let mask = {
            let queue = buffers.queue();
            let mask = queue.allocate(slab.len())?;
            if let Err(e) = queue.write(mask, 0, slab) {
                queue.release(mask);
                return Err(e);
            }
            mask
        };
        let args = [
            KernelArg::Buffer(buffers.input()),
            KernelArg::Buffer(mask),
            KernelArg::Buffer(buffers.output()),
            w,
            h,
            d,
        ];
        trace!(range = %chunk.range, "mask");
        let result = dispatch(buffers, program, "apply_mask", &args, chunk);
        buffers.queue().release(mask);
        result?;
        buffers.commit()
    }

    fn release_program(&mut self, queue: &mut dyn CommandQueue) {
        self.program.release(queue);
    }

    fn clone_stage(&self) -> Box<dyn FilterStage> {
        Box::new(self.clone())
    }
}
