//! Pass-through stage.

use super::{FilterStage, StageConfig, StageInfo};
use crate::ComputeResult;
use crate::backend::CommandQueue;
use crate::buffers::{BufferSet, LoadedChunk};

/// Copies input to output on the device. Holds no state, so one instance
/// is shared by every worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Identity {
    /// The identity stage.
    pub fn new() -> Self {
        Self
    }
}

impl FilterStage for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn info(&self) -> StageInfo {
        StageInfo::default()
    }

    fn is_stateful(&self) -> bool {
        false
    }

    fn load_program(&mut self, _queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        Ok(())
    }

    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        let (input, output) = (buffers.input(), buffers.output());
        buffers.queue().copy(input, output, chunk.bytes())?;
        buffers.commit()
    }

    fn release_program(&mut self, _queue: &mut dyn CommandQueue) {}

    fn clone_stage(&self) -> Box<dyn FilterStage> {
        Box::new(*self)
    }

    fn to_config(&self) -> Option<StageConfig> {
        Some(StageConfig::Identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::run_whole;
    use f3d_core::{Volume, VolumeDims};

    #[test]
    fn test_identity_is_exact() {
        let vol = Volume::from_fn(VolumeDims::new(5, 3, 7), |z, y, x| (z * 31 + y * 7 + x) as u8).unwrap();
        let out = run_whole(&mut Identity::new(), &vol).unwrap();
        assert_eq!(out, vol);
        assert!(!Identity.is_stateful());
    }
}
