//! Morphological dilation, erosion, opening and closing.
//!
//! A mask expands to one or more sub-elements that are applied in sequence,
//! ping-ponging between the temp and output buffers:
//!
//! ```text
//! pass 0:      input -> temp
//! pass 1:      temp  -> output
//! pass 2:      output -> temp
//! ...
//! odd count:   swap(output, temp)   result ends in output
//! ```
//!
//! Opening and closing own two primitives each and run them back to back.

use f3d_core::VolumeDims;
use tracing::trace;

use super::{FilterStage, ProgramSlot, StageConfig, StageInfo, dispatch, extent_args};
use crate::backend::{BufferHandle, CommandQueue, KernelArg};
use crate::buffers::{BufferSet, LoadedChunk};
use crate::element::{MaskSpec, StructuringElement};
use crate::{ComputeError, ComputeResult};

/// Primitive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Morphology {
    /// Local maximum under the element.
    Dilate,
    /// Local minimum under the element.
    Erode,
}

impl Morphology {
    fn kernel(self) -> &'static str {
        match self {
            Self::Dilate => "dilate3d",
            Self::Erode => "erode3d",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Dilate => "Dilation",
            Self::Erode => "Erosion",
        }
    }
}

/// Dilation or erosion under a [`MaskSpec`].
#[derive(Debug)]
struct Primitive {
    op: Morphology,
    mask: MaskSpec,
    elements: Vec<StructuringElement>,
    program: ProgramSlot,
}

impl Clone for Primitive {
    fn clone(&self) -> Self {
        Self::new(self.op, self.mask.clone())
    }
}

impl Primitive {
    fn new(op: Morphology, mask: MaskSpec) -> Self {
        Self {
            op,
            mask,
            elements: Vec::new(),
            program: ProgramSlot::new("morphology"),
        }
    }

    fn overlap(&self) -> usize {
        self.mask.overlap()
    }

    fn load(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        if self.elements.is_empty() {
            self.elements = self.mask.build()?;
        }
        self.program.load(queue)
    }

    fn release(&mut self, queue: &mut dyn CommandQueue) {
        self.program.release(queue);
    }

    /// Applies every sub-element; the result is left in `output`.
    fn apply(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        let program = self.program.get()?;
        if self.elements.is_empty() {
            return Err(ComputeError::Dispatch(format!("{} has no structuring elements", self.op.name())));
        }
        let extent = extent_args(chunk)?;

        for (pass, element) in self.elements.iter().enumerate() {
            element.check_size()?;
            let (src, dst) = match pass {
                0 => (buffers.input(), buffers.temp()?),
                p if p % 2 == 1 => (buffers.temp()?, buffers.output()),
                _ => (buffers.output(), buffers.temp()?),
            };
            let uploaded = upload(buffers.queue(), element)?;
            let (ed, eh, ew) = element.dims();
            let mut args = vec![KernelArg::Buffer(src), KernelArg::Buffer(uploaded), KernelArg::Buffer(dst)];
            args.extend_from_slice(&extent);
            args.extend([KernelArg::size(ew)?, KernelArg::size(eh)?, KernelArg::size(ed)?]);

            trace!(op = self.op.name(), pass, element = ?element.dims(), range = %chunk.range, "morphology pass");
            let result = dispatch(buffers, program, self.op.kernel(), &args, chunk);
            buffers.queue().release(uploaded);
            result?;
        }

        if self.elements.len() % 2 == 1 {
            buffers.swap_output_temp()?;
        }
        Ok(())
    }
}

fn upload(queue: &mut dyn CommandQueue, element: &StructuringElement) -> ComputeResult<BufferHandle> {
    let buffer = queue.allocate(element.voxels())?;
    if let Err(e) = queue.write(buffer, 0, element.data()) {
        queue.release(buffer);
        return Err(e);
    }
    Ok(buffer)
}

macro_rules! primitive_stage {
    ($(#[$doc:meta])* $stage:ident, $op:expr, $config:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $stage {
            inner: Primitive,
        }

        impl $stage {
            /// Stage applying every sub-element of `mask` in turn.
            pub fn new(mask: MaskSpec) -> Self {
                Self {
                    inner: Primitive::new($op, mask),
                }
            }

            /// Structuring element description.
            pub fn mask(&self) -> &MaskSpec {
                &self.inner.mask
            }
        }

        impl Default for $stage {
            fn default() -> Self {
                Self::new(MaskSpec::default())
            }
        }

        impl FilterStage for $stage {
            fn name(&self) -> &str {
                self.inner.op.name()
            }

            fn info(&self) -> StageInfo {
                StageInfo::uniform(self.inner.overlap(), true)
            }

            fn validate(&self, _dims: VolumeDims) -> ComputeResult<()> {
                self.inner.mask.validate().map(|_| ())
            }

            fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
                self.inner.load(queue)
            }

            fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
                self.inner.apply(buffers, chunk)?;
                buffers.commit()
            }

            fn release_program(&mut self, queue: &mut dyn CommandQueue) {
                self.inner.release(queue);
            }

            fn clone_stage(&self) -> Box<dyn FilterStage> {
                Box::new(self.clone())
            }

            fn to_config(&self) -> Option<StageConfig> {
                Some(StageConfig::$config {
                    mask: self.inner.mask.clone(),
                })
            }
        }
    };
}

primitive_stage!(
    /// Grey-level dilation.
    Dilate,
    Morphology::Dilate,
    Dilate
);

primitive_stage!(
    /// Grey-level erosion.
    Erode,
    Morphology::Erode,
    Erode
);

/// Two primitives run back to back.
#[derive(Debug, Clone)]
struct Composite {
    name: &'static str,
    first: Primitive,
    second: Primitive,
}

impl Composite {
    fn new(name: &'static str, first: Morphology, second: Morphology, mask: MaskSpec) -> Self {
        Self {
            name,
            first: Primitive::new(first, mask.clone()),
            second: Primitive::new(second, mask),
        }
    }

    fn info(&self) -> StageInfo {
        // Both passes eat into the halo.
        StageInfo::uniform(self.first.overlap() + self.second.overlap(), true)
    }

    fn validate(&self) -> ComputeResult<()> {
        self.first.mask.validate()?;
        self.second.mask.validate()?;
        Ok(())
    }

    fn load(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        self.first.load(queue)?;
        self.second.load(queue)
    }

    fn release(&mut self, queue: &mut dyn CommandQueue) {
        self.first.release(queue);
        self.second.release(queue);
    }

    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        trace!(stage = self.name, range = %chunk.range, "composite");
        self.first.apply(buffers, chunk)?;
        buffers.swap();
        self.second.apply(buffers, chunk)?;
        buffers.commit()
    }
}

macro_rules! composite_stage {
    ($(#[$doc:meta])* $stage:ident, $name:literal, $first:expr, $second:expr, $config:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $stage {
            inner: Composite,
        }

        impl $stage {
            /// Stage running both passes with the same `mask`.
            pub fn new(mask: MaskSpec) -> Self {
                Self {
                    inner: Composite::new($name, $first, $second, mask),
                }
            }

            /// Structuring element description.
            pub fn mask(&self) -> &MaskSpec {
                &self.inner.first.mask
            }
        }

        impl Default for $stage {
            fn default() -> Self {
                Self::new(MaskSpec::default())
            }
        }

        impl FilterStage for $stage {
            fn name(&self) -> &str {
                self.inner.name
            }

            fn info(&self) -> StageInfo {
                self.inner.info()
            }

            fn validate(&self, _dims: VolumeDims) -> ComputeResult<()> {
                self.inner.validate()
            }

            fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
                self.inner.load(queue)
            }

            fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
                self.inner.run(buffers, chunk)
            }

            fn release_program(&mut self, queue: &mut dyn CommandQueue) {
                self.inner.release(queue);
            }

            fn clone_stage(&self) -> Box<dyn FilterStage> {
                Box::new(self.clone())
            }

            fn to_config(&self) -> Option<StageConfig> {
                Some(StageConfig::$config {
                    mask: self.mask().clone(),
                })
            }
        }
    };
}

composite_stage!(
    /// Opening: erosion followed by dilation.
    Open,
    "Opening",
    Morphology::Erode,
    Morphology::Dilate,
    Open
);

composite_stage!(
    /// Closing: dilation followed by erosion.
    Close,
    "Closing",
    Morphology::Dilate,
    Morphology::Erode,
    Close
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::run_whole;
    use f3d_core::Volume;

    fn dot(dims: VolumeDims, at: (usize, usize, usize)) -> Volume {
        Volume::from_fn(dims, |z, y, x| if (z, y, x) == at { 255 } else { 0 }).unwrap()
    }

    /// Box dilation computed directly on the host.
    fn box_dilate(vol: &Volume, r: usize) -> Volume {
        let dims = vol.dims();
        Volume::from_fn(dims, |z, y, x| {
            let mut m = 0;
            for zz in z.saturating_sub(r)..=(z + r).min(dims.depth - 1) {
                for yy in y.saturating_sub(r)..=(y + r).min(dims.height - 1) {
                    for xx in x.saturating_sub(r)..=(x + r).min(dims.width - 1) {
                        m = m.max(vol.get(zz, yy, xx).unwrap_or(0));
                    }
                }
            }
            m
        })
        .unwrap()
    }

    #[test]
    fn test_l_dilation_is_box() {
        // Three sub-elements: odd pass count, exercises the final swap.
        let vol = dot(VolumeDims::new(8, 8, 8), (4, 3, 5));
        let out = run_whole(&mut Dilate::new(MaskSpec::l(1)), &vol).unwrap();
        assert_eq!(out, box_dilate(&vol, 1));
    }

    #[test]
    fn test_even_pass_count() {
        let vol = dot(VolumeDims::new(6, 6, 6), (2, 2, 2));
        let elements = vec![
            StructuringElement::line_x(3).unwrap(),
            StructuringElement::line_y(3).unwrap(),
        ];
        let out = run_whole(&mut Dilate::new(MaskSpec::Literal { elements }), &vol).unwrap();
        // 3x3 cross-product square in slice 2 only
        for z in 0..6 {
            for y in 0..6 {
                for x in 0..6 {
                    let inside = z == 2 && (1..=3).contains(&y) && (1..=3).contains(&x);
                    assert_eq!(out.get(z, y, x), Some(if inside { 255 } else { 0 }));
                }
            }
        }
    }

    #[test]
    fn test_erode_removes_dot() {
        let vol = dot(VolumeDims::new(6, 6, 6), (3, 3, 3));
        let out = run_whole(&mut Erode::new(MaskSpec::l(1)), &vol).unwrap();
        assert!(out.data().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_open_close_on_dot() {
        let vol = dot(VolumeDims::new(8, 8, 8), (4, 4, 4));
        let opened = run_whole(&mut Open::new(MaskSpec::l(1)), &vol).unwrap();
        assert!(opened.data().iter().all(|&v| v == 0));

        let closed = run_whole(&mut Close::new(MaskSpec::l(1)), &vol).unwrap();
        assert_eq!(closed, vol);
    }

    #[test]
    fn test_overlaps() {
        assert_eq!(Dilate::new(MaskSpec::l(3)).info().overlap_z, 3);
        assert_eq!(Open::new(MaskSpec::l(3)).info().overlap_z, 6);
        let diag: MaskSpec = "Diagonal10x10x4".parse().unwrap();
        assert_eq!(Close::new(diag).info().overlap_z, 8);
    }

    #[test]
    fn test_oversized_mask_rejected() {
        let spec = MaskSpec::Diagonal { width: 21, height: 21, depth: 21 };
        let dims = VolumeDims::new(4, 4, 4);
        assert!(Dilate::new(spec.clone()).validate(dims).is_err());
        assert!(Erode::new(spec.clone()).validate(dims).is_err());
        assert!(Open::new(spec.clone()).validate(dims).is_err());
        assert!(Close::new(spec).validate(dims).is_err());
    }

    #[test]
    fn test_names_and_config() {
        assert_eq!(Dilate::default().name(), "Dilation");
        assert_eq!(Close::default().name(), "Closing");
        assert_eq!(
            Open::new(MaskSpec::l(2)).to_config(),
            Some(StageConfig::Open { mask: MaskSpec::l(2) })
        );
    }
}
