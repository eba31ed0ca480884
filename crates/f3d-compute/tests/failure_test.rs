//! Worker failures: error context and resource release.

mod common;

use std::sync::Arc;

use common::{assert_clean, capped_cpus, noise};
use f3d_compute::backend::{CommandQueue, ProgramHandle};
use f3d_compute::stages::{FilterStage, Identity, Median};
use f3d_compute::{BufferSet, ComputeError, ComputeResult, DeviceSet, Engine, LoadedChunk, StageInfo, WorkGroup};
use f3d_core::VolumeDims;

/// How [`Faulty`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Builds a program no runtime knows.
    Compile,
    /// Launches a kernel the program does not have once the chunk starts
    /// at or after the given slice.
    Launch(usize),
    /// Returns an error once the chunk starts at or after the given slice.
    Run(usize),
}

struct Faulty {
    fault: Fault,
    program: Option<ProgramHandle>,
}

impl Faulty {
    fn new(fault: Fault) -> Self {
        Self { fault, program: None }
    }
}

impl FilterStage for Faulty {
    fn name(&self) -> &str {
        "Faulty"
    }

    fn info(&self) -> StageInfo {
        StageInfo::uniform(1, false)
    }

    fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        let name = if self.fault == Fault::Compile { "sharpen" } else { "median" };
        self.program = Some(queue.build_program(name)?);
        Ok(())
    }

    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        match self.fault {
            Fault::Launch(from) if chunk.range.start() >= from => {
                let program = self
                    .program
                    .as_ref()
                    .ok_or_else(|| ComputeError::Dispatch("not loaded".into()))?;
                let queue = buffers.queue();
                let range = WorkGroup::compute(queue.device_info(), &[chunk.width, chunk.height])
                    .ok_or_else(|| ComputeError::Dispatch("no range".into()))?;
                queue.dispatch(program, "sharpen3d", &[], &range)?;
                queue.finish()
            }
            Fault::Run(from) if chunk.range.start() >= from => {
                Err(ComputeError::Dispatch("injected fault".into()))
            }
            _ => buffers.commit(),
        }
    }

    fn release_program(&mut self, queue: &mut dyn CommandQueue) {
        if let Some(program) = self.program.take() {
            queue.release_program(program);
        }
    }

    fn clone_stage(&self) -> Box<dyn FilterStage> {
        Box::new(Self::new(self.fault))
    }
}

#[test]
fn test_compilation_failure_has_stage_context() {
    let volume = noise(VolumeDims::new(10, 3, 3), 1);
    let (devices, set) = capped_cpus(&[4]);
    let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Median::new()), Box::new(Faulty::new(Fault::Compile))];

    let err = Engine::default().run(&volume, &pipeline, &set).unwrap_err();
    match &err {
        ComputeError::Worker { device, range, stage, .. } => {
            assert_eq!(device, "CPU-0");
            assert_eq!(*range, None);
            assert_eq!(stage.as_deref(), Some("Faulty"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root(), ComputeError::Compilation { program, .. } if program == "sharpen"));
    assert_clean(&devices);
}

#[test]
fn test_dispatch_failure_names_chunk_and_stage() {
    let volume = noise(VolumeDims::new(12, 3, 3), 2);
    let (devices, set) = capped_cpus(&[4]);
    let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Identity::new()), Box::new(Faulty::new(Fault::Launch(4)))];

    let err = Engine::default().run(&volume, &pipeline, &set).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Worker on 'CPU-0' failed at chunk [4, 8) in stage 'Faulty': \
         Dispatch failed: program 'median' has no kernel 'sharpen3d'"
    );
    assert!(!err.is_configuration());
    assert_clean(&devices);
}

#[test]
fn test_buffers_released_on_failure_with_several_devices() {
    let volume = noise(VolumeDims::new(30, 4, 4), 3);
    let (devices, set) = capped_cpus(&[3, 5, 2]);
    let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Median::new()), Box::new(Faulty::new(Fault::Run(15)))];

    let err = Engine::default().run(&volume, &pipeline, &set).unwrap_err();
    assert!(matches!(err, ComputeError::Worker { .. }));
    assert!(matches!(err.root(), ComputeError::Dispatch(msg) if msg == "injected fault"));
    assert_clean(&devices);
}

#[test]
fn test_buffers_released_on_success() {
    let volume = noise(VolumeDims::new(30, 4, 4), 4);
    let (devices, set) = capped_cpus(&[3, 5, 2]);
    let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Median::new()), Box::new(Faulty::new(Fault::Run(usize::MAX)))];

    let engine = Engine::default();
    let first = engine.run(&volume, &pipeline, &set).unwrap();
    let second = engine.run(&volume, &pipeline, &set).unwrap();
    assert_eq!(first, second);
    assert_clean(&devices);
}

#[test]
fn test_allocation_failure_is_reported() {
    let volume = noise(VolumeDims::new(8, 4, 4), 5);
    let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Median::new())];
    let device = Arc::new(f3d_compute::CpuDevice::with_info(f3d_compute::DeviceInfo {
        name: "small".into(),
        kind: f3d_compute::DeviceKind::Gpu,
        global_mem: 200,
        max_mem_alloc: 1 << 20,
        max_work_group_size: 256,
        available: true,
    }));
    let set = DeviceSet::Single(Arc::clone(&device) as Arc<dyn f3d_compute::ComputeDevice>);

    let err = Engine::default().run(&volume, &pipeline, &set).unwrap_err();
    assert!(matches!(err.root(), ComputeError::Allocation { .. }), "{err}");
    assert_clean(&[device]);
}
