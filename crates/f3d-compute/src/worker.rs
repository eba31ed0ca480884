//! Per-device pipeline loop.
//!
//! One [`PipelineWorker`] runs on its own thread for every device of a run.
//! It sizes its chunks from the device budget, allocates one
//! [`BufferSet`] and then pulls ranges from the shared [`ChunkCursor`]
//! until the volume is exhausted:
//!
//! ```text
//! Init -> Loading -> Executing(0..n) -> WritingBack -+-> Draining -> Done
//!            ^                                        |
//!            +----------------------------------------+
//! any state -> Failed
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use f3d_core::{DepthRange, Volume};
use tracing::{debug, error, info, trace};

use crate::backend::{CommandQueue, DeviceBudget, DeviceSlot};
use crate::buffers::BufferSet;
use crate::collector::{ResultChunk, ResultCollector};
use crate::config::{EngineConfig, format_bytes};
use crate::cursor::ChunkCursor;
use crate::stages::{self, FilterStage};
use crate::{ComputeError, ComputeResult};

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started.
    Init,
    /// Uploading a chunk and its halo.
    Loading,
    /// Running the stage at this pipeline index.
    Executing(usize),
    /// Reading the chunk back without its halo.
    WritingBack,
    /// Releasing programs after the last chunk.
    Draining,
    /// Finished every chunk it took.
    Done,
    /// Stopped on an error.
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executing(i) => write!(f, "Executing({i})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// What one worker did during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Device name.
    pub device: String,
    /// Chunks processed.
    pub chunks: usize,
    /// Slices processed, halo excluded.
    pub slices: usize,
    /// Chunk depth the budget allowed.
    pub chunk_depth: usize,
    /// Time spent loading, filtering and reading back.
    pub busy: Duration,
}

/// A stage as seen by one worker: its own copy, or the caller's instance
/// when the stage holds no device state.
enum WorkerStage<'a> {
    Owned(Box<dyn FilterStage>),
    Shared(&'a dyn FilterStage),
}

impl WorkerStage<'_> {
    fn get(&self) -> &dyn FilterStage {
        match self {
            Self::Owned(stage) => stage.as_ref(),
            Self::Shared(stage) => *stage,
        }
    }

    fn load(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        match self {
            Self::Owned(stage) => stage.load_program(queue),
            Self::Shared(_) => Ok(()),
        }
    }

    fn release(&mut self, queue: &mut dyn CommandQueue) {
        if let Self::Owned(stage) = self {
            stage.release_program(queue);
        }
    }
}

/// Drives chunks of a volume through a pipeline on one device.
pub struct PipelineWorker<'a> {
    index: usize,
    slot: &'a DeviceSlot,
    pipeline: &'a [Box<dyn FilterStage>],
    volume: &'a Volume,
    cursor: &'a ChunkCursor,
    collector: &'a ResultCollector,
    config: &'a EngineConfig,
    state: WorkerState,
}

impl<'a> PipelineWorker<'a> {
    /// Worker `index` for the device in `slot`, sharing `cursor` and
    /// `collector` with the other workers of the run.
    pub fn new(
        index: usize,
        slot: &'a DeviceSlot,
        pipeline: &'a [Box<dyn FilterStage>],
        volume: &'a Volume,
        cursor: &'a ChunkCursor,
        collector: &'a ResultCollector,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            index,
            slot,
            pipeline,
            volume,
            cursor,
            collector,
            config,
            state: WorkerState::Init,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Name of the device this worker drives.
    pub fn device(&self) -> &str {
        &self.slot.device.info().name
    }

    /// Processes ranges until the cursor is exhausted.
    ///
    /// Every buffer and program is released before this returns, on success
    /// and on failure. Errors carry the device, the chunk and the stage they
    /// happened in.
    pub fn run(&mut self) -> ComputeResult<WorkerReport> {
        let started = Instant::now();
        match self.execute() {
            Ok(report) => {
                self.enter(WorkerState::Done);
                info!(
                    worker = self.index,
                    device = %report.device,
                    chunks = report.chunks,
                    slices = report.slices,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "worker done"
                );
                Ok(report)
            }
            Err(e) => {
                let state = self.state;
                self.enter(WorkerState::Failed);
                error!(worker = self.index, device = %self.device(), %state, "{e}");
                Err(e)
            }
        }
    }

    fn enter(&mut self, state: WorkerState) {
        trace!(worker = self.index, from = %self.state, to = %state, "state");
        self.state = state;
    }

    fn fail(&self, range: Option<DepthRange>, stage: Option<&str>, source: ComputeError) -> ComputeError {
        ComputeError::Worker {
            device: self.device().to_string(),
            range,
            stage: stage.map(str::to_string),
            source: Box::new(source),
        }
    }

    fn execute(&mut self) -> ComputeResult<WorkerReport> {
        let slot = self.slot;
        let device = slot.device.as_ref();
        let info = device.info();
        let dims = self.volume.dims();

        let halo = stages::max_overlap(self.pipeline);
        let budget = DeviceBudget::from_config(self.config);
        let chunk_depth = budget.max_chunk_depth(info, dims, slot.cap);
        if chunk_depth == 0 {
            return Err(self.fail(
                None,
                None,
                ComputeError::Configuration(format!("no chunk of a {dims} volume fits on '{}'", info.name)),
            ));
        }
        let slices = chunk_depth.saturating_add(2 * halo).min(dims.depth);
        debug!(
            worker = self.index,
            device = %info.name,
            chunk_depth,
            halo,
            ceiling = %format_bytes(budget.memory_ceiling(info)),
            "worker init"
        );

        let mut queue = device.create_queue().map_err(|e| self.fail(None, None, e))?;
        let mut stages: Vec<WorkerStage<'a>> = self
            .pipeline
            .iter()
            .map(|stage| {
                if stage.is_stateful() {
                    WorkerStage::Owned(stage.clone_stage())
                } else {
                    WorkerStage::Shared(stage.as_ref())
                }
            })
            .collect();

        let outcome = self.process(queue.as_mut(), &mut stages, chunk_depth, slices, halo);

        self.enter(WorkerState::Draining);
        for stage in &mut stages {
            stage.release(queue.as_mut());
        }
        let (chunks, processed, busy) = outcome?;

        Ok(WorkerReport {
            device: info.name.clone(),
            chunks,
            slices: processed,
            chunk_depth,
            busy,
        })
    }

    /// Loads programs, allocates buffers and runs the chunk loop. The
    /// buffers are dropped before this returns.
    fn process(
        &mut self,
        queue: &mut dyn CommandQueue,
        stages: &mut [WorkerStage<'_>],
        chunk_depth: usize,
        slices: usize,
        halo: usize,
    ) -> ComputeResult<(usize, usize, Duration)> {
        for stage in stages.iter_mut() {
            let name = stage.get().name().to_string();
            stage.load(queue).map_err(|e| self.fail(None, Some(&name), e))?;
        }

        let needs_temp = stages.iter().any(|s| s.get().info().needs_temp);
        let slice_len = self.volume.dims().slice_len();
        let mut buffers =
            BufferSet::allocate(queue, slice_len, slices, needs_temp).map_err(|e| self.fail(None, None, e))?;

        let (mut chunks, mut processed, mut busy) = (0, 0, Duration::ZERO);
        while let Some(range) = self.cursor.next_range(chunk_depth) {
            let started = Instant::now();

            self.enter(WorkerState::Loading);
            let chunk = buffers
                .load(self.volume, range, halo)
                .map_err(|e| self.fail(Some(range), None, e))?;

            let mut elapsed = Duration::ZERO;
            let last = stages.len().saturating_sub(1);
            for (i, stage) in stages.iter().enumerate() {
                let stage = stage.get();
                self.enter(WorkerState::Executing(i));
                let stage_start = Instant::now();
                stage
                    .run(&mut buffers, &chunk)
                    .map_err(|e| self.fail(Some(range), Some(stage.name()), e))?;
                let took = stage_start.elapsed();
                elapsed += took;
                trace!(worker = self.index, %range, stage = stage.name(), us = took.as_micros() as u64, "stage");
                if i < last {
                    buffers.swap();
                }
            }

            self.enter(WorkerState::WritingBack);
            let data = buffers.write_back(&chunk).map_err(|e| self.fail(Some(range), None, e))?;
            self.collector.push(ResultChunk {
                range,
                data,
                device: self.device().to_string(),
                elapsed,
            });

            chunks += 1;
            processed += range.len();
            busy += started.elapsed();
            if self.config.verbose {
                info!(worker = self.index, device = %self.device(), %range, window = %chunk.window, "chunk done");
            } else {
                debug!(worker = self.index, device = %self.device(), %range, window = %chunk.window, "chunk done");
            }
        }

        buffers.release();
        Ok((chunks, processed, busy))
    }
}

impl fmt::Debug for PipelineWorker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineWorker")
            .field("index", &self.index)
            .field("device", &self.device())
            .field("stages", &self.pipeline.len())
            .field("state", &self.state)
            .finish()
    }
}
