//! Run entry point.
//!
//! [`Engine::run`] validates its inputs, starts one worker thread per device,
//! waits for all of them and reassembles the filtered volume.
//!
//! ```rust
//! use std::sync::Arc;
//! use f3d_compute::{ComputeDevice, CpuDevice, DeviceSet, Engine};
//! use f3d_compute::stages::{FilterStage, Identity};
//! use f3d_core::{Volume, VolumeDims};
//!
//! let volume = Volume::from_fn(VolumeDims::new(20, 4, 4), |z, _, _| z as u8).unwrap();
//! let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Identity::new())];
//! let devices = DeviceSet::Capped(vec![
//!     (Arc::new(CpuDevice::named("CPU-0")) as Arc<dyn ComputeDevice>, 3),
//!     (Arc::new(CpuDevice::named("CPU-1")) as Arc<dyn ComputeDevice>, 7),
//! ]);
//!
//! let report = Engine::builder().build().run_with_report(&volume, &pipeline, &devices).unwrap();
//! assert_eq!(report.volume, volume);
//! assert!(report.chunks.iter().all(|c| c.range.len() <= 7));
//! ```

use std::thread;
use std::time::{Duration, Instant};

use f3d_core::{DepthRange, Volume};
use tracing::{debug, error, info};

use crate::backend::{DeviceSet, DeviceSlot};
use crate::collector::ResultCollector;
use crate::config::EngineConfig;
use crate::cursor::ChunkCursor;
use crate::stages::{FilterStage, PipelineConfig};
use crate::worker::{PipelineWorker, WorkerReport};
use crate::{ComputeError, ComputeResult};

/// One reassembled chunk: which slices, where and how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Slices the chunk covered.
    pub range: DepthRange,
    /// Device that filtered it.
    pub device: String,
    /// Time spent in its stages.
    pub elapsed: Duration,
}

/// Result of a run with per-chunk and per-worker detail.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Filtered volume.
    pub volume: Volume,
    /// Chunks sorted by start slice.
    pub chunks: Vec<ChunkSummary>,
    /// One report per device, in device order.
    pub workers: Vec<WorkerReport>,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl RunReport {
    /// Slices each device processed, in device order.
    pub fn slices_per_device(&self) -> Vec<(String, usize)> {
        self.workers.iter().map(|w| (w.device.clone(), w.slices)).collect()
    }
}

/// Chunked multi-device pipeline engine.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Engine with an explicit configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Starts from the default configuration.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Engine configured from `F3D_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Filters `volume` through `pipeline` on `devices`.
    pub fn run(&self, volume: &Volume, pipeline: &[Box<dyn FilterStage>], devices: &DeviceSet) -> ComputeResult<Volume> {
        self.run_with_report(volume, pipeline, devices).map(|r| r.volume)
    }

    /// Builds the stages described by `config` and runs them.
    pub fn run_config(&self, volume: &Volume, config: &PipelineConfig, devices: &DeviceSet) -> ComputeResult<Volume> {
        self.run(volume, &config.build(), devices)
    }

    /// Checks the run inputs and resolves the devices.
    ///
    /// Every failure here is a [`ComputeError::Configuration`].
    pub fn validate(
        &self,
        volume: &Volume,
        pipeline: &[Box<dyn FilterStage>],
        devices: &DeviceSet,
    ) -> ComputeResult<Vec<DeviceSlot>> {
        let dims = volume.dims();
        if dims.is_empty() {
            return Err(ComputeError::Configuration(format!("volume {dims} is empty")));
        }
        if pipeline.is_empty() {
            return Err(ComputeError::Configuration("pipeline has no stages".into()));
        }
        for stage in pipeline {
            stage.validate(dims).map_err(|e| match e {
                e @ ComputeError::Configuration(_) => e,
                other => ComputeError::Configuration(format!("stage '{}': {other}", stage.name())),
            })?;
        }
        devices.resolve()
    }

    /// Filters `volume` and reports how the work was spread.
    ///
    /// No worker starts unless [`validate`](Engine::validate) passes. If any
    /// worker fails the first failure in device order is returned and
    /// nothing is reassembled.
    pub fn run_with_report(
        &self,
        volume: &Volume,
        pipeline: &[Box<dyn FilterStage>],
        devices: &DeviceSet,
    ) -> ComputeResult<RunReport> {
        let slots = self.validate(volume, pipeline, devices)?;
        let dims = volume.dims();
        let started = Instant::now();
        info!(
            volume = %dims,
            stages = pipeline.len(),
            devices = slots.len(),
            "run start"
        );

        let cursor = ChunkCursor::new(dims.depth);
        let collector = ResultCollector::new();
        let config = &self.config;

        let outcomes: Vec<ComputeResult<WorkerReport>> = thread::scope(|scope| {
            let handles: Vec<_> = slots
                .iter()
                .enumerate()
                .map(|(index, slot)| {
                    let (cursor, collector) = (&cursor, &collector);
                    let spawned = thread::Builder::new()
                        .name(format!("f3d-worker-{index}"))
                        .spawn_scoped(scope, move || {
                            PipelineWorker::new(index, slot, pipeline, volume, cursor, collector, config).run()
                        });
                    (slot, spawned)
                })
                .collect();

            handles
                .into_iter()
                .map(|(slot, spawned)| {
                    let device = slot.device.info().name.clone();
                    match spawned {
                        Ok(handle) => handle.join().unwrap_or_else(|_| {
                            Err(ComputeError::Worker {
                                device,
                                range: None,
                                stage: None,
                                source: Box::new(ComputeError::Dispatch("worker thread panicked".into())),
                            })
                        }),
                        Err(e) => Err(ComputeError::Worker {
                            device,
                            range: None,
                            stage: None,
                            source: Box::new(ComputeError::Dispatch(format!("failed to spawn worker thread: {e}"))),
                        }),
                    }
                })
                .collect()
        });

        let mut workers = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(report) => workers.push(report),
                Err(e) => {
                    error!("{e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let chunks = collector.into_chunks();
        let mut summaries: Vec<ChunkSummary> = chunks
            .iter()
            .map(|c| ChunkSummary {
                range: c.range,
                device: c.device.clone(),
                elapsed: c.elapsed,
            })
            .collect();
        summaries.sort_by_key(|c| c.range.start());

        let volume = crate::collector::reconstruct(chunks, dims)?;
        let elapsed = started.elapsed();
        for worker in &workers {
            debug!(device = %worker.device, chunks = worker.chunks, slices = worker.slices, "worker share");
        }
        info!(chunks = summaries.len(), elapsed_ms = elapsed.as_millis() as u64, "run done");

        Ok(RunReport {
            volume,
            chunks: summaries,
            workers,
            elapsed,
        })
    }
}

/// Builder for [`Engine`].
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Caps every device's chunk depth.
    pub fn max_slices(mut self, slices: usize) -> Self {
        self.config.max_slices = Some(slices);
        self
    }

    /// Overrides the per-chunk memory ceiling in bytes.
    pub fn memory_ceiling(mut self, bytes: u64) -> Self {
        self.config.memory_ceiling = Some(bytes);
        self
    }

    /// Logs each finished chunk at `info` level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> Engine {
        Engine::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ComputeDevice, CpuDevice, DeviceInfo, DeviceKind};
    use crate::stages::{Identity, Median};
    use f3d_core::VolumeDims;
    use std::sync::Arc;

    fn ramp(depth: usize) -> Volume {
        Volume::from_fn(VolumeDims::new(depth, 3, 5), |z, y, x| (z * 7 + y * 3 + x) as u8).unwrap()
    }

    #[test]
    fn test_validation_before_workers() {
        let engine = Engine::default();
        let device = Arc::new(CpuDevice::new());
        let devices = DeviceSet::Single(Arc::clone(&device) as Arc<dyn ComputeDevice>);

        let err = engine.run(&ramp(4), &[], &devices).unwrap_err();
        assert!(err.is_configuration());

        let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Identity::new())];
        let err = engine.run(&ramp(4), &pipeline, &DeviceSet::List(Vec::new())).unwrap_err();
        assert!(matches!(err, ComputeError::Configuration(_)));

        let offline = CpuDevice::with_info(DeviceInfo {
            name: "offline".into(),
            kind: DeviceKind::Gpu,
            global_mem: 1 << 20,
            max_mem_alloc: 1 << 20,
            max_work_group_size: 256,
            available: false,
        });
        let err = engine
            .run(&ramp(4), &pipeline, &DeviceSet::Single(Arc::new(offline)))
            .unwrap_err();
        assert!(err.to_string().contains("offline"));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_builder() {
        let engine = Engine::builder().max_slices(4).memory_ceiling(1 << 20).verbose(true).build();
        assert_eq!(engine.config().max_slices, Some(4));
        assert_eq!(engine.config().memory_ceiling, Some(1 << 20));
        assert!(engine.config().verbose);

        let config = EngineConfig::default().with_max_slices(2);
        assert_eq!(Engine::builder().config(config.clone()).build().config(), &config);
    }

    #[test]
    fn test_global_cap_chunks() {
        let engine = Engine::builder().max_slices(4).build();
        let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Median::new())];
        let volume = ramp(11);

        let report = engine.run_with_report(&volume, &pipeline, &DeviceSet::cpu()).unwrap();
        let ranges: Vec<(usize, usize)> = report.chunks.iter().map(|c| (c.range.start(), c.range.end())).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 11)]);
        assert_eq!(report.workers.len(), 1);
        assert_eq!(report.slices_per_device(), vec![("CPU".to_string(), 11)]);

        let whole = Engine::default().run(&volume, &pipeline, &DeviceSet::cpu()).unwrap();
        assert_eq!(report.volume, whole);
    }
}
