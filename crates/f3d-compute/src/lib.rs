//! Chunked multi-device pipeline engine for large 3-D volumes.
//!
//! A volume too large for any single device is cut into depth-wise chunks.
//! Each chunk is loaded with a halo of neighbouring slices, streamed through
//! an ordered pipeline of filter stages on one of several devices and
//! written back with the halo stripped. The chunks are reassembled into one
//! volume identical to filtering the whole thing in one pass.
//!
//! # Architecture
//!
//! ```text
//! Engine::run(volume, pipeline, devices)
//!     ├── ChunkCursor (shared, hands out depth ranges)
//!     ├── PipelineWorker (one thread per device)
//!     │       ├── DeviceBudget  -> chunk depth
//!     │       ├── BufferSet     -> input / output / temp on the device
//!     │       └── FilterStage*  -> median, bilateral, fft, mask, morphology
//!     └── ResultCollector -> reconstruct() -> Volume
//! ```
//!
//! # Example
//!
//! ```rust
//! use f3d_compute::{DeviceSet, Engine, EngineConfig};
//! use f3d_compute::stages::{FilterStage, Median};
//! use f3d_core::{Volume, VolumeDims};
//!
//! let volume = Volume::from_fn(VolumeDims::new(12, 8, 8), |z, y, x| (z + y + x) as u8).unwrap();
//! let pipeline: Vec<Box<dyn FilterStage>> = vec![Box::new(Median::new())];
//!
//! let engine = Engine::new(EngineConfig::default().with_max_slices(4));
//! let filtered = engine.run(&volume, &pipeline, &DeviceSet::cpu()).unwrap();
//! assert_eq!(filtered.dims(), volume.dims());
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod buffers;
pub mod collector;
pub mod config;
pub mod cursor;
pub mod element;
pub mod engine;
pub mod stages;
pub mod worker;

pub use backend::{
    CommandQueue, ComputeDevice, CpuDevice, DeviceBudget, DeviceInfo, DeviceKind, DeviceSet, DeviceSlot, WorkGroup,
};
pub use buffers::{BufferSet, LoadedChunk};
pub use collector::{ResultChunk, ResultCollector, reconstruct};
pub use config::EngineConfig;
pub use cursor::ChunkCursor;
pub use element::{MaskSpec, StructuringElement};
pub use engine::{ChunkSummary, Engine, EngineBuilder, RunReport};
pub use stages::{FilterStage, PipelineConfig, StageConfig, StageInfo};
pub use worker::{PipelineWorker, WorkerReport, WorkerState};

use f3d_core::DepthRange;
use thiserror::Error;

/// Engine errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Invalid input, pipeline, device set or stage parameter.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A device program failed to build.
    #[error("Failed to build program '{program}': {reason}")]
    Compilation { program: String, reason: String },

    /// A kernel launch or transfer failed.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// A device buffer could not be allocated.
    #[error("Failed to allocate {requested} bytes: {reason}")]
    Allocation { requested: u64, reason: String },

    /// Result chunks do not tile the volume.
    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),

    /// Volume or range error.
    #[error(transparent)]
    Core(#[from] f3d_core::Error),

    /// Failure inside a worker, with where it happened.
    #[error("Worker on '{device}' failed{}{}: {source}", fmt_range(.range), fmt_stage(.stage))]
    Worker {
        /// Device name.
        device: String,
        /// Chunk being processed, if any.
        range: Option<DepthRange>,
        /// Stage that failed, if any.
        stage: Option<String>,
        /// Underlying error.
        #[source]
        source: Box<ComputeError>,
    },

    /// Unreadable pipeline description.
    #[error("Pipeline config error: {0}")]
    Config(String),
}

fn fmt_range(range: &Option<DepthRange>) -> String {
    range.map(|r| format!(" at chunk {r}")).unwrap_or_default()
}

fn fmt_stage(stage: &Option<String>) -> String {
    stage.as_ref().map(|s| format!(" in stage '{s}'")).unwrap_or_default()
}

impl ComputeError {
    /// The innermost error, skipping worker context.
    pub fn root(&self) -> &ComputeError {
        match self {
            Self::Worker { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for errors raised before any worker started.
    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Self::Configuration(_) | Self::Config(_))
    }
}

/// Result type for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;
