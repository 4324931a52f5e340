//! Core calibration and measurement modules

pub mod calibrate;
pub mod cosmic_ray;
pub mod filters;
pub mod parallel;
pub mod pipeline;
pub mod quality;
pub mod stats;
pub mod steps;

// Re-export main types
pub use calibrate::{
    BiasParams, BiasSubtractor, CalibrationFrame, DarkParams, DarkSubtractor, FlatCorrector, FlatParams,
};
pub use cosmic_ray::{CosmicRayParams, CosmicRayRemover, CosmicRayResult, MedianFilterRemover};
pub use parallel::TileConfig;
pub use pipeline::{CalibrationLibrary, DriverOptions, PipelineDriver, StepSpec, WorkflowRun};
pub use quality::{QualityAnalyzer, QualityParams};
pub use steps::{CancellationToken, Checkpoint, StepAlgorithm};
