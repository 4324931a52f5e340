//! astrocal: calibration engine for astronomical detector frames
//!
//! Decodes FITS frames, runs bias, dark, flat and cosmic-ray steps chosen
//! from a registry of algorithm variants, scores the result, and manages
//! versioned workflow configurations with session-sticky A/B selection.

pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod io;
pub mod registry;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    CalError, CalResult, ErrorKind, FrameImage, Header, HeaderValue, MeasurementRecord, ParamMap, ParamValue,
    QualityMetrics, StepOutcome, StepStatus, StepType, WorkflowStatus,
};

pub use config::EngineConfig;
pub use context::{ProcessingContext, ProcessingType};
pub use core::{CalibrationFrame, CalibrationLibrary, CancellationToken, StepSpec, WorkflowRun};
pub use engine::{full_calibration_steps, Engine, RunOptions, WorkflowSelection};
pub use io::{FrameCodec, FrameStore, HttpStore, LocalStore, MemoryStore};
pub use registry::{AlgorithmRegistry, StabilityFilter, WorkflowRegistry, WorkflowVersion};
