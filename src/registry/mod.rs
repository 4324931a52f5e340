//! Process-wide algorithm and workflow registries

pub mod algorithms;
pub mod workflows;

pub use algorithms::{AlgorithmDescriptor, AlgorithmRegistry, ParamSpec, Stability, StabilityFilter};
pub use workflows::{ActivationRequest, WorkflowRegistry, WorkflowVersion};
