//! Real-time and offline signal processing
//!
//! [`partition`] holds the uniform partitioned-convolution backend,
//! [`engine`] wraps it in the lifecycle the orchestrator drives, and
//! [`spectrum`] produces the offline frequency-response curves the UI
//! plots.

pub mod engine;
pub mod partition;
pub mod spectrum;

pub use engine::{ConvolutionEngine, EngineState};
pub use partition::PartitionedConvolver;
pub use spectrum::{compute_spectrum, SpectrumData};
