//! irhost - Convolution-based filtering subsystem
//!
//! Loads arbitrary-length impulse-response kernels (including spatial/HRTF
//! measurement sets), adapts them to the live session's sample rate and
//! block size, and runs them through a low-latency partitioned-convolution
//! engine inside a hard-real-time audio callback.
//!
//! # Architecture
//!
//! Dependency order, leaves first:
//! - [`kernel::KernelRepository`] - locates, loads, resamples, normalizes,
//!   combines and persists kernels. No real-time constraints.
//! - [`dsp::SpectrumAnalyzer`] - offline frequency-response analysis for
//!   UI display.
//! - [`dsp::ConvolutionEngine`] - owns the live partitioned-convolution
//!   backend and the real-time `process()` call.
//! - [`effect::ConvolverEffect`] - host-facing orchestrator; drives
//!   background reloads and UI-invocable operations.
//!
//! Three execution contexts share this code: the real-time audio callback,
//! a background worker for file I/O and engine reconfiguration, and the
//! UI/control context. Each owns its own kernel copy; updates are explicit
//! hand-offs, never aliased mutation across contexts.

pub mod dsp;
pub mod effect;
pub mod error;
pub mod kernel;

pub use effect::{AudioEffect, ConvolverEffect, ConvolverSettings, EffectNotification};
pub use error::{ConvolverError, Result};
pub use kernel::{ImpulseResponseKernel, KernelRepository, SpatialMetadata};
