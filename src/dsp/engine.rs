//! Live convolution engine
//!
//! Owns the partitioned backend plus the kernel-shaping transforms that
//! run right before upload: stereo width and automatic gain. The original
//! kernel is kept untouched so transforms are always recomputed from the
//! source data instead of compounding.

use std::time::Duration;

use log::{debug, warn};

use crate::dsp::partition::{ConvolverTap, PartitionedConvolver};
use crate::error::{ConvolverError, Result};
use crate::kernel::{ImpulseResponseKernel, KernelLayout};

/// Scheduling priority requested for the backend's processing
const AUDIO_PRIORITY: i32 = 20;

/// How long teardown waits for the audio thread to acknowledge a stop
const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine lifecycle as the orchestrator sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No kernel loaded yet
    Uninitialized,
    /// Kernel uploaded, backend convolving
    Ready,
    /// Stopped on request; a re-init brings it back
    Stopped,
    /// A block mismatch or backend failure latched the engine off
    Failed,
}

/// The real-time convolution stage of the effect
#[derive(Debug)]
pub struct ConvolutionEngine {
    state: EngineState,
    backend: Option<PartitionedConvolver>,
    /// Source kernel, never mutated after init
    original: Option<ImpulseResponseKernel>,
    rate: u32,
    quantum: usize,
    width_percent: f64,
    autogain: bool,
}

impl Default for ConvolutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvolutionEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            backend: None,
            original: None,
            rate: 0,
            quantum: 0,
            width_percent: 100.0,
            autogain: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// True when `process` will convolve rather than refuse
    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    /// Width and autogain currently applied
    pub fn shaping(&self) -> (f64, bool) {
        (self.width_percent, self.autogain)
    }

    /// Build a backend for `kernel` and start convolving.
    ///
    /// Any previous backend is stopped and drained first. The kernel must
    /// already be resampled to the session rate; adaptation is the
    /// repository's job, not the engine's.
    pub fn init(
        &mut self,
        kernel: ImpulseResponseKernel,
        rate: u32,
        quantum: usize,
        width_percent: f64,
        autogain: bool,
    ) -> Result<()> {
        if !kernel.is_valid() {
            return Err(ConvolverError::EmptyOrMismatchedChannels {
                details: format!("engine init with invalid kernel {}", kernel.name),
            });
        }
        if kernel.rate != rate {
            return Err(ConvolverError::BackendConfiguration {
                stage: "engine init",
                reason: format!(
                    "kernel rate {} does not match session rate {}",
                    kernel.rate, rate
                ),
            });
        }

        self.teardown_backend();

        let shaped = kernel_to_backend(&kernel, quantum, width_percent, autogain);
        let backend = match shaped {
            Ok(backend) => backend,
            Err(e) => {
                // The previous backend is already gone; the engine must
                // not claim readiness it no longer has.
                if self.state == EngineState::Ready {
                    self.state = EngineState::Failed;
                }
                return Err(e);
            }
        };

        debug!(
            "engine ready: kernel {} ({} samples at {} Hz), quantum {}, width {}%, autogain {}",
            kernel.name,
            kernel.sample_count(),
            rate,
            quantum,
            width_percent,
            autogain
        );

        self.backend = Some(backend);
        self.original = Some(kernel);
        self.rate = rate;
        self.quantum = quantum;
        self.width_percent = width_percent;
        self.autogain = autogain;
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Convolve one block.
    ///
    /// Returns `false` without touching the outputs when the engine is
    /// not ready or the block length differs from the configured quantum.
    /// A mismatch latches the engine into the failed state; the caller is
    /// expected to fall back to pass-through and schedule a re-init.
    pub fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
    ) -> bool {
        if self.state != EngineState::Ready {
            return false;
        }
        if input_l.len() != self.quantum || input_r.len() != self.quantum {
            warn!(
                "block of {} samples against quantum {}, disabling engine",
                input_l.len(),
                self.quantum
            );
            self.state = EngineState::Failed;
            return false;
        }

        let backend = match self.backend.as_mut() {
            Some(backend) => backend,
            None => {
                self.state = EngineState::Failed;
                return false;
            }
        };

        match backend.process_block(input_l, input_r, output_l, output_r) {
            Ok(()) => true,
            Err(e) => {
                warn!("backend refused block ({}), disabling engine", e.code());
                self.state = EngineState::Failed;
                false
            }
        }
    }

    /// Re-shape the kernel with new width/autogain settings.
    ///
    /// With `hot_swap` the new impulses replace the running ones in place,
    /// at the cost of a short history reset. Without it the backend is
    /// rebuilt from scratch.
    pub fn update_shaping(
        &mut self,
        width_percent: f64,
        autogain: bool,
        hot_swap: bool,
    ) -> Result<()> {
        let original = self
            .original
            .as_ref()
            .ok_or(ConvolverError::BackendConfiguration {
                stage: "shaping update",
                reason: "no kernel loaded".to_string(),
            })?
            .clone();

        if hot_swap && self.state == EngineState::Ready {
            let shaped = shape_kernel(&original, width_percent, autogain);
            if let Some(backend) = self.backend.as_mut() {
                upload_shaped_update(backend, &shaped)?;
                self.width_percent = width_percent;
                self.autogain = autogain;
                debug!("hot-swapped shaping: width {}%, autogain {}", width_percent, autogain);
                return Ok(());
            }
        }

        let (rate, quantum) = (self.rate, self.quantum);
        self.init(original, rate, quantum, width_percent, autogain)
    }

    /// Stop the backend and wait for the drain acknowledgement. Safe to
    /// call repeatedly and before init.
    pub fn stop(&mut self) {
        self.teardown_backend();
        if self.state != EngineState::Uninitialized {
            self.state = EngineState::Stopped;
        }
    }

    fn teardown_backend(&mut self) {
        if let Some(backend) = self.backend.take() {
            let handle = backend.stop_handle();
            backend.stop_process();
            if !handle.wait_stopped(STOP_TIMEOUT) {
                warn!("backend did not acknowledge stop within {:?}", STOP_TIMEOUT);
            }
        }
    }
}

impl Drop for ConvolutionEngine {
    fn drop(&mut self) {
        self.teardown_backend();
    }
}

/// Shape the kernel and stand up a running backend for it
fn kernel_to_backend(
    kernel: &ImpulseResponseKernel,
    quantum: usize,
    width_percent: f64,
    autogain: bool,
) -> Result<PartitionedConvolver> {
    let shaped = shape_kernel(kernel, width_percent, autogain);
    if shaped.has_invalid_samples() {
        return Err(ConvolverError::EmptyOrMismatchedChannels {
            details: "kernel shaping produced non-finite samples".to_string(),
        });
    }
    let mut backend =
        PartitionedConvolver::configure(shaped.layout(), quantum, shaped.sample_count())?;
    upload_kernel(&mut backend, &shaped)?;
    backend.start_process(AUDIO_PRIORITY)?;
    Ok(backend)
}

fn upload_kernel(backend: &mut PartitionedConvolver, kernel: &ImpulseResponseKernel) -> Result<()> {
    backend.upload_impulse(ConvolverTap::LeftDirect, &kernel.channel_l)?;
    backend.upload_impulse(ConvolverTap::RightDirect, &kernel.channel_r)?;
    if kernel.layout() == KernelLayout::TrueStereo {
        backend.upload_impulse(ConvolverTap::LeftCross, &kernel.channel_lr)?;
        backend.upload_impulse(ConvolverTap::RightCross, &kernel.channel_rl)?;
    }
    Ok(())
}

fn upload_shaped_update(
    backend: &mut PartitionedConvolver,
    kernel: &ImpulseResponseKernel,
) -> Result<()> {
    backend.update_impulse(ConvolverTap::LeftDirect, &kernel.channel_l)?;
    backend.update_impulse(ConvolverTap::RightDirect, &kernel.channel_r)?;
    if kernel.layout() == KernelLayout::TrueStereo {
        backend.update_impulse(ConvolverTap::LeftCross, &kernel.channel_lr)?;
        backend.update_impulse(ConvolverTap::RightCross, &kernel.channel_rl)?;
    }
    Ok(())
}

/// Apply stereo width and autogain to a copy of the kernel
fn shape_kernel(
    original: &ImpulseResponseKernel,
    width_percent: f64,
    autogain: bool,
) -> ImpulseResponseKernel {
    let mut kernel = original.clone();
    apply_stereo_width(&mut kernel, width_percent);
    if autogain {
        apply_autogain(&mut kernel);
    }
    kernel
}

/// Blend the channels toward mono as width falls below 100%.
///
/// With `w = width/100`, each sample pair becomes
/// `L' = L + x*R`, `R' = R + x*L` where `x = (1 - w) / (1 + w)`. Width
/// 100% gives `x = 0` and leaves the kernel untouched. Cross channels of
/// true-stereo kernels blend against each other with the sign flipped so
/// the matrix stays consistent.
fn apply_stereo_width(kernel: &mut ImpulseResponseKernel, width_percent: f64) {
    // The denominator vanishes at width -100%; clamp just above it so
    // the coefficient stays finite at the bottom of the control range.
    let w = (width_percent * 0.01).max(-0.99);
    let x = ((1.0 - w) / (1.0 + w)) as f32;
    if x == 0.0 {
        return;
    }

    for n in 0..kernel.channel_l.len() {
        let l = kernel.channel_l[n];
        let r = kernel.channel_r[n];
        kernel.channel_l[n] = l + x * r;
        kernel.channel_r[n] = r + x * l;
    }
    if kernel.layout() == KernelLayout::TrueStereo {
        for n in 0..kernel.channel_lr.len() {
            let lr = kernel.channel_lr[n];
            let rl = kernel.channel_rl[n];
            kernel.channel_lr[n] = lr - x * rl;
            kernel.channel_rl[n] = rl - x * lr;
        }
    }
}

/// Attenuate the kernel so its loudest channel carries at most unit
/// energy. Gain never exceeds 1, so quiet kernels are left alone.
fn apply_autogain(kernel: &mut ImpulseResponseKernel) {
    let power = kernel
        .channels()
        .map(|c| c.iter().map(|v| v * v).sum::<f32>())
        .fold(0.0f32, f32::max);
    if power <= 0.0 {
        return;
    }

    let gain = (1.0 / power.sqrt()).min(1.0);
    if gain < 1.0 {
        debug!("autogain attenuating kernel by {:.3}", gain);
        for channel in kernel.channels_mut() {
            for v in channel.iter_mut() {
                *v *= gain;
            }
        }
    }
}
