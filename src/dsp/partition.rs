//! Uniform partitioned FFT convolution backend
//!
//! The impulse response is cut into partitions of one block each,
//! transformed once at configuration time, and every audio block is
//! convolved in the frequency domain against all partitions with
//! overlap-add reassembly. Cost per block is bounded and independent of
//! where in the kernel the energy sits, which is what makes it safe to
//! call from the real-time thread.
//!
//! The backend has an explicit lifecycle: `configure` → `upload_impulse`
//! per tap → `start_process` → `process_block` per quantum →
//! `stop_process`. Stopping is acknowledged through a condvar so a
//! control thread can wait for the audio thread to drain without
//! spinning.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use crate::error::{ConvolverError, Result};
use crate::kernel::KernelLayout;

/// Routing taps of the convolver matrix.
///
/// Stereo kernels use only the two direct taps. True-stereo kernels add
/// the two cross-feed taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolverTap {
    /// Left input to left output
    LeftDirect,
    /// Right input to right output
    RightDirect,
    /// Left input bleeding into the right output
    LeftCross,
    /// Right input bleeding into the left output
    RightCross,
}

/// Lifecycle of the backend as seen by control threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Configured, impulses may be uploaded
    Configured,
    /// `start_process` accepted, blocks are being convolved
    Processing,
    /// Stop requested, waiting for the in-flight block to finish
    StopRequested,
    /// Fully drained, safe to drop or reconfigure
    Stopped,
}

#[derive(Debug)]
struct GateState {
    phase: Lifecycle,
    /// Set for the duration of one `process_block` convolution; a stop
    /// arriving while this is up must wait for the block to finish
    block_in_flight: bool,
}

/// Stop handshake shared between the audio thread and control threads
#[derive(Debug)]
struct LifecycleGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

/// Forward/inverse real FFT pair with a private plan.
///
/// Each convolver instance owns its plans, so concurrent engines and the
/// spectrum analyzer never contend on shared planner state.
struct BlockFft {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

impl BlockFft {
    fn new(segment_size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        Self {
            forward: planner.plan_fft_forward(segment_size),
            inverse: planner.plan_fft_inverse(segment_size),
        }
    }

    fn forward(&self, time: &mut [f32], freq: &mut [Complex<f32>]) -> Result<()> {
        self.forward
            .process(time, freq)
            .map_err(|e| ConvolverError::BackendConfiguration {
                stage: "forward fft",
                reason: e.to_string(),
            })
    }

    fn inverse(&self, freq: &mut [Complex<f32>], time: &mut [f32]) -> Result<()> {
        self.inverse
            .process(freq, time)
            .map_err(|e| ConvolverError::BackendConfiguration {
                stage: "inverse fft",
                reason: e.to_string(),
            })?;
        let scale = 1.0 / time.len() as f32;
        for v in time.iter_mut() {
            *v *= scale;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlockFft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockFft")
    }
}

/// Spectrum bins for a real segment of `size` samples
fn spectrum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Copy `src` into the front of `dst`, zeroing the rest
fn load_padded(dst: &mut [f32], src: &[f32]) {
    dst[..src.len()].copy_from_slice(src);
    dst[src.len()..].fill(0.0);
}

fn multiply_accumulate(acc: &mut [Complex<f32>], x: &[Complex<f32>], h: &[Complex<f32>]) {
    debug_assert_eq!(acc.len(), x.len());
    debug_assert_eq!(acc.len(), h.len());
    for ((a, xv), hv) in acc.iter_mut().zip(x).zip(h) {
        *a += *xv * *hv;
    }
}

/// Single-tap uniform partitioned FIR
#[derive(Debug)]
struct PartitionedFir {
    partition_size: usize,
    partition_count: usize,
    active_partitions: usize,
    /// Frequency-domain history of recent input blocks, ring-ordered
    input_spectra: Vec<Vec<Complex<f32>>>,
    /// Frequency-domain impulse partitions
    ir_spectra: Vec<Vec<Complex<f32>>>,
    fft: BlockFft,
    scratch_time: Vec<f32>,
    /// Accumulated products of older partitions, reused while the input
    /// buffer fills
    tail_product: Vec<Complex<f32>>,
    head_product: Vec<Complex<f32>>,
    overlap: Vec<f32>,
    cursor: usize,
    pending_input: Vec<f32>,
    pending_fill: usize,
}

impl PartitionedFir {
    fn new(partition_size: usize, max_ir_len: usize) -> Self {
        let segment_size = 2 * partition_size;
        let partition_count = max_ir_len.div_ceil(partition_size).max(1);
        let bins = spectrum_size(segment_size);

        Self {
            partition_size,
            partition_count,
            active_partitions: 0,
            input_spectra: vec![vec![Complex::default(); bins]; partition_count],
            ir_spectra: vec![vec![Complex::default(); bins]; partition_count],
            fft: BlockFft::new(segment_size),
            scratch_time: vec![0.0; segment_size],
            tail_product: vec![Complex::default(); bins],
            head_product: vec![Complex::default(); bins],
            overlap: vec![0.0; partition_size],
            cursor: 0,
            pending_input: vec![0.0; partition_size],
            pending_fill: 0,
        }
    }

    /// Transform an impulse response into the partition spectra.
    ///
    /// Responses longer than the configured maximum are rejected; shorter
    /// ones leave the remaining partitions zeroed.
    fn set_impulse(&mut self, impulse: &[f32]) -> Result<()> {
        let needed = impulse.len().div_ceil(self.partition_size).max(1);
        if needed > self.partition_count {
            return Err(ConvolverError::BackendConfiguration {
                stage: "impulse upload",
                reason: format!(
                    "impulse needs {} partitions, backend sized for {}",
                    needed, self.partition_count
                ),
            });
        }

        for (n, spectrum) in self.ir_spectra.iter_mut().take(needed).enumerate() {
            let start = n * self.partition_size;
            let end = (start + self.partition_size).min(impulse.len());
            load_padded(&mut self.scratch_time, &impulse[start..end]);
            self.fft.forward(&mut self.scratch_time, spectrum)?;
        }
        for spectrum in self.ir_spectra.iter_mut().skip(needed) {
            spectrum.fill(Complex::default());
        }

        self.active_partitions = if impulse.is_empty() { 0 } else { needed };
        self.reset_stream();
        Ok(())
    }

    /// Drop all buffered signal history, keeping the impulse spectra
    fn reset_stream(&mut self) {
        for spectrum in self.input_spectra.iter_mut() {
            spectrum.fill(Complex::default());
        }
        self.tail_product.fill(Complex::default());
        self.head_product.fill(Complex::default());
        self.overlap.fill(0.0);
        self.pending_input.fill(0.0);
        self.pending_fill = 0;
        self.cursor = 0;
    }

    /// Convolve one buffer of arbitrary length
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        if self.active_partitions == 0 {
            output.fill(0.0);
            return Ok(());
        }

        let mut done = 0;
        while done < output.len() {
            let fresh_block = self.pending_fill == 0;
            let take = (output.len() - done).min(self.partition_size - self.pending_fill);
            let offset = self.pending_fill;

            self.pending_input[offset..offset + take]
                .copy_from_slice(&input[done..done + take]);

            load_padded(&mut self.scratch_time, &self.pending_input);
            self.fft
                .forward(&mut self.scratch_time, &mut self.input_spectra[self.cursor])?;

            // Products against partitions 1..N only change once per full
            // block, so they are computed when the block starts filling
            // and reused for the remainder.
            if fresh_block {
                self.tail_product.fill(Complex::default());
                for n in 1..self.active_partitions {
                    let slot = (self.cursor + n) % self.active_partitions;
                    multiply_accumulate(
                        &mut self.tail_product,
                        &self.input_spectra[slot],
                        &self.ir_spectra[n],
                    );
                }
            }
            self.head_product.copy_from_slice(&self.tail_product);
            multiply_accumulate(
                &mut self.head_product,
                &self.input_spectra[self.cursor],
                &self.ir_spectra[0],
            );

            self.fft.inverse(&mut self.head_product, &mut self.scratch_time)?;

            for n in 0..take {
                output[done + n] = self.scratch_time[offset + n] + self.overlap[offset + n];
            }

            self.pending_fill += take;
            if self.pending_fill == self.partition_size {
                self.overlap
                    .copy_from_slice(&self.scratch_time[self.partition_size..]);
                self.pending_input.fill(0.0);
                self.pending_fill = 0;
                self.cursor = if self.cursor == 0 {
                    self.active_partitions - 1
                } else {
                    self.cursor - 1
                };
            }
            done += take;
        }
        Ok(())
    }
}

/// The live convolution backend: a matrix of partitioned FIRs plus the
/// start/stop lifecycle
#[derive(Debug)]
pub struct PartitionedConvolver {
    layout: KernelLayout,
    partition_size: usize,
    max_ir_len: usize,
    left_direct: PartitionedFir,
    right_direct: PartitionedFir,
    left_cross: Option<PartitionedFir>,
    right_cross: Option<PartitionedFir>,
    uploaded: [bool; 4],
    gate: Arc<LifecycleGate>,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
}

/// Cheap clonable handle for requesting and awaiting a stop from another
/// thread
#[derive(Debug, Clone)]
pub struct StopHandle {
    gate: Arc<LifecycleGate>,
}

impl StopHandle {
    /// Request the backend to stop.
    ///
    /// With no block in flight the stop is acknowledged on the spot;
    /// otherwise the audio thread acknowledges when the current block
    /// finishes.
    pub fn request_stop(&self) {
        let mut state = self.gate.state.lock();
        match state.phase {
            Lifecycle::Processing | Lifecycle::StopRequested => {
                state.phase = if state.block_in_flight {
                    Lifecycle::StopRequested
                } else {
                    Lifecycle::Stopped
                };
            }
            Lifecycle::Configured => state.phase = Lifecycle::Stopped,
            Lifecycle::Stopped => {}
        }
        self.gate.drained.notify_all();
    }

    /// Block until the backend acknowledges the stop
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut state = self.gate.state.lock();
        if state.phase == Lifecycle::Stopped {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        while state.phase != Lifecycle::Stopped {
            if self.gate.drained.wait_until(&mut state, deadline).timed_out() {
                return state.phase == Lifecycle::Stopped;
            }
        }
        true
    }
}

impl PartitionedConvolver {
    /// Allocate a backend for the given topology.
    ///
    /// `quantum` is the host block size; the partition size is the next
    /// power of two so FFT lengths stay friendly. `max_ir_len` bounds the
    /// impulse responses that may later be uploaded.
    pub fn configure(layout: KernelLayout, quantum: usize, max_ir_len: usize) -> Result<Self> {
        if quantum == 0 {
            return Err(ConvolverError::BackendConfiguration {
                stage: "configure",
                reason: "quantum is zero".to_string(),
            });
        }
        if max_ir_len == 0 {
            return Err(ConvolverError::BackendConfiguration {
                stage: "configure",
                reason: "maximum impulse length is zero".to_string(),
            });
        }

        let partition_size = quantum.next_power_of_two();
        let cross = layout == KernelLayout::TrueStereo;

        debug!(
            "configuring backend: {:?}, quantum {}, partition {}, max ir {}",
            layout, quantum, partition_size, max_ir_len
        );

        Ok(Self {
            layout,
            partition_size,
            max_ir_len,
            left_direct: PartitionedFir::new(partition_size, max_ir_len),
            right_direct: PartitionedFir::new(partition_size, max_ir_len),
            left_cross: cross.then(|| PartitionedFir::new(partition_size, max_ir_len)),
            right_cross: cross.then(|| PartitionedFir::new(partition_size, max_ir_len)),
            uploaded: [false; 4],
            gate: Arc::new(LifecycleGate {
                state: Mutex::new(GateState {
                    phase: Lifecycle::Configured,
                    block_in_flight: false,
                }),
                drained: Condvar::new(),
            }),
            scratch_l: vec![0.0; quantum],
            scratch_r: vec![0.0; quantum],
        })
    }

    pub fn layout(&self) -> KernelLayout {
        self.layout
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    /// Handle for stopping this backend from a control thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            gate: Arc::clone(&self.gate),
        }
    }

    fn fir_for(&mut self, tap: ConvolverTap) -> Result<&mut PartitionedFir> {
        match tap {
            ConvolverTap::LeftDirect => Ok(&mut self.left_direct),
            ConvolverTap::RightDirect => Ok(&mut self.right_direct),
            ConvolverTap::LeftCross => {
                self.left_cross
                    .as_mut()
                    .ok_or(ConvolverError::BackendConfiguration {
                        stage: "impulse upload",
                        reason: "cross tap on a stereo backend".to_string(),
                    })
            }
            ConvolverTap::RightCross => {
                self.right_cross
                    .as_mut()
                    .ok_or(ConvolverError::BackendConfiguration {
                        stage: "impulse upload",
                        reason: "cross tap on a stereo backend".to_string(),
                    })
            }
        }
    }

    fn tap_index(tap: ConvolverTap) -> usize {
        match tap {
            ConvolverTap::LeftDirect => 0,
            ConvolverTap::RightDirect => 1,
            ConvolverTap::LeftCross => 2,
            ConvolverTap::RightCross => 3,
        }
    }

    /// Upload an impulse response for one tap. Only legal before
    /// `start_process`.
    pub fn upload_impulse(&mut self, tap: ConvolverTap, impulse: &[f32]) -> Result<()> {
        {
            let state = self.gate.state.lock();
            if state.phase != Lifecycle::Configured {
                return Err(ConvolverError::BackendConfiguration {
                    stage: "impulse upload",
                    reason: format!("backend is {:?}, expected Configured", state.phase),
                });
            }
        }
        if impulse.len() > self.max_ir_len {
            return Err(ConvolverError::BackendConfiguration {
                stage: "impulse upload",
                reason: format!(
                    "impulse of {} samples exceeds configured maximum {}",
                    impulse.len(),
                    self.max_ir_len
                ),
            });
        }
        self.fir_for(tap)?.set_impulse(impulse)?;
        self.uploaded[Self::tap_index(tap)] = true;
        Ok(())
    }

    /// Swap an impulse response while processing.
    ///
    /// The replacement must fit the configured maximum. Stream history of
    /// that tap is reset, so a short fade at the swap point is expected.
    pub fn update_impulse(&mut self, tap: ConvolverTap, impulse: &[f32]) -> Result<()> {
        if impulse.len() > self.max_ir_len {
            return Err(ConvolverError::BackendConfiguration {
                stage: "impulse update",
                reason: format!(
                    "impulse of {} samples exceeds configured maximum {}",
                    impulse.len(),
                    self.max_ir_len
                ),
            });
        }
        self.fir_for(tap)?.set_impulse(impulse)
    }

    /// Move to the processing state.
    ///
    /// `priority` is the real-time scheduling priority the audio thread
    /// runs at; it is recorded for diagnostics since the host owns thread
    /// scheduling here.
    pub fn start_process(&mut self, priority: i32) -> Result<()> {
        let required = match self.layout {
            KernelLayout::Stereo => 2,
            KernelLayout::TrueStereo => 4,
        };
        if self.uploaded.iter().filter(|u| **u).count() < required {
            return Err(ConvolverError::BackendConfiguration {
                stage: "start",
                reason: format!(
                    "{:?} backend needs {} impulses uploaded",
                    self.layout, required
                ),
            });
        }

        let mut state = self.gate.state.lock();
        if state.phase != Lifecycle::Configured {
            return Err(ConvolverError::BackendConfiguration {
                stage: "start",
                reason: format!("backend is {:?}, expected Configured", state.phase),
            });
        }
        state.phase = Lifecycle::Processing;
        debug!("backend started at priority {}", priority);
        Ok(())
    }

    /// True while `process_block` will convolve rather than refuse
    pub fn is_processing(&self) -> bool {
        self.gate.state.lock().phase == Lifecycle::Processing
    }

    /// True once a requested stop has been acknowledged
    pub fn is_stopped(&self) -> bool {
        self.gate.state.lock().phase == Lifecycle::Stopped
    }

    /// Request a stop; acknowledged at the next block boundary. See
    /// [`StopHandle`] for the cross-thread variant.
    pub fn stop_process(&self) {
        self.stop_handle().request_stop();
    }

    /// Convolve one stereo block in place of the outputs.
    ///
    /// All four slices must share one length. Returns an error when the
    /// backend is not in the processing state.
    pub fn process_block(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
    ) -> Result<()> {
        let len = input_l.len();
        if input_r.len() != len || output_l.len() != len || output_r.len() != len {
            return Err(ConvolverError::BlockSizeMismatch {
                expected: len,
                actual: input_r.len().min(output_l.len()).min(output_r.len()),
            });
        }

        {
            let mut state = self.gate.state.lock();
            match state.phase {
                Lifecycle::Processing => state.block_in_flight = true,
                other => {
                    return Err(ConvolverError::BackendConfiguration {
                        stage: "process",
                        reason: format!("backend is {:?}", other),
                    });
                }
            }
        }

        let result = self.convolve(input_l, input_r, output_l, output_r);

        // Acknowledge a stop that arrived mid-block
        let mut state = self.gate.state.lock();
        state.block_in_flight = false;
        if state.phase == Lifecycle::StopRequested {
            state.phase = Lifecycle::Stopped;
            self.gate.drained.notify_all();
        }
        result
    }

    fn convolve(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
    ) -> Result<()> {
        let len = input_l.len();
        self.left_direct.process(input_l, output_l)?;
        self.right_direct.process(input_r, output_r)?;

        if let (Some(lc), Some(rc)) = (self.left_cross.as_mut(), self.right_cross.as_mut()) {
            if self.scratch_l.len() < len {
                // Host grew the quantum without reconfiguring; resize off
                // the happy path and log it.
                warn!("process block of {} exceeds scratch, resizing", len);
                self.scratch_l.resize(len, 0.0);
                self.scratch_r.resize(len, 0.0);
            }
            lc.process(input_l, &mut self.scratch_r[..len])?;
            rc.process(input_r, &mut self.scratch_l[..len])?;
            for n in 0..len {
                output_l[n] += self.scratch_l[n];
                output_r[n] += self.scratch_r[n];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::repository::direct_convolution;
    use approx::assert_relative_eq;

    fn dirac(len: usize) -> Vec<f32> {
        let mut v = vec![0.0; len];
        v[0] = 1.0;
        v
    }

    fn stereo_backend(impulse: &[f32], quantum: usize) -> PartitionedConvolver {
        let mut backend =
            PartitionedConvolver::configure(KernelLayout::Stereo, quantum, impulse.len().max(1))
                .unwrap();
        backend
            .upload_impulse(ConvolverTap::LeftDirect, impulse)
            .unwrap();
        backend
            .upload_impulse(ConvolverTap::RightDirect, impulse)
            .unwrap();
        backend.start_process(0).unwrap();
        backend
    }

    #[test]
    fn test_identity_impulse_passes_signal() {
        let mut backend = stereo_backend(&dirac(1), 64);
        let input: Vec<f32> = (0..64).map(|n| (n as f32 * 0.1).sin()).collect();
        let mut out_l = vec![0.0; 64];
        let mut out_r = vec![0.0; 64];

        backend
            .process_block(&input, &input, &mut out_l, &mut out_r)
            .unwrap();

        for (a, b) in input.iter().zip(&out_l) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
        assert_eq!(out_l, out_r);
    }

    #[test]
    fn test_matches_direct_convolution_across_blocks() {
        let impulse: Vec<f32> = (0..200).map(|n| (n as f32 * 0.07).cos() * 0.3).collect();
        let signal: Vec<f32> = (0..512).map(|n| (n as f32 * 0.013).sin()).collect();
        let expected = direct_convolution(&signal, &impulse);

        let mut backend = stereo_backend(&impulse, 128);
        let mut produced = Vec::new();
        for chunk in signal.chunks(128) {
            let mut out_l = vec![0.0; chunk.len()];
            let mut out_r = vec![0.0; chunk.len()];
            backend
                .process_block(chunk, chunk, &mut out_l, &mut out_r)
                .unwrap();
            produced.extend_from_slice(&out_l);
        }

        for (n, (a, b)) in produced.iter().zip(&expected).enumerate() {
            assert_relative_eq!(a, b, epsilon = 1e-3, max_relative = 1e-3);
            if n > 400 {
                break;
            }
        }
    }

    #[test]
    fn test_non_power_of_two_quantum() {
        let impulse = vec![0.5, 0.25];
        let mut backend = stereo_backend(&impulse, 48);
        assert_eq!(backend.partition_size(), 64);

        let signal = vec![1.0; 48];
        let mut out_l = vec![0.0; 48];
        let mut out_r = vec![0.0; 48];
        backend
            .process_block(&signal, &signal, &mut out_l, &mut out_r)
            .unwrap();
        assert_relative_eq!(out_l[0], 0.5, epsilon = 1e-5);
        assert_relative_eq!(out_l[1], 0.75, epsilon = 1e-5);
    }

    #[test]
    fn test_true_stereo_cross_feed() {
        let mut backend =
            PartitionedConvolver::configure(KernelLayout::TrueStereo, 32, 4).unwrap();
        backend
            .upload_impulse(ConvolverTap::LeftDirect, &[0.0; 4])
            .unwrap();
        backend
            .upload_impulse(ConvolverTap::RightDirect, &[0.0; 4])
            .unwrap();
        backend
            .upload_impulse(ConvolverTap::LeftCross, &dirac(4))
            .unwrap();
        backend
            .upload_impulse(ConvolverTap::RightCross, &[0.0; 4])
            .unwrap();
        backend.start_process(0).unwrap();

        let left = vec![1.0; 32];
        let right = vec![0.0; 32];
        let mut out_l = vec![0.0; 32];
        let mut out_r = vec![0.0; 32];
        backend
            .process_block(&left, &right, &mut out_l, &mut out_r)
            .unwrap();

        // Only the L->R cross tap carries signal
        assert_relative_eq!(out_r[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(out_l[0], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_cross_tap_rejected_on_stereo() {
        let mut backend = PartitionedConvolver::configure(KernelLayout::Stereo, 32, 8).unwrap();
        assert!(backend
            .upload_impulse(ConvolverTap::LeftCross, &dirac(4))
            .is_err());
    }

    #[test]
    fn test_start_requires_all_impulses() {
        let mut backend = PartitionedConvolver::configure(KernelLayout::Stereo, 32, 8).unwrap();
        backend
            .upload_impulse(ConvolverTap::LeftDirect, &dirac(4))
            .unwrap();
        assert!(backend.start_process(0).is_err());
    }

    #[test]
    fn test_oversized_impulse_rejected() {
        let mut backend = PartitionedConvolver::configure(KernelLayout::Stereo, 32, 8).unwrap();
        assert!(backend
            .upload_impulse(ConvolverTap::LeftDirect, &[0.1; 9])
            .is_err());
    }

    #[test]
    fn test_idle_stop_acknowledged_immediately() {
        let mut backend = stereo_backend(&dirac(2), 32);
        assert!(backend.is_processing());

        // No block is in flight, so the stop must not wait for one
        let handle = backend.stop_handle();
        let begun = std::time::Instant::now();
        handle.request_stop();
        assert!(backend.is_stopped());
        assert!(handle.wait_stopped(Duration::from_millis(500)));
        assert!(
            begun.elapsed() < Duration::from_millis(100),
            "idle stop took {:?}",
            begun.elapsed()
        );

        // Further blocks are refused after the acknowledgement
        let signal = vec![0.0; 32];
        let mut out_l = vec![0.0; 32];
        let mut out_r = vec![0.0; 32];
        let result = backend.process_block(&signal, &signal, &mut out_l, &mut out_r);
        assert!(result.is_err());
    }

    #[test]
    fn test_stop_during_block_waits_for_the_block() {
        use std::sync::mpsc;

        let mut backend = stereo_backend(&dirac(2), 4096);
        let handle = backend.stop_handle();
        let (started_tx, started_rx) = mpsc::channel();

        let stopper = std::thread::spawn(move || {
            started_rx.recv().unwrap();
            handle.request_stop();
            handle.wait_stopped(Duration::from_secs(2))
        });

        // Convolve a few blocks while the stop request lands; whenever it
        // arrives, the acknowledgement must come from a block boundary.
        started_tx.send(()).unwrap();
        let signal = vec![0.5; 4096];
        let mut out_l = vec![0.0; 4096];
        let mut out_r = vec![0.0; 4096];
        for _ in 0..50 {
            if backend
                .process_block(&signal, &signal, &mut out_l, &mut out_r)
                .is_err()
            {
                break;
            }
        }

        assert!(stopper.join().unwrap());
        assert!(backend.is_stopped());
    }

    #[test]
    fn test_stop_idempotent() {
        let backend = stereo_backend(&dirac(2), 32);
        let handle = backend.stop_handle();
        handle.request_stop();
        handle.request_stop();
        assert!(!backend.is_processing());
    }

    #[test]
    fn test_stop_before_start_is_immediate() {
        let backend = PartitionedConvolver::configure(KernelLayout::Stereo, 32, 8).unwrap();
        backend.stop_process();
        assert!(backend.is_stopped());
        assert!(backend.stop_handle().wait_stopped(Duration::from_millis(1)));
    }

    #[test]
    fn test_update_impulse_while_processing() {
        let mut backend = stereo_backend(&dirac(4), 32);
        backend
            .update_impulse(ConvolverTap::LeftDirect, &[0.0, 1.0])
            .unwrap();

        let signal = vec![1.0; 32];
        let mut out_l = vec![0.0; 32];
        let mut out_r = vec![0.0; 32];
        backend
            .process_block(&signal, &signal, &mut out_l, &mut out_r)
            .unwrap();
        // New impulse delays by one sample
        assert_relative_eq!(out_l[0], 0.0, epsilon = 1e-5);
        assert_relative_eq!(out_l[1], 1.0, epsilon = 1e-5);
    }
}
