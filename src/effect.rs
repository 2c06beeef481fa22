//! Host-facing convolver effect
//!
//! Ties the repository, the spectrum analyzer and the engine together and
//! enforces the three-context split: the real-time `process` call never
//! does I/O or reconfiguration, a single background worker handles kernel
//! loading and engine (re)initialization, and UI-invoked operations
//! return immediately and notify completion over a channel.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dsp::engine::ConvolutionEngine;
use crate::dsp::spectrum::{compute_spectrum, SpectrumData};
use crate::error::{ConvolverError, Result};
use crate::kernel::repository::SOFA_EXT;
use crate::kernel::sofa::SpatialContainer;
use crate::kernel::{ImpulseResponseKernel, KernelRepository};

/// The slice of the host plugin contract this effect implements.
///
/// `process` runs on the real-time thread; everything else is control
/// context.
pub trait AudioEffect {
    /// Invoked when the host's sample rate or quantum changes
    fn setup(&mut self, rate: u32, quantum: usize);

    /// Convolve one block; inputs and outputs share one length
    fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
    );

    /// Variant with a probe/sidechain pair; the convolver has no
    /// sidechain so the probe is ignored
    fn process_with_probe(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
        _probe_l: &[f32],
        _probe_r: &[f32],
    ) {
        self.process(input_l, input_r, output_l, output_r);
    }

    /// Drop transient state and rebuild from current settings
    fn reset(&mut self);

    /// Reported scheduling latency. Convolution adds processing delay of
    /// up to one quantum but no reported latency.
    fn latency_seconds(&self) -> f32 {
        0.0
    }
}

/// Settings snapshot the host's key-value store pushes at the effect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolverSettings {
    /// Name of the kernel to load, resolved by the repository
    pub kernel_name: String,
    /// Stereo width in percent; 100 leaves the kernel untouched
    pub ir_width: f64,
    /// Attenuate hot kernels to at most unit energy
    pub autogain: bool,
    /// Linear gain applied to the unprocessed signal
    pub dry: f32,
    /// Linear gain applied to the convolved signal
    pub wet: f32,
    /// Display points per spectrum curve
    pub spectrum_points: usize,
    /// Requested orientation for spatial kernels
    pub azimuth: f64,
    pub elevation: f64,
    pub radius: f64,
}

impl Default for ConvolverSettings {
    fn default() -> Self {
        Self {
            kernel_name: String::new(),
            ir_width: 100.0,
            autogain: false,
            dry: 0.0,
            wet: 1.0,
            spectrum_points: 1000,
            azimuth: 0.0,
            elevation: 0.0,
            radius: 1.0,
        }
    }
}

/// Completion events for asynchronous operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectNotification {
    KernelLoaded { name: String },
    KernelLoadFailed { name: String, code: &'static str },
    CombineFinished { output_name: String },
    CombineFailed { reason: String },
}

/// Work items for the background worker
enum Task {
    SessionSetup { rate: u32, quantum: usize },
    Reinit,
    UpdateShaping,
    Shutdown,
}

struct SharedState {
    engine: Mutex<ConvolutionEngine>,
    settings: Mutex<ConvolverSettings>,
    /// Guards against flooding the worker with one re-init per block
    /// after a mid-session failure
    reinit_pending: AtomicBool,
    /// Dry/wet gains mirrored as bit-cast floats so the audio thread
    /// reads them without touching the settings mutex
    dry_bits: AtomicU32,
    wet_bits: AtomicU32,
}

/// Orchestrator for the convolution subsystem
pub struct ConvolverEffect {
    shared: Arc<SharedState>,
    repository: KernelRepository,
    tasks: Sender<Task>,
    worker: Option<thread::JoinHandle<()>>,
    combine_threads: Vec<thread::JoinHandle<()>>,
    notify_tx: Sender<EffectNotification>,
    notify_rx: Receiver<EffectNotification>,
    bypass: Arc<AtomicBool>,
    rate: u32,
    quantum: usize,
    conv_l: Vec<f32>,
    conv_r: Vec<f32>,
}

impl ConvolverEffect {
    pub fn new(repository: KernelRepository, settings: ConvolverSettings) -> Self {
        let shared = Arc::new(SharedState {
            engine: Mutex::new(ConvolutionEngine::new()),
            reinit_pending: AtomicBool::new(false),
            dry_bits: AtomicU32::new(settings.dry.to_bits()),
            wet_bits: AtomicU32::new(settings.wet.to_bits()),
            settings: Mutex::new(settings),
        });
        let (task_tx, task_rx) = unbounded();
        let (notify_tx, notify_rx) = unbounded();

        let worker = thread::Builder::new()
            .name("convolver-worker".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                let repository = repository.clone();
                let notify = notify_tx.clone();
                move || worker_loop(task_rx, shared, repository, notify)
            })
            .ok();
        if worker.is_none() {
            warn!("could not spawn convolver worker, effect stays pass-through");
        }

        Self {
            shared,
            repository,
            tasks: task_tx,
            worker,
            combine_threads: Vec::new(),
            notify_tx,
            notify_rx,
            bypass: Arc::new(AtomicBool::new(false)),
            rate: 0,
            quantum: 0,
            conv_l: Vec::new(),
            conv_r: Vec::new(),
        }
    }

    /// Receiver for completion notifications; clonable, UI context
    pub fn notifications(&self) -> Receiver<EffectNotification> {
        self.notify_rx.clone()
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Relaxed);
    }

    pub fn bypass(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    /// True when the engine will convolve the next block
    pub fn ready(&self) -> bool {
        self.shared
            .engine
            .try_lock()
            .map(|engine| engine.is_ready())
            .unwrap_or(false)
    }

    pub fn settings(&self) -> ConvolverSettings {
        self.shared.settings.lock().clone()
    }

    /// Select a different kernel and rebuild the engine in the background
    pub fn set_kernel(&self, name: &str) {
        self.shared.settings.lock().kernel_name = name.to_string();
        self.submit(Task::Reinit);
    }

    /// Change stereo width / autogain; applied as a hot swap when the
    /// engine is running
    pub fn set_shaping(&self, ir_width: f64, autogain: bool) {
        {
            let mut settings = self.shared.settings.lock();
            settings.ir_width = ir_width;
            settings.autogain = autogain;
        }
        self.submit(Task::UpdateShaping);
    }

    pub fn set_dry_wet(&self, dry: f32, wet: f32) {
        {
            let mut settings = self.shared.settings.lock();
            settings.dry = dry;
            settings.wet = wet;
        }
        self.shared.dry_bits.store(dry.to_bits(), Ordering::Relaxed);
        self.shared.wet_bits.store(wet.to_bits(), Ordering::Relaxed);
    }

    /// Re-select the nearest spatial measurement and re-init, off the
    /// caller's thread
    pub fn apply_sofa_orientation(&self, azimuth: f64, elevation: f64, radius: f64) {
        {
            let mut settings = self.shared.settings.lock();
            settings.azimuth = azimuth;
            settings.elevation = elevation;
            settings.radius = radius;
        }
        self.submit(Task::Reinit);
    }

    /// Combine two kernels on a dedicated thread and persist the result.
    ///
    /// Never blocks the caller; completion arrives on the notification
    /// channel. Threads are tracked and joined at teardown, a started
    /// combination always runs to completion.
    pub fn combine_kernels(&mut self, name1: &str, name2: &str, output_name: &str) {
        let repository = self.repository.clone();
        let notify = self.notify_tx.clone();
        let (name1, name2, output_name) = (
            name1.to_string(),
            name2.to_string(),
            output_name.to_string(),
        );

        let handle = thread::Builder::new()
            .name("convolver-combine".to_string())
            .spawn(move || {
                let outcome = repository
                    .load_kernel(&name1)
                    .and_then(|a| repository.load_kernel(&name2).map(|b| (a, b)))
                    .and_then(|(a, b)| repository.combine_kernels(&a, &b, &output_name));
                let event = match outcome {
                    Ok(_) => EffectNotification::CombineFinished { output_name },
                    Err(e) => {
                        warn!("kernel combination failed: {}", e);
                        EffectNotification::CombineFailed {
                            reason: e.to_string(),
                        }
                    }
                };
                let _ = notify.send(event);
            });

        match handle {
            Ok(handle) => self.combine_threads.push(handle),
            Err(e) => {
                warn!("could not spawn combine thread: {}", e);
                let _ = self.notify_tx.send(EffectNotification::CombineFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Frequency-response curves for the currently selected kernel.
    ///
    /// Offline operation for the UI; loads from disk and never touches
    /// the live engine.
    pub fn kernel_spectrum(&self) -> Result<SpectrumData> {
        let (name, points) = {
            let settings = self.shared.settings.lock();
            (settings.kernel_name.clone(), settings.spectrum_points)
        };
        let kernel = self.repository.load_kernel(&name)?;
        compute_spectrum(&kernel.channel_l, &kernel.channel_r, kernel.rate, points)
    }

    /// Stop the worker, join combine threads and drain the engine.
    ///
    /// Invoked from `Drop`; calling it earlier makes shutdown explicit.
    pub fn teardown(&mut self) {
        let _ = self.tasks.send(Task::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("convolver worker panicked during shutdown");
            }
        }
        for handle in self.combine_threads.drain(..) {
            if handle.join().is_err() {
                warn!("combine thread panicked during shutdown");
            }
        }
        self.shared.engine.lock().stop();
        debug!("convolver effect torn down");
    }

    fn submit(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            warn!("convolver worker is gone, request dropped");
        }
    }

    fn pass_through(
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
    ) {
        output_l.copy_from_slice(input_l);
        output_r.copy_from_slice(input_r);
    }
}

impl AudioEffect for ConvolverEffect {
    fn setup(&mut self, rate: u32, quantum: usize) {
        self.rate = rate;
        self.quantum = quantum;
        self.conv_l.resize(quantum, 0.0);
        self.conv_r.resize(quantum, 0.0);
        self.submit(Task::SessionSetup { rate, quantum });
    }

    fn process(
        &mut self,
        input_l: &[f32],
        input_r: &[f32],
        output_l: &mut [f32],
        output_r: &mut [f32],
    ) {
        if self.bypass.load(Ordering::Relaxed) || input_l.len() > self.conv_l.len() {
            Self::pass_through(input_l, input_r, output_l, output_r);
            return;
        }

        // The lock is only contended while the worker swaps the engine;
        // during that window the effect degrades to pass-through instead
        // of blocking the audio thread.
        let mut engine = match self.shared.engine.try_lock() {
            Some(engine) => engine,
            None => {
                Self::pass_through(input_l, input_r, output_l, output_r);
                return;
            }
        };
        if !engine.is_ready() {
            Self::pass_through(input_l, input_r, output_l, output_r);
            return;
        }

        let len = input_l.len();
        let convolved = engine.process(
            input_l,
            input_r,
            &mut self.conv_l[..len],
            &mut self.conv_r[..len],
        );
        drop(engine);

        if !convolved {
            Self::pass_through(input_l, input_r, output_l, output_r);
            if !self.shared.reinit_pending.swap(true, Ordering::AcqRel) {
                debug!("engine refused block, scheduling deferred re-init");
                self.submit(Task::Reinit);
            }
            return;
        }

        let dry = f32::from_bits(self.shared.dry_bits.load(Ordering::Relaxed));
        let wet = f32::from_bits(self.shared.wet_bits.load(Ordering::Relaxed));
        for n in 0..len {
            output_l[n] = dry * input_l[n] + wet * self.conv_l[n];
            output_r[n] = dry * input_r[n] + wet * self.conv_r[n];
        }
    }

    fn reset(&mut self) {
        let (rate, quantum) = (self.rate, self.quantum);
        if rate > 0 && quantum > 0 {
            self.submit(Task::SessionSetup { rate, quantum });
        }
    }
}

impl Drop for ConvolverEffect {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Background worker: serializes every engine reconfiguration.
///
/// Requests are handled in submission order with no coalescing; when
/// rapid changes overlap, the last one to finish defines the engine
/// state.
fn worker_loop(
    tasks: Receiver<Task>,
    shared: Arc<SharedState>,
    repository: KernelRepository,
    notify: Sender<EffectNotification>,
) {
    let mut session: Option<(u32, usize)> = None;

    while let Ok(task) = tasks.recv() {
        match task {
            Task::Shutdown => break,
            Task::SessionSetup { rate, quantum } => {
                session = Some((rate, quantum));
                run_init(&shared, &repository, &notify, rate, quantum);
            }
            Task::Reinit => {
                if let Some((rate, quantum)) = session {
                    run_init(&shared, &repository, &notify, rate, quantum);
                } else {
                    debug!("re-init requested before any session setup, ignored");
                }
            }
            Task::UpdateShaping => {
                let (width, autogain) = {
                    let settings = shared.settings.lock();
                    (settings.ir_width, settings.autogain)
                };
                let mut engine = shared.engine.lock();
                if let Err(e) = engine.update_shaping(width, autogain, true) {
                    debug!("shaping update skipped: {}", e);
                }
            }
        }
    }
    debug!("convolver worker exiting");
}

/// Load the selected kernel at the session rate and arm the engine
fn run_init(
    shared: &SharedState,
    repository: &KernelRepository,
    notify: &Sender<EffectNotification>,
    rate: u32,
    quantum: usize,
) {
    shared.reinit_pending.store(false, Ordering::Release);

    let settings = shared.settings.lock().clone();
    if settings.kernel_name.is_empty() {
        debug!("no kernel selected, engine stays unarmed");
        return;
    }

    match load_for_session(repository, &settings, rate) {
        Ok(kernel) => {
            let name = kernel.name.clone();
            let result = shared.engine.lock().init(
                kernel,
                rate,
                quantum,
                settings.ir_width,
                settings.autogain,
            );
            let event = match result {
                Ok(()) => {
                    info!("kernel {} armed at {} Hz, quantum {}", name, rate, quantum);
                    EffectNotification::KernelLoaded { name }
                }
                Err(e) => {
                    warn!("engine init failed ({}): {}", e.code(), e);
                    EffectNotification::KernelLoadFailed {
                        name,
                        code: e.code(),
                    }
                }
            };
            let _ = notify.send(event);
        }
        Err(e) => {
            warn!("kernel load failed ({}): {}", e.code(), e);
            let _ = notify.send(EffectNotification::KernelLoadFailed {
                name: settings.kernel_name,
                code: e.code(),
            });
        }
    }
}

/// Resolve, load and rate-adapt the configured kernel. Spatial kernels
/// get the measurement nearest the configured orientation.
fn load_for_session(
    repository: &KernelRepository,
    settings: &ConvolverSettings,
    rate: u32,
) -> Result<ImpulseResponseKernel> {
    let path = repository.search_kernel_path(&settings.kernel_name)?;

    let mut kernel = if path.extension().and_then(|e| e.to_str()) == Some(SOFA_EXT) {
        let container = SpatialContainer::load(&path)?;
        let index = container.nearest_measurement(
            settings.azimuth,
            settings.elevation,
            settings.radius,
        );
        let mut kernel = container.extract(index, &settings.kernel_name)?;
        kernel.name = settings.kernel_name.clone();
        kernel.source_path = path;
        kernel
    } else {
        repository.load_kernel_file(&path)?
    };

    if kernel.rate != rate {
        repository.resample_kernel(&mut kernel, rate)?;
    }
    if !kernel.is_valid() {
        return Err(ConvolverError::EmptyOrMismatchedChannels {
            details: format!("kernel {} invalid after rate adaptation", kernel.name),
        });
    }
    Ok(kernel)
}
