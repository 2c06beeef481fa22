//! Kernel repository: locating, loading and persisting impulse responses
//!
//! Kernels live as `.irs` files (WAV containers, 1/2/4 channels) or
//! `.sofa` spatial measurement sets. The repository resolves names against
//! a user-local directory first and a list of read-only system directories
//! second, and owns every offline transformation: resampling, peak
//! normalization, and combining two kernels into one by direct
//! convolution.

use std::fs;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, info, warn};
use rayon::prelude::*;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use walkdir::WalkDir;

use crate::error::{ConvolverError, Result};
use crate::kernel::sofa::SpatialContainer;
use crate::kernel::ImpulseResponseKernel;

/// Kernel file extension for WAV-based impulse responses
pub const IRS_EXT: &str = "irs";
/// Kernel file extension for spatial measurement sets
pub const SOFA_EXT: &str = "sofa";

/// Recursion limit when scanning system kernel directories
const MAX_SEARCH_DEPTH: usize = 10;

/// Peaks at or below this level leave normalization a no-op
const NORMALIZE_FLOOR: f32 = 1e-6;

/// Longest kernel name the combiner will write
const MAX_COMBINED_NAME: usize = 100;

/// Locates and transforms impulse-response kernels on disk
#[derive(Debug, Clone)]
pub struct KernelRepository {
    /// Writable directory for user kernels; searched first
    local_dir: PathBuf,
    /// Read-only fallback directories, scanned recursively
    system_dirs: Vec<PathBuf>,
}

impl KernelRepository {
    pub fn new(local_dir: PathBuf, system_dirs: Vec<PathBuf>) -> Self {
        Self {
            local_dir,
            system_dirs,
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Resolve a kernel name to a file path.
    ///
    /// The local directory is checked flat first, for both supported
    /// extensions. System directories are then walked recursively, so
    /// vendored kernel collections may be nested.
    pub fn search_kernel_path(&self, name: &str) -> Result<PathBuf> {
        for ext in [IRS_EXT, SOFA_EXT] {
            let candidate = self.local_dir.join(format!("{name}.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        for dir in &self.system_dirs {
            for entry in WalkDir::new(dir)
                .max_depth(MAX_SEARCH_DEPTH)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.file_stem().and_then(|s| s.to_str()) == Some(name)
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == IRS_EXT || e == SOFA_EXT)
                {
                    return Ok(path.to_path_buf());
                }
            }
        }

        Err(ConvolverError::NotFound {
            name: name.to_string(),
        })
    }

    /// Load a kernel by name, dispatching on the resolved extension
    pub fn load_kernel(&self, name: &str) -> Result<ImpulseResponseKernel> {
        let path = self.search_kernel_path(name)?;
        self.load_kernel_file(&path)
    }

    /// Load a kernel from an explicit path
    pub fn load_kernel_file(&self, path: &Path) -> Result<ImpulseResponseKernel> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let mut kernel = match ext {
            SOFA_EXT => {
                let container = SpatialContainer::load(path)?;
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("")
                    .to_string();
                // Default selection is the first measurement; the
                // orchestrator re-extracts when an orientation is chosen.
                container.extract(0, &stem)?
            }
            _ => load_irs(path)?,
        };

        kernel.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        kernel.source_path = path.to_path_buf();

        if !kernel.is_valid() {
            return Err(ConvolverError::EmptyOrMismatchedChannels {
                details: format!("kernel {} failed validation after load", kernel.name),
            });
        }
        if kernel.has_invalid_samples() {
            return Err(ConvolverError::InvalidFormat {
                path: path.display().to_string(),
                reason: "kernel contains NaN or infinite samples".to_string(),
            });
        }

        info!(
            "loaded kernel {} ({} samples, {} Hz, {:?})",
            kernel.name,
            kernel.sample_count(),
            kernel.rate,
            kernel.layout()
        );
        Ok(kernel)
    }

    /// Resample a kernel in place to `target_rate`.
    ///
    /// No-op when already at the target rate. `original_rate` is left
    /// untouched so the UI can report the source rate.
    pub fn resample_kernel(
        &self,
        kernel: &mut ImpulseResponseKernel,
        target_rate: u32,
    ) -> Result<()> {
        if kernel.rate == target_rate {
            return Ok(());
        }
        if target_rate == 0 {
            return Err(ConvolverError::Resample {
                reason: "target rate is zero".to_string(),
            });
        }

        let source_rate = kernel.rate;
        let channels: Vec<Vec<f32>> = kernel.channels().cloned().collect();
        let resampled = resample_channels(&channels, source_rate, target_rate)?;

        for (dst, src) in kernel.channels_mut().zip(resampled) {
            *dst = src;
        }
        kernel.rate = target_rate;

        debug!(
            "resampled kernel {} from {} Hz to {} Hz ({} samples)",
            kernel.name,
            source_rate,
            target_rate,
            kernel.sample_count()
        );
        Ok(())
    }

    /// Scale all channels so the global peak magnitude is 1.0.
    ///
    /// Silent kernels (peak at or below the floor) are left alone rather
    /// than blown up.
    pub fn normalize_kernel(&self, kernel: &mut ImpulseResponseKernel) {
        let peak = kernel
            .channels()
            .flat_map(|c| c.iter())
            .fold(0.0f32, |acc, v| acc.max(v.abs()));

        if peak <= NORMALIZE_FLOOR {
            debug!("kernel {} peak {} below floor, not normalized", kernel.name, peak);
            return;
        }

        for channel in kernel.channels_mut() {
            for v in channel.iter_mut() {
                *v /= peak;
            }
        }
    }

    /// Convolve two kernels together and persist the result under
    /// `output_name` in the local directory.
    ///
    /// The lower-rate kernel is resampled up to the higher rate first, so
    /// no information is thrown away. Only the L and R arrays take part;
    /// the result is always a plain stereo kernel of length
    /// `len(a) + len(b) - 1`.
    pub fn combine_kernels(
        &self,
        first: &ImpulseResponseKernel,
        second: &ImpulseResponseKernel,
        output_name: &str,
    ) -> Result<PathBuf> {
        if !first.is_valid() || !second.is_valid() {
            return Err(ConvolverError::EmptyOrMismatchedChannels {
                details: "combine requires two valid kernels".to_string(),
            });
        }

        let target_rate = first.rate.max(second.rate);
        let mut a = first.clone();
        let mut b = second.clone();
        self.resample_kernel(&mut a, target_rate)?;
        self.resample_kernel(&mut b, target_rate)?;

        let mut combined = ImpulseResponseKernel::stereo(
            target_rate,
            direct_convolution(&a.channel_l, &b.channel_l),
            direct_convolution(&a.channel_r, &b.channel_r),
        );
        self.normalize_kernel(&mut combined);
        combined.name = sanitize_kernel_name(output_name);

        if combined.name.is_empty() {
            return Err(ConvolverError::InvalidFormat {
                path: output_name.to_string(),
                reason: "combined kernel name is empty after sanitizing".to_string(),
            });
        }

        let name = combined.name.clone();
        let path = self.save_kernel(&combined, &name)?;
        info!(
            "combined kernels {} + {} into {} ({} samples at {} Hz)",
            first.name,
            second.name,
            name,
            combined.sample_count(),
            target_rate
        );
        Ok(path)
    }

    /// Write a kernel to `<local_dir>/<name>.irs` as 32-bit float WAV
    pub fn save_kernel(&self, kernel: &ImpulseResponseKernel, name: &str) -> Result<PathBuf> {
        if !kernel.is_valid() {
            return Err(ConvolverError::EmptyOrMismatchedChannels {
                details: format!("refusing to save invalid kernel {name}"),
            });
        }

        fs::create_dir_all(&self.local_dir)?;
        let path = self.local_dir.join(format!("{name}.{IRS_EXT}"));

        let channels: Vec<&Vec<f32>> = kernel.channels().collect();
        let spec = WavSpec {
            channels: channels.len() as u16,
            sample_rate: kernel.rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };

        let mut writer = WavWriter::create(&path, spec).map_err(map_wav_error(&path))?;
        for frame in 0..kernel.sample_count() {
            for channel in &channels {
                writer
                    .write_sample(channel[frame])
                    .map_err(map_wav_error(&path))?;
            }
        }
        writer.finalize().map_err(map_wav_error(&path))?;

        debug!("saved kernel {} to {}", name, path.display());
        Ok(path)
    }

    /// Copy a kernel file into the local directory.
    ///
    /// The file is probed before copying so junk never lands in the
    /// directory. Name collisions get a ` (1)`, ` (2)`, ... suffix instead
    /// of overwriting.
    pub fn import_kernel(&self, source: &Path) -> Result<PathBuf> {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != IRS_EXT && ext != SOFA_EXT {
            return Err(ConvolverError::InvalidFormat {
                path: source.display().to_string(),
                reason: format!("unsupported kernel extension .{ext}"),
            });
        }

        // Probe before copying
        self.load_kernel_file(source)?;

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("kernel");
        fs::create_dir_all(&self.local_dir)?;

        let mut destination = self.local_dir.join(format!("{stem}.{ext}"));
        let mut suffix = 0usize;
        while destination.exists() {
            suffix += 1;
            destination = self.local_dir.join(format!("{stem} ({suffix}).{ext}"));
        }

        fs::copy(source, &destination)?;
        info!("imported kernel {} as {}", source.display(), destination.display());
        Ok(destination)
    }

    /// Names of all kernels in the local directory, sorted
    pub fn list_kernels(&self) -> Vec<String> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.local_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot list {}: {}", self.local_dir.display(), e);
                return names;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_kernel = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == IRS_EXT || e == SOFA_EXT);
            if is_kernel {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names
    }

    /// Delete a kernel from the local directory. System kernels cannot be
    /// removed.
    pub fn remove_kernel(&self, name: &str) -> Result<()> {
        for ext in [IRS_EXT, SOFA_EXT] {
            let path = self.local_dir.join(format!("{name}.{ext}"));
            if path.is_file() {
                fs::remove_file(&path)?;
                info!("removed kernel {}", path.display());
                return Ok(());
            }
        }
        Err(ConvolverError::NotFound {
            name: name.to_string(),
        })
    }
}

/// Read an `.irs` WAV file into a kernel.
///
/// 1 channel is duplicated into both ears, 2 maps to stereo, 4 to
/// true-stereo in L, R, L->R, R->L order. Anything else is rejected.
fn load_irs(path: &Path) -> Result<ImpulseResponseKernel> {
    let reader = WavReader::open(path).map_err(map_wav_error(path))?;
    let spec = reader.spec();
    let channel_count = spec.channels as usize;

    if !matches!(channel_count, 1 | 2 | 4) {
        return Err(ConvolverError::EmptyOrMismatchedChannels {
            details: format!(
                "{} has {} channels, expected 1, 2 or 4",
                path.display(),
                channel_count
            ),
        });
    }

    let interleaved = read_samples(reader, spec, path)?;
    if interleaved.is_empty() {
        return Err(ConvolverError::EmptyOrMismatchedChannels {
            details: format!("{} holds no samples", path.display()),
        });
    }

    let frames = interleaved.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (n, sample) in interleaved.into_iter().enumerate() {
        channels[n % channel_count].push(sample);
    }

    let kernel = match channel_count {
        1 => {
            let mono = channels.pop().unwrap_or_default();
            ImpulseResponseKernel::stereo(spec.sample_rate, mono.clone(), mono)
        }
        2 => {
            let r = channels.pop().unwrap_or_default();
            let l = channels.pop().unwrap_or_default();
            ImpulseResponseKernel::stereo(spec.sample_rate, l, r)
        }
        _ => {
            let rl = channels.pop().unwrap_or_default();
            let lr = channels.pop().unwrap_or_default();
            let r = channels.pop().unwrap_or_default();
            let l = channels.pop().unwrap_or_default();
            ImpulseResponseKernel::true_stereo(spec.sample_rate, l, r, lr, rl)
        }
    };
    Ok(kernel)
}

fn read_samples(
    mut reader: WavReader<std::io::BufReader<fs::File>>,
    spec: WavSpec,
    path: &Path,
) -> Result<Vec<f32>> {
    match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_wav_error(path)),
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_wav_error(path))
        }
    }
}

fn map_wav_error(path: &Path) -> impl Fn(hound::Error) -> ConvolverError + '_ {
    move |e| ConvolverError::InvalidFormat {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Sinc resampling over a set of equal-length channels.
///
/// Output length is pinned to `round(len * to / from)`: the resampler's
/// transient delay is skipped and the tail trimmed or zero-padded, so the
/// kernel duration in seconds is preserved.
fn resample_channels(channels: &[Vec<f32>], from: u32, to: u32) -> Result<Vec<Vec<f32>>> {
    let map_err = |e: &dyn std::fmt::Display| ConvolverError::Resample {
        reason: e.to_string(),
    };

    let ratio = to as f64 / from as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    const CHUNK: usize = 1024;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK, channels.len())
        .map_err(|e| map_err(&e))?;
    let delay = resampler.output_delay();

    let input_len = channels[0].len();
    let expected = (input_len as f64 * ratio).round() as usize;
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels.len()];

    let mut pos = 0;
    while pos + CHUNK <= input_len {
        let frame: Vec<&[f32]> = channels.iter().map(|c| &c[pos..pos + CHUNK]).collect();
        let processed = resampler.process(&frame, None).map_err(|e| map_err(&e))?;
        for (out, chunk) in output.iter_mut().zip(&processed) {
            out.extend_from_slice(chunk);
        }
        pos += CHUNK;
    }
    if pos < input_len {
        let frame: Vec<&[f32]> = channels.iter().map(|c| &c[pos..]).collect();
        let processed = resampler
            .process_partial(Some(&frame), None)
            .map_err(|e| map_err(&e))?;
        for (out, chunk) in output.iter_mut().zip(&processed) {
            out.extend_from_slice(chunk);
        }
    }

    // Flush the resampler's internal buffer until the delayed tail is out
    while output[0].len() < expected + delay {
        let processed = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| map_err(&e))?;
        if processed[0].is_empty() {
            break;
        }
        for (out, chunk) in output.iter_mut().zip(&processed) {
            out.extend_from_slice(chunk);
        }
    }

    for out in output.iter_mut() {
        if out.len() > delay {
            out.drain(..delay);
        } else {
            out.clear();
        }
        out.resize(expected, 0.0);
    }
    Ok(output)
}

/// Direct (time-domain) convolution, parallel over output samples.
///
/// The shorter sequence is swept over the longer one, so cost per output
/// sample is bounded by the shorter length regardless of argument order.
pub fn direct_convolution(a: &[f32], b: &[f32]) -> Vec<f32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let (longer, shorter) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let output_len = a.len() + b.len() - 1;

    (0..output_len)
        .into_par_iter()
        .map(|n| {
            let start = n.saturating_sub(longer.len() - 1);
            let end = n.min(shorter.len() - 1);
            let mut acc = 0.0f32;
            for m in start..=end {
                acc += shorter[m] * longer[n - m];
            }
            acc
        })
        .collect()
}

/// Strip path separators and control characters from a user-supplied
/// kernel name and cap its length
fn sanitize_kernel_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .take(MAX_COMBINED_NAME)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelLayout;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn write_irs(dir: &Path, name: &str, rate: u32, channels: &[Vec<f32>]) -> PathBuf {
        let path = dir.join(format!("{name}.{IRS_EXT}"));
        let spec = WavSpec {
            channels: channels.len() as u16,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for frame in 0..channels[0].len() {
            for channel in channels {
                writer.write_sample(channel[frame]).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    fn impulse(len: usize) -> Vec<f32> {
        let mut v = vec![0.0; len];
        v[0] = 1.0;
        v
    }

    #[test]
    fn test_load_stereo_irs() {
        let dir = tempdir().unwrap();
        write_irs(dir.path(), "hall", 48000, &[impulse(64), impulse(64)]);
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);

        let kernel = repo.load_kernel("hall").unwrap();
        assert_eq!(kernel.rate, 48000);
        assert_eq!(kernel.sample_count(), 64);
        assert_eq!(kernel.layout(), KernelLayout::Stereo);
        assert_eq!(kernel.name, "hall");
    }

    #[test]
    fn test_load_mono_duplicates_channels() {
        let dir = tempdir().unwrap();
        write_irs(dir.path(), "mono", 44100, &[vec![0.5, 0.25, 0.125]]);
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);

        let kernel = repo.load_kernel("mono").unwrap();
        assert_eq!(kernel.channel_l, kernel.channel_r);
        assert_eq!(kernel.channel_l, vec![0.5, 0.25, 0.125]);
    }

    #[test]
    fn test_load_true_stereo() {
        let dir = tempdir().unwrap();
        write_irs(
            dir.path(),
            "ts",
            48000,
            &[impulse(16), impulse(16), vec![0.0; 16], vec![0.0; 16]],
        );
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);

        let kernel = repo.load_kernel("ts").unwrap();
        assert_eq!(kernel.layout(), KernelLayout::TrueStereo);
        assert_eq!(kernel.channel_lr.len(), 16);
    }

    #[test]
    fn test_three_channels_rejected() {
        let dir = tempdir().unwrap();
        write_irs(
            dir.path(),
            "odd",
            48000,
            &[impulse(8), impulse(8), impulse(8)],
        );
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);

        let err = repo.load_kernel("odd").unwrap_err();
        assert!(matches!(
            err,
            ConvolverError::EmptyOrMismatchedChannels { .. }
        ));
    }

    #[test]
    fn test_missing_kernel_not_found() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        assert!(matches!(
            repo.load_kernel("ghost").unwrap_err(),
            ConvolverError::NotFound { .. }
        ));
    }

    #[test]
    fn test_local_dir_takes_precedence_over_system() {
        let local = tempdir().unwrap();
        let system = tempdir().unwrap();
        let nested = system.path().join("vendored");
        fs::create_dir_all(&nested).unwrap();
        write_irs(local.path(), "room", 48000, &[impulse(8), impulse(8)]);
        write_irs(&nested, "room", 44100, &[impulse(8), impulse(8)]);

        let repo = KernelRepository::new(
            local.path().to_path_buf(),
            vec![system.path().to_path_buf()],
        );
        let kernel = repo.load_kernel("room").unwrap();
        assert_eq!(kernel.rate, 48000);
    }

    #[test]
    fn test_system_dir_searched_recursively() {
        let local = tempdir().unwrap();
        let system = tempdir().unwrap();
        let nested = system.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        write_irs(&nested, "deep", 44100, &[impulse(8), impulse(8)]);

        let repo = KernelRepository::new(
            local.path().to_path_buf(),
            vec![system.path().to_path_buf()],
        );
        assert!(repo.load_kernel("deep").is_ok());
    }

    #[test]
    fn test_resample_length() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let mut kernel =
            ImpulseResponseKernel::stereo(48000, vec![0.1; 4800], vec![0.1; 4800]);

        repo.resample_kernel(&mut kernel, 44100).unwrap();

        assert_eq!(kernel.rate, 44100);
        assert_eq!(kernel.original_rate, 48000);
        let len = kernel.sample_count() as i64;
        assert!((len - 4410).abs() <= 1, "got {len} samples");
        assert_eq!(kernel.channel_l.len(), kernel.channel_r.len());
    }

    #[test]
    fn test_resample_same_rate_is_noop() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let mut kernel = ImpulseResponseKernel::stereo(48000, vec![0.7; 100], vec![0.7; 100]);

        repo.resample_kernel(&mut kernel, 48000).unwrap();
        assert_eq!(kernel.sample_count(), 100);
        assert_eq!(kernel.channel_l[50], 0.7);
    }

    #[test]
    fn test_normalize_kernel() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let mut kernel =
            ImpulseResponseKernel::stereo(48000, vec![0.5, -2.0, 0.25], vec![1.0, 0.0, 0.0]);

        repo.normalize_kernel(&mut kernel);
        assert_relative_eq!(kernel.channel_l[1], -1.0);
        assert_relative_eq!(kernel.channel_l[0], 0.25);
        assert_relative_eq!(kernel.channel_r[0], 0.5);
    }

    #[test]
    fn test_normalize_skips_silence() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let mut kernel =
            ImpulseResponseKernel::stereo(48000, vec![1e-9, -1e-9], vec![0.0, 0.0]);

        repo.normalize_kernel(&mut kernel);
        assert_relative_eq!(kernel.channel_l[0], 1e-9);
    }

    #[test]
    fn test_direct_convolution_identity() {
        let signal = vec![0.5, -0.25, 0.75];
        let out = direct_convolution(&signal, &[1.0]);
        assert_eq!(out, signal);
    }

    #[test]
    fn test_direct_convolution_length_and_values() {
        let out = direct_convolution(&[1.0, 2.0], &[3.0, 4.0, 5.0]);
        assert_eq!(out.len(), 4);
        assert_relative_eq!(out[0], 3.0);
        assert_relative_eq!(out[1], 10.0);
        assert_relative_eq!(out[2], 13.0);
        assert_relative_eq!(out[3], 10.0);
    }

    #[test]
    fn test_direct_convolution_commutative() {
        let a: Vec<f32> = (0..37).map(|n| (n as f32 * 0.31).sin()).collect();
        let b: Vec<f32> = (0..120).map(|n| (n as f32 * 0.11).cos()).collect();
        let ab = direct_convolution(&a, &b);
        let ba = direct_convolution(&b, &a);
        assert_eq!(ab.len(), ba.len());
        for (x, y) in ab.iter().zip(&ba) {
            assert_relative_eq!(x, y, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_combine_kernels_length() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let a = ImpulseResponseKernel::stereo(44100, impulse(4800), impulse(4800));
        let b = ImpulseResponseKernel::stereo(44100, impulse(2400), impulse(2400));

        let path = repo.combine_kernels(&a, &b, "combined").unwrap();
        let result = repo.load_kernel_file(&path).unwrap();
        assert_eq!(result.sample_count(), 7199);
        assert_eq!(result.rate, 44100);
    }

    #[test]
    fn test_combine_resamples_to_higher_rate() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let a = ImpulseResponseKernel::stereo(48000, impulse(480), impulse(480));
        let b = ImpulseResponseKernel::stereo(24000, impulse(240), impulse(240));

        let path = repo.combine_kernels(&a, &b, "mixedrate").unwrap();
        let result = repo.load_kernel_file(&path).unwrap();
        assert_eq!(result.rate, 48000);
        // 240 samples at 24 kHz become ~480 at 48 kHz
        let len = result.sample_count() as i64;
        assert!((len - 959).abs() <= 1, "got {len} samples");
    }

    #[test]
    fn test_combine_name_sanitized() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let a = ImpulseResponseKernel::stereo(48000, impulse(16), impulse(16));
        let b = ImpulseResponseKernel::stereo(48000, impulse(16), impulse(16));

        let path = repo.combine_kernels(&a, &b, "  evil/../name  ").unwrap();
        assert_eq!(
            path.file_name().and_then(|s| s.to_str()),
            Some("evil..name.irs")
        );
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempdir().unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);
        let kernel = ImpulseResponseKernel::stereo(
            48000,
            vec![0.1, -0.2, 0.3],
            vec![-0.4, 0.5, -0.6],
        );

        let path = repo.save_kernel(&kernel, "rt").unwrap();
        let loaded = repo.load_kernel_file(&path).unwrap();
        assert_eq!(loaded.channel_l, kernel.channel_l);
        assert_eq!(loaded.channel_r, kernel.channel_r);
    }

    #[test]
    fn test_import_collision_suffix() {
        let source_dir = tempdir().unwrap();
        let local = tempdir().unwrap();
        let source = write_irs(source_dir.path(), "club", 48000, &[impulse(8), impulse(8)]);
        let repo = KernelRepository::new(local.path().to_path_buf(), vec![]);

        let first = repo.import_kernel(&source).unwrap();
        let second = repo.import_kernel(&source).unwrap();
        let third = repo.import_kernel(&source).unwrap();

        assert_eq!(first.file_name().and_then(|s| s.to_str()), Some("club.irs"));
        assert_eq!(
            second.file_name().and_then(|s| s.to_str()),
            Some("club (1).irs")
        );
        assert_eq!(
            third.file_name().and_then(|s| s.to_str()),
            Some("club (2).irs")
        );
    }

    #[test]
    fn test_import_rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let junk = dir.path().join("notes.txt");
        fs::write(&junk, "not audio").unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);

        assert!(matches!(
            repo.import_kernel(&junk).unwrap_err(),
            ConvolverError::InvalidFormat { .. }
        ));
    }

    #[test]
    fn test_list_and_remove() {
        let dir = tempdir().unwrap();
        write_irs(dir.path(), "beta", 48000, &[impulse(8), impulse(8)]);
        write_irs(dir.path(), "alpha", 48000, &[impulse(8), impulse(8)]);
        fs::write(dir.path().join("readme.txt"), "ignored").unwrap();
        let repo = KernelRepository::new(dir.path().to_path_buf(), vec![]);

        assert_eq!(repo.list_kernels(), vec!["alpha", "beta"]);
        repo.remove_kernel("alpha").unwrap();
        assert_eq!(repo.list_kernels(), vec!["beta"]);
        assert!(matches!(
            repo.remove_kernel("alpha").unwrap_err(),
            ConvolverError::NotFound { .. }
        ));
    }
}
