//! Offline frequency-response analysis
//!
//! Produces the curves the UI plots for a loaded kernel: per-channel
//! magnitude over frequency, sampled onto both a linear and a logarithmic
//! frequency axis and min-max normalized to [0, 1].

use log::debug;
use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;

use crate::error::{ConvolverError, Result};

/// Frequency-response curves for one stereo kernel.
///
/// Each curve is `(frequency_hz, normalized_magnitude)` pairs, magnitudes
/// in [0, 1].
#[derive(Debug, Clone, Default)]
pub struct SpectrumData {
    pub linear_l: Vec<(f32, f32)>,
    pub linear_r: Vec<(f32, f32)>,
    pub log_l: Vec<(f32, f32)>,
    pub log_r: Vec<(f32, f32)>,
}

/// Compute display spectra for a stereo impulse response.
///
/// Both channels must be non-empty, equal length and at least two samples
/// long. `num_points` sets the exact length of every returned curve.
pub fn compute_spectrum(
    left: &[f32],
    right: &[f32],
    rate: u32,
    num_points: usize,
) -> Result<SpectrumData> {
    if left.is_empty() || left.len() != right.len() {
        return Err(ConvolverError::EmptyOrMismatchedChannels {
            details: format!(
                "spectrum input lengths {} / {}",
                left.len(),
                right.len()
            ),
        });
    }
    if left.len() < 2 || rate == 0 || num_points < 2 {
        return Err(ConvolverError::EmptyOrMismatchedChannels {
            details: "spectrum needs at least 2 samples, 2 points and a positive rate"
                .to_string(),
        });
    }

    let magnitude_l = channel_magnitude(left)?;
    let magnitude_r = channel_magnitude(right)?;

    // Bin n of an N-point real FFT sits at rate*n/N. The DC bin carries
    // no display information and breaks the log axis, so it goes.
    let size = left.len();
    let bin_width = rate as f32 / size as f32;
    let bins: Vec<f32> = (1..magnitude_l.len()).map(|n| n as f32 * bin_width).collect();
    let magnitude_l = &magnitude_l[1..];
    let magnitude_r = &magnitude_r[1..];

    let min_freq = bins[0];
    let max_freq = bins[bins.len() - 1];
    let linear_axis = linspace(min_freq, max_freq, num_points);
    let log_axis = logspace(min_freq, max_freq, num_points);

    let data = SpectrumData {
        linear_l: resample_curve(&bins, magnitude_l, &linear_axis),
        linear_r: resample_curve(&bins, magnitude_r, &linear_axis),
        log_l: resample_curve(&bins, magnitude_l, &log_axis),
        log_r: resample_curve(&bins, magnitude_r, &log_axis),
    };
    debug!(
        "computed spectrum: {} fft bins down to {} display points",
        bins.len(),
        num_points
    );
    Ok(data)
}

/// Windowed power spectrum of one channel, power normalized by N²
fn channel_magnitude(samples: &[f32]) -> Result<Vec<f32>> {
    let size = samples.len();
    let mut windowed: Vec<f32> = samples
        .iter()
        .enumerate()
        .map(|(n, v)| v * hann(n, size))
        .collect();

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(size);
    let mut spectrum = vec![Complex::default(); size / 2 + 1];
    fft.process(&mut windowed, &mut spectrum)
        .map_err(|e| ConvolverError::BackendConfiguration {
            stage: "spectrum fft",
            reason: e.to_string(),
        })?;

    let scale = 1.0 / (size as f32 * size as f32);
    Ok(spectrum
        .iter()
        .map(|c| (c.re * c.re + c.im * c.im) * scale)
        .collect())
}

fn hann(n: usize, size: usize) -> f32 {
    let phase = 2.0 * std::f32::consts::PI * n as f32 / (size - 1) as f32;
    0.5 * (1.0 - phase.cos())
}

fn linspace(start: f32, stop: f32, count: usize) -> Vec<f32> {
    let step = (stop - start) / (count - 1) as f32;
    (0..count).map(|n| start + step * n as f32).collect()
}

fn logspace(start: f32, stop: f32, count: usize) -> Vec<f32> {
    let log_start = start.log10();
    let step = (stop.log10() - log_start) / (count - 1) as f32;
    (0..count)
        .map(|n| 10f32.powf(log_start + step * n as f32))
        .collect()
}

/// Interpolate `(xs, ys)` onto `axis` and min-max normalize the result
fn resample_curve(xs: &[f32], ys: &[f32], axis: &[f32]) -> Vec<(f32, f32)> {
    let mut values: Vec<f32> = axis.iter().map(|&x| interpolate(xs, ys, x)).collect();

    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in &values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    let span = hi - lo;
    if span > 0.0 {
        for v in values.iter_mut() {
            *v = (*v - lo) / span;
        }
    } else {
        values.fill(0.0);
    }

    axis.iter().copied().zip(values).collect()
}

/// Piecewise-linear lookup over sorted sample positions, clamped at the
/// ends
fn interpolate(xs: &[f32], ys: &[f32], x: f32) -> f32 {
    if x <= xs[0] {
        return ys[0];
    }
    let last = xs.len() - 1;
    if x >= xs[last] {
        return ys[last];
    }
    let upper = xs.partition_point(|&v| v < x);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    let t = (x - x0) / (x1 - x0);
    y0 + t * (y1 - y0)
}
