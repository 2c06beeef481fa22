//! Impulse-response kernel data model and repository
//!
//! The central entity is [`ImpulseResponseKernel`]: 2 or 4 equal-length
//! channel arrays at a known sample rate, optionally tagged with spatial
//! (HRTF) metadata describing which measurement of a multi-measurement
//! set it was taken from.

pub mod repository;
pub mod sofa;

pub use repository::KernelRepository;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Channel topology of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelLayout {
    /// Plain stereo kernel: L and R arrays only
    Stereo,
    /// True-stereo kernel with cross-talk arrays (L, R, L->R, R->L)
    TrueStereo,
}

impl KernelLayout {
    /// Number of channel arrays present for this layout
    pub fn channel_count(&self) -> usize {
        match self {
            KernelLayout::Stereo => 2,
            KernelLayout::TrueStereo => 4,
        }
    }
}

/// Spatial metadata recorded when a kernel was selected out of an
/// HRTF measurement set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialMetadata {
    /// Identifier of the source database/file
    pub database: String,
    /// Which measurement was selected
    pub measurement_index: usize,
    /// Total measurements available in the set
    pub measurement_count: usize,
    /// Coordinates of the selected measurement
    pub azimuth: f64,
    pub elevation: f64,
    pub radius: f64,
    /// Valid coordinate ranges over the whole set
    pub azimuth_range: (f64, f64),
    pub elevation_range: (f64, f64),
    pub radius_range: (f64, f64),
}

/// An impulse-response filter kernel
///
/// All present channel arrays share one length. The cross-talk arrays
/// (`channel_lr`, `channel_rl`) are empty unless `layout` is
/// [`KernelLayout::TrueStereo`].
#[derive(Debug, Clone, Default)]
pub struct ImpulseResponseKernel {
    /// Sample rate of the data currently held
    pub rate: u32,
    /// Sample rate the kernel was originally loaded at
    pub original_rate: u32,

    pub name: String,
    pub source_path: PathBuf,

    pub channel_l: Vec<f32>,
    pub channel_r: Vec<f32>,
    /// L->R cross-talk, true-stereo only
    pub channel_lr: Vec<f32>,
    /// R->L cross-talk, true-stereo only
    pub channel_rl: Vec<f32>,

    /// Present only for HRTF-sourced kernels
    pub spatial: Option<SpatialMetadata>,
}

impl ImpulseResponseKernel {
    /// Create a plain stereo kernel from channel data
    pub fn stereo(rate: u32, channel_l: Vec<f32>, channel_r: Vec<f32>) -> Self {
        Self {
            rate,
            original_rate: rate,
            channel_l,
            channel_r,
            ..Default::default()
        }
    }

    /// Create a true-stereo kernel from four channel arrays
    pub fn true_stereo(
        rate: u32,
        channel_l: Vec<f32>,
        channel_r: Vec<f32>,
        channel_lr: Vec<f32>,
        channel_rl: Vec<f32>,
    ) -> Self {
        Self {
            rate,
            original_rate: rate,
            channel_l,
            channel_r,
            channel_lr,
            channel_rl,
            ..Default::default()
        }
    }

    /// Channel topology of this kernel
    pub fn layout(&self) -> KernelLayout {
        if self.channel_lr.is_empty() && self.channel_rl.is_empty() {
            KernelLayout::Stereo
        } else {
            KernelLayout::TrueStereo
        }
    }

    /// Number of samples per channel
    pub fn sample_count(&self) -> usize {
        self.channel_l.len()
    }

    /// Kernel length in seconds at the current rate
    pub fn duration(&self) -> f64 {
        if self.rate == 0 || self.channel_l.is_empty() {
            return 0.0;
        }
        (self.channel_l.len() - 1) as f64 / self.rate as f64
    }

    /// A kernel is valid when it has samples, a positive rate, and all
    /// present channel arrays share one length
    pub fn is_valid(&self) -> bool {
        if self.rate == 0 || self.channel_l.is_empty() {
            return false;
        }
        if self.channel_l.len() != self.channel_r.len() {
            return false;
        }
        match self.layout() {
            KernelLayout::Stereo => true,
            KernelLayout::TrueStereo => {
                self.channel_lr.len() == self.channel_l.len()
                    && self.channel_rl.len() == self.channel_l.len()
            }
        }
    }

    /// True if any channel contains NaN or infinite samples
    pub fn has_invalid_samples(&self) -> bool {
        self.channels().any(|c| c.iter().any(|v| !v.is_finite()))
    }

    /// Iterate over the present channel arrays
    pub fn channels(&self) -> impl Iterator<Item = &Vec<f32>> {
        let cross = match self.layout() {
            KernelLayout::Stereo => None,
            KernelLayout::TrueStereo => Some([&self.channel_lr, &self.channel_rl]),
        };
        [&self.channel_l, &self.channel_r]
            .into_iter()
            .chain(cross.into_iter().flatten())
    }

    /// Iterate mutably over the present channel arrays
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        let true_stereo = self.layout() == KernelLayout::TrueStereo;
        let mut all = vec![&mut self.channel_l, &mut self.channel_r];
        if true_stereo {
            all.push(&mut self.channel_lr);
            all.push(&mut self.channel_rl);
        }
        all.into_iter()
    }
}
