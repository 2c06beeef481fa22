//! Spatial impulse-response containers
//!
//! HRTF measurement sets store many two-ear impulse responses, each tagged
//! with a spherical listening position (azimuth, elevation, radius). This
//! module reads such containers, selects one measurement (by index or by
//! nearest orientation) and projects it into a plain stereo
//! [`ImpulseResponseKernel`] carrying [`SpatialMetadata`].

use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConvolverError, Result};
use crate::kernel::{ImpulseResponseKernel, SpatialMetadata};

/// One measurement inside a spatial container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialMeasurement {
    /// Horizontal angle in degrees, 0 = front, counterclockwise
    pub azimuth: f64,
    /// Vertical angle in degrees, 0 = ear level
    pub elevation: f64,
    /// Distance from the listener in meters
    pub radius: f64,
    /// Left-ear impulse response
    pub left: Vec<f32>,
    /// Right-ear impulse response
    pub right: Vec<f32>,
}

/// A full spatial measurement set as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialContainer {
    /// Sample rate all measurements were captured at
    pub rate: u32,
    /// Optional human-readable database name
    #[serde(default)]
    pub database: String,
    pub measurements: Vec<SpatialMeasurement>,
}

impl SpatialContainer {
    /// Read a container from disk
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let container: SpatialContainer = serde_json::from_str(&raw)?;

        if container.measurements.is_empty() {
            return Err(ConvolverError::InvalidFormat {
                path: path.display().to_string(),
                reason: "spatial container holds no measurements".to_string(),
            });
        }
        if container.rate == 0 {
            return Err(ConvolverError::InvalidFormat {
                path: path.display().to_string(),
                reason: "spatial container declares a zero sample rate".to_string(),
            });
        }
        for (n, m) in container.measurements.iter().enumerate() {
            if m.left.is_empty() || m.left.len() != m.right.len() {
                return Err(ConvolverError::EmptyOrMismatchedChannels {
                    details: format!(
                        "measurement {} has ear lengths {} / {}",
                        n,
                        m.left.len(),
                        m.right.len()
                    ),
                });
            }
        }

        debug!(
            "loaded spatial container {} with {} measurements at {} Hz",
            path.display(),
            container.measurements.len(),
            container.rate
        );

        Ok(container)
    }

    /// Write a container to disk. Used by kernel import and by tests that
    /// build fixture sets.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Coordinate ranges over the whole set, as (azimuth, elevation,
    /// radius) min/max pairs
    pub fn coordinate_ranges(&self) -> [(f64, f64); 3] {
        let mut ranges = [
            (f64::INFINITY, f64::NEG_INFINITY),
            (f64::INFINITY, f64::NEG_INFINITY),
            (f64::INFINITY, f64::NEG_INFINITY),
        ];
        for m in &self.measurements {
            for (range, value) in ranges.iter_mut().zip([m.azimuth, m.elevation, m.radius]) {
                range.0 = range.0.min(value);
                range.1 = range.1.max(value);
            }
        }
        ranges
    }

    /// Index of the measurement closest to the requested orientation.
    ///
    /// Distance is squared Euclidean over (azimuth, elevation, radius),
    /// with azimuth difference wrapped to [-180, 180].
    pub fn nearest_measurement(&self, azimuth: f64, elevation: f64, radius: f64) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (n, m) in self.measurements.iter().enumerate() {
            let mut da = (m.azimuth - azimuth).abs() % 360.0;
            if da > 180.0 {
                da = 360.0 - da;
            }
            let de = m.elevation - elevation;
            let dr = m.radius - radius;
            let dist = da * da + de * de + dr * dr;
            if dist < best_dist {
                best_dist = dist;
                best = n;
            }
        }
        best
    }

    /// Project one measurement into a stereo kernel with spatial metadata
    pub fn extract(&self, index: usize, database: &str) -> Result<ImpulseResponseKernel> {
        let measurement =
            self.measurements
                .get(index)
                .ok_or_else(|| ConvolverError::InvalidFormat {
                    path: database.to_string(),
                    reason: format!(
                        "measurement index {} out of range, set has {}",
                        index,
                        self.measurements.len()
                    ),
                })?;

        let [azimuth_range, elevation_range, radius_range] = self.coordinate_ranges();

        let mut kernel = ImpulseResponseKernel::stereo(
            self.rate,
            measurement.left.clone(),
            measurement.right.clone(),
        );
        kernel.spatial = Some(SpatialMetadata {
            database: if self.database.is_empty() {
                database.to_string()
            } else {
                self.database.clone()
            },
            measurement_index: index,
            measurement_count: self.measurements.len(),
            azimuth: measurement.azimuth,
            elevation: measurement.elevation,
            radius: measurement.radius,
            azimuth_range,
            elevation_range,
            radius_range,
        });

        if kernel.has_invalid_samples() {
            warn!("spatial measurement {} contains non-finite samples", index);
            return Err(ConvolverError::InvalidFormat {
                path: database.to_string(),
                reason: "measurement contains NaN or infinite samples".to_string(),
            });
        }

        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_container() -> SpatialContainer {
        SpatialContainer {
            rate: 48000,
            database: "testdb".to_string(),
            measurements: vec![
                SpatialMeasurement {
                    azimuth: 0.0,
                    elevation: 0.0,
                    radius: 1.0,
                    left: vec![1.0, 0.5],
                    right: vec![0.5, 1.0],
                },
                SpatialMeasurement {
                    azimuth: 90.0,
                    elevation: 0.0,
                    radius: 1.0,
                    left: vec![0.2, 0.1],
                    right: vec![0.1, 0.2],
                },
                SpatialMeasurement {
                    azimuth: 350.0,
                    elevation: 10.0,
                    radius: 2.0,
                    left: vec![0.3, 0.3],
                    right: vec![0.3, 0.3],
                },
            ],
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.sofa");
        sample_container().save(&path).unwrap();

        let loaded = SpatialContainer::load(&path).unwrap();
        assert_eq!(loaded.rate, 48000);
        assert_eq!(loaded.measurements.len(), 3);
        assert_eq!(loaded.measurements[1].azimuth, 90.0);
    }

    #[test]
    fn test_empty_set_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.sofa");
        std::fs::write(&path, r#"{"rate":48000,"measurements":[]}"#).unwrap();

        let err = SpatialContainer::load(&path).unwrap_err();
        assert!(matches!(err, ConvolverError::InvalidFormat { .. }));
    }

    #[test]
    fn test_mismatched_ears_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.sofa");
        let raw = r#"{"rate":48000,"measurements":[
            {"azimuth":0,"elevation":0,"radius":1,"left":[0.1,0.2],"right":[0.1]}
        ]}"#;
        std::fs::write(&path, raw).unwrap();

        let err = SpatialContainer::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConvolverError::EmptyOrMismatchedChannels { .. }
        ));
    }

    #[test]
    fn test_nearest_measurement_wraps_azimuth() {
        let container = sample_container();
        // 355 degrees is closer to 350 than to 0 and far from 90
        assert_eq!(container.nearest_measurement(355.0, 10.0, 2.0), 2);
        // 5 degrees wraps around to the front measurement
        assert_eq!(container.nearest_measurement(5.0, 0.0, 1.0), 0);
        assert_eq!(container.nearest_measurement(85.0, 0.0, 1.0), 1);
    }

    #[test]
    fn test_extract_carries_metadata() {
        let container = sample_container();
        let kernel = container.extract(1, "fallback").unwrap();

        assert_eq!(kernel.rate, 48000);
        assert_eq!(kernel.channel_l, vec![0.2, 0.1]);
        let spatial = kernel.spatial.unwrap();
        assert_eq!(spatial.database, "testdb");
        assert_eq!(spatial.measurement_index, 1);
        assert_eq!(spatial.measurement_count, 3);
        assert_eq!(spatial.azimuth, 90.0);
        assert_eq!(spatial.azimuth_range, (0.0, 350.0));
        assert_eq!(spatial.radius_range, (1.0, 2.0));
    }

    #[test]
    fn test_extract_out_of_range() {
        let container = sample_container();
        assert!(container.extract(7, "db").is_err());
    }
}
