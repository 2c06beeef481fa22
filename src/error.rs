//! Error handling for the convolution subsystem
//!
//! Every failure in this crate maps to one `ConvolverError` variant. None
//! of them are fatal to playback: the orchestrator reacts by leaving the
//! engine not-ready and letting audio pass through unchanged.

use thiserror::Error;

/// Result type alias for convolver operations
pub type Result<T> = std::result::Result<T, ConvolverError>;

/// All errors raised by the convolution subsystem
#[derive(Error, Debug)]
pub enum ConvolverError {
    /// Kernel name could not be resolved to a file in any search directory
    #[error("Kernel not found: {name}")]
    NotFound { name: String },

    /// The kernel file exists but its contents are not usable
    #[error("Invalid kernel format in {path}: {reason}")]
    InvalidFormat { path: String, reason: String },

    /// Channel data is empty or channel lengths disagree
    #[error("Empty or mismatched channel data: {details}")]
    EmptyOrMismatchedChannels { details: String },

    /// The partitioned-convolution backend rejected a configuration,
    /// impulse upload, or start request
    #[error("Convolution backend failure during {stage}: {reason}")]
    BackendConfiguration { stage: &'static str, reason: String },

    /// A real-time block arrived whose length differs from the configured
    /// quantum
    #[error("Block size mismatch: engine configured for {expected}, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    /// The resampling capability failed or produced inconsistent output
    #[error("Kernel resampling failed: {reason}")]
    Resample { reason: String },

    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Spatial container payload could not be decoded
    #[error("Spatial container error: {0}")]
    SpatialDecode(#[from] serde_json::Error),
}

impl ConvolverError {
    /// Short machine-facing code, used in log lines
    pub fn code(&self) -> &'static str {
        match self {
            ConvolverError::NotFound { .. } => "NOT_FOUND",
            ConvolverError::InvalidFormat { .. } => "INVALID_FORMAT",
            ConvolverError::EmptyOrMismatchedChannels { .. } => "EMPTY_OR_MISMATCHED_CHANNELS",
            ConvolverError::BackendConfiguration { .. } => "BACKEND_CONFIGURATION",
            ConvolverError::BlockSizeMismatch { .. } => "BLOCK_SIZE_MISMATCH",
            ConvolverError::Resample { .. } => "RESAMPLE",
            ConvolverError::Io(_) => "IO_ERROR",
            ConvolverError::SpatialDecode(_) => "SPATIAL_DECODE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ConvolverError::NotFound {
            name: "hall".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = ConvolverError::BlockSizeMismatch {
            expected: 512,
            actual: 256,
        };
        assert_eq!(err.code(), "BLOCK_SIZE_MISMATCH");
        assert!(err.to_string().contains("512"));
    }
}
