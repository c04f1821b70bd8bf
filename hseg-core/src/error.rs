//! Error types for the hseg-core library

use thiserror::Error;

/// Main error type for segmentation operations
#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("Invalid configuration: {message}")]
    ConfigError { message: String },

    #[error("Input data error: {message}")]
    InputError { message: String },

    #[error("Resource error: {message}")]
    ResourceError { message: String },

    #[error("Algorithm error: {message}")]
    AlgorithmError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SegmentationError {
    /// Create a new configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a new input data error
    pub fn input_error(message: impl Into<String>) -> Self {
        Self::InputError {
            message: message.into(),
        }
    }

    /// Create a new resource error
    pub fn resource_error(message: impl Into<String>) -> Self {
        Self::ResourceError {
            message: message.into(),
        }
    }

    /// Create a new algorithm error
    pub fn algorithm_error(message: impl Into<String>) -> Self {
        Self::AlgorithmError {
            message: message.into(),
        }
    }
}

/// Result type alias for convenience
pub type SegResult<T> = Result<T, SegmentationError>;
