//! Error handling for beamview
//!
//! This module defines the crate-level error type and a Result alias. Pipeline
//! operations return the narrower [`PipelineError`]; this type wraps it together
//! with configuration and IO failures for callers that span both.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for beamview operations
#[derive(Error, Debug)]
pub enum BeamViewError {
    /// Errors raised by the mapping pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BeamViewError>,
    },
}

impl BeamViewError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BeamViewError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    fn from_err(err: impl Into<BeamViewError>) -> Self {
        err.into()
    }
}

impl From<serde_json::Error> for BeamViewError {
    fn from(err: serde_json::Error) -> Self {
        BeamViewError::Serialization(err.to_string())
    }
}

/// Result type alias for beamview operations
pub type Result<T> = std::result::Result<T, BeamViewError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<BeamViewError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| BeamViewError::from_err(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| BeamViewError::from_err(e).with_context(f()))
    }
}
