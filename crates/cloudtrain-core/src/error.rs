//! Error taxonomy for the pipeline.
//!
//! Nothing here is retried: every variant is propagated to the caller, which
//! halts the pipeline.

use cloudtrain_service::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid dataset: {0}")]
    Dataset(String),

    #[error("npy error: {0}")]
    Npy(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("command `{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("training job {job_name} ended as {status}")]
    JobFailed { job_name: String, status: String },

    #[error("endpoint {endpoint_name} failed to provision: {reason}")]
    EndpointFailed {
        endpoint_name: String,
        reason: String,
    },

    #[error("invalid prediction: {0}")]
    Prediction(String),

    #[error("serving error: {0}")]
    Serving(String),

    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for environment variable {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Download(err.to_string())
    }
}

impl From<ndarray_npy::WriteNpyError> for PipelineError {
    fn from(err: ndarray_npy::WriteNpyError) -> Self {
        PipelineError::Npy(err.to_string())
    }
}

impl From<ndarray_npy::ReadNpyError> for PipelineError {
    fn from(err: ndarray_npy::ReadNpyError) -> Self {
        PipelineError::Npy(err.to_string())
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        PipelineError::Dataset(err.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
