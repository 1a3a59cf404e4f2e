//! Error types for cloudtrain-service

use thiserror::Error;

/// Errors surfaced by the managed ML service seam.
///
/// These are reported as-is by the pipeline; nothing in this crate retries.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The service answered with a non-success status
    #[error("service returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never produced a response (connect, TLS, body read)
    #[error("transport error: {0}")]
    Transport(String),

    /// Object missing from storage
    #[error("object not found: {uri}")]
    ObjectNotFound { uri: String },

    /// Training job unknown to the service
    #[error("training job not found: {name}")]
    JobNotFound { name: String },

    /// A job with the same name was already submitted
    #[error("training job already exists: {name}")]
    JobAlreadyExists { name: String },

    /// Model unknown to the service
    #[error("model not found: {name}")]
    ModelNotFound { name: String },

    /// Endpoint unknown to the service
    #[error("endpoint not found: {name}")]
    EndpointNotFound { name: String },

    /// An object URI could not be parsed
    #[error("invalid object URI: {uri}")]
    InvalidUri { uri: String },

    /// Request or response body failed to (de)serialize
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_carries_status_and_message() {
        let err = ServiceError::Api {
            status: 409,
            message: "ResourceInUse".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("409"));
        assert!(msg.contains("ResourceInUse"));
    }

    #[test]
    fn serde_error_maps_to_serialization() {
        let err: ServiceError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ServiceError::Serialization(_)));
    }
}
