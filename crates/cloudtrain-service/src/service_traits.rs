//! Service trait definitions for cloudtrain
//!
//! These traits describe the external managed ML service the pipeline drives:
//! - `IdentityProvider`: who the caller is (account, role)
//! - `ObjectStore`: blob upload/download by `ObjectUri`
//! - `TrainingService`: submit and describe managed training jobs
//! - `HostingService`: register models, provision and delete endpoints
//! - `PredictionService`: invoke a live endpoint
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module, a REST backend via the `rest` module.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Result type for service operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

// ---------------------------------------------------------------------------
// IdentityProvider
// ---------------------------------------------------------------------------

/// Caller identity as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Account that owns the resources created by the pipeline
    pub account: String,
    /// Execution role assumed by training jobs and endpoints
    pub role: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the identity the credentials belong to.
    async fn caller_identity(&self) -> ServiceResult<CallerIdentity>;
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Location of a blob in remote object storage, rendered `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUri {
    bucket: String,
    key: String,
}

impl ObjectUri {
    pub const SCHEME: &'static str = "s3://";

    /// Build a URI from bucket and key. Leading/trailing slashes on the key are dropped.
    pub fn new(bucket: impl Into<String>, key: impl AsRef<str>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append path segments to the key.
    pub fn join(&self, segment: impl AsRef<str>) -> Self {
        let segment = segment.as_ref().trim_matches('/');
        let key = if self.key.is_empty() {
            segment.to_string()
        } else if segment.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{}", self.key, segment)
        };
        Self {
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// Final key segment (the "file name").
    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}{}", Self::SCHEME, self.bucket)
        } else {
            write!(f, "{}{}/{}", Self::SCHEME, self.bucket, self.key)
        }
    }
}

impl FromStr for ObjectUri {
    type Err = ServiceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| ServiceError::InvalidUri { uri: s.to_string() })?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ServiceError::InvalidUri { uri: s.to_string() });
        }
        Ok(ObjectUri::new(bucket, key))
    }
}

impl Serialize for ObjectUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Blob storage.
///
/// Guarantees:
/// - `get(uri)` returns the exact bytes previously `put` at `uri`.
/// - `list(prefix)` returns every URI whose key starts with the prefix key, sorted.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes at `uri`, replacing any previous content.
    async fn put_object(&self, uri: &ObjectUri, data: Vec<u8>) -> ServiceResult<()>;

    /// Retrieve bytes. Returns `ServiceError::ObjectNotFound` if absent.
    async fn get_object(&self, uri: &ObjectUri) -> ServiceResult<Vec<u8>>;

    /// List objects under a prefix.
    async fn list_objects(&self, prefix: &ObjectUri) -> ServiceResult<Vec<ObjectUri>>;
}

// ---------------------------------------------------------------------------
// TrainingService
// ---------------------------------------------------------------------------

/// Compute resources for a job or endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Instance type, e.g. `ml.p3.2xlarge`
    pub instance_type: String,
    /// Number of instances
    pub instance_count: u32,
}

/// Script the training container runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    /// Entry point file inside the source bundle
    pub entry_point: String,
    /// Uploaded source bundle (`sourcedir.tar.gz`)
    pub source_bundle: ObjectUri,
}

/// Job descriptor submitted to the training service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobRequest {
    pub job_name: String,
    pub script: ScriptRef,
    /// Framework container image
    pub image: String,
    /// Execution role
    pub role: String,
    pub resources: ResourceSpec,
    /// Flat string-keyed hyperparameters handed to the script
    pub hyperparameters: BTreeMap<String, String>,
    /// Named input channels
    pub channels: BTreeMap<String, ObjectUri>,
    /// Prefix under which `<job>/output/{model,output}.tar.gz` are written
    pub output_path: ObjectUri,
}

/// External job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed(String),
    Stopped,
}

impl JobStatus {
    /// Whether the job will no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

/// Description of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobDescription {
    pub job_name: String,
    pub status: JobStatus,
    /// Model archive, set once the job completed
    pub model_artifact: Option<ObjectUri>,
    /// Auxiliary output archive (plots, logs), set once the job completed
    pub output_data: Option<ObjectUri>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Managed training jobs.
///
/// A job transitions: InProgress → Completed | Failed | Stopped (terminal).
#[async_trait]
pub trait TrainingService: Send + Sync {
    /// Submit a job. Fails with `JobAlreadyExists` on a duplicate name.
    async fn create_training_job(&self, request: &TrainingJobRequest) -> ServiceResult<()>;

    /// Current description of a job.
    async fn describe_training_job(&self, job_name: &str)
        -> ServiceResult<TrainingJobDescription>;
}

// ---------------------------------------------------------------------------
// HostingService
// ---------------------------------------------------------------------------

/// A servable model registered from a training artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model_name: String,
    /// Serving container image
    pub image: String,
    pub model_artifact: ObjectUri,
    pub role: String,
}

/// Endpoint provisioning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub endpoint_name: String,
    pub model_name: String,
    pub resources: ResourceSpec,
}

/// External endpoint state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason")]
pub enum EndpointStatus {
    Creating,
    InService,
    Failed(String),
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub endpoint_name: String,
    pub model_name: String,
    pub status: EndpointStatus,
    pub created_at: DateTime<Utc>,
}

/// Model registration and endpoint lifecycle.
///
/// Endpoints are billable until `delete_endpoint` is called; nothing here
/// expires them.
#[async_trait]
pub trait HostingService: Send + Sync {
    async fn create_model(&self, request: &ModelRequest) -> ServiceResult<()>;

    async fn delete_model(&self, model_name: &str) -> ServiceResult<()>;

    async fn create_endpoint(&self, request: &EndpointRequest) -> ServiceResult<()>;

    async fn describe_endpoint(&self, endpoint_name: &str) -> ServiceResult<EndpointDescription>;

    async fn delete_endpoint(&self, endpoint_name: &str) -> ServiceResult<()>;
}

// ---------------------------------------------------------------------------
// PredictionService
// ---------------------------------------------------------------------------

/// Invocation of a live endpoint. Body and response are opaque bytes; the
/// JSON framing lives with the caller.
#[async_trait]
pub trait PredictionService: Send + Sync {
    async fn invoke_endpoint(
        &self,
        endpoint_name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> ServiceResult<Vec<u8>>;
}

/// Everything the pipeline needs from one backend.
pub trait ManagedCloud:
    IdentityProvider + ObjectStore + TrainingService + HostingService + PredictionService
{
}

impl<T> ManagedCloud for T where
    T: IdentityProvider + ObjectStore + TrainingService + HostingService + PredictionService
{
}
