//! Pipeline configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, then `CLOUDTRAIN_*` environment variables. Every field has a
//! default so a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::{CIFAR10_BINARY_URL, TEST_COUNT, TRAIN_COUNT};
use crate::error::{PipelineError, Result};

/// Service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// REST base URL of the managed service
    pub base_url: String,
    /// Bearer token; usually supplied through `CLOUDTRAIN_TOKEN`
    pub token: Option<String>,
    pub region: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            region: "eu-west-1".to_string(),
        }
    }
}

/// Execution identity overrides. Unset fields are resolved from the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub role: Option<String>,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Tarball location, `http(s)://` or `file://`
    pub url: String,
    /// Local scratch directory for the download, extraction and `.npy` files
    pub work_dir: PathBuf,
    /// Object-storage prefix the partitions are uploaded under
    pub key_prefix: String,
    pub expected_train: usize,
    pub expected_test: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            url: CIFAR10_BINARY_URL.to_string(),
            work_dir: PathBuf::from("work"),
            key_prefix: "data/cloudtrain-cifar10".to_string(),
            expected_train: TRAIN_COUNT,
            expected_test: TEST_COUNT,
        }
    }
}

impl DatasetConfig {
    /// Where the packaged `.npy` partitions are written.
    pub fn data_dir(&self) -> PathBuf {
        self.work_dir.join("data")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub base_job_name: String,
    pub entry_point: String,
    /// Local directory bundled as `sourcedir.tar.gz`
    pub source_dir: PathBuf,
    pub image: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub epochs: u32,
    pub batch_size: u32,
    /// Only forwarded to the script when set
    pub learning_rate: Option<f64>,
    pub poll_interval_secs: u64,
    /// Prefix under the session bucket for job outputs
    pub output_prefix: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_job_name: "cloudtrain-vgg-cifar10".to_string(),
            entry_point: "train.py".to_string(),
            source_dir: PathBuf::from("scripts"),
            image: "tensorflow-training:2.13-gpu-py310".to_string(),
            instance_type: "ml.p3.2xlarge".to_string(),
            instance_count: 1,
            epochs: 10,
            batch_size: 256,
            learning_rate: None,
            poll_interval_secs: 30,
            output_prefix: "jobs".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    pub base_name: String,
    pub image: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub poll_interval_secs: u64,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            base_name: "cloudtrain-vgg-endpoint".to_string(),
            image: "tensorflow-inference:2.13-cpu".to_string(),
            instance_type: "ml.m4.xlarge".to_string(),
            instance_count: 1,
            poll_interval_secs: 30,
        }
    }
}

impl HostingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Stage toggles and lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Number of test images sent in the single prediction request
    pub sample_count: usize,
    pub retrieve_artifacts: bool,
    pub artifacts_dir: PathBuf,
    pub deploy: bool,
    /// Tear the endpoint down at the end of a successful run
    pub reclaim_endpoint: bool,
    /// Tear the endpoint down when a stage after `deploy` fails
    pub reclaim_on_failure: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            sample_count: 10,
            retrieve_artifacts: true,
            artifacts_dir: PathBuf::from("artifacts"),
            deploy: true,
            reclaim_endpoint: true,
            reclaim_on_failure: true,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub service: ServiceConfig,
    pub session: SessionConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub hosting: HostingConfig,
    pub run: RunOptions,
}

impl PipelineConfig {
    /// Defaults, then `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Apply `CLOUDTRAIN_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CLOUDTRAIN_ENDPOINT") {
            self.service.base_url = v;
        }
        if let Some(v) = lookup("CLOUDTRAIN_TOKEN") {
            self.service.token = Some(v);
        }
        if let Some(v) = lookup("CLOUDTRAIN_REGION") {
            self.service.region = v;
        }
        if let Some(v) = lookup("CLOUDTRAIN_ROLE") {
            self.session.role = Some(v);
        }
        if let Some(v) = lookup("CLOUDTRAIN_BUCKET") {
            self.session.bucket = Some(v);
        }
        if let Some(v) = lookup("CLOUDTRAIN_WORK_DIR") {
            self.dataset.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLOUDTRAIN_DATASET_URL") {
            self.dataset.url = v;
        }
        if let Some(v) = lookup("CLOUDTRAIN_TRAIN_INSTANCE_TYPE") {
            self.training.instance_type = v;
        }
        if let Some(v) = lookup("CLOUDTRAIN_HOST_INSTANCE_TYPE") {
            self.hosting.instance_type = v;
        }
        if let Some(v) = lookup("CLOUDTRAIN_EPOCHS") {
            self.training.epochs = parse_override("CLOUDTRAIN_EPOCHS", &v)?;
        }
        if let Some(v) = lookup("CLOUDTRAIN_BATCH_SIZE") {
            self.training.batch_size = parse_override("CLOUDTRAIN_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("CLOUDTRAIN_LEARNING_RATE") {
            self.training.learning_rate = Some(parse_override("CLOUDTRAIN_LEARNING_RATE", &v)?);
        }
        debug!("configuration overrides applied");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.training.instance_count == 0 || self.hosting.instance_count == 0 {
            return Err(PipelineError::Config(
                "instance_count must be at least 1".to_string(),
            ));
        }
        if self.training.epochs == 0 || self.training.batch_size == 0 {
            return Err(PipelineError::Config(
                "epochs and batch_size must be positive".to_string(),
            ));
        }
        if let Some(lr) = self.training.learning_rate {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(PipelineError::Config(format!(
                    "learning_rate must be a positive number, got {}",
                    lr
                )));
            }
        }
        if self.run.sample_count == 0 || self.run.sample_count > self.dataset.expected_test {
            return Err(PipelineError::Config(format!(
                "sample_count must be within 1..={}",
                self.dataset.expected_test
            )));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| PipelineError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}
