//! Managed training job launch and completion wait.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cloudtrain_service::{
    JobStatus, ObjectStore, ObjectUri, ResourceSpec, ScriptRef, TrainingJobDescription,
    TrainingJobRequest, TrainingService,
};

use crate::command::create_tar_gz;
use crate::config::TrainingConfig;
use crate::error::{PipelineError, Result};
use crate::session::Session;
use crate::upload::upload_file;

pub const SOURCE_BUNDLE_NAME: &str = "sourcedir.tar.gz";

/// Script arguments. Learning rate is only sent when explicitly set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: Option<f64>,
}

impl Hyperparameters {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
        }
    }

    /// Flatten to the string map handed to the script.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("epochs".to_string(), self.epochs.to_string());
        map.insert("batch-size".to_string(), self.batch_size.to_string());
        if let Some(lr) = self.learning_rate {
            map.insert("learning-rate".to_string(), lr.to_string());
        }
        map
    }
}

/// `<base>-YYYY-MM-DD-HH-MM-SS-mmm`
pub fn unique_name(base: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", base, now.format("%Y-%m-%d-%H-%M-%S-%3f"))
}

/// Everything needed to submit one job.
#[derive(Debug, Clone)]
pub struct TrainingJobSpec {
    pub base_job_name: String,
    pub entry_point: String,
    pub source_dir: PathBuf,
    pub image: String,
    pub resources: ResourceSpec,
    pub hyperparameters: Hyperparameters,
    pub channels: BTreeMap<String, ObjectUri>,
    pub output_prefix: String,
    pub poll_interval: Duration,
}

impl TrainingJobSpec {
    pub fn from_config(config: &TrainingConfig, channels: BTreeMap<String, ObjectUri>) -> Self {
        Self {
            base_job_name: config.base_job_name.clone(),
            entry_point: config.entry_point.clone(),
            source_dir: config.source_dir.clone(),
            image: config.image.clone(),
            resources: ResourceSpec {
                instance_type: config.instance_type.clone(),
                instance_count: config.instance_count,
            },
            hyperparameters: Hyperparameters::from_config(config),
            channels,
            output_prefix: config.output_prefix.clone(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// A job that reached `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_name: String,
    pub model_artifact: ObjectUri,
    pub output_data: Option<ObjectUri>,
    pub duration_ms: u64,
}

/// Bundle the script, submit the job and block until it is terminal.
pub async fn launch<C>(cloud: &C, session: &Session, spec: &TrainingJobSpec) -> Result<TrainingJob>
where
    C: ObjectStore + TrainingService + ?Sized,
{
    let start = Instant::now();
    if !spec.source_dir.join(&spec.entry_point).is_file() {
        return Err(PipelineError::Config(format!(
            "entry point {} not found in {}",
            spec.entry_point,
            spec.source_dir.display()
        )));
    }
    let job_name = unique_name(&spec.base_job_name, Utc::now());

    let bundle_dir = tempfile::tempdir()?;
    let bundle_path = bundle_dir.path().join(SOURCE_BUNDLE_NAME);
    create_tar_gz(&spec.source_dir, &bundle_path).await?;
    let bundle_uri = session.object(format!("{}/source/{}", job_name, SOURCE_BUNDLE_NAME));
    upload_file(cloud, &bundle_path, &bundle_uri).await?;

    let request = TrainingJobRequest {
        job_name: job_name.clone(),
        script: ScriptRef {
            entry_point: spec.entry_point.clone(),
            source_bundle: bundle_uri,
        },
        image: spec.image.clone(),
        role: session.role.clone(),
        resources: spec.resources.clone(),
        hyperparameters: spec.hyperparameters.to_map(),
        channels: spec.channels.clone(),
        output_path: session.object(&spec.output_prefix),
    };
    cloud.create_training_job(&request).await?;
    info!(
        job = %job_name,
        instance_type = %spec.resources.instance_type,
        instances = spec.resources.instance_count,
        "training job submitted"
    );

    let description = wait_for_job(cloud, &job_name, spec.poll_interval).await?;
    let job = completed_job(description, start.elapsed())?;
    info!(job = %job.job_name, model = %job.model_artifact, "training job completed");
    Ok(job)
}

/// Poll until the job leaves `InProgress`.
pub async fn wait_for_job<T>(
    training: &T,
    job_name: &str,
    poll_interval: Duration,
) -> Result<TrainingJobDescription>
where
    T: TrainingService + ?Sized,
{
    loop {
        let description = training.describe_training_job(job_name).await?;
        if description.status.is_terminal() {
            return Ok(description);
        }
        debug!(job = job_name, "training job in progress");
        tokio::time::sleep(poll_interval).await;
    }
}

/// Turn a terminal description into a `TrainingJob`, or the job's failure.
fn completed_job(description: TrainingJobDescription, elapsed: Duration) -> Result<TrainingJob> {
    let job_name = description.job_name;
    match description.status {
        JobStatus::Completed => {
            let model_artifact = description.model_artifact.ok_or_else(|| {
                PipelineError::JobFailed {
                    job_name: job_name.clone(),
                    status: "Completed without a model artifact".to_string(),
                }
            })?;
            Ok(TrainingJob {
                job_name,
                model_artifact,
                output_data: description.output_data,
                duration_ms: elapsed.as_millis() as u64,
            })
        }
        JobStatus::Failed(reason) => {
            warn!(job = %job_name, reason = %reason, "training job failed");
            Err(PipelineError::JobFailed {
                job_name,
                status: format!("Failed: {}", reason),
            })
        }
        JobStatus::Stopped => Err(PipelineError::JobFailed {
            job_name,
            status: "Stopped".to_string(),
        }),
        JobStatus::InProgress => Err(PipelineError::JobFailed {
            job_name,
            status: "InProgress".to_string(),
        }),
    }
}
