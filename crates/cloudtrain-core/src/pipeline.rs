//! End-to-end orchestration: dataset to hosted predictions and back down.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use cloudtrain_service::{ManagedCloud, ObjectUri};

use crate::artifacts::{retrieve_artifacts, RetrievedArtifacts};
use crate::config::{DatasetConfig, PipelineConfig};
use crate::dataset::{package, sample_images, DatasetFetcher, Split};
use crate::deploy::{deploy, reclaim, DeploySpec, EndpointHandle};
use crate::error::Result;
use crate::inference::{predict, Prediction};
use crate::session::Session;
use crate::stage::{Stage, StageLog, StageResult};
use crate::training::{launch, TrainingJob, TrainingJobSpec};
use crate::upload::upload_directory;

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub session: Session,
    pub train_data: ObjectUri,
    pub test_data: ObjectUri,
    pub job: TrainingJob,
    pub artifacts: Option<RetrievedArtifacts>,
    /// Set only when the endpoint was left running
    pub endpoint: Option<EndpointHandle>,
    pub predictions: Vec<Prediction>,
    /// Dataset labels of the predicted samples, same order
    pub true_labels: Vec<u8>,
    pub stages: Vec<StageResult>,
    pub duration_ms: u64,
}

impl PipelineReport {
    /// Fraction of samples whose predicted label matches the dataset label.
    pub fn accuracy(&self) -> Option<f64> {
        if self.predictions.is_empty() {
            return None;
        }
        let correct = self
            .predictions
            .iter()
            .zip(&self.true_labels)
            .filter(|(p, &t)| p.label == t as usize)
            .count();
        Some(correct as f64 / self.predictions.len() as f64)
    }
}

/// Train and test prefixes under the session bucket.
pub fn dataset_prefixes(session: &Session, dataset: &DatasetConfig) -> (ObjectUri, ObjectUri) {
    let prefix = &dataset.key_prefix;
    (
        session.object(format!("{}/{}", prefix, Split::Train.name())),
        session.object(format!("{}/{}", prefix, Split::Test.name())),
    )
}

/// Channel map handed to the training job.
pub fn training_channels(train: &ObjectUri, test: &ObjectUri) -> BTreeMap<String, ObjectUri> {
    BTreeMap::from([
        (Split::Train.name().to_string(), train.clone()),
        (Split::Test.name().to_string(), test.clone()),
    ])
}

pub struct TrainingPipeline;

impl TrainingPipeline {
    /// Run every enabled stage in order. The first failing stage stops the run
    /// and its error is returned. A deployed endpoint is reclaimed before a
    /// later failure propagates unless `run.reclaim_on_failure` is off.
    pub async fn run<C: ManagedCloud>(cloud: &C, config: &PipelineConfig) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        Self::run_stages(cloud, config, run_id)
            .instrument(info_span!("pipeline", run_id = %run_id))
            .await
    }

    async fn run_stages<C: ManagedCloud>(
        cloud: &C,
        config: &PipelineConfig,
        run_id: Uuid,
    ) -> Result<PipelineReport> {
        let start = Instant::now();
        let mut log = StageLog::default();
        info!("pipeline started");

        let running = log.start(Stage::ResolveSession);
        let session = match Session::resolve(cloud, config).await {
            Ok(s) => s,
            Err(e) => return Err(log.fail(running, e)),
        };
        log.finish(running, session.role.clone());

        let running = log.start(Stage::FetchDataset);
        let fetcher = DatasetFetcher::from_config(&config.dataset);
        let fetched = match fetcher.fetch().await {
            Ok(f) => f,
            Err(e) => return Err(log.fail(running, e)),
        };
        let packaged = match package(&fetched.dataset, &config.dataset.data_dir()) {
            Ok(p) => p,
            Err(e) => return Err(log.fail(running, e)),
        };
        log.finish(
            running,
            format!(
                "{} train / {} test images",
                fetched.dataset.train.len(),
                fetched.dataset.test.len()
            ),
        );

        let running = log.start(Stage::UploadDataset);
        let (train_prefix, test_prefix) = dataset_prefixes(&session, &config.dataset);
        let uploaded = async {
            let train = upload_directory(cloud, &packaged.train_dir, &train_prefix).await?;
            let test = upload_directory(cloud, &packaged.test_dir, &test_prefix).await?;
            Ok::<_, crate::error::PipelineError>((train, test))
        }
        .await;
        let (train_upload, test_upload) = match uploaded {
            Ok(u) => u,
            Err(e) => return Err(log.fail(running, e)),
        };
        log.finish(
            running,
            format!(
                "{} bytes",
                train_upload.total_bytes() + test_upload.total_bytes()
            ),
        );

        let running = log.start(Stage::Train);
        let spec = TrainingJobSpec::from_config(
            &config.training,
            training_channels(&train_upload.prefix, &test_upload.prefix),
        );
        let job = match launch(cloud, &session, &spec).await {
            Ok(j) => j,
            Err(e) => return Err(log.fail(running, e)),
        };
        log.finish(running, job.job_name.clone());

        let artifacts = match (&job.output_data, config.run.retrieve_artifacts) {
            (Some(output), true) => {
                let running = log.start(Stage::RetrieveArtifacts);
                let dest = config.run.artifacts_dir.join(&job.job_name);
                match retrieve_artifacts(cloud, output, &dest).await {
                    Ok(a) => {
                        log.finish(running, format!("{} plots", a.plots.len()));
                        Some(a)
                    }
                    Err(e) => return Err(log.fail(running, e)),
                }
            }
            (None, true) => {
                log.skip(Stage::RetrieveArtifacts, "job produced no output data");
                None
            }
            (_, false) => {
                log.skip(Stage::RetrieveArtifacts, "disabled");
                None
            }
        };

        let mut report = PipelineReport {
            run_id,
            session,
            train_data: train_upload.prefix,
            test_data: test_upload.prefix,
            job,
            artifacts,
            endpoint: None,
            predictions: Vec::new(),
            true_labels: Vec::new(),
            stages: Vec::new(),
            duration_ms: 0,
        };

        if config.run.deploy {
            let running = log.start(Stage::Deploy);
            let deploy_spec = DeploySpec::from_config(&config.hosting);
            let handle = match deploy(
                cloud,
                &report.session,
                &report.job.model_artifact,
                &deploy_spec,
            )
            .await
            {
                Ok(h) => h,
                Err(e) => return Err(log.fail(running, e)),
            };
            log.finish(running, handle.endpoint_name.clone());

            let running = log.start(Stage::Predict);
            let predicted = async {
                let samples = sample_images(&fetched.batches_dir, config.run.sample_count)?;
                let (images, labels): (Vec<_>, Vec<_>) = samples.into_iter().unzip();
                let predictions = predict(cloud, &handle, &images).await?;
                Ok::<_, crate::error::PipelineError>((predictions, labels))
            }
            .await;
            match predicted {
                Ok((predictions, labels)) => {
                    log.finish(running, format!("{} predictions", predictions.len()));
                    report.predictions = predictions;
                    report.true_labels = labels;
                }
                Err(e) => {
                    let err = log.fail(running, e);
                    if config.run.reclaim_on_failure {
                        if let Err(cleanup) = reclaim(cloud, handle).await {
                            warn!(error = %cleanup, "endpoint reclaim after failure failed");
                        }
                    } else {
                        warn!(endpoint = %handle.endpoint_name, "endpoint left running after failure");
                    }
                    return Err(err);
                }
            }

            if config.run.reclaim_endpoint {
                let running = log.start(Stage::Reclaim);
                let name = handle.endpoint_name.clone();
                if let Err(e) = reclaim(cloud, handle).await {
                    return Err(log.fail(running, e));
                }
                log.finish(running, name);
            } else {
                log.skip(Stage::Reclaim, "disabled");
                warn!(endpoint = %handle.endpoint_name, "endpoint left running");
                report.endpoint = Some(handle);
            }
        } else {
            for stage in [Stage::Deploy, Stage::Predict, Stage::Reclaim] {
                log.skip(stage, "deploy disabled");
            }
        }

        report.stages = log.into_results();
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            duration_ms = report.duration_ms,
            predictions = report.predictions.len(),
            accuracy = report.accuracy().unwrap_or(0.0),
            "pipeline finished"
        );
        Ok(report)
    }
}
