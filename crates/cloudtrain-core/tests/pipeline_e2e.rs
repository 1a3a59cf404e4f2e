//! End-to-end pipeline runs against the in-memory managed service.

use std::path::Path;

use cloudtrain_core::command::create_tar_gz;
use cloudtrain_core::dataset::{BATCHES_DIR, PLANE_BYTES, TEST_BATCH, TRAIN_BATCHES};
use cloudtrain_core::{PipelineConfig, PipelineError, Stage, TrainingPipeline};
use cloudtrain_service::fakes::{JobOutcome, MemoryCloud};
use cloudtrain_service::ServiceError;
use tempfile::TempDir;

const TEST_IMAGES: usize = 12;

/// Every plane holds `25 * label + 5`, which the fake endpoint maps back to
/// `label`.
fn record(label: u8) -> Vec<u8> {
    let value = 25 * label + 5;
    let mut out = vec![label];
    out.extend(vec![value; PLANE_BYTES * 3]);
    out
}

async fn fixture() -> (TempDir, PipelineConfig) {
    let root = tempfile::tempdir().unwrap();
    let staging = root.path().join("staging");
    let batches = staging.join(BATCHES_DIR);
    std::fs::create_dir_all(&batches).unwrap();
    for name in TRAIN_BATCHES {
        let bytes: Vec<u8> = (0..2u8).flat_map(record).collect();
        std::fs::write(batches.join(name), bytes).unwrap();
    }
    let test: Vec<u8> = (0..TEST_IMAGES).flat_map(|i| record((i % 10) as u8)).collect();
    std::fs::write(batches.join(TEST_BATCH), test).unwrap();

    let archive = root.path().join("cifar.tar.gz");
    create_tar_gz(&staging, &archive).await.unwrap();

    let scripts = root.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("train.py"), "print('train')\n").unwrap();

    let mut config = PipelineConfig::default();
    config.dataset.url = format!("file://{}", archive.display());
    config.dataset.work_dir = root.path().join("work");
    config.dataset.expected_train = 10;
    config.dataset.expected_test = TEST_IMAGES;
    config.training.source_dir = scripts;
    config.training.poll_interval_secs = 0;
    config.hosting.poll_interval_secs = 0;
    config.run.artifacts_dir = root.path().join("artifacts");
    config.validate().unwrap();
    (root, config)
}

fn assert_exists(path: &Path) {
    assert!(path.exists(), "{} should exist", path.display());
}

#[tokio::test]
async fn test_full_run_predicts_in_order_and_reclaims() {
    let (root, config) = fixture().await;
    let cloud = MemoryCloud::new().with_polls_until_done(2);

    let report = TrainingPipeline::run(&cloud, &config).await.unwrap();

    assert_eq!(report.predictions.len(), 10);
    let labels: Vec<usize> = report.predictions.iter().map(|p| p.label).collect();
    assert_eq!(labels, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(report.true_labels, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(report.accuracy(), Some(1.0));
    assert_eq!(report.predictions[3].class_name, "cat");

    assert!(cloud.live_endpoints().is_empty());
    assert!(cloud.registered_models().is_empty());
    assert_eq!(cloud.deleted_endpoints().len(), 1);
    assert_eq!(cloud.invocation_count(), 1);
    assert!(report.endpoint.is_none());

    let stages: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());

    let jobs = cloud.submitted_jobs();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.channels["train"], report.train_data);
    assert_eq!(job.channels["test"], report.test_data);
    assert_eq!(job.hyperparameters["epochs"], "10");
    assert!(!job.hyperparameters.contains_key("learning-rate"));

    let keys: Vec<String> = cloud.object_uris().iter().map(|u| u.to_string()).collect();
    assert!(keys
        .iter()
        .any(|k| k.ends_with("data/cloudtrain-cifar10/train/x_train.npy")));
    assert!(keys
        .iter()
        .any(|k| k.ends_with("data/cloudtrain-cifar10/test/y_test.npy")));
    assert!(keys.iter().any(|k| k.ends_with("source/sourcedir.tar.gz")));

    assert_exists(&root.path().join("work/data/train/x_train.npy"));
    assert_exists(&config.run.artifacts_dir.join(&report.job.job_name));
}

#[tokio::test]
async fn test_prediction_failure_still_reclaims_endpoint() {
    let (_root, config) = fixture().await;
    let cloud = MemoryCloud::new().with_failing_invocations();

    let err = TrainingPipeline::run(&cloud, &config).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Service(ServiceError::Api { status: 500, .. })
    ));
    assert!(cloud.live_endpoints().is_empty());
    assert!(cloud.registered_models().is_empty());
    assert_eq!(cloud.deleted_endpoints().len(), 1);
}

#[tokio::test]
async fn test_prediction_failure_without_reclaim_leaves_endpoint() {
    let (_root, mut config) = fixture().await;
    config.run.reclaim_on_failure = false;
    let cloud = MemoryCloud::new().with_failing_invocations();

    assert!(TrainingPipeline::run(&cloud, &config).await.is_err());
    assert_eq!(cloud.live_endpoints().len(), 1);
}

#[tokio::test]
async fn test_job_failure_propagates_before_deploy() {
    let (_root, config) = fixture().await;
    let cloud = MemoryCloud::new().with_job_outcome(JobOutcome::Fail("AlgorithmError".into()));

    let err = TrainingPipeline::run(&cloud, &config).await.unwrap_err();

    match err {
        PipelineError::JobFailed { status, .. } => assert!(status.contains("AlgorithmError")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(cloud.registered_models().is_empty());
    assert!(cloud.deleted_endpoints().is_empty());
}

#[tokio::test]
async fn test_endpoint_failure_leaves_nothing_running() {
    let (_root, config) = fixture().await;
    let cloud = MemoryCloud::new().with_endpoint_failure("insufficient capacity");

    let err = TrainingPipeline::run(&cloud, &config).await.unwrap_err();

    assert!(matches!(err, PipelineError::EndpointFailed { .. }));
    assert!(cloud.live_endpoints().is_empty());
    assert!(cloud.registered_models().is_empty());
}

#[tokio::test]
async fn test_endpoint_kept_when_reclaim_disabled() {
    let (_root, mut config) = fixture().await;
    config.run.reclaim_endpoint = false;
    let cloud = MemoryCloud::new();

    let report = TrainingPipeline::run(&cloud, &config).await.unwrap();

    let handle = report.endpoint.clone().unwrap();
    assert_eq!(cloud.live_endpoints(), vec![handle.endpoint_name.clone()]);
    assert_eq!(report.stages.len(), Stage::ALL.len() - 1);
    cloudtrain_core::reclaim(&cloud, handle).await.unwrap();
    assert!(cloud.live_endpoints().is_empty());
}

#[tokio::test]
async fn test_deploy_disabled_stops_after_training() {
    let (_root, mut config) = fixture().await;
    config.run.deploy = false;
    config.run.retrieve_artifacts = false;
    let cloud = MemoryCloud::new();

    let report = TrainingPipeline::run(&cloud, &config).await.unwrap();

    assert!(report.predictions.is_empty());
    assert!(report.accuracy().is_none());
    assert!(report.artifacts.is_none());
    assert!(cloud.registered_models().is_empty());
    assert_eq!(
        report.stages.last().map(|s| s.stage),
        Some(Stage::Train)
    );
}

#[tokio::test]
async fn test_missing_entry_point_is_config_error() {
    let (root, mut config) = fixture().await;
    config.training.source_dir = root.path().join("nowhere");
    let cloud = MemoryCloud::new();

    let err = TrainingPipeline::run(&cloud, &config).await.unwrap_err();

    assert!(matches!(err, PipelineError::Config(_)));
    assert!(cloud.submitted_jobs().is_empty());
}
