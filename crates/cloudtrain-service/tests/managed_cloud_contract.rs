//! Trait-level contract checks, run against the in-memory backend through
//! `dyn` references the way callers hold it.

use std::collections::BTreeMap;
use std::sync::Arc;

use cloudtrain_service::fakes::{JobOutcome, MemoryCloud};
use cloudtrain_service::{
    EndpointRequest, EndpointStatus, HostingService, JobStatus, ModelRequest, ObjectStore,
    ObjectUri, PredictionService, ResourceSpec, ScriptRef, ServiceError, TrainingJobRequest,
    TrainingService,
};

fn resources() -> ResourceSpec {
    ResourceSpec {
        instance_type: "ml.m4.xlarge".to_string(),
        instance_count: 1,
    }
}

async fn submit(cloud: &MemoryCloud, name: &str) {
    let bundle = ObjectUri::new("bucket", format!("{}/source/sourcedir.tar.gz", name));
    cloud.put_object(&bundle, vec![0x1f, 0x8b]).await.unwrap();
    let request = TrainingJobRequest {
        job_name: name.to_string(),
        script: ScriptRef {
            entry_point: "train.py".to_string(),
            source_bundle: bundle,
        },
        image: "training-image".to_string(),
        role: "role".to_string(),
        resources: resources(),
        hyperparameters: BTreeMap::from([("epochs".to_string(), "1".to_string())]),
        channels: BTreeMap::from([("train".to_string(), ObjectUri::new("bucket", "data/train"))]),
        output_path: ObjectUri::new("bucket", "jobs"),
    };
    cloud.create_training_job(&request).await.unwrap();
}

#[tokio::test]
async fn test_object_store_through_trait_object() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryCloud::new());
    let uri: ObjectUri = "s3://bucket/a/b.npy".parse().unwrap();
    store.put_object(&uri, b"npy".to_vec()).await.unwrap();
    assert_eq!(store.get_object(&uri).await.unwrap(), b"npy".to_vec());

    let missing = store
        .get_object(&ObjectUri::new("bucket", "a/c.npy"))
        .await
        .unwrap_err();
    assert!(matches!(missing, ServiceError::ObjectNotFound { .. }));
}

#[tokio::test]
async fn test_stopped_job_is_terminal_without_artifact() {
    let cloud = MemoryCloud::new()
        .with_job_outcome(JobOutcome::Stop)
        .with_polls_until_done(0);
    submit(&cloud, "job-stop").await;

    let training: &dyn TrainingService = &cloud;
    let description = training.describe_training_job("job-stop").await.unwrap();
    assert_eq!(description.status, JobStatus::Stopped);
    assert!(description.status.is_terminal());
    assert!(description.model_artifact.is_none());
    assert!(description.finished_at.is_some());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let cloud = MemoryCloud::new();
    let err = cloud.describe_training_job("ghost").await.unwrap_err();
    assert!(matches!(err, ServiceError::JobNotFound { ref name } if name == "ghost"));
}

#[tokio::test]
async fn test_endpoint_lifecycle() {
    let cloud = MemoryCloud::new().with_polls_until_done(1);
    submit(&cloud, "job-1").await;
    let done = cloud.describe_training_job("job-1").await.unwrap();
    assert_eq!(done.status, JobStatus::InProgress);
    let done = cloud.describe_training_job("job-1").await.unwrap();
    let artifact = done.model_artifact.unwrap();

    let hosting: &dyn HostingService = &cloud;
    hosting
        .create_model(&ModelRequest {
            model_name: "m".to_string(),
            image: "serving-image".to_string(),
            model_artifact: artifact,
            role: "role".to_string(),
        })
        .await
        .unwrap();
    hosting
        .create_endpoint(&EndpointRequest {
            endpoint_name: "e".to_string(),
            model_name: "m".to_string(),
            resources: resources(),
        })
        .await
        .unwrap();

    assert_eq!(
        hosting.describe_endpoint("e").await.unwrap().status,
        EndpointStatus::Creating
    );
    let rejected = cloud
        .invoke_endpoint("e", "application/json", b"{\"instances\": []}".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(rejected, ServiceError::Api { status: 400, .. }));

    assert_eq!(
        hosting.describe_endpoint("e").await.unwrap().status,
        EndpointStatus::InService
    );
    let body = cloud
        .invoke_endpoint(
            "e",
            "application/json",
            b"{\"instances\": [[0.95, 0.95], [0.0]]}".to_vec(),
        )
        .await
        .unwrap();
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let predictions = response["predictions"].as_array().unwrap();
    assert_eq!(predictions.len(), 2);
    assert_eq!(predictions[0][9], 0.55);
    assert_eq!(predictions[1][0], 0.55);

    hosting.delete_endpoint("e").await.unwrap();
    hosting.delete_model("m").await.unwrap();
    assert!(cloud.live_endpoints().is_empty());
    assert!(matches!(
        hosting.delete_endpoint("e").await.unwrap_err(),
        ServiceError::EndpointNotFound { .. }
    ));
}

#[tokio::test]
async fn test_endpoint_requires_registered_model() {
    let cloud = MemoryCloud::new();
    let err = cloud
        .create_endpoint(&EndpointRequest {
            endpoint_name: "e".to_string(),
            model_name: "nope".to_string(),
            resources: resources(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ModelNotFound { .. }));
}
