//! In-memory fake of the managed service (testing only)
//!
//! `MemoryCloud` satisfies every service trait without any network access.
//! Training jobs and endpoints reach their terminal state after a configurable
//! number of `describe_*` polls, so poll loops are exercised too.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ServiceError;
use crate::service_traits::*;

/// How submitted training jobs end.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Complete,
    Fail(String),
    Stop,
}

#[derive(Debug)]
struct JobState {
    request: TrainingJobRequest,
    description: TrainingJobDescription,
    polls_left: u32,
}

#[derive(Debug)]
struct EndpointState {
    description: EndpointDescription,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct CloudState {
    objects: BTreeMap<ObjectUri, Vec<u8>>,
    jobs: HashMap<String, JobState>,
    models: HashMap<String, ModelRequest>,
    endpoints: HashMap<String, EndpointState>,
    deleted_endpoints: Vec<String>,
    invocations: usize,
}

/// In-memory managed service.
#[derive(Debug)]
pub struct MemoryCloud {
    identity: CallerIdentity,
    job_outcome: JobOutcome,
    endpoint_failure: Option<String>,
    fail_invocations: bool,
    polls_until_done: u32,
    model_archive: Vec<u8>,
    output_archive: Vec<u8>,
    state: Mutex<CloudState>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self {
            identity: CallerIdentity {
                account: "123456789012".to_string(),
                role: "arn:cloud:iam::123456789012:role/cloudtrain-execution".to_string(),
            },
            job_outcome: JobOutcome::Complete,
            endpoint_failure: None,
            fail_invocations: false,
            polls_until_done: 1,
            model_archive: b"model".to_vec(),
            output_archive: Vec::new(),
            state: Mutex::new(CloudState::default()),
        }
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal outcome of every submitted job.
    pub fn with_job_outcome(mut self, outcome: JobOutcome) -> Self {
        self.job_outcome = outcome;
        self
    }

    /// Endpoints fail to provision with this reason.
    pub fn with_endpoint_failure(mut self, reason: impl Into<String>) -> Self {
        self.endpoint_failure = Some(reason.into());
        self
    }

    /// Every endpoint invocation returns a 500.
    pub fn with_failing_invocations(mut self) -> Self {
        self.fail_invocations = true;
        self
    }

    /// Number of `describe_*` calls that still report a non-terminal state.
    pub fn with_polls_until_done(mut self, polls: u32) -> Self {
        self.polls_until_done = polls;
        self
    }

    /// Bytes written as `output.tar.gz` when a job completes.
    pub fn with_output_archive(mut self, bytes: Vec<u8>) -> Self {
        self.output_archive = bytes;
        self
    }

    /// Requests of every submitted job, in no particular order.
    pub fn submitted_jobs(&self) -> Vec<TrainingJobRequest> {
        let state = self.state.lock().unwrap();
        state.jobs.values().map(|j| j.request.clone()).collect()
    }

    /// Endpoints that exist and have not been deleted.
    pub fn live_endpoints(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn deleted_endpoints(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_endpoints.clone()
    }

    pub fn registered_models(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.models.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn invocation_count(&self) -> usize {
        self.state.lock().unwrap().invocations
    }

    /// All stored object URIs, sorted.
    pub fn object_uris(&self) -> Vec<ObjectUri> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    fn finish_job(&self, state: &mut CloudState, job_name: &str) {
        let Some(job) = state.jobs.get_mut(job_name) else {
            return;
        };
        let output = job.request.output_path.join(job_name).join("output");
        let model_uri = output.join("model.tar.gz");
        let output_uri = output.join("output.tar.gz");
        job.description.finished_at = Some(Utc::now());
        job.description.status = match &self.job_outcome {
            JobOutcome::Complete => {
                job.description.model_artifact = Some(model_uri.clone());
                job.description.output_data = Some(output_uri.clone());
                JobStatus::Completed
            }
            JobOutcome::Fail(reason) => JobStatus::Failed(reason.clone()),
            JobOutcome::Stop => JobStatus::Stopped,
        };
        if matches!(self.job_outcome, JobOutcome::Complete) {
            state.objects.insert(model_uri, self.model_archive.clone());
            state.objects.insert(output_uri, self.output_archive.clone());
        }
    }
}

#[async_trait]
impl IdentityProvider for MemoryCloud {
    async fn caller_identity(&self) -> ServiceResult<CallerIdentity> {
        Ok(self.identity.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryCloud {
    async fn put_object(&self, uri: &ObjectUri, data: Vec<u8>) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(uri.clone(), data);
        Ok(())
    }

    async fn get_object(&self, uri: &ObjectUri) -> ServiceResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(uri)
            .cloned()
            .ok_or_else(|| ServiceError::ObjectNotFound {
                uri: uri.to_string(),
            })
    }

    async fn list_objects(&self, prefix: &ObjectUri) -> ServiceResult<Vec<ObjectUri>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .keys()
            .filter(|uri| uri.bucket() == prefix.bucket() && uri.key().starts_with(prefix.key()))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TrainingService for MemoryCloud {
    async fn create_training_job(&self, request: &TrainingJobRequest) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&request.job_name) {
            return Err(ServiceError::JobAlreadyExists {
                name: request.job_name.clone(),
            });
        }
        if !state.objects.contains_key(&request.script.source_bundle) {
            return Err(ServiceError::ObjectNotFound {
                uri: request.script.source_bundle.to_string(),
            });
        }
        let description = TrainingJobDescription {
            job_name: request.job_name.clone(),
            status: JobStatus::InProgress,
            model_artifact: None,
            output_data: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        state.jobs.insert(
            request.job_name.clone(),
            JobState {
                request: request.clone(),
                description,
                polls_left: self.polls_until_done,
            },
        );
        Ok(())
    }

    async fn describe_training_job(
        &self,
        job_name: &str,
    ) -> ServiceResult<TrainingJobDescription> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| ServiceError::JobNotFound {
                name: job_name.to_string(),
            })?;
        if job.description.status.is_terminal() {
            return Ok(job.description.clone());
        }
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(job.description.clone());
        }
        self.finish_job(&mut state, job_name);
        Ok(state.jobs[job_name].description.clone())
    }
}

#[async_trait]
impl HostingService for MemoryCloud {
    async fn create_model(&self, request: &ModelRequest) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(&request.model_artifact) {
            return Err(ServiceError::ObjectNotFound {
                uri: request.model_artifact.to_string(),
            });
        }
        state
            .models
            .insert(request.model_name.clone(), request.clone());
        Ok(())
    }

    async fn delete_model(&self, model_name: &str) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .models
            .remove(model_name)
            .map(|_| ())
            .ok_or_else(|| ServiceError::ModelNotFound {
                name: model_name.to_string(),
            })
    }

    async fn create_endpoint(&self, request: &EndpointRequest) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.models.contains_key(&request.model_name) {
            return Err(ServiceError::ModelNotFound {
                name: request.model_name.clone(),
            });
        }
        if state.endpoints.contains_key(&request.endpoint_name) {
            return Err(ServiceError::Api {
                status: 400,
                message: format!("endpoint {} already exists", request.endpoint_name),
            });
        }
        state.endpoints.insert(
            request.endpoint_name.clone(),
            EndpointState {
                description: EndpointDescription {
                    endpoint_name: request.endpoint_name.clone(),
                    model_name: request.model_name.clone(),
                    status: EndpointStatus::Creating,
                    created_at: Utc::now(),
                },
                polls_left: self.polls_until_done,
            },
        );
        Ok(())
    }

    async fn describe_endpoint(&self, endpoint_name: &str) -> ServiceResult<EndpointDescription> {
        let mut state = self.state.lock().unwrap();
        let endpoint =
            state
                .endpoints
                .get_mut(endpoint_name)
                .ok_or_else(|| ServiceError::EndpointNotFound {
                    name: endpoint_name.to_string(),
                })?;
        if endpoint.description.status == EndpointStatus::Creating {
            if endpoint.polls_left > 0 {
                endpoint.polls_left -= 1;
            } else {
                endpoint.description.status = match &self.endpoint_failure {
                    Some(reason) => EndpointStatus::Failed(reason.clone()),
                    None => EndpointStatus::InService,
                };
            }
        }
        Ok(endpoint.description.clone())
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.endpoints.remove(endpoint_name).is_none() {
            return Err(ServiceError::EndpointNotFound {
                name: endpoint_name.to_string(),
            });
        }
        state.deleted_endpoints.push(endpoint_name.to_string());
        Ok(())
    }
}

#[async_trait]
impl PredictionService for MemoryCloud {
    /// Answers `{"instances": [...]}` with one probability vector per instance.
    /// The peak class is `floor(mean pixel value * 10)`, so callers can steer it.
    async fn invoke_endpoint(
        &self,
        endpoint_name: &str,
        _content_type: &str,
        body: Vec<u8>,
    ) -> ServiceResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let endpoint =
            state
                .endpoints
                .get(endpoint_name)
                .ok_or_else(|| ServiceError::EndpointNotFound {
                    name: endpoint_name.to_string(),
                })?;
        if endpoint.description.status != EndpointStatus::InService {
            return Err(ServiceError::Api {
                status: 400,
                message: format!("endpoint {} is not in service", endpoint_name),
            });
        }
        state.invocations += 1;
        if self.fail_invocations {
            return Err(ServiceError::Api {
                status: 500,
                message: "model container crashed".to_string(),
            });
        }

        let request: Value = serde_json::from_slice(&body)?;
        let instances = request["instances"]
            .as_array()
            .ok_or_else(|| ServiceError::Api {
                status: 400,
                message: "missing instances".to_string(),
            })?;
        let predictions: Vec<Vec<f32>> = instances
            .iter()
            .map(|instance| {
                let (sum, count) = sum_numbers(instance);
                let mean = if count == 0 { 0.0 } else { sum / count as f64 };
                let peak = ((mean * 10.0) as usize).min(9);
                (0..10)
                    .map(|class| if class == peak { 0.55 } else { 0.05 })
                    .collect()
            })
            .collect();
        Ok(serde_json::to_vec(&json!({ "predictions": predictions }))?)
    }
}

fn sum_numbers(value: &Value) -> (f64, usize) {
    match value {
        Value::Number(n) => (n.as_f64().unwrap_or(0.0), 1),
        Value::Array(items) => items.iter().fold((0.0, 0), |(s, c), item| {
            let (si, ci) = sum_numbers(item);
            (s + si, c + ci)
        }),
        _ => (0.0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_request(cloud_bundle: &ObjectUri) -> TrainingJobRequest {
        TrainingJobRequest {
            job_name: "job-1".to_string(),
            script: ScriptRef {
                entry_point: "train.py".to_string(),
                source_bundle: cloud_bundle.clone(),
            },
            image: "tensorflow-training:2.13".to_string(),
            role: "role".to_string(),
            resources: ResourceSpec {
                instance_type: "ml.p3.2xlarge".to_string(),
                instance_count: 1,
            },
            hyperparameters: BTreeMap::new(),
            channels: BTreeMap::new(),
            output_path: ObjectUri::new("bucket", "jobs"),
        }
    }

    #[tokio::test]
    async fn job_completes_after_polls_and_writes_artifacts() {
        let cloud = MemoryCloud::new().with_polls_until_done(2);
        let bundle = ObjectUri::new("bucket", "src/sourcedir.tar.gz");
        cloud.put_object(&bundle, vec![1]).await.unwrap();
        cloud.create_training_job(&job_request(&bundle)).await.unwrap();

        for _ in 0..2 {
            let desc = cloud.describe_training_job("job-1").await.unwrap();
            assert_eq!(desc.status, JobStatus::InProgress);
        }
        let desc = cloud.describe_training_job("job-1").await.unwrap();
        assert_eq!(desc.status, JobStatus::Completed);
        let model = desc.model_artifact.unwrap();
        assert_eq!(model.to_string(), "s3://bucket/jobs/job-1/output/model.tar.gz");
        assert_eq!(cloud.get_object(&model).await.unwrap(), b"model".to_vec());
    }

    #[tokio::test]
    async fn duplicate_job_name_rejected() {
        let cloud = MemoryCloud::new();
        let bundle = ObjectUri::new("bucket", "src/sourcedir.tar.gz");
        cloud.put_object(&bundle, vec![1]).await.unwrap();
        cloud.create_training_job(&job_request(&bundle)).await.unwrap();
        let err = cloud
            .create_training_job(&job_request(&bundle))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::JobAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn list_objects_filters_by_prefix() {
        let cloud = MemoryCloud::new();
        for key in ["data/train/a", "data/train/b", "data/test/c"] {
            cloud
                .put_object(&ObjectUri::new("bucket", key), vec![])
                .await
                .unwrap();
        }
        let listed = cloud
            .list_objects(&ObjectUri::new("bucket", "data/train"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn invoking_unknown_endpoint_fails() {
        let cloud = MemoryCloud::new();
        let err = cloud
            .invoke_endpoint("nope", "application/json", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EndpointNotFound { .. }));
    }
}
