//! REST backend for the managed service
//!
//! Speaks JSON over HTTPS with bearer-token auth. Every trait method maps to
//! exactly one request; non-2xx answers become `ServiceError::Api`.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServiceError;
use crate::service_traits::*;

/// REST backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Service base URL, e.g. `https://ml.eu-west-1.example.com`
    pub base_url: String,
    /// Bearer token (optional for local gateways)
    pub token: Option<String>,
}

impl RestConfig {
    pub fn new(base_url: &str) -> Self {
        RestConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }
}

/// `ManagedCloud` implementation backed by `reqwest`.
pub struct RestCloud {
    config: RestConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ObjectListing {
    keys: Vec<String>,
}

impl RestCloud {
    pub fn new(config: RestConfig) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cloudtrain/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(RestCloud { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Object keys keep their `/` separators; every other reserved byte is
    /// percent-encoded so `#`, `?` and spaces stay inside the path.
    fn object_path(uri: &ObjectUri) -> String {
        let key = uri
            .key()
            .split('/')
            .map(encode_segment)
            .collect::<Vec<_>>()
            .join("/");
        format!("buckets/{}/objects/{}", encode_segment(uri.bucket()), key)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = self.url(path);
        debug!(method = method.as_str(), url = url.as_str(), "service request");
        let builder = self.http.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(builder: reqwest::RequestBuilder) -> ServiceResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ServiceError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Narrow a 404 into the matching not-found variant.
fn not_found_as(err: ServiceError, mapped: impl FnOnce() -> ServiceError) -> ServiceError {
    match err {
        ServiceError::Api { status, .. } if status == StatusCode::NOT_FOUND.as_u16() => mapped(),
        other => other,
    }
}

#[async_trait]
impl IdentityProvider for RestCloud {
    async fn caller_identity(&self) -> ServiceResult<CallerIdentity> {
        let response = Self::send(self.request(reqwest::Method::GET, "identity")).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ObjectStore for RestCloud {
    async fn put_object(&self, uri: &ObjectUri, data: Vec<u8>) -> ServiceResult<()> {
        let builder = self
            .request(reqwest::Method::PUT, &Self::object_path(uri))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        Self::send(builder).await?;
        Ok(())
    }

    async fn get_object(&self, uri: &ObjectUri) -> ServiceResult<Vec<u8>> {
        let response = Self::send(self.request(reqwest::Method::GET, &Self::object_path(uri)))
            .await
            .map_err(|e| {
                not_found_as(e, || ServiceError::ObjectNotFound {
                    uri: uri.to_string(),
                })
            })?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn list_objects(&self, prefix: &ObjectUri) -> ServiceResult<Vec<ObjectUri>> {
        let builder = self
            .request(
                reqwest::Method::GET,
                &format!("buckets/{}/objects", prefix.bucket()),
            )
            .query(&[("prefix", prefix.key())]);
        let listing: ObjectListing = Self::send(builder).await?.json().await?;
        let mut uris: Vec<ObjectUri> = listing
            .keys
            .iter()
            .map(|key| ObjectUri::new(prefix.bucket(), key))
            .collect();
        uris.sort();
        Ok(uris)
    }
}

#[async_trait]
impl TrainingService for RestCloud {
    async fn create_training_job(&self, request: &TrainingJobRequest) -> ServiceResult<()> {
        let builder = self
            .request(reqwest::Method::POST, "training-jobs")
            .json(request);
        Self::send(builder).await.map_err(|e| match e {
            ServiceError::Api { status: 409, .. } => ServiceError::JobAlreadyExists {
                name: request.job_name.clone(),
            },
            other => other,
        })?;
        Ok(())
    }

    async fn describe_training_job(
        &self,
        job_name: &str,
    ) -> ServiceResult<TrainingJobDescription> {
        let response = Self::send(
            self.request(reqwest::Method::GET, &format!("training-jobs/{}", job_name)),
        )
        .await
        .map_err(|e| {
            not_found_as(e, || ServiceError::JobNotFound {
                name: job_name.to_string(),
            })
        })?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl HostingService for RestCloud {
    async fn create_model(&self, request: &ModelRequest) -> ServiceResult<()> {
        Self::send(self.request(reqwest::Method::POST, "models").json(request)).await?;
        Ok(())
    }

    async fn delete_model(&self, model_name: &str) -> ServiceResult<()> {
        Self::send(self.request(reqwest::Method::DELETE, &format!("models/{}", model_name)))
            .await
            .map_err(|e| {
                not_found_as(e, || ServiceError::ModelNotFound {
                    name: model_name.to_string(),
                })
            })?;
        Ok(())
    }

    async fn create_endpoint(&self, request: &EndpointRequest) -> ServiceResult<()> {
        Self::send(self.request(reqwest::Method::POST, "endpoints").json(request)).await?;
        Ok(())
    }

    async fn describe_endpoint(&self, endpoint_name: &str) -> ServiceResult<EndpointDescription> {
        let response = Self::send(
            self.request(reqwest::Method::GET, &format!("endpoints/{}", endpoint_name)),
        )
        .await
        .map_err(|e| {
            not_found_as(e, || ServiceError::EndpointNotFound {
                name: endpoint_name.to_string(),
            })
        })?;
        Ok(response.json().await?)
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> ServiceResult<()> {
        Self::send(self.request(
            reqwest::Method::DELETE,
            &format!("endpoints/{}", endpoint_name),
        ))
        .await
        .map_err(|e| {
            not_found_as(e, || ServiceError::EndpointNotFound {
                name: endpoint_name.to_string(),
            })
        })?;
        Ok(())
    }
}

#[async_trait]
impl PredictionService for RestCloud {
    async fn invoke_endpoint(
        &self,
        endpoint_name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> ServiceResult<Vec<u8>> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("endpoints/{}/invocations", endpoint_name),
            )
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);
        let response = Self::send(builder).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
