//! Endpoint deployment and teardown.
//!
//! An [`EndpointHandle`] stands for a live, billable endpoint. It is only
//! released by passing it to [`reclaim`]; nothing expires it.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cloudtrain_service::{
    EndpointRequest, EndpointStatus, HostingService, ModelRequest, ObjectUri, ResourceSpec,
};

use crate::config::HostingConfig;
use crate::error::{PipelineError, Result};
use crate::session::Session;
use crate::training::unique_name;

/// Reference to a live endpoint and the model registered for it.
#[must_use = "a live endpoint keeps billing until it is passed to `reclaim`"]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHandle {
    pub endpoint_name: String,
    pub model_name: String,
}

impl EndpointHandle {
    /// Rebuild a handle for an endpoint created by an earlier run.
    pub fn attach(endpoint_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            model_name: model_name.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploySpec {
    pub base_name: String,
    pub image: String,
    pub resources: ResourceSpec,
    pub poll_interval: Duration,
}

impl DeploySpec {
    pub fn from_config(config: &HostingConfig) -> Self {
        Self {
            base_name: config.base_name.clone(),
            image: config.image.clone(),
            resources: ResourceSpec {
                instance_type: config.instance_type.clone(),
                instance_count: config.instance_count,
            },
            poll_interval: config.poll_interval(),
        }
    }
}

/// Register the model, create the endpoint and wait until it is in service.
///
/// If provisioning fails the endpoint and model are deleted before the
/// failure is returned, since the caller never receives a handle for them.
pub async fn deploy<H>(
    hosting: &H,
    session: &Session,
    model_artifact: &ObjectUri,
    spec: &DeploySpec,
) -> Result<EndpointHandle>
where
    H: HostingService + ?Sized,
{
    let name = unique_name(&spec.base_name, Utc::now());
    let handle = EndpointHandle::attach(name.clone(), name);

    hosting
        .create_model(&ModelRequest {
            model_name: handle.model_name.clone(),
            image: spec.image.clone(),
            model_artifact: model_artifact.clone(),
            role: session.role.clone(),
        })
        .await?;

    let created = hosting
        .create_endpoint(&EndpointRequest {
            endpoint_name: handle.endpoint_name.clone(),
            model_name: handle.model_name.clone(),
            resources: spec.resources.clone(),
        })
        .await;
    if let Err(err) = created {
        if let Err(cleanup) = hosting.delete_model(&handle.model_name).await {
            warn!(model = %handle.model_name, error = %cleanup, "model cleanup failed");
        }
        return Err(err.into());
    }
    info!(
        endpoint = %handle.endpoint_name,
        instance_type = %spec.resources.instance_type,
        "endpoint requested"
    );

    if let Err(err) = wait_in_service(hosting, &handle.endpoint_name, spec.poll_interval).await {
        warn!(endpoint = %handle.endpoint_name, error = %err, "endpoint provisioning failed");
        let endpoint_name = handle.endpoint_name.clone();
        if let Err(cleanup) = reclaim(hosting, handle).await {
            warn!(endpoint = %endpoint_name, error = %cleanup, "endpoint cleanup failed");
        }
        return Err(err);
    }

    info!(endpoint = %handle.endpoint_name, "endpoint in service");
    Ok(handle)
}

/// Poll until the endpoint is `InService`. A `Failed` status becomes
/// `EndpointFailed`; describe errors are returned as-is.
async fn wait_in_service<H>(
    hosting: &H,
    endpoint_name: &str,
    poll_interval: Duration,
) -> Result<()>
where
    H: HostingService + ?Sized,
{
    loop {
        let description = hosting.describe_endpoint(endpoint_name).await?;
        match description.status {
            EndpointStatus::InService => return Ok(()),
            EndpointStatus::Failed(reason) => {
                return Err(PipelineError::EndpointFailed {
                    endpoint_name: endpoint_name.to_string(),
                    reason,
                });
            }
            EndpointStatus::Creating | EndpointStatus::Deleting => {
                debug!(endpoint = endpoint_name, "endpoint provisioning");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

/// Delete the endpoint, then its model. Consumes the handle.
pub async fn reclaim<H>(hosting: &H, handle: EndpointHandle) -> Result<()>
where
    H: HostingService + ?Sized,
{
    hosting.delete_endpoint(&handle.endpoint_name).await?;
    hosting.delete_model(&handle.model_name).await?;
    info!(endpoint = %handle.endpoint_name, "endpoint reclaimed");
    Ok(())
}
