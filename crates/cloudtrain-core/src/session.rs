//! Execution identity for the managed environment.

use serde::{Deserialize, Serialize};
use tracing::info;

use cloudtrain_service::{IdentityProvider, ObjectUri};

use crate::config::PipelineConfig;
use crate::error::Result;

/// Who the pipeline runs as and where it keeps its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub role: String,
    pub account: String,
    pub region: String,
    pub default_bucket: String,
}

impl Session {
    /// Resolve identity from the service, letting configuration pin the role
    /// and bucket.
    pub async fn resolve<I>(identity: &I, config: &PipelineConfig) -> Result<Self>
    where
        I: IdentityProvider + ?Sized,
    {
        let caller = identity.caller_identity().await?;
        let region = config.service.region.clone();
        let role = config.session.role.clone().unwrap_or(caller.role);
        let default_bucket = config
            .session
            .bucket
            .clone()
            .unwrap_or_else(|| default_bucket_name(&region, &caller.account));

        info!(
            account = %caller.account,
            role = %role,
            bucket = %default_bucket,
            "session resolved"
        );
        Ok(Session {
            role,
            account: caller.account,
            region,
            default_bucket,
        })
    }

    /// `s3://<default bucket>/<key>`
    pub fn object(&self, key: impl AsRef<str>) -> ObjectUri {
        ObjectUri::new(self.default_bucket.clone(), key)
    }
}

pub fn default_bucket_name(region: &str, account: &str) -> String {
    format!("cloudtrain-{}-{}", region, account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudtrain_service::fakes::MemoryCloud;

    #[tokio::test]
    async fn test_resolve_from_service() {
        let cloud = MemoryCloud::new();
        let session = Session::resolve(&cloud, &PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(session.account, "123456789012");
        assert!(session.role.ends_with("role/cloudtrain-execution"));
        assert_eq!(session.default_bucket, "cloudtrain-eu-west-1-123456789012");
    }

    #[tokio::test]
    async fn test_config_pins_role_and_bucket() {
        let cloud = MemoryCloud::new();
        let mut config = PipelineConfig::default();
        config.session.role = Some("arn:role/custom".to_string());
        config.session.bucket = Some("my-bucket".to_string());
        let session = Session::resolve(&cloud, &config).await.unwrap();
        assert_eq!(session.role, "arn:role/custom");
        assert_eq!(session.default_bucket, "my-bucket");
        assert_eq!(
            session.object("data/train").to_string(),
            "s3://my-bucket/data/train"
        );
    }
}
