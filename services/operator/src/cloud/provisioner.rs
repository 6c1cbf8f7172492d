//! Idempotent provisioning on top of a [`CloudClient`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{CloudClient, CloudError, CloudServer, InstanceSpec, ProvisionedInstance, TokenCache};
use crate::config::CloudConfig;
use crate::request::RequestId;

/// Image, flavor and network used for every server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDefaults {
    pub image_ref: String,
    pub flavor_ref: String,
    pub network_id: String,
}

impl From<&CloudConfig> for InstanceDefaults {
    fn from(config: &CloudConfig) -> Self {
        Self {
            image_ref: config.image_ref.clone(),
            flavor_ref: config.flavor_ref.clone(),
            network_id: config.network_id.clone(),
        }
    }
}

/// Provisions servers with a cached token and bounded calls.
pub struct CloudProvisioner {
    client: Arc<dyn CloudClient>,
    tokens: TokenCache,
    defaults: InstanceDefaults,
    timeout: Duration,
}

impl CloudProvisioner {
    pub fn new(client: Arc<dyn CloudClient>, defaults: InstanceDefaults, timeout: Duration) -> Self {
        Self {
            tokens: TokenCache::new(Arc::clone(&client), timeout),
            client,
            defaults,
            timeout,
        }
    }

    /// Ensures a server named `name` exists for `request_id`.
    ///
    /// An existing server with the exact name is returned as-is, so repeating
    /// the call after a crash or duplicate dispatch never creates a second one.
    pub async fn ensure_instance(
        &self,
        name: &str,
        request_id: RequestId,
    ) -> Result<ProvisionedInstance, CloudError> {
        let token = self.tokens.token().await?;

        if let Some(existing) = self.bounded(&token, self.client.find_server(&token, name)).await? {
            info!(
                request_id = %request_id,
                name = %existing.name,
                cloud_instance_id = %existing.id,
                "Reusing existing cloud instance"
            );
            return Ok(provisioned(existing, Some(request_id), true));
        }

        let server = self.create(&token, name).await?;
        Ok(provisioned(server, Some(request_id), false))
    }

    /// Creates a server without a prior lookup. Used for standing capacity,
    /// whose names are unique per tick.
    pub async fn create_standing_instance(&self, name: &str) -> Result<ProvisionedInstance, CloudError> {
        let token = self.tokens.token().await?;
        let server = self.create(&token, name).await?;
        Ok(provisioned(server, None, false))
    }

    /// Lists servers whose name starts with `prefix`.
    pub async fn list_instances(&self, prefix: &str) -> Result<Vec<CloudServer>, CloudError> {
        let token = self.tokens.token().await?;
        self.bounded(&token, self.client.list_servers(&token, prefix)).await
    }

    /// Deletes the server named `name`, returning its id if one existed.
    pub async fn terminate_instance(&self, name: &str) -> Result<Option<String>, CloudError> {
        let token = self.tokens.token().await?;
        let Some(server) = self.bounded(&token, self.client.find_server(&token, name)).await? else {
            debug!(name = %name, "No cloud instance to terminate");
            return Ok(None);
        };
        self.bounded(&token, self.client.delete_server(&token, &server.id)).await?;
        info!(name = %name, cloud_instance_id = %server.id, "Cloud instance terminated");
        Ok(Some(server.id))
    }

    async fn create(&self, token: &str, name: &str) -> Result<CloudServer, CloudError> {
        let spec = InstanceSpec {
            name: name.to_string(),
            image_ref: self.defaults.image_ref.clone(),
            flavor_ref: self.defaults.flavor_ref.clone(),
            network_id: self.defaults.network_id.clone(),
        };
        debug!(name = %name, image_ref = %spec.image_ref, flavor_ref = %spec.flavor_ref, "Creating cloud instance");

        let server = self.bounded(token, self.client.create_server(token, &spec)).await?;
        info!(name = %server.name, cloud_instance_id = %server.id, "Cloud instance created");
        Ok(server)
    }

    /// Applies the call timeout and drops `token` if the provider rejected it.
    async fn bounded<T, F>(&self, token: &str, call: F) -> Result<T, CloudError>
    where
        F: Future<Output = Result<T, CloudError>>,
    {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout(self.timeout)),
        };
        if let Err(CloudError::Auth(reason)) = &result {
            warn!(reason = %reason, "Cloud token rejected, invalidating");
            self.tokens.invalidate(token).await;
        }
        result
    }
}

fn provisioned(server: CloudServer, request_id: Option<RequestId>, reused: bool) -> ProvisionedInstance {
    ProvisionedInstance {
        cloud_instance_id: server.id,
        name: server.name,
        request_id,
        created_at: Utc::now(),
        reused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloud;

    fn defaults() -> InstanceDefaults {
        InstanceDefaults {
            image_ref: "img".into(),
            flavor_ref: "flv".into(),
            network_id: "net".into(),
        }
    }

    #[tokio::test]
    async fn test_ensure_instance_creates_once() {
        let cloud = Arc::new(MockCloud::new());
        let provisioner = CloudProvisioner::new(cloud.clone(), defaults(), Duration::from_secs(5));

        let first = provisioner
            .ensure_instance("Instance-7", RequestId::new(7))
            .await
            .unwrap();
        assert!(!first.reused);
        assert_eq!(first.request_id, Some(RequestId::new(7)));

        let second = provisioner
            .ensure_instance("Instance-7", RequestId::new(7))
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.cloud_instance_id, first.cloud_instance_id);
        assert_eq!(cloud.create_calls(), 1);
        assert_eq!(cloud.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_timeout() {
        let cloud = Arc::new(MockCloud::new());
        cloud.delay_create("Instance-9", Duration::from_millis(200));
        let provisioner = CloudProvisioner::new(cloud, defaults(), Duration::from_millis(20));

        let err = provisioner
            .ensure_instance("Instance-9", RequestId::new(9))
            .await
            .unwrap_err();
        assert_eq!(err, CloudError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_standing_instance_skips_lookup() {
        let cloud = Arc::new(MockCloud::new());
        let provisioner = CloudProvisioner::new(cloud.clone(), defaults(), Duration::from_secs(5));

        let instance = provisioner
            .create_standing_instance("Instance-standing-a")
            .await
            .unwrap();
        assert_eq!(instance.request_id, None);
        assert_eq!(cloud.find_calls(), 0);
        assert_eq!(cloud.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_terminate_instance() {
        let cloud = Arc::new(MockCloud::new());
        cloud.insert_server("i-042", "Instance-42");
        let provisioner = CloudProvisioner::new(cloud.clone(), defaults(), Duration::from_secs(5));

        let removed = provisioner.terminate_instance("Instance-42").await.unwrap();
        assert_eq!(removed.as_deref(), Some("i-042"));
        assert!(cloud.servers().is_empty());

        assert_eq!(provisioner.terminate_instance("Instance-42").await.unwrap(), None);
        assert_eq!(cloud.delete_calls(), 1);
    }
}
