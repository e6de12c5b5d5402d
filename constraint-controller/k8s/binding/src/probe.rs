use gatekeeper_constraint_controller_k8s_api::{self as k8s, BindingVersion};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Answers whether the API server serves a kind at a group version.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    async fn serves(&self, api_version: &str, kind: &str) -> Result<bool, k8s::Error>;
}

#[async_trait::async_trait]
impl Discovery for k8s::Client {
    async fn serves(&self, api_version: &str, kind: &str) -> Result<bool, k8s::Error> {
        match self.list_api_group_resources(api_version).await {
            Ok(list) => Ok(list.resources.iter().any(|r| r.kind == kind)),
            // The group version itself is not served.
            Err(k8s::Error::Api(error)) if error.code == 404 => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Discovers, once per process, which binding schema version the cluster
/// serves.
///
/// The API server's feature set does not change during the process lifetime,
/// so the first answer (including a failed probe) is kept.
#[derive(Clone)]
pub struct FeatureProbe {
    discovery: Arc<dyn Discovery>,
    version: Arc<RwLock<Option<Option<BindingVersion>>>>,
}

// === impl FeatureProbe ===

impl FeatureProbe {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            version: Default::default(),
        }
    }

    /// The binding version to generate, or `None` if bindings are unavailable.
    pub async fn version(&self) -> Option<BindingVersion> {
        if let Some(version) = *self.version.read().await {
            return version;
        }

        let mut cached = self.version.write().await;
        // Another task may have probed while we waited for the write lock.
        if let Some(version) = *cached {
            return version;
        }
        let version = self.discover().await;
        *cached = Some(version);
        version
    }

    pub async fn is_available(&self) -> bool {
        self.version().await.is_some()
    }

    async fn discover(&self) -> Option<BindingVersion> {
        for version in BindingVersion::PREFERRED {
            match self
                .discovery
                .serves(&version.api_version(), BindingVersion::KIND)
                .await
            {
                Ok(true) => {
                    tracing::info!(%version, "ValidatingAdmissionPolicyBinding API available");
                    return Some(version);
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%version, %error, "Failed to discover ValidatingAdmissionPolicyBinding API");
                    return None;
                }
            }
        }
        tracing::info!("ValidatingAdmissionPolicyBinding API not available");
        None
    }
}

impl std::fmt::Debug for FeatureProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureProbe").finish_non_exhaustive()
    }
}
