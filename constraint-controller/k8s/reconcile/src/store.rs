use gatekeeper_constraint_controller_k8s_api::{
    self as k8s, admission_v1, admission_v1beta1, constraint_api_resource, Binding,
    BindingVersion, ConstraintPodStatus, ConstraintTemplate, DynamicObject, GroupVersionKind,
};

/// Reads and writes the cluster objects a reconcile touches.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_constraint(
        &self,
        gvk: &GroupVersionKind,
        name: &str,
    ) -> Result<DynamicObject, StoreError>;

    async fn get_template(&self, name: &str) -> Result<ConstraintTemplate, StoreError>;

    async fn get_pod_status(&self, name: &str) -> Result<ConstraintPodStatus, StoreError>;

    async fn create_pod_status(
        &self,
        status: &ConstraintPodStatus,
    ) -> Result<ConstraintPodStatus, StoreError>;

    /// Writes only the status of an existing record.
    async fn update_pod_status(
        &self,
        status: &ConstraintPodStatus,
    ) -> Result<ConstraintPodStatus, StoreError>;

    async fn delete_pod_status(&self, name: &str) -> Result<(), StoreError>;

    async fn get_binding(&self, version: BindingVersion, name: &str)
        -> Result<Binding, StoreError>;

    async fn create_binding(&self, binding: &Binding) -> Result<Binding, StoreError>;

    async fn update_binding(&self, binding: &Binding) -> Result<Binding, StoreError>;

    async fn delete_binding(&self, version: BindingVersion, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// The resource type itself is not served, typically because its CRD
    /// was just removed.
    #[error("no resource matches kind {0}")]
    NoKindMatch(String),

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// A store backed by the Kubernetes API.
///
/// Pod status records live in a single namespace.
#[derive(Clone)]
pub struct KubeStore {
    client: k8s::Client,
    namespace: String,
}

// === impl StoreError ===

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the object should be treated as gone.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoKindMatch(_))
    }

    fn from_api(what: String, error: k8s::Error) -> Self {
        // The API server answers requests for unknown resource types with a
        // bare 404 and this message rather than a typed not-found status.
        const NO_RESOURCE: &str = "the server could not find the requested resource";
        match error {
            k8s::Error::Api(rsp) if rsp.code == 404 && rsp.message == NO_RESOURCE => {
                Self::NoKindMatch(what)
            }
            k8s::Error::Api(rsp) if rsp.code == 404 => Self::NotFound(what),
            error => Self::Api(error),
        }
    }
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: k8s::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn pod_statuses(&self) -> k8s::Api<ConstraintPodStatus> {
        k8s::Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn v1(&self) -> k8s::Api<admission_v1::ValidatingAdmissionPolicyBinding> {
        k8s::Api::all(self.client.clone())
    }

    fn v1beta1(&self) -> k8s::Api<admission_v1beta1::ValidatingAdmissionPolicyBinding> {
        k8s::Api::all(self.client.clone())
    }
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get_constraint(
        &self,
        gvk: &GroupVersionKind,
        name: &str,
    ) -> Result<DynamicObject, StoreError> {
        let api = k8s::Api::<DynamicObject>::all_with(
            self.client.clone(),
            &constraint_api_resource(gvk),
        );
        api.get(name)
            .await
            .map_err(|e| StoreError::from_api(format!("{}/{name}", gvk.kind), e))
    }

    async fn get_template(&self, name: &str) -> Result<ConstraintTemplate, StoreError> {
        k8s::Api::<ConstraintTemplate>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|e| StoreError::from_api(format!("ConstraintTemplate/{name}"), e))
    }

    async fn get_pod_status(&self, name: &str) -> Result<ConstraintPodStatus, StoreError> {
        self.pod_statuses()
            .get(name)
            .await
            .map_err(|e| StoreError::from_api(format!("ConstraintPodStatus/{name}"), e))
    }

    async fn create_pod_status(
        &self,
        status: &ConstraintPodStatus,
    ) -> Result<ConstraintPodStatus, StoreError> {
        let created = self
            .pod_statuses()
            .create(&k8s::PostParams::default(), status)
            .await?;
        // Creation ignores the status sub-resource.
        if status.status.is_some() {
            let mut status = status.clone();
            status.metadata = created.metadata;
            return self.update_pod_status(&status).await;
        }
        Ok(created)
    }

    async fn update_pod_status(
        &self,
        status: &ConstraintPodStatus,
    ) -> Result<ConstraintPodStatus, StoreError> {
        let name = status.metadata.name.as_deref().unwrap_or_default();
        let patch = status_patch(status);
        self.pod_statuses()
            .patch_status(name, &k8s::PatchParams::default(), &k8s::Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_api(format!("ConstraintPodStatus/{name}"), e))
    }

    async fn delete_pod_status(&self, name: &str) -> Result<(), StoreError> {
        self.pod_statuses()
            .delete(name, &k8s::DeleteParams::default())
            .await
            .map_err(|e| StoreError::from_api(format!("ConstraintPodStatus/{name}"), e))?;
        Ok(())
    }

    async fn get_binding(
        &self,
        version: BindingVersion,
        name: &str,
    ) -> Result<Binding, StoreError> {
        let what = format!("{}/{name}", BindingVersion::KIND);
        match version {
            BindingVersion::V1 => self.v1().get(name).await.map(Binding::V1),
            BindingVersion::V1Beta1 => self.v1beta1().get(name).await.map(Binding::V1Beta1),
        }
        .map_err(|e| StoreError::from_api(what, e))
    }

    async fn create_binding(&self, binding: &Binding) -> Result<Binding, StoreError> {
        let pp = k8s::PostParams::default();
        let created = match binding {
            Binding::V1(b) => self.v1().create(&pp, b).await.map(Binding::V1)?,
            Binding::V1Beta1(b) => self.v1beta1().create(&pp, b).await.map(Binding::V1Beta1)?,
        };
        Ok(created)
    }

    async fn update_binding(&self, binding: &Binding) -> Result<Binding, StoreError> {
        let pp = k8s::PostParams::default();
        let name = binding.name();
        match binding {
            Binding::V1(b) => self.v1().replace(name, &pp, b).await.map(Binding::V1),
            Binding::V1Beta1(b) => self.v1beta1().replace(name, &pp, b).await.map(Binding::V1Beta1),
        }
        .map_err(|e| StoreError::from_api(format!("{}/{name}", BindingVersion::KIND), e))
    }

    async fn delete_binding(&self, version: BindingVersion, name: &str) -> Result<(), StoreError> {
        let dp = k8s::DeleteParams::default();
        match version {
            BindingVersion::V1 => self.v1().delete(name, &dp).await.map(|_| ()),
            BindingVersion::V1Beta1 => self.v1beta1().delete(name, &dp).await.map(|_| ()),
        }
        .map_err(|e| StoreError::from_api(format!("{}/{name}", BindingVersion::KIND), e))
    }
}

/// The merge patch that replaces a record's status.
pub(crate) fn status_patch(status: &ConstraintPodStatus) -> serde_json::Value {
    serde_json::json!({ "status": status.status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> k8s::Error {
        k8s::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors() {
        let e = StoreError::from_api("K/c".to_string(), api_error(404, "k \"c\" not found"));
        assert!(e.is_not_found());

        let e = StoreError::from_api(
            "K/c".to_string(),
            api_error(404, "the server could not find the requested resource"),
        );
        assert!(matches!(e, StoreError::NoKindMatch(_)));
        assert!(e.is_absent());
        assert!(!e.is_not_found());

        let e = StoreError::from_api("K/c".to_string(), api_error(500, "boom"));
        assert!(!e.is_absent());
    }
}
