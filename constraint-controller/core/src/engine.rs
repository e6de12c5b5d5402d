use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gatekeeper_constraint_controller_k8s_api::{DynamicObject, DynamicRecord};
use parking_lot::RwLock;
use std::sync::Arc;

/// The policy engine's index of active constraints.
///
/// The engine itself evaluates admission requests elsewhere; the controller
/// only keeps its index in sync with the cluster.
#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn add_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError>;

    /// Fails with [`EngineError::MissingConstraint`] if the constraint was
    /// never added.
    async fn remove_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError>;

    async fn get_constraint(&self, constraint: &DynamicObject)
        -> Result<DynamicObject, EngineError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("constraint {kind}/{name} is not known to the engine")]
    MissingConstraint { kind: String, name: String },

    #[error("no template is registered for constraint kind {0}")]
    MissingTemplate(String),

    #[error("constraint is missing a kind")]
    MissingKind,

    #[error("constraint rejected by the engine: {0}")]
    Rejected(String),
}

/// Compares the parts of two constraints the engine acts on.
///
/// Metadata such as resource versions changes on every write and is ignored.
pub fn semantic_eq(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.kind() == b.kind()
        && a.name() == b.name()
        && a.nested(&["spec"]) == b.nested(&["spec"])
        && a.metadata.labels == b.metadata.labels
}

/// An in-memory engine index.
///
/// Constraints may only be added for kinds whose template has been
/// registered.
#[derive(Clone, Debug, Default)]
pub struct Index(Arc<RwLock<Inner>>);

#[derive(Debug, Default)]
struct Inner {
    templates: HashSet<String>,
    constraints: HashMap<(String, String), DynamicObject>,
}

// === impl Index ===

impl Index {
    pub fn add_template(&self, kind: impl Into<String>) {
        self.0.write().templates.insert(kind.into());
    }

    /// Drops a template along with every constraint of its kind.
    pub fn remove_template(&self, kind: &str) {
        let mut inner = self.0.write();
        inner.templates.remove(kind);
        inner.constraints.retain(|(k, _), _| k != kind);
    }

    pub fn constraint_count(&self) -> usize {
        self.0.read().constraints.len()
    }

    fn key(constraint: &DynamicObject) -> Result<(String, String), EngineError> {
        let kind = constraint.kind().ok_or(EngineError::MissingKind)?;
        Ok((kind.to_string(), constraint.name().to_string()))
    }
}

#[async_trait::async_trait]
impl PolicyEngine for Index {
    async fn add_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError> {
        let key = Self::key(constraint)?;
        let mut inner = self.0.write();
        if !inner.templates.contains(&key.0) {
            return Err(EngineError::MissingTemplate(key.0));
        }
        if constraint.spec().is_none() && constraint.nested(&["spec"]).is_some() {
            return Err(EngineError::Rejected("spec must be an object".to_string()));
        }
        tracing::trace!(kind = %key.0, name = %key.1, "Indexed constraint");
        inner.constraints.insert(key, constraint.clone());
        Ok(())
    }

    async fn remove_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError> {
        let key = Self::key(constraint)?;
        match self.0.write().constraints.remove(&key) {
            Some(_) => Ok(()),
            None => Err(EngineError::MissingConstraint {
                kind: key.0,
                name: key.1,
            }),
        }
    }

    async fn get_constraint(
        &self,
        constraint: &DynamicObject,
    ) -> Result<DynamicObject, EngineError> {
        let key = Self::key(constraint)?;
        self.0
            .read()
            .constraints
            .get(&key)
            .cloned()
            .ok_or(EngineError::MissingConstraint {
                kind: key.0,
                name: key.1,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_constraint_controller_k8s_api::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn constraint(name: &str, spec: serde_json::Value) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("constraints.gatekeeper.sh", "v1beta1", "K8sRequiredLabels");
        DynamicObject::new(name, &ApiResource::from_gvk(&gvk)).data(json!({ "spec": spec }))
    }

    #[tokio::test]
    async fn requires_template() {
        let index = Index::default();
        let c = constraint("c", json!({}));
        assert_eq!(
            index.add_constraint(&c).await,
            Err(EngineError::MissingTemplate("K8sRequiredLabels".to_string()))
        );

        index.add_template("K8sRequiredLabels");
        index.add_constraint(&c).await.unwrap();
        assert!(semantic_eq(&index.get_constraint(&c).await.unwrap(), &c));
    }

    #[tokio::test]
    async fn remove_missing_is_distinguished() {
        let index = Index::default();
        let c = constraint("c", json!({}));
        assert!(matches!(
            index.remove_constraint(&c).await,
            Err(EngineError::MissingConstraint { .. })
        ));
    }

    #[tokio::test]
    async fn removing_template_drops_constraints() {
        let index = Index::default();
        index.add_template("K8sRequiredLabels");
        index.add_constraint(&constraint("a", json!({}))).await.unwrap();
        index.add_constraint(&constraint("b", json!({}))).await.unwrap();
        assert_eq!(index.constraint_count(), 2);

        index.remove_template("K8sRequiredLabels");
        assert_eq!(index.constraint_count(), 0);
    }

    #[test]
    fn semantic_eq_ignores_resource_version() {
        let a = constraint("c", json!({ "enforcementAction": "deny" }));
        let mut b = a.clone();
        b.metadata.resource_version = Some("42".to_string());
        assert!(semantic_eq(&a, &b));

        let c = constraint("c", json!({ "enforcementAction": "warn" }));
        assert!(!semantic_eq(&a, &c));
    }
}
