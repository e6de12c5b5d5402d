use crate::convert::{BindingConverter, ConvertError, V1ToV1Beta1};
use gatekeeper_constraint_controller_core::EnforcementAction;
use gatekeeper_constraint_controller_k8s_api::{
    admission_v1 as v1,
    binding::{binding_name, policy_name},
    dynamic::controller_owner_ref,
    template::template_name,
    Binding, BindingVersion, DynamicObject, DynamicRecord, LabelSelector, ObjectMeta,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("enforcement action {0} has no binding validation action")]
    UnsupportedAction(EnforcementAction),

    #[error("constraint is missing a kind")]
    MissingKind,

    #[error("constraint is missing the uid required for an owner reference")]
    MissingIdentity,

    #[error("invalid spec.match.{field}: {message}")]
    InvalidSelector {
        field: &'static str,
        message: String,
    },

    #[error(transparent)]
    Convert(#[from] ConvertError),
}

/// The API server's default for `matchResources.matchPolicy`.
pub const DEFAULT_MATCH_POLICY: &str = "Equivalent";

/// Maps an enforcement action onto a binding validation action.
pub fn validation_action(action: EnforcementAction) -> Result<&'static str, TransformError> {
    match action {
        EnforcementAction::Deny => Ok("Deny"),
        EnforcementAction::Warn => Ok("Warn"),
        EnforcementAction::Dryrun => Ok("Audit"),
        action => Err(TransformError::UnsupportedAction(action)),
    }
}

/// Builds the binding a constraint should have, in the richest schema.
pub fn binding_v1(
    constraint: &DynamicObject,
    actions: &[EnforcementAction],
) -> Result<v1::ValidatingAdmissionPolicyBinding, TransformError> {
    let kind = constraint.kind().ok_or(TransformError::MissingKind)?;
    let owner = controller_owner_ref(constraint).ok_or(TransformError::MissingIdentity)?;

    let mut validation_actions = Vec::with_capacity(actions.len());
    for action in actions {
        let action = validation_action(*action)?.to_string();
        if !validation_actions.contains(&action) {
            validation_actions.push(action);
        }
    }

    let object_selector = selector(constraint, "labelSelector")?;
    let namespace_selector = selector(constraint, "namespaceSelector")?;
    // Written in the form the API server stores, so a stored binding compares
    // equal to a freshly built one.
    let match_resources = if object_selector.is_some() || namespace_selector.is_some() {
        Some(v1::MatchResources {
            match_policy: Some(DEFAULT_MATCH_POLICY.to_string()),
            object_selector: Some(object_selector.unwrap_or_default()),
            namespace_selector: Some(namespace_selector.unwrap_or_default()),
            ..Default::default()
        })
    } else {
        None
    };

    Ok(v1::ValidatingAdmissionPolicyBinding {
        metadata: ObjectMeta {
            name: Some(binding_name(constraint.name())),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(v1::ValidatingAdmissionPolicyBindingSpec {
            policy_name: Some(policy_name(&template_name(kind))),
            param_ref: Some(v1::ParamRef {
                name: Some(constraint.name().to_string()),
                parameter_not_found_action: Some("Deny".to_string()),
                ..Default::default()
            }),
            match_resources,
            validation_actions: Some(validation_actions),
        }),
    })
}

/// Builds the binding a constraint should have in the given schema version.
pub fn binding(
    constraint: &DynamicObject,
    actions: &[EnforcementAction],
    version: BindingVersion,
) -> Result<Binding, TransformError> {
    let binding = binding_v1(constraint, actions)?;
    match version {
        BindingVersion::V1 => Ok(Binding::V1(binding)),
        BindingVersion::V1Beta1 => Ok(Binding::V1Beta1(V1ToV1Beta1.convert(&binding)?)),
    }
}

fn selector(
    constraint: &DynamicObject,
    field: &'static str,
) -> Result<Option<LabelSelector>, TransformError> {
    match constraint.nested(&["spec", "match", field]) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| TransformError::InvalidSelector {
                field,
                message: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_constraint_controller_k8s_api::{ApiResource, GroupVersionKind};
    use maplit::btreemap;
    use serde_json::json;

    fn constraint(spec: serde_json::Value) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("constraints.gatekeeper.sh", "v1beta1", "K8sRequiredLabels");
        let mut obj = DynamicObject::new("c", &ApiResource::from_gvk(&gvk)).data(json!({ "spec": spec }));
        obj.metadata.uid = Some("uid-c".to_string());
        obj
    }

    #[test]
    fn deny_binding() {
        let binding = binding_v1(&constraint(json!({})), &[EnforcementAction::Deny]).unwrap();
        assert_eq!(binding.metadata.name.as_deref(), Some("gatekeeper-c"));

        let owner = &binding.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "uid-c");
        assert_eq!(owner.controller, Some(true));

        let spec = binding.spec.unwrap();
        assert_eq!(spec.policy_name.as_deref(), Some("gatekeeper-k8srequiredlabels"));
        assert_eq!(spec.validation_actions, Some(vec!["Deny".to_string()]));
        let param_ref = spec.param_ref.unwrap();
        assert_eq!(param_ref.name.as_deref(), Some("c"));
        assert_eq!(param_ref.parameter_not_found_action.as_deref(), Some("Deny"));
        assert!(spec.match_resources.is_none());
    }

    #[test]
    fn dryrun_audits() {
        let binding = binding_v1(
            &constraint(json!({})),
            &[EnforcementAction::Dryrun, EnforcementAction::Warn, EnforcementAction::Dryrun],
        )
        .unwrap();
        assert_eq!(
            binding.spec.unwrap().validation_actions,
            Some(vec!["Audit".to_string(), "Warn".to_string()])
        );
    }

    #[test]
    fn selectors_from_match() {
        let c = constraint(json!({
            "match": {
                "labelSelector": { "matchLabels": { "app": "web" } },
                "namespaceSelector": { "matchLabels": { "team": "a" } },
            },
        }));
        let resources = binding_v1(&c, &[EnforcementAction::Deny])
            .unwrap()
            .spec
            .unwrap()
            .match_resources
            .unwrap();
        assert_eq!(
            resources.object_selector.unwrap().match_labels,
            Some(btreemap! { "app".to_string() => "web".to_string() })
        );
        assert_eq!(
            resources.namespace_selector.unwrap().match_labels,
            Some(btreemap! { "team".to_string() => "a".to_string() })
        );
    }

    #[test]
    fn match_resources_are_defaulted() {
        let c = constraint(json!({
            "match": { "labelSelector": { "matchLabels": { "app": "web" } } },
        }));
        let resources = binding_v1(&c, &[EnforcementAction::Deny])
            .unwrap()
            .spec
            .unwrap()
            .match_resources
            .unwrap();
        assert_eq!(resources.match_policy.as_deref(), Some("Equivalent"));
        assert_eq!(resources.namespace_selector, Some(LabelSelector::default()));
        assert!(resources.object_selector.unwrap().match_labels.is_some());
    }

    #[test]
    fn invalid_selector() {
        let c = constraint(json!({ "match": { "labelSelector": "app=web" } }));
        assert!(matches!(
            binding_v1(&c, &[EnforcementAction::Deny]),
            Err(TransformError::InvalidSelector { field: "labelSelector", .. })
        ));
    }

    #[test]
    fn requires_uid() {
        let mut c = constraint(json!({}));
        c.metadata.uid = None;
        assert_eq!(
            binding_v1(&c, &[EnforcementAction::Deny]),
            Err(TransformError::MissingIdentity)
        );
    }

    #[test]
    fn legacy_version_rejects_audit() {
        let c = constraint(json!({}));
        let b = binding(&c, &[EnforcementAction::Warn], BindingVersion::V1Beta1).unwrap();
        assert_eq!(b.version(), BindingVersion::V1Beta1);
        assert_eq!(b.validation_actions(), vec!["Warn".to_string()]);

        assert_eq!(
            binding(&c, &[EnforcementAction::Dryrun], BindingVersion::V1Beta1),
            Err(TransformError::Convert(ConvertError::UnsupportedEnforcementAction(
                "Audit".to_string()
            )))
        );
    }
}
