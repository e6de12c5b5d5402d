//! Conversion between binding schema versions.
//!
//! The upstream conversion registry mis-handles this version pair, so fields
//! are mapped by hand. Only fields known to be safe are converted; anything
//! else that is populated fails the conversion instead of being dropped.
//! Revalidate this list whenever the k8s-openapi dependency is upgraded.

use gatekeeper_constraint_controller_k8s_api::{admission_v1 as v1, admission_v1beta1 as v1beta1};

pub trait BindingConverter {
    type From;
    type To;

    fn convert(&self, from: &Self::From) -> Result<Self::To, ConvertError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("enforcement action {0:?} cannot be represented by ValidatingAdmissionPolicyBinding v1beta1")]
    UnsupportedEnforcementAction(String),

    #[error("field {0} is not converted to ValidatingAdmissionPolicyBinding v1beta1")]
    UnsupportedField(&'static str),
}

/// Converts `admissionregistration.k8s.io/v1` bindings to `v1beta1`.
#[derive(Copy, Clone, Debug, Default)]
pub struct V1ToV1Beta1;

impl BindingConverter for V1ToV1Beta1 {
    type From = v1::ValidatingAdmissionPolicyBinding;
    type To = v1beta1::ValidatingAdmissionPolicyBinding;

    fn convert(&self, from: &Self::From) -> Result<Self::To, ConvertError> {
        let spec = match from.spec.as_ref() {
            Some(spec) => Some(v1beta1::ValidatingAdmissionPolicyBindingSpec {
                policy_name: spec.policy_name.clone(),
                param_ref: spec.param_ref.as_ref().map(param_ref),
                match_resources: spec.match_resources.as_ref().map(match_resources).transpose()?,
                validation_actions: spec
                    .validation_actions
                    .as_ref()
                    .map(|actions| validation_actions(actions))
                    .transpose()?,
            }),
            None => None,
        };
        Ok(v1beta1::ValidatingAdmissionPolicyBinding {
            metadata: from.metadata.clone(),
            spec,
        })
    }
}

fn param_ref(from: &v1::ParamRef) -> v1beta1::ParamRef {
    v1beta1::ParamRef {
        name: from.name.clone(),
        namespace: from.namespace.clone(),
        parameter_not_found_action: from.parameter_not_found_action.clone(),
        selector: from.selector.clone(),
    }
}

fn match_resources(from: &v1::MatchResources) -> Result<v1beta1::MatchResources, ConvertError> {
    if from.resource_rules.is_some() {
        return Err(ConvertError::UnsupportedField("matchResources.resourceRules"));
    }
    if from.exclude_resource_rules.is_some() {
        return Err(ConvertError::UnsupportedField(
            "matchResources.excludeResourceRules",
        ));
    }
    Ok(v1beta1::MatchResources {
        match_policy: from.match_policy.clone(),
        namespace_selector: from.namespace_selector.clone(),
        object_selector: from.object_selector.clone(),
        ..Default::default()
    })
}

/// The legacy version only understands `Deny` and `Warn`.
fn validation_actions(actions: &[String]) -> Result<Vec<String>, ConvertError> {
    actions
        .iter()
        .map(|action| match action.as_str() {
            "Deny" | "Warn" => Ok(action.clone()),
            _ => Err(ConvertError::UnsupportedEnforcementAction(action.clone())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_constraint_controller_k8s_api::{LabelSelector, ObjectMeta};
    use maplit::btreemap;

    fn binding(spec: v1::ValidatingAdmissionPolicyBindingSpec) -> v1::ValidatingAdmissionPolicyBinding {
        v1::ValidatingAdmissionPolicyBinding {
            metadata: ObjectMeta {
                name: Some("gatekeeper-c".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
        }
    }

    fn actions(actions: &[&str]) -> Option<Vec<String>> {
        Some(actions.iter().map(|a| a.to_string()).collect())
    }

    #[test]
    fn deny_and_warn_convert() {
        let from = binding(v1::ValidatingAdmissionPolicyBindingSpec {
            validation_actions: actions(&["Deny", "Warn"]),
            ..Default::default()
        });
        let to = V1ToV1Beta1.convert(&from).unwrap();
        assert_eq!(
            to.spec.unwrap().validation_actions,
            actions(&["Deny", "Warn"])
        );
        assert_eq!(to.metadata, from.metadata);
    }

    #[test]
    fn audit_is_unsupported() {
        let from = binding(v1::ValidatingAdmissionPolicyBindingSpec {
            validation_actions: actions(&["Deny", "Audit"]),
            ..Default::default()
        });
        assert_eq!(
            V1ToV1Beta1.convert(&from),
            Err(ConvertError::UnsupportedEnforcementAction("Audit".to_string()))
        );
    }

    #[test]
    fn policy_name() {
        let from = binding(v1::ValidatingAdmissionPolicyBindingSpec {
            policy_name: Some("gatekeeper-k8srequiredlabels".to_string()),
            ..Default::default()
        });
        let spec = V1ToV1Beta1.convert(&from).unwrap().spec.unwrap();
        assert_eq!(spec.policy_name.as_deref(), Some("gatekeeper-k8srequiredlabels"));
        assert_eq!(spec.validation_actions, None);
    }

    #[test]
    fn param_ref_fields() {
        let from = binding(v1::ValidatingAdmissionPolicyBindingSpec {
            param_ref: Some(v1::ParamRef {
                name: Some("c".to_string()),
                namespace: Some("ns".to_string()),
                parameter_not_found_action: Some("Deny".to_string()),
                selector: None,
            }),
            ..Default::default()
        });
        let param_ref = V1ToV1Beta1.convert(&from).unwrap().spec.unwrap().param_ref.unwrap();
        assert_eq!(param_ref.name.as_deref(), Some("c"));
        assert_eq!(param_ref.namespace.as_deref(), Some("ns"));
        assert_eq!(param_ref.parameter_not_found_action.as_deref(), Some("Deny"));
    }

    #[test]
    fn selectors() {
        let selector = LabelSelector {
            match_labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
            ..Default::default()
        };
        let from = binding(v1::ValidatingAdmissionPolicyBindingSpec {
            match_resources: Some(v1::MatchResources {
                object_selector: Some(selector.clone()),
                namespace_selector: Some(selector.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let resources = V1ToV1Beta1
            .convert(&from)
            .unwrap()
            .spec
            .unwrap()
            .match_resources
            .unwrap();
        assert_eq!(resources.object_selector, Some(selector.clone()));
        assert_eq!(resources.namespace_selector, Some(selector));
    }

    #[test]
    fn resource_rules_are_not_converted() {
        let from = binding(v1::ValidatingAdmissionPolicyBindingSpec {
            match_resources: Some(v1::MatchResources {
                resource_rules: Some(vec![Default::default()]),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(
            V1ToV1Beta1.convert(&from),
            Err(ConvertError::UnsupportedField("matchResources.resourceRules"))
        );
    }
}
