#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Lowering constraints into `ValidatingAdmissionPolicyBinding`s.
//!
//! Everything here is free of store I/O apart from API discovery; the
//! reconciler drives these pieces against the cluster.

pub mod convert;
pub mod gate;
pub mod probe;
pub mod template;
pub mod transform;

pub use self::{
    convert::{BindingConverter, ConvertError, V1ToV1Beta1},
    gate::{Gate, GateError},
    probe::{Discovery, FeatureProbe},
    template::TemplateError,
    transform::TransformError,
};
use gatekeeper_constraint_controller_core::{
    enforcement_action::{self, ActionError, BINDING_ENFORCEMENT_POINT},
    EnforcementAction,
};
use serde_json::{Map, Value};

/// Resolves the actions a binding should carry for a constraint.
///
/// Scoped constraints contribute the actions scoped to the binding
/// enforcement point. Simple actions only apply when bindings are generated
/// by default. An empty result means no binding should exist.
pub fn binding_actions(
    action: EnforcementAction,
    spec: Option<&Map<String, Value>>,
    generate_by_default: bool,
) -> Result<Vec<EnforcementAction>, ActionError> {
    match action {
        EnforcementAction::Scoped => {
            enforcement_action::actions_for_point(spec, BINDING_ENFORCEMENT_POINT)
        }
        EnforcementAction::Deny | EnforcementAction::Dryrun | EnforcementAction::Warn
            if generate_by_default =>
        {
            Ok(vec![action])
        }
        _ => Ok(vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_actions_follow_default() {
        assert_eq!(
            binding_actions(EnforcementAction::Deny, None, false),
            Ok(vec![])
        );
        assert_eq!(
            binding_actions(EnforcementAction::Deny, None, true),
            Ok(vec![EnforcementAction::Deny])
        );
        assert_eq!(
            binding_actions(EnforcementAction::Unrecognized, None, true),
            Ok(vec![])
        );
    }

    #[test]
    fn scoped_actions_ignore_default() {
        let spec = json!({
            "enforcementAction": "scoped",
            "scopedEnforcementActions": [
                { "action": "warn", "enforcementPoints": [{ "name": "vap.k8s.io" }] },
                { "action": "deny", "enforcementPoints": [{ "name": "validation.gatekeeper.sh" }] },
            ],
        });
        let spec = spec.as_object();
        assert_eq!(
            binding_actions(EnforcementAction::Scoped, spec, false),
            Ok(vec![EnforcementAction::Warn])
        );
    }
}
