use k8s_openapi::api::admissionregistration::{v1, v1beta1};
use kube::api::ObjectMeta;
use std::fmt;

/// Prefix applied to every generated binding and policy name.
pub const NAME_PREFIX: &str = "gatekeeper-";

/// Schema versions of `ValidatingAdmissionPolicyBinding` the controller can emit.
///
/// Only one of them is used in a given cluster, chosen by discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindingVersion {
    V1,
    V1Beta1,
}

/// A binding in whichever schema version the cluster serves.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    V1(v1::ValidatingAdmissionPolicyBinding),
    V1Beta1(v1beta1::ValidatingAdmissionPolicyBinding),
}

// === impl BindingVersion ===

impl BindingVersion {
    pub const GROUP: &'static str = "admissionregistration.k8s.io";
    pub const KIND: &'static str = "ValidatingAdmissionPolicyBinding";

    /// Versions in order of preference.
    pub const PREFERRED: [Self; 2] = [Self::V1, Self::V1Beta1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V1Beta1 => "v1beta1",
        }
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", Self::GROUP, self.as_str())
    }
}

impl fmt::Display for BindingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Binding ===

impl Binding {
    pub fn version(&self) -> BindingVersion {
        match self {
            Self::V1(_) => BindingVersion::V1,
            Self::V1Beta1(_) => BindingVersion::V1Beta1,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::V1(b) => &b.metadata,
            Self::V1Beta1(b) => &b.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::V1(b) => &mut b.metadata,
            Self::V1Beta1(b) => &mut b.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Returns true if both bindings carry the same version and spec.
    pub fn spec_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::V1(a), Self::V1(b)) => a.spec == b.spec,
            (Self::V1Beta1(a), Self::V1Beta1(b)) => a.spec == b.spec,
            _ => false,
        }
    }

    /// Copies `desired`'s spec onto this binding, keeping its identity.
    ///
    /// Returns false if the versions differ and nothing was copied.
    pub fn copy_spec_from(&mut self, desired: &Self) -> bool {
        match (self, desired) {
            (Self::V1(current), Self::V1(desired)) => {
                current.spec = desired.spec.clone();
                true
            }
            (Self::V1Beta1(current), Self::V1Beta1(desired)) => {
                current.spec = desired.spec.clone();
                true
            }
            _ => false,
        }
    }

    /// The validation actions declared by the binding.
    pub fn validation_actions(&self) -> Vec<String> {
        let actions = match self {
            Self::V1(b) => b.spec.as_ref().and_then(|s| s.validation_actions.clone()),
            Self::V1Beta1(b) => b.spec.as_ref().and_then(|s| s.validation_actions.clone()),
        };
        actions.unwrap_or_default()
    }
}

/// Name of the binding generated for a constraint.
pub fn binding_name(constraint: &str) -> String {
    format!("{NAME_PREFIX}{constraint}")
}

/// Name of the policy generated for a template.
pub fn policy_name(template: &str) -> String {
    format!("{NAME_PREFIX}{template}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1(name: &str, actions: &[&str]) -> Binding {
        Binding::V1(v1::ValidatingAdmissionPolicyBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(v1::ValidatingAdmissionPolicyBindingSpec {
                validation_actions: Some(actions.iter().map(|a| a.to_string()).collect()),
                ..Default::default()
            }),
        })
    }

    #[test]
    fn names() {
        assert_eq!(binding_name("c"), "gatekeeper-c");
        assert_eq!(policy_name("k8srequiredlabels"), "gatekeeper-k8srequiredlabels");
        assert_eq!(
            BindingVersion::V1Beta1.api_version(),
            "admissionregistration.k8s.io/v1beta1"
        );
    }

    #[test]
    fn copies_spec_keeping_identity() {
        let mut current = v1("gatekeeper-c", &["Deny"]);
        let desired = v1("ignored", &["Warn"]);
        assert!(!current.spec_eq(&desired));

        assert!(current.copy_spec_from(&desired));
        assert!(current.spec_eq(&desired));
        assert_eq!(current.name(), "gatekeeper-c");
        assert_eq!(current.metadata().resource_version.as_deref(), Some("7"));
        assert_eq!(current.validation_actions(), vec!["Warn".to_string()]);
    }

    #[test]
    fn versions_never_mix() {
        let mut current = v1("gatekeeper-c", &["Deny"]);
        let other = Binding::V1Beta1(Default::default());
        assert!(!current.spec_eq(&other));
        assert!(!current.copy_spec_from(&other));
        assert_eq!(current.version(), BindingVersion::V1);
    }
}
