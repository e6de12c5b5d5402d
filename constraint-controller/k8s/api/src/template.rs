use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares a constraint kind and the policy code that backs it.
///
/// The controller never evaluates the code; it only reads the declared kind
/// and the per-engine generation flags.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "templates.gatekeeper.sh", version = "v1", kind = "ConstraintTemplate")]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplateSpec {
    #[serde(default)]
    pub crd: Crd,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Crd {
    #[serde(default)]
    pub spec: CrdSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CrdSpec {
    #[serde(default)]
    pub names: Names,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Names {
    #[serde(default)]
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Target {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rego: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Code>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Code {
    pub engine: String,
    /// Engine-specific source; opaque to this controller.
    #[serde(default)]
    pub source: serde_json::Value,
}

// === impl ConstraintTemplate ===

impl ConstraintTemplate {
    /// The constraint kind this template declares.
    pub fn constraint_kind(&self) -> &str {
        &self.spec.crd.spec.names.kind
    }

    /// Returns the code block for `engine`, if the template declares one.
    pub fn code_for(&self, engine: &str) -> Option<&Code> {
        self.spec
            .targets
            .iter()
            .flat_map(|t| t.code.iter())
            .find(|c| c.engine == engine)
    }
}

/// Templates are named after the lower-cased kind they declare.
pub fn template_name(kind: &str) -> String {
    kind.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_template() {
        let spec: ConstraintTemplateSpec = serde_json::from_value(json!({
            "crd": { "spec": { "names": { "kind": "K8sRequiredLabels" } } },
            "targets": [{
                "target": "admission.k8s.gatekeeper.sh",
                "rego": "package k8srequiredlabels",
                "code": [{
                    "engine": "K8sNativeValidation",
                    "source": { "generateVAP": true, "validations": [] },
                }],
            }],
        }))
        .unwrap();
        let template = ConstraintTemplate::new("k8srequiredlabels", spec);

        assert_eq!(template.constraint_kind(), "K8sRequiredLabels");
        let code = template.code_for("K8sNativeValidation").unwrap();
        assert_eq!(code.source["generateVAP"], json!(true));
        assert!(template.code_for("Rego").is_none());
        assert_eq!(template_name("K8sRequiredLabels"), "k8srequiredlabels");
    }
}
