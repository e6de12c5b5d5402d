use gatekeeper_constraint_controller_k8s_api::ConstraintTemplate;
use serde_json::Value;

/// The engine whose code can be lowered into admission policies.
pub const NATIVE_VALIDATION_ENGINE: &str = "K8sNativeValidation";

/// Source flag opting a template in or out of policy generation.
pub const GENERATE_FLAG: &str = "generateVAP";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The template has no code for the native engine, so nothing can ever
    /// be generated from it.
    #[error("template {0} has no {NATIVE_VALIDATION_ENGINE} code")]
    EngineMissing(String),

    #[error("template {0} has a non-boolean {GENERATE_FLAG}")]
    InvalidFlag(String),
}

/// Whether bindings should be generated for constraints of `template`.
///
/// An absent flag defers to `default`.
pub fn should_generate(template: &ConstraintTemplate, default: bool) -> Result<bool, TemplateError> {
    let name = || template.metadata.name.clone().unwrap_or_default();
    let code = template
        .code_for(NATIVE_VALIDATION_ENGINE)
        .ok_or_else(|| TemplateError::EngineMissing(name()))?;

    match code.source.get(GENERATE_FLAG) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(generate)) => Ok(*generate),
        Some(_) => Err(TemplateError::InvalidFlag(name())),
    }
}
