#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod dynamic;
pub mod pod_status;
pub mod request;
pub mod template;

pub use self::{
    binding::{Binding, BindingVersion},
    dynamic::DynamicRecord,
    pod_status::{ConstraintPodStatus, ConstraintPodStatusSpec, PodStatus},
    request::Request,
    template::ConstraintTemplate,
};
pub use k8s_openapi::{
    api::admissionregistration::{v1 as admission_v1, v1beta1 as admission_v1beta1},
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time},
};
pub use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, ObjectMeta, Patch, PatchParams, PostParams,
        ResourceExt,
    },
    core::GroupVersionKind,
    Client, Error, Resource,
};

/// The API group every constraint kind is served under.
pub const CONSTRAINTS_GROUP: &str = "constraints.gatekeeper.sh";

/// Constraint kinds are only served at this version by the template controller.
pub const CONSTRAINTS_VERSION: &str = "v1beta1";

pub const TEMPLATES_GROUP: &str = "templates.gatekeeper.sh";

pub const STATUS_GROUP: &str = "status.gatekeeper.sh";

/// Builds the `ApiResource` for a constraint kind.
///
/// Constraint CRDs use the lower-cased kind as their plural, so the default
/// pluralization rules in `ApiResource::from_gvk` do not apply.
pub fn constraint_api_resource(gvk: &GroupVersionKind) -> ApiResource {
    ApiResource::from_gvk_with_plural(gvk, &gvk.kind.to_lowercase())
}
