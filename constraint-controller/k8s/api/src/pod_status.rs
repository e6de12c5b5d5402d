use crate::dynamic::{controller_owner_ref, DynamicRecord};
use kube::{api::DynamicObject, api::ObjectMeta, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const POD_LABEL: &str = "internal.gatekeeper.sh/pod";
pub const CONSTRAINT_NAME_LABEL: &str = "internal.gatekeeper.sh/constraint-name";
pub const CONSTRAINT_KIND_LABEL: &str = "internal.gatekeeper.sh/constraint-kind";

/// Records how a single controller replica sees a single constraint.
///
/// Each replica owns its own record, so status writes never contend across
/// replicas.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "status.gatekeeper.sh",
    version = "v1beta1",
    kind = "ConstraintPodStatus",
    status = "PodStatus",
    namespaced
)]
pub struct ConstraintPodStatusSpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub id: String,

    #[serde(default, rename = "constraintUID")]
    pub constraint_uid: String,

    #[serde(default)]
    pub operations: Vec<String>,

    #[serde(default)]
    pub enforced: bool,

    // Lists are always written so a merge patch can empty them.
    #[serde(default)]
    pub errors: Vec<StatusError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Keyed by enforcement point name; stored as a list.
    #[serde(default, with = "enforcement_points")]
    #[schemars(with = "Vec<NamedEnforcementPointStatus>")]
    pub enforcement_points_status: BTreeMap<String, EnforcementPointStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct StatusError {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementPointStatus {
    pub state: EnforcementPointState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementPointState {
    Generated,
    Waiting,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedEnforcementPointStatus {
    pub enforcement_point: String,
    #[serde(flatten)]
    pub status: EnforcementPointStatus,
}

mod enforcement_points {
    use super::{EnforcementPointStatus, NamedEnforcementPointStatus};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, EnforcementPointStatus>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(point, status)| NamedEnforcementPointStatus {
                enforcement_point: point.clone(),
                status: status.clone(),
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, EnforcementPointStatus>, D::Error> {
        // Later entries win if the stored list repeats an enforcement point.
        let list = Vec::<NamedEnforcementPointStatus>::deserialize(deserializer)?;
        Ok(list
            .into_iter()
            .map(|s| (s.enforcement_point, s.status))
            .collect())
    }
}

// === impl ConstraintPodStatus ===

impl ConstraintPodStatus {
    /// Builds a fresh status record for `constraint` as seen by `pod`.
    pub fn for_constraint(pod: &str, namespace: &str, constraint: &DynamicObject) -> Self {
        let kind = constraint.kind().unwrap_or_default();
        let labels = [
            (POD_LABEL.to_string(), pod.to_string()),
            (
                CONSTRAINT_NAME_LABEL.to_string(),
                constraint.name().to_string(),
            ),
            (CONSTRAINT_KIND_LABEL.to_string(), kind.to_string()),
        ]
        .into_iter()
        .collect();

        let mut status = ConstraintPodStatus::new(
            &pod_status_name(pod, kind, constraint.name()),
            ConstraintPodStatusSpec {},
        );
        status.metadata = ObjectMeta {
            name: status.metadata.name.take(),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: controller_owner_ref(constraint).map(|o| vec![o]),
            ..Default::default()
        };
        status.status = Some(PodStatus {
            id: pod.to_string(),
            constraint_uid: constraint.metadata.uid.clone().unwrap_or_default(),
            ..Default::default()
        });
        status
    }
}

impl PodStatus {
    pub fn push_error(&mut self, code: impl ToString, message: impl ToString) {
        self.errors.push(StatusError {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}

/// Deterministic name of the status record `pod` keeps for a constraint.
///
/// Dashes inside each segment are doubled so that distinct
/// `(pod, kind, name)` triples never collide once joined.
pub fn pod_status_name(pod: &str, kind: &str, name: &str) -> String {
    [pod, kind, name]
        .iter()
        .map(|segment| segment.to_lowercase().replace('-', "--"))
        .collect::<Vec<_>>()
        .join("-")
}
