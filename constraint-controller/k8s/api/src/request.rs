use crate::CONSTRAINTS_GROUP;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::GroupVersionKind;
use std::fmt;

const PREFIX: &str = "gvk";

/// A reconciliation request for a constraint.
///
/// Requests for every constraint kind flow through a single queue, so the
/// kind travels inside the request name as `gvk:<Kind>.<version>.<group>:<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("request {0:?} is not prefixed with a group-version-kind")]
    MissingPrefix(String),

    #[error("request {0:?} has a malformed group-version-kind")]
    MalformedKind(String),

    #[error("request {0:?} has an empty name")]
    EmptyName(String),
}

// === impl Request ===

impl Request {
    pub fn new(gvk: &GroupVersionKind, name: &str) -> Self {
        Self {
            name: format!(
                "{PREFIX}:{}.{}.{}:{name}",
                gvk.kind, gvk.version, gvk.group
            ),
            namespace: None,
        }
    }

    /// Splits the request back into its kind and object name.
    pub fn decode(&self) -> Result<(GroupVersionKind, String), DecodeError> {
        let rest = self
            .name
            .strip_prefix(PREFIX)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| DecodeError::MissingPrefix(self.name.clone()))?;

        let (gvk, name) = rest
            .split_once(':')
            .ok_or_else(|| DecodeError::MalformedKind(self.name.clone()))?;
        if name.is_empty() {
            return Err(DecodeError::EmptyName(self.name.clone()));
        }

        // Groups contain dots but kinds and versions never do.
        let mut parts = gvk.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(version), Some(group))
                if !kind.is_empty() && !version.is_empty() && !group.is_empty() =>
            {
                Ok((GroupVersionKind::gvk(group, version, kind), name.to_string()))
            }
            _ => Err(DecodeError::MalformedKind(self.name.clone())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Maps the owner references of a related object back to constraint requests.
///
/// Only controller references into the constraints group are followed.
pub fn for_owner_refs<'a>(
    owners: impl IntoIterator<Item = &'a OwnerReference>,
) -> Vec<Request> {
    owners
        .into_iter()
        .filter(|o| o.controller == Some(true))
        .filter_map(|o| {
            let (group, version) = o.api_version.split_once('/')?;
            if group != CONSTRAINTS_GROUP {
                return None;
            }
            let gvk = GroupVersionKind::gvk(group, version, &o.kind);
            Some(Request::new(&gvk, &o.name))
        })
        .collect()
}
