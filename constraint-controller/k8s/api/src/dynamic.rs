use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::{api::DynamicObject, core::GroupVersionKind};
use serde_json::Value;

/// Typed access to schema-free objects.
///
/// Constraint kinds are generated at runtime from templates, so the
/// controller only ever sees them as `DynamicObject`s. All field access goes
/// through this trait rather than through ad-hoc JSON indexing.
pub trait DynamicRecord {
    fn kind(&self) -> Option<&str>;

    fn api_version(&self) -> Option<&str>;

    fn name(&self) -> &str;

    fn namespace_ref(&self) -> Option<&str>;

    fn generation(&self) -> Option<i64>;

    fn deletion_timestamp(&self) -> Option<&Time>;

    /// Returns the value at `path`, or `None` if any segment is missing.
    fn nested(&self, path: &[&str]) -> Option<&Value>;

    /// Sets the value at `path`, creating intermediate objects as needed.
    ///
    /// Fails if an intermediate segment exists but is not an object.
    fn set_nested(&mut self, path: &[&str], value: Value) -> Result<(), FieldError>;

    /// Removes the value at `path`, returning it if it was present.
    fn remove_nested(&mut self, path: &[&str]) -> Option<Value>;

    fn group_version_kind(&self) -> Option<GroupVersionKind> {
        let kind = self.kind()?;
        let (group, version) = match self.api_version()?.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version()?),
        };
        Some(GroupVersionKind::gvk(group, version, kind))
    }

    fn is_deleting(&self) -> bool {
        self.deletion_timestamp().is_some()
    }

    /// The `spec` object, if the record has one.
    fn spec(&self) -> Option<&serde_json::Map<String, Value>> {
        self.nested(&["spec"]).and_then(Value::as_object)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("field {path} is not an object")]
pub struct FieldError {
    pub path: String,
}

impl DynamicRecord for DynamicObject {
    fn kind(&self) -> Option<&str> {
        self.types.as_ref().map(|t| t.kind.as_str())
    }

    fn api_version(&self) -> Option<&str> {
        self.types.as_ref().map(|t| t.api_version.as_str())
    }

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn namespace_ref(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }

    fn deletion_timestamp(&self) -> Option<&Time> {
        self.metadata.deletion_timestamp.as_ref()
    }

    fn nested(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.data, |value, key| value.get(key))
    }

    fn set_nested(&mut self, path: &[&str], value: Value) -> Result<(), FieldError> {
        let Some((last, parents)) = path.split_last() else {
            self.data = value;
            return Ok(());
        };

        let mut cursor = &mut self.data;
        for (i, key) in parents.iter().enumerate() {
            if cursor.is_null() {
                *cursor = Value::Object(Default::default());
            }
            let Some(map) = cursor.as_object_mut() else {
                return Err(FieldError {
                    path: path[..i].join("."),
                });
            };
            cursor = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }

        if cursor.is_null() {
            *cursor = Value::Object(Default::default());
        }
        match cursor.as_object_mut() {
            Some(map) => {
                map.insert(last.to_string(), value);
                Ok(())
            }
            None => Err(FieldError {
                path: parents.join("."),
            }),
        }
    }

    fn remove_nested(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut cursor = &mut self.data;
        for key in parents {
            cursor = cursor.get_mut(key)?;
        }
        cursor.as_object_mut()?.remove(*last)
    }
}

/// Builds a controller owner reference pointing at `record`.
///
/// Returns `None` when the record lacks the type or identity metadata an
/// owner reference requires.
pub fn controller_owner_ref(record: &DynamicObject) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: record.api_version()?.to_string(),
        kind: record.kind()?.to_string(),
        name: record.metadata.name.clone()?,
        uid: record.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Returns a copy of `record` with its `status` removed.
///
/// The policy engine only stores the user-authored portion of a constraint.
pub fn without_status(record: &DynamicObject) -> DynamicObject {
    let mut record = record.clone();
    record.remove_nested(&["status"]);
    record
}
