use chrono::{DateTime, Utc};
use gatekeeper_constraint_controller_k8s_api::{ConstraintTemplate, ResourceExt, Time};
use std::time::Duration;

/// Set on a template to hold back binding generation until a time.
///
/// Newly installed CRDs may not have propagated to every API server
/// endpoint, and a binding that references a kind the server cannot resolve
/// fails or dangles.
pub const BLOCK_UNTIL_ANNOTATION: &str = "gatekeeper.sh/block-vapb-generation-until";

/// Annotation value that lifts the block immediately.
pub const UNBLOCKED: &str = "unblocked";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Gate {
    Open,
    /// Generation must wait at least this long.
    Blocked(Duration),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {BLOCK_UNTIL_ANNOTATION} annotation {value:?}: {message}")]
pub struct GateError {
    pub value: String,
    pub message: String,
}

/// Decides whether bindings for `template`'s constraints may be generated
/// at `now`.
///
/// Without the annotation, generation waits `default_wait` past the
/// template's creation.
pub fn evaluate(
    template: &ConstraintTemplate,
    default_wait: Duration,
    now: DateTime<Utc>,
) -> Result<Gate, GateError> {
    let until = match template.annotations().get(BLOCK_UNTIL_ANNOTATION) {
        Some(value) if value == UNBLOCKED => return Ok(Gate::Open),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map_err(|e| GateError {
                value: value.clone(),
                message: e.to_string(),
            })?
            .with_timezone(&Utc),
        None => {
            let Some(created) = template.creation_timestamp().as_ref().and_then(to_chrono) else {
                return Ok(Gate::Open);
            };
            let wait = chrono::Duration::from_std(default_wait).unwrap_or(chrono::Duration::MAX);
            created.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
    };

    match (until - now).to_std() {
        Ok(remaining) if !remaining.is_zero() => Ok(Gate::Blocked(remaining)),
        // Negative or zero: the time has passed.
        _ => Ok(Gate::Open),
    }
}

fn to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_constraint_controller_k8s_api::template::ConstraintTemplateSpec;
    use maplit::btreemap;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn template(annotation: Option<&str>, created: Option<&str>) -> ConstraintTemplate {
        let mut t = ConstraintTemplate::new("k8srequiredlabels", ConstraintTemplateSpec::default());
        t.metadata.annotations = annotation.map(|a| {
            btreemap! { BLOCK_UNTIL_ANNOTATION.to_string() => a.to_string() }
        });
        t.metadata.creation_timestamp =
            created.map(|c| serde_json::from_value(json!(c)).unwrap());
        t
    }

    const WAIT: Duration = Duration::from_secs(30);

    #[test]
    fn unblocked_marker() {
        let t = template(Some(UNBLOCKED), Some("2024-05-01T12:00:00Z"));
        assert_eq!(evaluate(&t, WAIT, now()), Ok(Gate::Open));
    }

    #[test]
    fn future_timestamp_blocks() {
        let t = template(Some("2024-05-01T12:00:10Z"), None);
        assert_eq!(
            evaluate(&t, WAIT, now()),
            Ok(Gate::Blocked(Duration::from_secs(10)))
        );
    }

    #[test]
    fn past_timestamp_opens() {
        let t = template(Some("2024-05-01T11:59:59Z"), None);
        assert_eq!(evaluate(&t, WAIT, now()), Ok(Gate::Open));
        let t = template(Some("2024-05-01T12:00:00Z"), None);
        assert_eq!(evaluate(&t, WAIT, now()), Ok(Gate::Open));
    }

    #[test]
    fn defaults_to_creation_plus_wait() {
        let t = template(None, Some("2024-05-01T11:59:50Z"));
        assert_eq!(
            evaluate(&t, WAIT, now()),
            Ok(Gate::Blocked(Duration::from_secs(20)))
        );

        let t = template(None, Some("2024-05-01T11:00:00Z"));
        assert_eq!(evaluate(&t, WAIT, now()), Ok(Gate::Open));

        let t = template(None, None);
        assert_eq!(evaluate(&t, WAIT, now()), Ok(Gate::Open));
    }

    #[test]
    fn malformed_annotation() {
        let t = template(Some("tomorrow"), None);
        let err = evaluate(&t, WAIT, now()).unwrap_err();
        assert_eq!(err.value, "tomorrow");
    }
}
