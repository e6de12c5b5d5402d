use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

pub const ENFORCEMENT_ACTION_FIELD: &str = "enforcementAction";
pub const SCOPED_ENFORCEMENT_ACTIONS_FIELD: &str = "scopedEnforcementActions";

/// The enforcement point served by the admission webhook.
pub const WEBHOOK_ENFORCEMENT_POINT: &str = "validation.gatekeeper.sh";

/// The enforcement point served by generated admission policy bindings.
pub const BINDING_ENFORCEMENT_POINT: &str = "vap.k8s.io";

/// Matches every enforcement point.
pub const ALL_ENFORCEMENT_POINTS: &str = "*";

/// How a constraint's violations are acted upon.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnforcementAction {
    Deny,
    Dryrun,
    Warn,
    /// Actions are declared per enforcement point in `scopedEnforcementActions`.
    Scoped,
    /// A value this controller does not know. Carried through rather than
    /// rejected so that newer constraints keep flowing to the engine.
    Unrecognized,
}

/// A single `scopedEnforcementActions` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedEnforcementAction {
    pub action: EnforcementAction,
    pub enforcement_points: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("spec.{0} must be a string")]
    NotAString(&'static str),

    #[error("scoped enforcement action requires a non-empty spec.scopedEnforcementActions")]
    MissingScopedActions,

    #[error("malformed spec.scopedEnforcementActions: {0}")]
    Malformed(String),

    #[error("scoped enforcement action {0:?} is not supported")]
    UnsupportedScopedAction(String),

    #[error("scoped enforcement action entry has an empty enforcement point name")]
    EmptyEnforcementPoint,
}

// === impl EnforcementAction ===

impl EnforcementAction {
    /// Every value, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::Deny,
        Self::Dryrun,
        Self::Warn,
        Self::Scoped,
        Self::Unrecognized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Dryrun => "dryrun",
            Self::Warn => "warn",
            Self::Scoped => "scoped",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Reads `spec.enforcementAction`, falling back to `default` when unset.
    pub fn from_spec(spec: Option<&Map<String, Value>>, default: Self) -> Result<Self, ActionError> {
        match spec.and_then(|s| s.get(ENFORCEMENT_ACTION_FIELD)) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::String(s)) if s.is_empty() => Ok(default),
            Some(Value::String(s)) => Ok(Self::parse(s)),
            Some(_) => Err(ActionError::NotAString(ENFORCEMENT_ACTION_FIELD)),
        }
    }

    /// Maps a declared value onto a known action; unknown values are
    /// `Unrecognized`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "deny" => Self::Deny,
            "dryrun" => Self::Dryrun,
            "warn" => Self::Warn,
            "scoped" => Self::Scoped,
            _ => Self::Unrecognized,
        }
    }

    /// Actions that may appear inside a scoped entry.
    fn is_simple(&self) -> bool {
        matches!(self, Self::Deny | Self::Dryrun | Self::Warn)
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a single action. `scoped` is rejected since it only has meaning
/// alongside a constraint's own scoped entries.
impl FromStr for EnforcementAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse(s) {
            action if action.is_simple() => Ok(action),
            Self::Scoped => Err(format!("{s} must be declared on each constraint")),
            _ => Err(format!("unknown enforcement action: {s}")),
        }
    }
}

/// Parses `spec.scopedEnforcementActions`.
///
/// A missing field yields an empty list; structural problems are errors.
pub fn scoped_actions(
    spec: Option<&Map<String, Value>>,
) -> Result<Vec<ScopedEnforcementAction>, ActionError> {
    let items = match spec.and_then(|s| s.get(SCOPED_ENFORCEMENT_ACTIONS_FIELD)) {
        None | Some(Value::Null) => return Ok(vec![]),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ActionError::Malformed("expected a list".to_string())),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let action = match item.get("action") {
                Some(Value::String(a)) => EnforcementAction::parse(a),
                _ => {
                    return Err(ActionError::Malformed(format!(
                        "entry {i} is missing a string action"
                    )))
                }
            };
            let points = match item.get("enforcementPoints") {
                Some(Value::Array(points)) => points,
                _ => {
                    return Err(ActionError::Malformed(format!(
                        "entry {i} is missing enforcementPoints"
                    )))
                }
            };
            let enforcement_points = points
                .iter()
                .map(|p| match p.get("name") {
                    Some(Value::String(name)) => Ok(name.clone()),
                    _ => Err(ActionError::Malformed(format!(
                        "entry {i} has an enforcement point without a name"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ScopedEnforcementAction {
                action,
                enforcement_points,
            })
        })
        .collect()
}

/// Checks that `action` is structurally legal for a constraint with `spec`.
pub fn validate(
    action: EnforcementAction,
    spec: Option<&Map<String, Value>>,
) -> Result<(), ActionError> {
    if action != EnforcementAction::Scoped {
        return Ok(());
    }

    let scoped = scoped_actions(spec)?;
    if scoped.is_empty() {
        return Err(ActionError::MissingScopedActions);
    }
    for entry in &scoped {
        if !entry.action.is_simple() {
            let declared = entry.action.as_str().to_string();
            return Err(ActionError::UnsupportedScopedAction(declared));
        }
        if entry.enforcement_points.is_empty() || entry.enforcement_points.iter().any(String::is_empty)
        {
            return Err(ActionError::EmptyEnforcementPoint);
        }
    }
    Ok(())
}

/// Returns the actions scoped to `point` (directly or through the wildcard),
/// de-duplicated in declaration order.
pub fn actions_for_point(
    spec: Option<&Map<String, Value>>,
    point: &str,
) -> Result<Vec<EnforcementAction>, ActionError> {
    let mut actions = Vec::new();
    for entry in scoped_actions(spec)? {
        let applies = entry
            .enforcement_points
            .iter()
            .any(|p| p == point || p == ALL_ENFORCEMENT_POINTS);
        if applies && !actions.contains(&entry.action) {
            actions.push(entry.action);
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn absent_yields_default() {
        assert_eq!(
            EnforcementAction::from_spec(None, EnforcementAction::Deny),
            Ok(EnforcementAction::Deny)
        );
        let s = spec(json!({ "match": {} }));
        assert_eq!(
            EnforcementAction::from_spec(Some(&s), EnforcementAction::Warn),
            Ok(EnforcementAction::Warn)
        );
    }

    #[test]
    fn known_and_unknown_values() {
        for (declared, expected) in [
            ("deny", EnforcementAction::Deny),
            ("dryrun", EnforcementAction::Dryrun),
            ("Warn", EnforcementAction::Warn),
            ("scoped", EnforcementAction::Scoped),
            ("audit-only", EnforcementAction::Unrecognized),
        ] {
            let s = spec(json!({ "enforcementAction": declared }));
            assert_eq!(
                EnforcementAction::from_spec(Some(&s), EnforcementAction::Deny),
                Ok(expected),
                "{declared}"
            );
        }
    }

    #[test]
    fn from_str_accepts_only_simple_actions() {
        assert_eq!("dryrun".parse::<EnforcementAction>(), Ok(EnforcementAction::Dryrun));
        assert_eq!("WARN".parse::<EnforcementAction>(), Ok(EnforcementAction::Warn));
        assert!("scoped".parse::<EnforcementAction>().is_err());
        assert!("audit".parse::<EnforcementAction>().is_err());
    }

    #[test]
    fn non_string_is_an_error() {
        let s = spec(json!({ "enforcementAction": 3 }));
        assert_eq!(
            EnforcementAction::from_spec(Some(&s), EnforcementAction::Deny),
            Err(ActionError::NotAString(ENFORCEMENT_ACTION_FIELD))
        );
    }

    #[test]
    fn simple_actions_always_validate() {
        assert!(validate(EnforcementAction::Deny, None).is_ok());
        assert!(validate(EnforcementAction::Unrecognized, None).is_ok());
    }

    #[test]
    fn scoped_requires_entries() {
        let s = spec(json!({ "enforcementAction": "scoped" }));
        assert_eq!(
            validate(EnforcementAction::Scoped, Some(&s)),
            Err(ActionError::MissingScopedActions)
        );

        let s = spec(json!({
            "enforcementAction": "scoped",
            "scopedEnforcementActions": [{ "action": "deny" }],
        }));
        assert!(matches!(
            validate(EnforcementAction::Scoped, Some(&s)),
            Err(ActionError::Malformed(_))
        ));

        let s = spec(json!({
            "enforcementAction": "scoped",
            "scopedEnforcementActions": [{ "action": "deny", "enforcementPoints": [] }],
        }));
        assert_eq!(
            validate(EnforcementAction::Scoped, Some(&s)),
            Err(ActionError::EmptyEnforcementPoint)
        );

        let s = spec(json!({
            "enforcementAction": "scoped",
            "scopedEnforcementActions": [{
                "action": "scoped",
                "enforcementPoints": [{ "name": "vap.k8s.io" }],
            }],
        }));
        assert_eq!(
            validate(EnforcementAction::Scoped, Some(&s)),
            Err(ActionError::UnsupportedScopedAction("scoped".to_string()))
        );
    }

    #[test]
    fn resolves_actions_per_point() {
        let s = spec(json!({
            "enforcementAction": "scoped",
            "scopedEnforcementActions": [
                { "action": "deny", "enforcementPoints": [{ "name": "vap.k8s.io" }] },
                { "action": "warn", "enforcementPoints": [{ "name": "*" }] },
                { "action": "dryrun", "enforcementPoints": [{ "name": "validation.gatekeeper.sh" }] },
                { "action": "deny", "enforcementPoints": [{ "name": "*" }] },
            ],
        }));
        assert!(validate(EnforcementAction::Scoped, Some(&s)).is_ok());
        assert_eq!(
            actions_for_point(Some(&s), BINDING_ENFORCEMENT_POINT),
            Ok(vec![EnforcementAction::Deny, EnforcementAction::Warn])
        );
        assert_eq!(
            actions_for_point(Some(&s), WEBHOOK_ENFORCEMENT_POINT),
            Ok(vec![
                EnforcementAction::Warn,
                EnforcementAction::Dryrun,
                EnforcementAction::Deny
            ])
        );
        assert_eq!(actions_for_point(None, BINDING_ENFORCEMENT_POINT), Ok(vec![]));
    }
}
