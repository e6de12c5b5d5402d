use crate::enforcement_action::EnforcementAction;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::fmt;

/// Whether a constraint was last accepted by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Active,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tags {
    pub enforcement_action: EnforcementAction,
    pub status: Status,
}

/// Per-process view of every constraint this replica has reconciled.
///
/// This is only used to compute metric totals; it is not authoritative and
/// may briefly lag the engine.
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: RwLock<HashMap<String, Tags>>,
}

// === impl Status ===

impl Status {
    pub const ALL: [Self; 2] = [Self::Active, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Tags ===

impl Tags {
    pub fn new(enforcement_action: EnforcementAction, status: Status) -> Self {
        Self {
            enforcement_action,
            status,
        }
    }

    /// Every combination of action and status.
    pub fn all() -> impl Iterator<Item = Self> {
        EnforcementAction::ALL
            .into_iter()
            .flat_map(|a| Status::ALL.into_iter().map(move |s| Self::new(a, s)))
    }
}

// === impl StatusCache ===

impl StatusCache {
    /// Cache keys are `kind/name`.
    pub fn key(kind: &str, name: &str) -> String {
        format!("{kind}/{name}")
    }

    pub fn add_or_replace(&self, key: impl Into<String>, tags: Tags) {
        self.entries.write().insert(key.into(), tags);
    }

    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<Tags> {
        self.entries.read().get(key).copied()
    }

    /// Counts entries per tag combination.
    ///
    /// Every combination is present, including those with a zero count, so
    /// that a gauge which drops to zero is reported as zero rather than left
    /// at its last value.
    pub fn compute_totals(&self) -> HashMap<Tags, u64> {
        let mut totals = Tags::all().map(|t| (t, 0)).collect::<HashMap<_, _>>();
        for tags in self.entries.read().values() {
            *totals.entry(*tags).or_default() += 1;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DENY_ACTIVE: Tags = Tags {
        enforcement_action: EnforcementAction::Deny,
        status: Status::Active,
    };
    const WARN_ERROR: Tags = Tags {
        enforcement_action: EnforcementAction::Warn,
        status: Status::Error,
    };

    #[test]
    fn totals_cover_every_combination() {
        let cache = StatusCache::default();
        let totals = cache.compute_totals();
        assert_eq!(totals.len(), EnforcementAction::ALL.len() * Status::ALL.len());
        assert!(totals.values().all(|n| *n == 0));
    }

    #[test]
    fn last_write_wins() {
        let cache = StatusCache::default();
        let key = StatusCache::key("K8sRequiredLabels", "c");
        cache.add_or_replace(key.clone(), DENY_ACTIVE);
        cache.add_or_replace(key.clone(), WARN_ERROR);
        assert_eq!(cache.get(&key), Some(WARN_ERROR));
        assert_eq!(cache.len(), 1);

        let totals = cache.compute_totals();
        assert_eq!(totals[&WARN_ERROR], 1);
        assert_eq!(totals[&DENY_ACTIVE], 0);
    }

    #[test]
    fn delete_reports_zero() {
        let cache = StatusCache::default();
        cache.add_or_replace("K/a", DENY_ACTIVE);
        cache.add_or_replace("K/b", DENY_ACTIVE);
        assert_eq!(cache.compute_totals()[&DENY_ACTIVE], 2);

        cache.delete("K/a");
        cache.delete("K/b");
        cache.delete("K/b");
        assert!(cache.is_empty());
        let totals = cache.compute_totals();
        assert_eq!(totals.get(&DENY_ACTIVE), Some(&0));
    }

    #[test]
    fn replay_matches_last_write_per_key() {
        let cache = StatusCache::default();
        let ops: &[(&str, Option<Tags>)] = &[
            ("K/a", Some(DENY_ACTIVE)),
            ("K/b", Some(WARN_ERROR)),
            ("K/a", Some(WARN_ERROR)),
            ("K/b", None),
            ("K/c", Some(DENY_ACTIVE)),
            ("K/c", None),
            ("K/c", Some(DENY_ACTIVE)),
        ];
        for (key, op) in ops {
            match op {
                Some(tags) => cache.add_or_replace(*key, *tags),
                None => cache.delete(key),
            }
        }

        assert_eq!(cache.get("K/a"), Some(WARN_ERROR));
        assert_eq!(cache.get("K/b"), None);
        assert_eq!(cache.get("K/c"), Some(DENY_ACTIVE));
        let totals = cache.compute_totals();
        assert_eq!(totals[&WARN_ERROR], 1);
        assert_eq!(totals[&DENY_ACTIVE], 1);
    }
}
