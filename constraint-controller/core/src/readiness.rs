use ahash::AHashMap as HashMap;
use gatekeeper_constraint_controller_k8s_api::{DynamicObject, DynamicRecord, GroupVersionKind};
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};

/// Records which expected objects have been observed at startup.
///
/// Readiness is reported once every object expected at startup has either
/// been observed or had its expectation cancelled.
pub trait ReadinessTracker: Send + Sync {
    fn observe(&self, gvk: &GroupVersionKind, obj: &DynamicObject);

    fn cancel_expect(&self, gvk: &GroupVersionKind, obj: &DynamicObject);

    /// Like `cancel_expect`, but only cancels once the object has been seen
    /// missing more than once. Used where a transient miss is plausible.
    fn try_cancel_expect(&self, gvk: &GroupVersionKind, obj: &DynamicObject);
}

/// In-memory expectation sets, keyed by kind.
#[derive(Clone, Debug, Default)]
pub struct Expectations(Arc<RwLock<HashMap<String, Kind>>>);

#[derive(Debug, Default)]
struct Kind {
    expected: BTreeSet<String>,
    satisfied: BTreeSet<String>,
    misses: HashMap<String, u8>,
}

const TRY_CANCEL_THRESHOLD: u8 = 2;

// === impl Expectations ===

impl Expectations {
    pub fn expect(&self, gvk: &GroupVersionKind, name: impl Into<String>) {
        self.0
            .write()
            .entry(gvk.kind.clone())
            .or_default()
            .expected
            .insert(name.into());
    }

    /// True once every expectation has been observed or cancelled.
    pub fn is_satisfied(&self) -> bool {
        self.0
            .read()
            .values()
            .all(|k| k.expected.is_subset(&k.satisfied))
    }

    fn satisfy(&self, gvk: &GroupVersionKind, name: &str) {
        let mut kinds = self.0.write();
        let kind = kinds.entry(gvk.kind.clone()).or_default();
        kind.misses.remove(name);
        if kind.expected.contains(name) {
            kind.satisfied.insert(name.to_string());
        }
    }
}

impl ReadinessTracker for Expectations {
    fn observe(&self, gvk: &GroupVersionKind, obj: &DynamicObject) {
        self.satisfy(gvk, obj.name());
    }

    fn cancel_expect(&self, gvk: &GroupVersionKind, obj: &DynamicObject) {
        self.satisfy(gvk, obj.name());
    }

    fn try_cancel_expect(&self, gvk: &GroupVersionKind, obj: &DynamicObject) {
        let name = obj.name();
        let cancel = {
            let mut kinds = self.0.write();
            let misses = kinds
                .entry(gvk.kind.clone())
                .or_default()
                .misses
                .entry(name.to_string())
                .or_default();
            *misses = misses.saturating_add(1);
            *misses >= TRY_CANCEL_THRESHOLD
        };
        if cancel {
            self.satisfy(gvk, name);
        }
    }
}
