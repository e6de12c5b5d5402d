use ahash::AHashMap as HashMap;
use gatekeeper_constraint_controller_core::Tags;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    constraints: Family<ConstraintLabels, Gauge>,
    bindings: Family<BindingLabels, Gauge>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    Active,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConstraintLabels {
    enforcement_action: String,
    status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BindingLabels {
    binding: String,
    status: String,
}

// === impl BindingState ===

impl BindingState {
    const ALL: [Self; 2] = [Self::Active, Self::Error];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let constraints = Family::default();
        prom.register(
            "constraints",
            "Current number of known constraints by enforcement action and status",
            constraints.clone(),
        );

        let bindings = Family::default();
        prom.register(
            "vapb_status",
            "Status of generated ValidatingAdmissionPolicyBindings",
            bindings.clone(),
        );

        Self {
            constraints,
            bindings,
        }
    }

    /// Overwrites every constraint series with `totals`.
    ///
    /// Combinations missing from `totals` are reported as zero so stale
    /// values never linger.
    pub fn report_totals(&self, totals: &HashMap<Tags, u64>) {
        for tags in Tags::all() {
            let count = totals.get(&tags).copied().unwrap_or(0);
            self.constraints
                .get_or_create(&ConstraintLabels::from(tags))
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    pub fn report_binding(&self, binding: &str, state: BindingState) {
        for s in BindingState::ALL {
            self.bindings
                .get_or_create(&BindingLabels::new(binding, s))
                .set((s == state) as i64);
        }
    }

    pub fn remove_binding(&self, binding: &str) {
        for s in BindingState::ALL {
            self.bindings.remove(&BindingLabels::new(binding, s));
        }
    }

    #[cfg(test)]
    pub(crate) fn constraint_total(&self, tags: Tags) -> i64 {
        self.constraints
            .get_or_create(&ConstraintLabels::from(tags))
            .get()
    }

    #[cfg(test)]
    pub(crate) fn binding_state(&self, binding: &str) -> Option<BindingState> {
        BindingState::ALL.into_iter().find(|s| {
            self.bindings
                .get_or_create(&BindingLabels::new(binding, *s))
                .get()
                == 1
        })
    }
}

impl From<Tags> for ConstraintLabels {
    fn from(tags: Tags) -> Self {
        Self {
            enforcement_action: tags.enforcement_action.as_str().to_string(),
            status: tags.status.as_str().to_string(),
        }
    }
}

impl BindingLabels {
    fn new(binding: &str, state: BindingState) -> Self {
        Self {
            binding: binding.to_string(),
            status: state.as_str().to_string(),
        }
    }
}
