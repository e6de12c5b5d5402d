#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reconciles constraints against the policy engine.
//!
//! Each reconcile is a fresh pass over a single constraint: it either
//! upserts the constraint (engine, pod status, status cache, binding) or
//! tears all of that down when the constraint is gone.

mod error;
mod lower;
pub mod metrics;
mod status;
pub mod store;


pub use self::{
    error::{BindingError, Error},
    metrics::Metrics,
    store::{KubeStore, Store, StoreError},
};
use chrono::{DateTime, Utc};
use gatekeeper_constraint_controller_core::{
    enforcement_action, engine::semantic_eq, EngineError, EnforcementAction, PolicyEngine,
    ReadinessTracker, Status, StatusCache, Tags,
};
use gatekeeper_constraint_controller_k8s_api::{
    binding::binding_name, constraint_api_resource, dynamic::without_status,
    pod_status::pod_status_name, ConstraintPodStatus, DynamicObject, DynamicRecord,
    GroupVersionKind, Request, CONSTRAINTS_GROUP,
};
use gatekeeper_constraint_controller_k8s_binding::FeatureProbe;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// What the caller should do with a request once it has been reconciled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the object changes.
    AwaitChange,
    Requeue(Duration),
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Identifies this replica's pod status records.
    pub pod_name: String,
    pub namespace: String,
    /// Operations this replica performs, recorded on its pod status.
    pub operations: Vec<String>,
    pub default_enforcement_action: EnforcementAction,
    /// Generate bindings for constraints with a simple enforcement action.
    pub default_create_binding: bool,
    /// Whether templates without a `generateVAP` flag generate policies.
    pub default_create_policy: bool,
    /// How long after a template's creation bindings are held back.
    pub default_wait: Duration,
}

/// Stops reconciliation during shutdown.
#[derive(Clone, Debug, Default)]
pub struct Switch(Arc<AtomicBool>);

/// Decides whether a constraint kind is still watched. Unwatched kinds are
/// treated as deleted without reading them from the API.
pub type FetchGate = Arc<dyn Fn(&GroupVersionKind) -> bool + Send + Sync>;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Reconciler {
    config: Config,
    store: Arc<dyn Store>,
    engine: Arc<dyn PolicyEngine>,
    tracker: Arc<dyn ReadinessTracker>,
    cache: Arc<StatusCache>,
    metrics: Metrics,
    probe: FeatureProbe,
    switch: Switch,
    fetch_gate: FetchGate,
    clock: Clock,
}

/// The state changes a reconcile made.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Outcome {
    NoOp,
    Upserted,
    Deleted,
    Errored,
}

// === impl Switch ===

impl Switch {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        engine: Arc<dyn PolicyEngine>,
        tracker: Arc<dyn ReadinessTracker>,
        probe: FeatureProbe,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            tracker,
            cache: Default::default(),
            metrics,
            probe,
            switch: Default::default(),
            fetch_gate: Arc::new(|_| true),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_switch(mut self, switch: Switch) -> Self {
        self.switch = switch;
        self
    }

    pub fn with_fetch_gate(mut self, gate: FetchGate) -> Self {
        self.fetch_gate = gate;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    pub async fn reconcile(&self, req: &Request) -> Result<Action, Error> {
        let (outcome, result) = self.reconcile_request(req).await;
        if outcome != Outcome::NoOp {
            self.metrics.report_totals(&self.cache.compute_totals());
        }
        result
    }

    async fn reconcile_request(&self, req: &Request) -> (Outcome, Result<Action, Error>) {
        if self.switch.is_stopped() {
            return (Outcome::NoOp, Ok(Action::AwaitChange));
        }

        // Neither of these can succeed on retry.
        let (gvk, name) = match req.decode() {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(%req, %error, "Dropping malformed request");
                return (Outcome::NoOp, Ok(Action::AwaitChange));
            }
        };
        if gvk.group != CONSTRAINTS_GROUP {
            warn!(%req, group = %gvk.group, "Dropping request for a foreign group");
            return (Outcome::NoOp, Ok(Action::AwaitChange));
        }

        let span = info_span!("constraint", kind = %gvk.kind, %name);
        async move {
            let (constraint, missing) = match self.fetch(&gvk, &name).await {
                Ok(fetched) => fetched,
                Err(error) => return (Outcome::NoOp, Err(error)),
            };
            let deleted = missing || constraint.is_deleting();

            let action = match EnforcementAction::from_spec(
                constraint.spec(),
                self.config.default_enforcement_action,
            ) {
                Ok(action) => action,
                Err(error) => return (Outcome::NoOp, Err(error.into())),
            };

            if deleted {
                self.delete(&gvk, &constraint).await
            } else {
                self.upsert(&gvk, &constraint, action).await
            }
        }
        .instrument(span)
        .await
    }

    /// Reads the constraint, returning a placeholder and true when it is
    /// gone.
    async fn fetch(
        &self,
        gvk: &GroupVersionKind,
        name: &str,
    ) -> Result<(DynamicObject, bool), Error> {
        let placeholder = || DynamicObject::new(name, &constraint_api_resource(gvk));

        if !(self.fetch_gate)(gvk) {
            debug!("Kind is no longer watched");
            return Ok((placeholder(), true));
        }
        match self.store.get_constraint(gvk, name).await {
            Ok(constraint) => Ok((constraint, false)),
            Err(error) if error.is_absent() => {
                debug!(%error, "Constraint is gone");
                Ok((placeholder(), true))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn upsert(
        &self,
        gvk: &GroupVersionKind,
        constraint: &DynamicObject,
        action: EnforcementAction,
    ) -> (Outcome, Result<Action, Error>) {
        let key = StatusCache::key(&gvk.kind, constraint.name());
        let errored = |error: Error| -> (Outcome, Result<Action, Error>) {
            self.cache
                .add_or_replace(key.clone(), Tags::new(action, Status::Error));
            (Outcome::Errored, Err(error))
        };

        let mut status = match self.pod_status(constraint).await {
            Ok(status) => status,
            Err(error) => return (Outcome::NoOp, Err(error)),
        };
        {
            let s = status::pod_status(&mut status);
            s.errors.clear();
            s.id = self.config.pod_name.clone();
            s.constraint_uid = constraint.metadata.uid.clone().unwrap_or_default();
            s.operations = self.config.operations.clone();
        }

        if let Err(error) = enforcement_action::validate(action, constraint.spec()) {
            // Retrying cannot fix a malformed enforcement action, so it must
            // not hold readiness back.
            self.tracker.try_cancel_expect(gvk, constraint);
            let error = status::report_error(&*self.store, &mut status, error.into()).await;
            return errored(error);
        }

        let requeue = match self.lower(constraint, action, &mut status).await {
            Ok(requeue) => requeue,
            Err(error) => return errored(error),
        };

        let sanitized = without_status(constraint);
        let unchanged = match self.engine.get_constraint(&sanitized).await {
            Ok(cached) => semantic_eq(&cached, &sanitized),
            Err(_) => false,
        };
        if unchanged {
            debug!("Engine is up to date");
        } else {
            if let Err(error) = self.engine.add_constraint(&sanitized).await {
                let error = status::report_error(&*self.store, &mut status, error.into()).await;
                return errored(error);
            }
            info!(enforcement_action = %action, "Constraint added to the engine");
        }

        {
            let s = status::pod_status(&mut status);
            s.enforced = true;
            s.observed_generation = constraint.generation();
        }
        self.cache
            .add_or_replace(key, Tags::new(action, Status::Active));
        self.tracker.observe(gvk, constraint);

        if let Err(error) = self.store.update_pod_status(&status).await {
            return (Outcome::Upserted, Err(error.into()));
        }

        let action = match requeue {
            Some(after) => Action::Requeue(after),
            None => Action::AwaitChange,
        };
        (Outcome::Upserted, Ok(action))
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        constraint: &DynamicObject,
    ) -> (Outcome, Result<Action, Error>) {
        match self.engine.remove_constraint(&without_status(constraint)).await {
            Ok(()) => info!("Constraint removed from the engine"),
            Err(EngineError::MissingConstraint { .. }) => {
                debug!("Constraint was never added to the engine")
            }
            Err(error) => return (Outcome::NoOp, Err(error.into())),
        }
        self.tracker.cancel_expect(gvk, constraint);
        self.cache
            .delete(&StatusCache::key(&gvk.kind, constraint.name()));

        let name = pod_status_name(&self.config.pod_name, &gvk.kind, constraint.name());
        match self.store.delete_pod_status(&name).await {
            Ok(()) => debug!(status = %name, "Deleted pod status"),
            Err(error) if error.is_not_found() => {}
            Err(error) => return (Outcome::Deleted, Err(error.into())),
        }

        // Owner references would get the binding collected eventually, but a
        // constraint recreated under the same name must not find it.
        if let Some(version) = self.probe.version().await {
            let binding = binding_name(constraint.name());
            if let Err(error) = self.delete_binding(version, &binding).await {
                return (Outcome::Deleted, Err(error.into()));
            }
        }

        (Outcome::Deleted, Ok(Action::AwaitChange))
    }

    async fn pod_status(&self, constraint: &DynamicObject) -> Result<ConstraintPodStatus, Error> {
        let kind = constraint.kind().unwrap_or_default();
        let name = pod_status_name(&self.config.pod_name, kind, constraint.name());
        match self.store.get_pod_status(&name).await {
            Ok(status) => Ok(status),
            Err(error) if error.is_not_found() => {
                let status = ConstraintPodStatus::for_constraint(
                    &self.config.pod_name,
                    &self.config.namespace,
                    constraint,
                );
                Ok(self.store.create_pod_status(&status).await?)
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("probe", &self.probe)
            .field("switch", &self.switch)
            .finish_non_exhaustive()
    }
}
