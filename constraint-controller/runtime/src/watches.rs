//! Turns cluster events into reconcile requests.
//!
//! Constraint kinds come and go with their templates, so each kind gets its
//! own watch, started when its template appears and stopped when it is
//! removed.

use crate::queue::Scheduler;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use gatekeeper_constraint_controller_core::{engine::Index, readiness::Expectations};
use gatekeeper_constraint_controller_k8s_api::{
    self as k8s, constraint_api_resource, pod_status::POD_LABEL, request, ConstraintPodStatus,
    ConstraintTemplate, DynamicObject, GroupVersionKind, Request, ResourceExt, CONSTRAINTS_GROUP,
    CONSTRAINTS_VERSION,
};
use gatekeeper_constraint_controller_k8s_reconcile::FetchGate;
use kube::runtime::{watcher, WatchStreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// The constraint kinds currently watched.
#[derive(Clone, Debug, Default)]
pub struct Kinds(Arc<RwLock<HashMap<String, Watch>>>);

#[derive(Debug)]
struct Watch {
    task: JoinHandle<()>,
    names: Names,
}

/// Constraint names seen by a kind's watch.
type Names = Arc<RwLock<HashSet<String>>>;

// === impl Kinds ===

impl Kinds {
    pub fn is_watched(&self, kind: &str) -> bool {
        self.0.read().contains_key(kind)
    }

    /// Allows fetches only for kinds that are still watched.
    pub fn fetch_gate(&self) -> FetchGate {
        let kinds = self.clone();
        Arc::new(move |gvk: &GroupVersionKind| kinds.is_watched(&gvk.kind))
    }

    fn insert(&self, kind: String, watch: Watch) {
        self.0.write().insert(kind, watch);
    }

    fn remove(&self, kind: &str) -> Option<Watch> {
        self.0.write().remove(kind)
    }

    fn kinds(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }
}

/// Watches templates, starting and stopping constraint watches as kinds
/// appear and disappear.
pub async fn templates(
    events: impl Stream<Item = watcher::Event<ConstraintTemplate>>,
    client: k8s::Client,
    kinds: Kinds,
    index: Index,
    expectations: Expectations,
    scheduler: Scheduler,
) {
    tokio::pin!(events);

    let register = |kind: &str| {
        if kind.is_empty() || kinds.is_watched(kind) {
            return;
        }
        index.add_template(kind);
        let gvk = GroupVersionKind::gvk(CONSTRAINTS_GROUP, CONSTRAINTS_VERSION, kind);
        let names = Names::default();
        let task = tokio::spawn(
            constraints(
                client.clone(),
                gvk,
                names.clone(),
                expectations.clone(),
                scheduler.clone(),
            )
            .instrument(info_span!("constraints", %kind)),
        );
        info!(%kind, "Watching constraints");
        kinds.insert(kind.to_string(), Watch { task, names });
    };

    let unregister = |kind: &str| {
        let Some(Watch { task, names }) = kinds.remove(kind) else {
            return;
        };
        task.abort();
        index.remove_template(kind);
        info!(%kind, "Stopped watching constraints");

        // The fetch gate now reports these as gone, so each reconcile tears
        // its constraint down.
        let gvk = GroupVersionKind::gvk(CONSTRAINTS_GROUP, CONSTRAINTS_VERSION, kind);
        for name in names.read().iter() {
            scheduler.schedule(Request::new(&gvk, name));
        }
    };

    // Kinds seen since the watch last restarted.
    let mut relisted = HashSet::default();
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init => relisted.clear(),
            watcher::Event::InitApply(template) => {
                let kind = template.constraint_kind();
                relisted.insert(kind.to_string());
                register(kind);
            }
            watcher::Event::InitDone => {
                // Templates deleted while the watch was down.
                for kind in kinds.kinds() {
                    if !relisted.contains(&kind) {
                        unregister(&kind);
                    }
                }
            }
            watcher::Event::Apply(template) => register(template.constraint_kind()),
            watcher::Event::Delete(template) => unregister(template.constraint_kind()),
        }
    }
}

/// Schedules a request for every change to a constraint of one kind.
///
/// Constraints in the watch's first listing are expected before the
/// controller reports ready.
async fn constraints(
    client: k8s::Client,
    gvk: GroupVersionKind,
    names: Names,
    expectations: Expectations,
    scheduler: Scheduler,
) {
    let api = k8s::Api::<DynamicObject>::all_with(client, &constraint_api_resource(&gvk));
    let events = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(events);

    let mut relisted = HashSet::default();
    let mut listed = false;
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "Constraint watch failed");
                continue;
            }
        };
        match event {
            watcher::Event::Init => relisted.clear(),
            watcher::Event::InitApply(obj) => {
                if !listed {
                    expectations.expect(&gvk, obj.name_any());
                }
                relisted.insert(obj.name_any());
                names.write().insert(obj.name_any());
                scheduler.schedule(Request::new(&gvk, &obj.name_any()));
            }
            watcher::Event::InitDone => {
                listed = true;
                // Constraints deleted while the watch was down.
                let gone = names
                    .read()
                    .iter()
                    .filter(|n| !relisted.contains(*n))
                    .cloned()
                    .collect::<Vec<_>>();
                for name in gone {
                    names.write().remove(&name);
                    scheduler.schedule(Request::new(&gvk, &name));
                }
            }
            watcher::Event::Apply(obj) => {
                names.write().insert(obj.name_any());
                scheduler.schedule(Request::new(&gvk, &obj.name_any()));
            }
            watcher::Event::Delete(obj) => {
                names.write().remove(&obj.name_any());
                scheduler.schedule(Request::new(&gvk, &obj.name_any()));
            }
        }
    }
}

/// Maps this replica's pod status records back to their constraints, so a
/// status removed out from under the controller is restored.
///
/// Updates are ignored; they are almost always the controller's own writes.
pub async fn pod_statuses(client: k8s::Client, namespace: String, pod: String, scheduler: Scheduler) {
    let api = k8s::Api::<ConstraintPodStatus>::namespaced(client, &namespace);
    let config = watcher::Config::default().labels(&format!("{POD_LABEL}={pod}"));
    let events = watcher(api, config).default_backoff();
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Delete(status)) => {
                for req in request::for_owner_refs(status.owner_references()) {
                    debug!(%req, status = %status.name_any(), "Status deleted");
                    scheduler.schedule(req);
                }
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "Pod status watch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_gate_follows_watched_kinds() {
        let kinds = Kinds::default();
        let gate = kinds.fetch_gate();
        let gvk = GroupVersionKind::gvk(CONSTRAINTS_GROUP, CONSTRAINTS_VERSION, "K8sRequiredLabels");
        assert!(!gate(&gvk));

        let task = tokio::spawn(std::future::pending::<()>());
        kinds.insert(
            "K8sRequiredLabels".to_string(),
            Watch {
                task,
                names: Names::default(),
            },
        );
        assert!(gate(&gvk));

        kinds.remove("K8sRequiredLabels");
        assert!(!gate(&gvk));
    }
}
