use crate::{
    binding::FeatureProbe,
    core::{engine::Index, readiness::Expectations, EnforcementAction},
    k8s::{Client, ConstraintTemplate, Resource},
    queue::{self, Backoff},
    reconcile::{Config, KubeStore, Metrics, Reconciler, Switch},
    watches::{self, Kinds},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

const READINESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[clap(name = "constraint-controller", about = "A Gatekeeper constraint controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "gatekeeper=info,warn",
        env = "GATEKEEPER_CONSTRAINT_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Identifies this replica's pod status records.
    #[clap(long, env = "POD_NAME")]
    pod_name: String,

    /// The namespace pod status records are written to.
    #[clap(long, env = "POD_NAMESPACE", default_value = "gatekeeper-system")]
    namespace: String,

    /// Operations this replica performs. May be repeated.
    #[clap(long = "operation", default_values = ["audit", "status", "webhook"])]
    operations: Vec<String>,

    /// Applied to constraints that do not declare an enforcement action.
    #[clap(long, default_value = "deny")]
    default_enforcement_action: EnforcementAction,

    /// Generate bindings for constraints that do not scope an action to
    /// the binding enforcement point.
    #[clap(long = "default-create-vap-binding-for-constraints")]
    default_create_binding: bool,

    /// Treat templates without a `generateVAP` flag as generating policies.
    #[clap(long = "default-create-vap-for-templates")]
    default_create_policy: bool,

    /// Seconds after a template's creation before its bindings are
    /// generated.
    #[clap(long = "default-wait-for-vapb-generation", default_value = "30")]
    default_wait_secs: u64,

    #[clap(long, default_value = "100")]
    min_backoff_ms: u64,

    #[clap(long, default_value = "300")]
    max_backoff_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            pod_name,
            namespace,
            operations,
            default_enforcement_action,
            default_create_binding,
            default_create_policy,
            default_wait_secs,
            min_backoff_ms,
            max_backoff_secs,
        } = self;

        let backoff = Backoff {
            min: Duration::from_millis(min_backoff_ms),
            max: Duration::from_secs(max_backoff_secs),
        };
        if backoff.min > backoff.max {
            bail!("--min-backoff-ms must not exceed --max-backoff-secs");
        }

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("gatekeeper"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        if !api_resource_exists::<ConstraintTemplate>(&runtime.client()).await {
            bail!(
                "{} is not served; the template CRD must be installed",
                ConstraintTemplate::kind(&())
            );
        }

        let config = Config {
            pod_name,
            namespace: namespace.clone(),
            operations,
            default_enforcement_action,
            default_create_binding,
            default_create_policy,
            default_wait: Duration::from_secs(default_wait_secs),
        };
        info!(?config, "Starting");

        let index = Index::default();
        let expectations = Expectations::default();
        let kinds = Kinds::default();
        let switch = Switch::default();
        let probe = FeatureProbe::new(Arc::new(runtime.client()));
        let store = KubeStore::new(runtime.client(), namespace.clone());

        let reconciler = Arc::new(
            Reconciler::new(
                config.clone(),
                Arc::new(store),
                Arc::new(index.clone()),
                Arc::new(expectations.clone()),
                probe,
                metrics,
            )
            .with_switch(switch.clone())
            .with_fetch_gate(kinds.fetch_gate()),
        );

        let (scheduler, queue) = queue::channel(backoff);

        // Spawn resource watches.

        let templates = runtime.watch_all::<ConstraintTemplate>(watcher::Config::default());
        tokio::spawn(
            watches::templates(
                templates,
                runtime.client(),
                kinds,
                index,
                expectations.clone(),
                scheduler.clone(),
            )
            .instrument(info_span!("templates")),
        );

        tokio::spawn(
            watches::pod_statuses(runtime.client(), namespace, config.pod_name, scheduler)
                .instrument(info_span!("pod_statuses")),
        );

        tokio::spawn(
            queue
                .run(
                    move |req| {
                        let reconciler = reconciler.clone();
                        async move { reconciler.reconcile(&req).await }
                    },
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("reconcile")),
        );

        // In-flight reconciles finish, but nothing new starts once shutdown
        // begins.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = shutdown.signaled().await;
            switch.stop();
            drop(release);
        });

        tokio::spawn(
            readiness(expectations, READINESS_INTERVAL).instrument(info_span!("readiness")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Logs once every constraint listed at startup has been reconciled.
async fn readiness(expectations: Expectations, interval: Duration) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        if expectations.is_satisfied() {
            info!("All constraints listed at startup have been reconciled");
            return;
        }
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["constraint-controller", "--pod-name=gatekeeper-audit-0"])
            .expect("args must parse");
        assert_eq!(args.pod_name, "gatekeeper-audit-0");
        assert_eq!(args.operations, ["audit", "status", "webhook"]);
        assert_eq!(args.default_enforcement_action, EnforcementAction::Deny);
        assert!(!args.default_create_binding);
        assert!(!args.default_create_policy);
        assert_eq!(args.default_wait_secs, 30);
    }

    #[test]
    fn repeated_operations_replace_defaults() {
        let args = Args::try_parse_from([
            "constraint-controller",
            "--pod-name=p",
            "--operation=audit",
            "--operation=status",
            "--default-enforcement-action=warn",
            "--default-create-vap-binding-for-constraints",
        ])
        .expect("args must parse");
        assert_eq!(args.operations, ["audit", "status"]);
        assert_eq!(args.default_enforcement_action, EnforcementAction::Warn);
        assert!(args.default_create_binding);
    }

    #[test]
    fn rejects_scoped_default_action() {
        let res = Args::try_parse_from([
            "constraint-controller",
            "--pod-name=p",
            "--default-enforcement-action=scoped",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn rejects_unknown_default_action() {
        let res = Args::try_parse_from([
            "constraint-controller",
            "--pod-name=p",
            "--default-enforcement-action=audit",
        ]);
        assert!(res.is_err());
    }
}
