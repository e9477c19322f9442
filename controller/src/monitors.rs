//! Monitors holds the controller for the "MetricsMonitor" CRD.

use std::{
    env,
    sync::{Arc, LazyLock},
};

use k8s_openapi::{
    api::apps::v1::Deployment, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{Api, Patch},
    core::GroupVersionKind,
    runtime::{
        controller::{Config as ControllerConfig, Error as CtrlErr},
        finalizer::{finalizer, Event as Finalizer},
    },
};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{Duration, Instant},
};
use tokio_stream::wrappers::SignalStream;

use crate::{config::Configuration, k8s_label, prelude::*};
use v1alpha1::{ConditionKind, MetricsMonitor};

static SELF_GVK: LazyLock<GroupVersionKind> = LazyLock::new(|| GroupVersionKind {
    group: MetricsMonitor::group(&()).to_string(),
    version: MetricsMonitor::version(&()).to_string(),
    kind: MetricsMonitor::kind(&()).to_string(),
});

/// MONITOR_FINALIZER gates deletion so the stores built for a monitor are
/// released before the object goes away.
pub const MONITOR_FINALIZER: &str = "crstate.io/store-teardown";

// POD_NAMESPACE selects the namespace holding the controller's own
// Deployment, which monitors are owner-referenced to when set.
const POD_NAMESPACE: &str = "POD_NAMESPACE";

/// Controller is the MetricsMonitor controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(
    cancel: CancellationToken,
    ctx: Arc<Context>,
    workers: u16,
) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<MetricsMonitor> = Api::all(client);
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    Ok(async move {
        let ctl = Controller::new(root, ctlcfg)
            .with_config(ControllerConfig::default().concurrency(workers))
            .reconcile_all_on(sig)
            .graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting metricsmonitor controller");

        if !ctx.gvk_exists(&SELF_GVK).await {
            error!("CRD is not queryable ({SELF_GVK:?}); is the CRD installed?");
            return Err(Error::MissingMetadata("no CRD"));
        }

        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                    };
                }
                futures::future::ready(())
            })
            .await;
        debug!("metricsmonitor controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(monitor: Arc<MetricsMonitor>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(
        error = err.to_string(),
        monitor.metadata.name, monitor.metadata.uid, "reconcile error"
    );
    // Exponential per-object backoff; the streak resets on the next success.
    Action::requeue(ctx.next_backoff(&monitor.name_any()))
}

#[instrument(skip(ctx, monitor), fields(
    name = monitor.name_any(),
    generation = monitor.metadata.generation,
    resource_version = monitor.metadata.resource_version
))]
async fn reconcile(monitor: Arc<MetricsMonitor>, ctx: Arc<Context>) -> Result<Action> {
    info!("reconciling MetricsMonitor");
    ctx.throttle().await;

    let name = monitor.name_any();
    let api: Api<MetricsMonitor> = Api::all(ctx.client.clone());
    let action = finalizer(&api, MONITOR_FINALIZER, monitor, |event| async {
        match event {
            Finalizer::Apply(monitor) => Reconciler::from((monitor, ctx.clone())).apply().await,
            Finalizer::Cleanup(monitor) => {
                Reconciler::from((monitor, ctx.clone())).cleanup().await
            }
        }
    })
    .await
    .map_err(Error::from)?;
    ctx.reset_backoff(&name);
    Ok(action)
}

#[derive(Debug)]
struct Reconciler {
    monitor: Arc<MetricsMonitor>,
    ctx: Arc<Context>,
    api: Api<MetricsMonitor>,
}

impl From<(Arc<MetricsMonitor>, Arc<Context>)> for Reconciler {
    fn from(value: (Arc<MetricsMonitor>, Arc<Context>)) -> Self {
        let (monitor, ctx) = value;
        let api: Api<MetricsMonitor> = Api::all(ctx.client.clone());
        Self { monitor, ctx, api }
    }
}

impl Reconciler {
    fn client(&self) -> kube::Client {
        self.ctx.client.clone()
    }
    fn name(&self) -> String {
        self.monitor.name_any()
    }
    fn uid(&self) -> Result<String> {
        self.monitor.uid().ok_or(Error::MissingMetadata("uid"))
    }

    // The generation recorded by the last successful pass, if any.
    fn processed_generation(&self) -> Option<i64> {
        self.monitor
            .status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == ConditionKind::Processed.as_str() && c.status == "True")?
            .observed_generation
    }

    #[instrument(skip(self), ret)]
    async fn apply(self) -> Result<Action> {
        let uid = self.uid()?;

        // Status writes bump the resource version but not the generation, so
        // a served generation means this event is self-induced churn.
        if self.ctx.registry.contains(&uid)
            && self.processed_generation().is_some()
            && self.processed_generation() == self.monitor.metadata.generation
        {
            debug!(uid, "configuration already served, skipping rebuild");
            return Ok(Action::await_change());
        }

        self.refresh_metadata().await?;
        self.set_condition(ConditionKind::Processed, false, "event handler received the resource")
            .await?;

        // Between resource versions the old stores are stale; drop before the
        // (purely additive) rebuild.
        self.ctx.registry.drop_uid(&uid);

        let configuration = match Configuration::parse(&self.monitor.spec.configuration_yaml) {
            Ok(configuration) => configuration,
            Err(err @ Error::Configuration(_)) => {
                warn!(error = %err, "rejecting configuration");
                self.set_condition(ConditionKind::Failed, true, &err.to_string())
                    .await?;
                self.publish(EventType::Warning, "ConfigurationRejected", &err.to_string())
                    .await;
                // User input problem: a requeue cannot fix it.
                return Ok(Action::await_change());
            }
            Err(err) => return Err(err),
        };
        configuration.build(
            &self.client(),
            &self.ctx.registry,
            &uid,
            self.ctx.try_no_cache,
            &self.ctx.cancel,
        );
        info!(uid, stores = configuration.stores.len(), "built stores");

        self.set_condition(ConditionKind::Processed, true, "event handler completed successfully")
            .await?;
        self.publish(
            EventType::Normal,
            "ConfigurationApplied",
            &format!("serving {} store(s)", configuration.stores.len()),
        )
        .await;
        Ok(Action::await_change())
    }

    #[instrument(skip(self), ret)]
    async fn cleanup(self) -> Result<Action> {
        if let Some(uid) = self.monitor.uid() {
            self.ctx.registry.drop_uid(&uid);
            info!(uid, "released stores");
        }
        Ok(Action::await_change())
    }

    // Refresh_metadata stamps the managed-by and version labels and, when
    // POD_NAMESPACE is set, an owner reference to the controller's own
    // Deployment. Polls for up to a minute to ride out update bursts.
    #[instrument(skip(self))]
    async fn refresh_metadata(&self) -> Result<()> {
        let mut patch = serde_json::json!({
            "metadata": {
                "labels": {
                    (k8s_label("managed-by")): CONTROLLER_NAME.replace('_', "-"),
                    (k8s_label("version")): env!("CARGO_PKG_VERSION"),
                },
            },
        });
        if let Some(owner) = self.controller_owner().await {
            patch["metadata"]["ownerReferences"] = serde_json::json!([owner]);
        }

        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            match self
                .api
                .patch(&self.name(), &PATCH_PARAMS, &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if Instant::now() < deadline => {
                    debug!(error = %err, "error refreshing metadata, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn controller_owner(&self) -> Option<OwnerReference> {
        let namespace = env::var(POD_NAMESPACE).ok()?;
        let api = Api::<Deployment>::namespaced(self.client(), &namespace);
        match api.get_opt(CONTROLLER_NAME).await {
            Ok(Some(deployment)) => {
                let uid = deployment.uid()?;
                Some(OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "Deployment".into(),
                    name: deployment.name_any(),
                    uid,
                    controller: Some(true),
                    block_owner_deletion: Some(false),
                })
            }
            Ok(None) => {
                debug!(namespace, "controller Deployment not found, skipping owner reference");
                None
            }
            Err(err) => {
                debug!(error = %err, "error fetching controller Deployment, skipping owner reference");
                None
            }
        }
    }

    async fn set_condition(&self, kind: ConditionKind, status: bool, detail: &str) -> Result<()> {
        let mut next = self.api.get_status(&self.name()).await?;
        next.meta_mut().managed_fields = None;
        let generation = next.metadata.generation;
        next.status
            .get_or_insert_default()
            .set_condition(generation, kind, status, detail);
        debug!(condition = kind.as_str(), status, "patching status");
        self.api
            .patch_status(&self.name(), &PATCH_PARAMS, &Patch::Apply(&next))
            .await?;
        Ok(())
    }

    // Events are best-effort; a failed publish only logs.
    async fn publish(&self, type_: EventType, reason: &str, note: &str) {
        let ev = Event {
            type_,
            reason: reason.to_string(),
            action: "ProcessConfiguration".to_string(),
            note: Some(note.to_string()),
            secondary: None,
        };
        if let Err(err) = self.ctx.publish(&ev, &self.monitor.object_ref(&())).await {
            debug!(error = %err, "error publishing event");
        }
    }
}
