//! Controller loops for the managed Sigstore kinds
//!
//! Each kind gets its own kube-rs `Controller` watching the custom resource
//! and every artifact kind its pipeline creates. A change to either queues
//! a pass over the owning resource.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::action::ActionContext;
use crate::controller::pipeline::{PassOutcome, Pipeline};
use crate::controller::{ctlog, rekor, trillian};
use crate::crd::{CTlog, ManagedResource, Rekor, Trillian};
use crate::error::{Error, Result};

/// Delay before a non-leader replica looks at a resource again
const STANDBY_REQUEUE: Duration = Duration::from_secs(5);

/// Fallback delay for errors that are neither retriable nor terminal
const SLOW_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    /// Set by the leader election loop; passes only run while it is true
    pub is_leader: Arc<AtomicBool>,
    pub ctx: ActionContext,
}

/// Per-kind context: the shared state plus that kind's pipeline
struct KindContext<K> {
    state: Arc<ControllerState>,
    pipeline: Pipeline<K>,
}

/// Main entry point to start the controllers
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    info!(
        "Starting Sigstore controllers (namespace scope: {})",
        state
            .config
            .watch_namespace
            .as_deref()
            .unwrap_or("<all>")
    );

    let (t, r, c) = futures::join!(
        run_kind::<Trillian>(state.clone(), trillian::pipeline()),
        run_kind::<Rekor>(state.clone(), rekor::pipeline()),
        run_kind::<CTlog>(state.clone(), ctlog::pipeline()),
    );
    t?;
    r?;
    c?;
    Ok(())
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run_kind<K>(state: Arc<ControllerState>, pipeline: Pipeline<K>) -> Result<()>
where
    K: ManagedResource + Resource<Scope = NamespaceResourceScope>,
{
    let client = state.client.clone();
    let namespace = state.config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    let kind = K::kind(&()).to_string();
    let managed: Api<K> = scoped(&client, namespace);

    // Verify CRD exists
    match managed.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("{} CRD is available", kind),
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            return Err(Error::ConfigError(format!("{kind} CRD not installed")));
        }
    }
    info!("Pipeline for {}: {:?}", kind, pipeline.action_names());

    let ctx = Arc::new(KindContext { state, pipeline });
    Controller::new(managed, Config::default())
        .owns::<Deployment>(scoped(&client, namespace), Config::default())
        .owns::<Service>(scoped(&client, namespace), Config::default())
        .owns::<Job>(scoped(&client, namespace), Config::default())
        .owns::<ConfigMap>(scoped(&client, namespace), Config::default())
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!("Reconciled {}: {:?}", obj, action),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    info!("{} controller stopped", kind);
    Ok(())
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = %obj.namespace().unwrap_or_default()))]
async fn reconcile<K: ManagedResource>(obj: Arc<K>, ctx: Arc<KindContext<K>>) -> Result<Action> {
    if !ctx.state.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping pass");
        return Ok(Action::requeue(STANDBY_REQUEUE));
    }

    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let outcome = ctx
        .pipeline
        .reconcile(&ctx.state.ctx, &namespace, &obj.name_any())
        .await?;
    Ok(match next_pass(&outcome, &ctx.state.config) {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// When to run the next pass after a successful one; `None` waits for a watch event
pub(crate) fn next_pass(outcome: &PassOutcome, config: &OperatorConfig) -> Option<Duration> {
    match outcome {
        PassOutcome::Idle => Some(config.resync()),
        PassOutcome::Requeue(delay) => Some(*delay),
        PassOutcome::StatusUpdated | PassOutcome::NotFound => None,
    }
}

/// When to retry after a failed pass; `None` waits for a spec change
pub(crate) fn retry_after(error: &Error, config: &OperatorConfig) -> Option<Duration> {
    if error.is_terminal() {
        None
    } else if error.is_retriable() {
        Some(config.error_requeue())
    } else {
        Some(SLOW_REQUEUE)
    }
}

fn error_policy<K: ManagedResource>(obj: Arc<K>, error: &Error, ctx: Arc<KindContext<K>>) -> Action {
    error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    match retry_after(error, &ctx.state.config) {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}
