//! Owned Deployment/Service actions and the readiness gate
//!
//! These are generic over the managed kind; each pipeline instantiates them
//! with the builders from [`crate::controller::resources`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::ImageConfig;
use crate::controller::action::{ActionContext, ActionResult, ReconcileAction};
use crate::controller::conditions::{all_true, ready_reason, ready_reason_in, set_ready, ReadyReason};
use crate::controller::ensure::{
    ensure, ensure_controller_reference, ensure_deployment_spec, ensure_labels,
    ensure_service_spec, Mutator,
};
use crate::controller::events::{record, EventType};
use crate::controller::resources::{owner_reference, MANAGED_LABELS};
use crate::crd::ManagedResource;
use crate::error::Result;
use crate::store;

/// Artifact actions only run once the resource is being built
const BUILDING: &[ReadyReason] = &[
    ReadyReason::Creating,
    ReadyReason::Initialize,
    ReadyReason::Ready,
];

fn ensured<K: ManagedResource>(obj: &mut K, kind: &str, name: &str) -> ActionResult {
    info!("Ensured {} {} for {}", kind, name, obj.name_any());
    if ready_reason(obj) == Some(ReadyReason::Creating) {
        set_ready(obj, ReadyReason::Creating, &format!("{kind} {name} ensured"));
    }
    ActionResult::StatusUpdate
}

/// Keep one Deployment in sync with its builder
pub struct EnsureDeployment<K> {
    name: &'static str,
    requires: &'static [&'static str],
    build: fn(&K, &ImageConfig) -> Result<Deployment>,
}

impl<K> EnsureDeployment<K> {
    pub fn new(name: &'static str, build: fn(&K, &ImageConfig) -> Result<Deployment>) -> Self {
        Self {
            name,
            requires: &[],
            build,
        }
    }

    /// Wait for these sub-features before building
    pub fn requires(mut self, features: &'static [&'static str]) -> Self {
        self.requires = features;
        self
    }
}

/// Create or update a Deployment owned by `owner`
pub async fn ensure_deployment<K: ManagedResource>(
    ctx: &ActionContext,
    owner: &K,
    desired: Deployment,
) -> Result<bool> {
    let mutators: Vec<Mutator<Deployment>> = vec![
        ensure_labels(MANAGED_LABELS, desired.labels().clone()),
        ensure_controller_reference(owner_reference(owner)),
        ensure_deployment_spec(desired.spec.clone().unwrap_or_default()),
    ];
    ensure(ctx.store.as_ref(), desired, &mutators).await
}

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for EnsureDeployment<K> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason_in(obj, BUILDING) && all_true(obj.conditions(), self.requires)
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let desired = match (self.build)(obj, &ctx.config.images) {
            Ok(desired) => desired,
            Err(e) => return ActionResult::Failed(e),
        };
        let name = desired.name_any();
        match ensure_deployment(ctx, obj, desired).await {
            Ok(true) => ensured(obj, "Deployment", &name),
            Ok(false) => ActionResult::Continue,
            Err(e) => ActionResult::Failed(e),
        }
    }
}

/// Keep one Service in sync with its builder
pub struct EnsureService<K> {
    name: &'static str,
    build: fn(&K) -> Service,
}

impl<K> EnsureService<K> {
    pub fn new(name: &'static str, build: fn(&K) -> Service) -> Self {
        Self { name, build }
    }
}

/// Create or update a Service owned by `owner`
pub async fn ensure_service<K: ManagedResource>(
    ctx: &ActionContext,
    owner: &K,
    desired: Service,
) -> Result<bool> {
    let mutators: Vec<Mutator<Service>> = vec![
        ensure_labels(MANAGED_LABELS, desired.labels().clone()),
        ensure_controller_reference(owner_reference(owner)),
        ensure_service_spec(desired.spec.clone().unwrap_or_default()),
    ];
    ensure(ctx.store.as_ref(), desired, &mutators).await
}

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for EnsureService<K> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason_in(obj, BUILDING)
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let desired = (self.build)(obj);
        let name = desired.name_any();
        match ensure_service(ctx, obj, desired).await {
            Ok(true) => ensured(obj, "Service", &name),
            Ok(false) => ActionResult::Continue,
            Err(e) => ActionResult::Failed(e),
        }
    }
}

/// Check whether a Deployment reports the Available condition
pub fn is_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
}

/// Initialize → Ready once every named Deployment is available
pub struct Initialize<K> {
    deployments: fn(&K) -> Vec<String>,
    on_ready: fn(&mut K),
}

impl<K> Initialize<K> {
    pub fn new(deployments: fn(&K) -> Vec<String>, on_ready: fn(&mut K)) -> Self {
        Self {
            deployments,
            on_ready,
        }
    }
}

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for Initialize<K> {
    fn name(&self) -> &'static str {
        "initialize"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason(obj) == Some(ReadyReason::Initialize)
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let namespace = obj.namespace().unwrap_or_default();
        for name in (self.deployments)(obj) {
            match store::get::<Deployment>(ctx.store.as_ref(), &namespace, &name).await {
                Ok(Some(deployment)) if is_available(&deployment) => {}
                Ok(_) => {
                    debug!("Deployment {}/{} not available yet", namespace, name);
                    return ActionResult::Requeue(ctx.short_requeue());
                }
                Err(e) => return ActionResult::Failed(e),
            }
        }

        let message = format!("{} is ready", K::kind(&()));
        set_ready(obj, ReadyReason::Ready, &message);
        obj.set_recovery_attempts(0);
        (self.on_ready)(obj);
        record(ctx, obj, EventType::Normal, "Ready", &message).await;
        ActionResult::StatusUpdate
    }
}
