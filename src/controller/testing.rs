//! Shared fixtures for controller tests

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DynamicObject, ObjectMeta};
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use crate::config::OperatorConfig;
use crate::controller::action::ActionContext;
use crate::controller::conditions::{ready_reason, ReadyReason};
use crate::controller::events::MemoryEventRecorder;
use crate::controller::pipeline::{PassOutcome, Pipeline};
use crate::crd::{
    CTlog, CTlogSpec, ManagedResource, Rekor, RekorSpec, ResourceRequirements, Trillian,
    TrillianService, TrillianSpec,
};
use crate::error::Result;
use crate::store::{self, ClusterStore, MemoryStore};

pub const NAMESPACE: &str = "sigstore";

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(format!("uid-{name}")),
        generation: Some(1),
        ..Default::default()
    }
}

pub fn trillian(name: &str) -> Trillian {
    Trillian {
        metadata: meta(name),
        spec: TrillianSpec {
            database_secret_ref: "trillian-db".to_string(),
            replicas: 1,
            resources: ResourceRequirements::default(),
        },
        status: None,
    }
}

pub fn rekor(name: &str, tree_id: Option<i64>) -> Rekor {
    Rekor {
        metadata: meta(name),
        spec: RekorSpec {
            tree_id,
            trillian: TrillianService::default(),
            signer_secret_ref: None,
            replicas: 1,
            resources: ResourceRequirements::default(),
        },
        status: None,
    }
}

pub fn ctlog(name: &str, tree_id: Option<i64>) -> CTlog {
    CTlog {
        metadata: meta(name),
        spec: CTlogSpec {
            tree_id,
            trillian: TrillianService::default(),
            config_secret_ref: "ctlog-config".to_string(),
            resources: ResourceRequirements::default(),
        },
        status: None,
    }
}

/// In-memory collaborators wired the way the controller wires the real ones
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventRecorder>,
    pub ctx: ActionContext,
}

pub fn harness() -> Harness {
    harness_with(OperatorConfig::default())
}

pub fn harness_with(config: OperatorConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_over(store.clone(), store, config)
}

/// Harness whose actions talk to `backend` while fixtures use `store` directly
pub fn harness_over(
    store: Arc<MemoryStore>,
    backend: Arc<dyn ClusterStore>,
    config: OperatorConfig,
) -> Harness {
    let events = Arc::new(MemoryEventRecorder::new());
    let ctx = ActionContext::new(backend, events.clone(), Arc::new(config));
    Harness { store, events, ctx }
}

impl Harness {
    /// Store a fresh managed resource
    pub async fn create<K: ManagedResource>(&self, obj: &K) -> K {
        store::create(self.store.as_ref(), obj).await.unwrap()
    }

    /// Read back a managed resource
    pub async fn get<K: ManagedResource>(&self, name: &str) -> K {
        store::get(self.store.as_ref(), NAMESPACE, name)
            .await
            .unwrap()
            .expect("resource exists")
    }

    /// Run one reconcile pass
    pub async fn pass<K: ManagedResource>(
        &self,
        pipeline: &Pipeline<K>,
        name: &str,
    ) -> Result<PassOutcome> {
        pipeline.reconcile(&self.ctx, NAMESPACE, name).await
    }

    /// Run one pass that must succeed, returning the outcome and the new Ready reason
    pub async fn step<K: ManagedResource>(
        &self,
        pipeline: &Pipeline<K>,
        name: &str,
    ) -> (PassOutcome, Option<ReadyReason>) {
        let outcome = self.pass(pipeline, name).await.unwrap();
        let obj: K = self.get(name).await;
        (outcome, ready_reason(&obj))
    }

    pub async fn deployment(&self, name: &str) -> Option<Deployment> {
        store::get(self.store.as_ref(), NAMESPACE, name)
            .await
            .unwrap()
    }

    pub async fn config_map(&self, name: &str) -> Option<ConfigMap> {
        store::get(self.store.as_ref(), NAMESPACE, name)
            .await
            .unwrap()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        store::list(self.store.as_ref(), NAMESPACE, "").await.unwrap()
    }

    /// Report a Deployment as Available, like the deployment controller would
    pub async fn mark_available(&self, name: &str) {
        let mut deployment = self.deployment(name).await.expect("deployment exists");
        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        store::replace_status(self.store.as_ref(), &deployment)
            .await
            .unwrap();
    }

    /// Finish a Job with the given terminal condition (`Complete` or `Failed`)
    pub async fn finish_job(&self, name: &str, condition: &str) {
        let mut job: Job = store::get(self.store.as_ref(), NAMESPACE, name)
            .await
            .unwrap()
            .expect("job exists");
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: condition.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        store::replace_status(self.store.as_ref(), &job)
            .await
            .unwrap();
    }

    /// Write the holder payload the way the tree workload does
    pub async fn write_holder(&self, holder: &str, tree_id: &str) {
        let mut cm = self.config_map(holder).await.expect("holder exists");
        cm.data = Some(BTreeMap::from([(
            "tree_id".to_string(),
            tree_id.to_string(),
        )]));
        store::replace(self.store.as_ref(), &cm).await.unwrap();
    }
}

/// Insert `value` under `key` unless the field is already set
fn set_default(target: &mut Value, key: &str, value: Value) {
    if let Some(map) = target.as_object_mut() {
        map.entry(key).or_insert(value);
    }
}

fn default_ports(target: &mut Value) {
    let ports = target.get_mut("ports").and_then(Value::as_array_mut);
    for port in ports.into_iter().flatten() {
        set_default(port, "protocol", json!("TCP"));
    }
}

/// Fill in the fields the API server defaults on Deployment and Service writes
pub fn apply_server_defaults(kind: &str, obj: &DynamicObject) -> DynamicObject {
    let mut obj = obj.clone();
    if let Some(spec) = obj.data.get_mut("spec") {
        match kind {
            "Deployment" => {
                set_default(spec, "revisionHistoryLimit", json!(10));
                set_default(spec, "progressDeadlineSeconds", json!(600));
                if let Some(pod) = spec.pointer_mut("/template/spec") {
                    set_default(pod, "restartPolicy", json!("Always"));
                    set_default(pod, "dnsPolicy", json!("ClusterFirst"));
                    let containers = pod.get_mut("containers").and_then(Value::as_array_mut);
                    for container in containers.into_iter().flatten() {
                        set_default(container, "imagePullPolicy", json!("IfNotPresent"));
                        set_default(
                            container,
                            "terminationMessagePath",
                            json!("/dev/termination-log"),
                        );
                        default_ports(container);
                        if let Some(readiness) = container.get_mut("readinessProbe") {
                            set_default(readiness, "timeoutSeconds", json!(1));
                            set_default(readiness, "periodSeconds", json!(10));
                            set_default(readiness, "successThreshold", json!(1));
                            set_default(readiness, "failureThreshold", json!(3));
                        }
                    }
                }
            }
            "Service" => {
                set_default(spec, "type", json!("ClusterIP"));
                set_default(spec, "sessionAffinity", json!("None"));
                set_default(spec, "clusterIP", json!("10.96.0.10"));
                default_ports(spec);
            }
            _ => {}
        }
    }
    obj
}

/// Store that defaults Deployments and Services on every write, like a real API server
pub struct DefaultingStore {
    pub inner: Arc<MemoryStore>,
}

#[async_trait]
impl ClusterStore for DefaultingStore {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.inner.get(ar, namespace, name).await
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let defaulted = apply_server_defaults(&ar.kind, obj);
        self.inner.create(ar, namespace, &defaulted).await
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let defaulted = apply_server_defaults(&ar.kind, obj);
        self.inner.replace(ar, namespace, &defaulted).await
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.inner.replace_status(ar, namespace, obj).await
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        self.inner.delete(ar, namespace, name).await
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        self.inner.list(ar, namespace, label_selector).await
    }
}

/// Harness whose actions write through a [`DefaultingStore`]
pub fn defaulting_harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(DefaultingStore {
        inner: store.clone(),
    });
    harness_over(store, backend, OperatorConfig::default())
}
