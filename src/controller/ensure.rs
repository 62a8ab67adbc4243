//! Declarative create-or-update of owned artifacts
//!
//! [`ensure`] fetches the object named by `desired`, and then either
//! creates it (mutators applied to `desired`), leaves it alone (paused or
//! already in sync), or replaces it (mutators applied to a copy of the live
//! object). Mutators only touch the fields they own; server defaults and
//! fields written by other writers survive an update.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{Container, ContainerPort, Probe, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::store::{self, ClusterStore};

/// Annotation that freezes an object: set to `"true"` and [`ensure`] stops touching it
pub const PAUSE_ANNOTATION: &str = "sigstore.dev/pause-reconciliation";

/// A composable edit applied to the desired or live object
pub type Mutator<K> = Box<dyn Fn(&mut K) -> Result<()> + Send + Sync>;

/// Metadata fields the API server owns and that never count as drift
const VOLATILE_METADATA: &[&str] = &[
    "resourceVersion",
    "managedFields",
    "generation",
    "creationTimestamp",
    "uid",
    "selfLink",
];

/// Create or update `desired`, returning whether anything was written
#[instrument(skip_all, fields(kind = %K::kind(&()), name = desired.meta().name.as_deref().unwrap_or_default()))]
pub async fn ensure<K>(store: &dyn ClusterStore, desired: K, mutators: &[Mutator<K>]) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync,
{
    let namespace = desired
        .meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let Some(existing) = store::get::<K>(store, &namespace, &name).await? else {
        let mut obj = desired;
        apply_mutators(&mut obj, mutators)?;
        store::create(store, &obj).await?;
        info!("Created {} {}/{}", K::kind(&()), namespace, name);
        return Ok(true);
    };

    if is_paused(&existing) {
        debug!("{} {}/{} is paused, skipping", K::kind(&()), namespace, name);
        return Ok(false);
    }

    let mut working = existing.clone();
    apply_mutators(&mut working, mutators)?;
    if projection(&working)? == projection(&existing)? {
        return Ok(false);
    }

    store::replace(store, &working).await?;
    info!("Updated {} {}/{}", K::kind(&()), namespace, name);
    Ok(true)
}

fn apply_mutators<K>(obj: &mut K, mutators: &[Mutator<K>]) -> Result<()> {
    mutators.iter().try_for_each(|m| m(obj))
}

/// Whether the pause annotation is set to `"true"`
pub fn is_paused<K: Resource>(obj: &K) -> bool {
    obj.annotations()
        .get(PAUSE_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// The part of an object that counts for drift detection
pub fn projection<K: Serialize>(obj: &K) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in VOLATILE_METADATA {
                meta.remove(*field);
            }
        }
    }
    Ok(value)
}

/// Merge `desired` into `current` for a set of keys this operator owns
///
/// Owned keys missing from `desired` are removed, then `desired` is laid
/// over the top. Keys outside `managed` are never touched.
pub fn merge_managed(
    current: &mut BTreeMap<String, String>,
    managed: &[String],
    desired: &BTreeMap<String, String>,
) {
    current.retain(|k, _| !managed.contains(k) || desired.contains_key(k));
    current.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn managed_keys(managed: &[&str], desired: &BTreeMap<String, String>) -> Vec<String> {
    managed
        .iter()
        .map(|k| k.to_string())
        .chain(desired.keys().cloned())
        .collect()
}

/// Keep the labels in `managed ∪ keys(desired)` equal to `desired`
pub fn ensure_labels<K: Resource>(managed: &[&str], desired: BTreeMap<String, String>) -> Mutator<K> {
    let managed = managed_keys(managed, &desired);
    Box::new(move |obj: &mut K| {
        merge_managed(obj.labels_mut(), &managed, &desired);
        Ok(())
    })
}

/// Keep the annotations in `managed ∪ keys(desired)` equal to `desired`
pub fn ensure_annotations<K: Resource>(
    managed: &[&str],
    desired: BTreeMap<String, String>,
) -> Mutator<K> {
    let managed = managed_keys(managed, &desired);
    Box::new(move |obj: &mut K| {
        merge_managed(obj.annotations_mut(), &managed, &desired);
        Ok(())
    })
}

/// Make `owner` the controller of the object
///
/// Fails when a different controller already claims it.
pub fn ensure_controller_reference<K: Resource>(owner: OwnerReference) -> Mutator<K> {
    Box::new(move |obj: &mut K| {
        let name = obj.name_any();
        let refs = obj.owner_references_mut();
        if let Some(other) = refs
            .iter()
            .find(|r| r.controller == Some(true) && r.uid != owner.uid)
        {
            return Err(Error::terminal(format!(
                "{name} is already controlled by {} {}",
                other.kind, other.name
            )));
        }
        match refs.iter_mut().find(|r| r.uid == owner.uid) {
            Some(existing) => *existing = owner.clone(),
            None => refs.push(owner.clone()),
        }
        Ok(())
    })
}

/// Add `owner` as an additional, non-controlling owner
pub fn ensure_owner_reference<K: Resource>(owner: OwnerReference) -> Mutator<K> {
    Box::new(move |obj: &mut K| {
        let refs = obj.owner_references_mut();
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(OwnerReference {
                controller: None,
                ..owner.clone()
            });
        }
        Ok(())
    })
}

/// Replace `current` only when `desired` sets a value
fn overlay<T: Clone>(current: &mut Option<T>, desired: &Option<T>) {
    if desired.is_some() {
        current.clone_from(desired);
    }
}

/// Desired container ports, each merged over the live port with the same number
fn merge_container_ports(
    current: Option<&Vec<ContainerPort>>,
    desired: &[ContainerPort],
) -> Vec<ContainerPort> {
    desired
        .iter()
        .map(|wanted| {
            let mut port = current
                .into_iter()
                .flatten()
                .find(|p| p.container_port == wanted.container_port)
                .cloned()
                .unwrap_or_default();
            port.container_port = wanted.container_port;
            overlay(&mut port.name, &wanted.name);
            overlay(&mut port.protocol, &wanted.protocol);
            overlay(&mut port.host_ip, &wanted.host_ip);
            overlay(&mut port.host_port, &wanted.host_port);
            port
        })
        .collect()
}

/// Desired readiness check merged over the live one; unset timings keep their server defaults
fn merge_readiness(current: Option<&Probe>, desired: &Probe) -> Probe {
    let mut check = current.cloned().unwrap_or_default();
    let live_scheme = check.http_get.as_ref().and_then(|h| h.scheme.clone());
    check.exec.clone_from(&desired.exec);
    check.grpc.clone_from(&desired.grpc);
    check.tcp_socket.clone_from(&desired.tcp_socket);
    check.http_get.clone_from(&desired.http_get);
    if let Some(http) = check.http_get.as_mut() {
        if http.scheme.is_none() {
            http.scheme = live_scheme;
        }
    }
    overlay(&mut check.initial_delay_seconds, &desired.initial_delay_seconds);
    overlay(&mut check.period_seconds, &desired.period_seconds);
    overlay(&mut check.timeout_seconds, &desired.timeout_seconds);
    overlay(&mut check.success_threshold, &desired.success_threshold);
    overlay(&mut check.failure_threshold, &desired.failure_threshold);
    overlay(
        &mut check.termination_grace_period_seconds,
        &desired.termination_grace_period_seconds,
    );
    check
}

/// Sync the managed parts of a container, keeping server-defaulted fields
fn sync_container(current: &mut Container, desired: &Container) {
    current.image = desired.image.clone();
    current.command = desired.command.clone();
    current.args = desired.args.clone();
    current.env = desired.env.clone();
    current.ports = desired
        .ports
        .as_ref()
        .map(|ports| merge_container_ports(current.ports.as_ref(), ports));
    current.resources = desired.resources.clone();
    current.volume_mounts = desired.volume_mounts.clone();
    current.readiness_probe = desired
        .readiness_probe
        .as_ref()
        .map(|check| merge_readiness(current.readiness_probe.as_ref(), check));
}

/// Sync replicas, pod labels, volumes and containers of a Deployment
///
/// The selector is immutable after creation and is only set when missing.
pub fn ensure_deployment_spec(
    desired: DeploymentSpec,
) -> Mutator<k8s_openapi::api::apps::v1::Deployment> {
    Box::new(move |deployment| {
        let spec = deployment.spec.get_or_insert_with(Default::default);
        spec.replicas = desired.replicas;
        if spec.selector.match_labels.is_none() && spec.selector.match_expressions.is_none() {
            spec.selector = desired.selector.clone();
        }

        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        let desired_labels = desired
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        let managed: Vec<String> = desired_labels.keys().cloned().collect();
        merge_managed(
            template_meta.labels.get_or_insert_with(Default::default),
            &managed,
            &desired_labels,
        );

        let Some(desired_pod) = desired.template.spec.as_ref() else {
            return Ok(());
        };
        let pod = spec.template.spec.get_or_insert_with(Default::default);
        pod.service_account_name = desired_pod.service_account_name.clone();
        pod.volumes = desired_pod.volumes.clone();

        let mut containers = Vec::with_capacity(desired_pod.containers.len());
        for wanted in &desired_pod.containers {
            let mut container = pod
                .containers
                .iter()
                .find(|c| c.name == wanted.name)
                .cloned()
                .unwrap_or_else(|| Container {
                    name: wanted.name.clone(),
                    ..Default::default()
                });
            sync_container(&mut container, wanted);
            containers.push(container);
        }
        pod.containers = containers;
        Ok(())
    })
}

/// Desired service ports, each merged over the live port with the same number
///
/// `protocol`, `targetPort` and an allocated `nodePort` keep their live values
/// when the desired port leaves them unset.
fn merge_service_ports(current: Option<&Vec<ServicePort>>, desired: &[ServicePort]) -> Vec<ServicePort> {
    desired
        .iter()
        .map(|wanted| {
            let mut port = current
                .into_iter()
                .flatten()
                .find(|p| p.port == wanted.port)
                .cloned()
                .unwrap_or_default();
            port.port = wanted.port;
            overlay(&mut port.name, &wanted.name);
            overlay(&mut port.protocol, &wanted.protocol);
            overlay(&mut port.target_port, &wanted.target_port);
            overlay(&mut port.node_port, &wanted.node_port);
            overlay(&mut port.app_protocol, &wanted.app_protocol);
            port
        })
        .collect()
}

/// Sync selector, ports and type of a Service, keeping the assigned cluster IP
pub fn ensure_service_spec(desired: ServiceSpec) -> Mutator<k8s_openapi::api::core::v1::Service> {
    Box::new(move |service| {
        let spec = service.spec.get_or_insert_with(Default::default);
        spec.selector = desired.selector.clone();
        spec.ports = desired
            .ports
            .as_ref()
            .map(|ports| merge_service_ports(spec.ports.as_ref(), ports));
        if desired.type_.is_some() {
            spec.type_ = desired.type_.clone();
        }
        Ok(())
    })
}

/// Keep the rules of a Role
pub fn ensure_role_rules(rules: Vec<PolicyRule>) -> Mutator<k8s_openapi::api::rbac::v1::Role> {
    Box::new(move |role| {
        role.rules = Some(rules.clone());
        Ok(())
    })
}

/// Keep the subjects of a RoleBinding. The role reference is immutable and
/// only set on creation.
pub fn ensure_role_binding(
    role_ref: RoleRef,
    subjects: Vec<Subject>,
) -> Mutator<k8s_openapi::api::rbac::v1::RoleBinding> {
    Box::new(move |binding| {
        if binding.role_ref.name.is_empty() {
            binding.role_ref = role_ref.clone();
        }
        binding.subjects = Some(subjects.clone());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("sigstore".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn deployment(image: &str) -> Deployment {
        let selector = labels(&[("app.kubernetes.io/instance", "rekor")]);
        Deployment {
            metadata: ObjectMeta {
                name: Some("rekor-server".to_string()),
                namespace: Some("sigstore".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "rekor-server".to_string(),
                            image: Some(image.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn label_mutator(desired: &[(&str, &str)]) -> Vec<Mutator<ConfigMap>> {
        vec![ensure_labels(&["old", "new"], labels(desired))]
    }

    #[test]
    fn test_merge_removes_managed_keys_missing_from_desired() {
        let mut current = labels(&[("old", "x")]);
        let managed = vec!["old".to_string(), "new".to_string()];
        merge_managed(&mut current, &managed, &labels(&[("new", "y")]));
        assert_eq!(current, labels(&[("new", "y")]));
    }

    #[test]
    fn test_merge_preserves_unmanaged_keys() {
        let mut current = labels(&[("old", "x"), ("team", "security")]);
        let managed = vec!["old".to_string()];
        merge_managed(&mut current, &managed, &BTreeMap::new());
        assert_eq!(current, labels(&[("team", "security")]));
    }

    #[tokio::test]
    async fn test_ensure_creates_missing_object() {
        let store = MemoryStore::new();
        let changed = ensure(&store, config_map("a"), &label_mutator(&[("new", "y")]))
            .await
            .unwrap();
        assert!(changed);

        let created: ConfigMap = store::get(&store, "sigstore", "a").await.unwrap().unwrap();
        assert_eq!(created.labels(), &labels(&[("new", "y")]));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let store = MemoryStore::new();
        let mutators = label_mutator(&[("new", "y")]);
        assert!(ensure(&store, config_map("a"), &mutators).await.unwrap());
        let first: ConfigMap = store::get(&store, "sigstore", "a").await.unwrap().unwrap();

        assert!(!ensure(&store, config_map("a"), &mutators).await.unwrap());
        let second: ConfigMap = store::get(&store, "sigstore", "a").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ensure_replaces_managed_labels() {
        let store = MemoryStore::new();
        let mut existing = config_map("a");
        existing.metadata.labels = Some(labels(&[("old", "x"), ("external", "keep")]));
        store::create(&store, &existing).await.unwrap();

        let changed = ensure(&store, config_map("a"), &label_mutator(&[("new", "y")]))
            .await
            .unwrap();
        assert!(changed);

        let updated: ConfigMap = store::get(&store, "sigstore", "a").await.unwrap().unwrap();
        assert_eq!(
            updated.labels(),
            &labels(&[("new", "y"), ("external", "keep")])
        );
    }

    #[tokio::test]
    async fn test_paused_object_is_never_changed() {
        let store = MemoryStore::new();
        let mut existing = config_map("a");
        existing.metadata.annotations = Some(labels(&[(PAUSE_ANNOTATION, "true")]));
        existing.metadata.labels = Some(labels(&[("old", "x")]));
        store::create(&store, &existing).await.unwrap();

        for _ in 0..2 {
            let changed = ensure(&store, config_map("a"), &label_mutator(&[("new", "y")]))
                .await
                .unwrap();
            assert!(!changed);
        }
        let current: ConfigMap = store::get(&store, "sigstore", "a").await.unwrap().unwrap();
        assert_eq!(current.labels(), &labels(&[("old", "x")]));

        // Unpausing lets the next call through.
        let mut unpaused = current;
        unpaused.metadata.annotations = None;
        store::replace(&store, &unpaused).await.unwrap();
        assert!(ensure(&store, config_map("a"), &label_mutator(&[("new", "y")]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ensure_never_touches_unmanaged_payload() {
        let store = MemoryStore::new();
        let mut existing = config_map("holder");
        existing.data = Some(labels(&[("tree_id", "654321")]));
        store::create(&store, &existing).await.unwrap();

        ensure(&store, config_map("holder"), &label_mutator(&[("new", "y")]))
            .await
            .unwrap();
        let current: ConfigMap = store::get(&store, "sigstore", "holder")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.data, Some(labels(&[("tree_id", "654321")])));
    }

    #[tokio::test]
    async fn test_controller_reference_conflict_is_terminal() {
        let mut cm = config_map("a");
        cm.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "sigstore.dev/v1alpha1".to_string(),
            kind: "Rekor".to_string(),
            name: "other".to_string(),
            uid: "uid-other".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
        let mutator = ensure_controller_reference::<ConfigMap>(OwnerReference {
            api_version: "sigstore.dev/v1alpha1".to_string(),
            kind: "Rekor".to_string(),
            name: "rekor".to_string(),
            uid: "uid-rekor".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
        let err = mutator(&mut cm).unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_deployment_spec_keeps_server_defaults() {
        let store = MemoryStore::new();
        let mut live = deployment("rekor:v1");
        if let Some(pod) = live
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        {
            pod.containers[0].termination_message_path = Some("/dev/termination-log".to_string());
        }
        store::create(&store, &live).await.unwrap();

        let desired = deployment("rekor:v2");
        let spec = desired.spec.clone().unwrap();
        let changed = ensure(&store, desired, &[ensure_deployment_spec(spec.clone())])
            .await
            .unwrap();
        assert!(changed);

        let current: Deployment = store::get(&store, "sigstore", "rekor-server")
            .await
            .unwrap()
            .unwrap();
        let container = &current.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("rekor:v2"));
        assert_eq!(
            container.termination_message_path.as_deref(),
            Some("/dev/termination-log")
        );

        let again = ensure(&store, deployment("rekor:v2"), &[ensure_deployment_spec(spec)])
            .await
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_readiness_merge_keeps_defaulted_timings() {
        use k8s_openapi::api::core::v1::TCPSocketAction;
        use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

        let desired = Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(3000),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        };
        let live = Probe {
            timeout_seconds: Some(1),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..desired.clone()
        };
        assert_eq!(merge_readiness(Some(&live), &desired), live);

        let retuned = Probe {
            failure_threshold: Some(6),
            ..desired.clone()
        };
        let merged = merge_readiness(Some(&live), &retuned);
        assert_eq!(merged.failure_threshold, Some(6));
        assert_eq!(merged.timeout_seconds, Some(1));
    }

    #[test]
    fn test_port_merge_keeps_protocol_and_drops_stale_ports() {
        let live = vec![
            ServicePort {
                name: Some("http".to_string()),
                port: 80,
                protocol: Some("TCP".to_string()),
                node_port: Some(30080),
                ..Default::default()
            },
            ServicePort {
                name: Some("old".to_string()),
                port: 81,
                ..Default::default()
            },
        ];
        let desired = vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            ..Default::default()
        }];
        let merged = merge_service_ports(Some(&live), &desired);
        assert_eq!(merged, vec![live[0].clone()]);

        let container = merge_container_ports(
            Some(&vec![ContainerPort {
                container_port: 3000,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            &[ContainerPort {
                container_port: 3000,
                name: Some("http".to_string()),
                ..Default::default()
            }],
        );
        assert_eq!(container[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(container[0].name.as_deref(), Some("http"));
    }

    #[tokio::test]
    async fn test_defaulting_server_converges_in_one_write() {
        use crate::controller::testing::DefaultingStore;
        use std::sync::Arc;

        let store = DefaultingStore {
            inner: Arc::new(MemoryStore::new()),
        };
        let mut desired = deployment("rekor:v1");
        if let Some(pod) = desired.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            pod.containers[0].ports = Some(vec![ContainerPort {
                container_port: 3000,
                ..Default::default()
            }]);
            pod.containers[0].readiness_probe = Some(Probe {
                period_seconds: Some(10),
                ..Default::default()
            });
        }
        let spec = desired.spec.clone().unwrap();

        assert!(ensure(&store, desired.clone(), &[ensure_deployment_spec(spec.clone())])
            .await
            .unwrap());
        for _ in 0..2 {
            assert!(!ensure(&store, desired.clone(), &[ensure_deployment_spec(spec.clone())])
                .await
                .unwrap());
        }
    }

    #[test]
    fn test_projection_ignores_volatile_metadata() {
        let mut a = config_map("a");
        let mut b = config_map("a");
        a.metadata.resource_version = Some("1".to_string());
        b.metadata.resource_version = Some("7".to_string());
        b.metadata.uid = Some("uid-1".to_string());
        assert_eq!(projection(&a).unwrap(), projection(&b).unwrap());

        b.data = Some(labels(&[("k", "v")]));
        assert_ne!(projection(&a).unwrap(), projection(&b).unwrap());
    }
}
