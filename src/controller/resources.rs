//! Kubernetes resource builders for the Sigstore components
//!
//! Pure functions from a managed resource to the desired shape of the
//! Deployments, Services and tree-resolution objects it owns. The
//! reconcile actions hand these to the Ensure engine.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements as K8sResources, SecretKeySelector,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, TCPSocketAction,
    Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::ImageConfig;
use crate::crd::{
    CTlog, ManagedResource, Rekor, ResourceRequirements, TreeResolvable, Trillian,
    DEFAULT_TRILLIAN_PORT,
};
use crate::error::{Error, Result};

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label keys owned by the operator on every artifact
pub const MANAGED_LABELS: &[&str] = &[
    LABEL_NAME,
    LABEL_INSTANCE,
    LABEL_COMPONENT,
    LABEL_PART_OF,
    LABEL_MANAGED_BY,
];

/// Key the tree-creation workload writes the resolved id under
pub const TREE_ID_KEY: &str = "tree_id";

const TRILLIAN_HTTP_PORT: i32 = 8090;
const REKOR_PORT: i32 = 3000;
const CTLOG_PORT: i32 = 6962;
const REKOR_SIGNER_MOUNT: &str = "/var/run/rekor-signer";
const CTLOG_CONFIG_MOUNT: &str = "/ctfe-config";

/// Get the standard labels for one component of an instance
pub fn standard_labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), component.to_string());
    labels.insert(LABEL_INSTANCE.to_string(), instance.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
    labels.insert(LABEL_PART_OF.to_string(), "sigstore".to_string());
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        "sigstore-operator".to_string(),
    );
    labels
}

/// Create a controller OwnerReference for garbage collection
pub fn owner_reference<K: ManagedResource>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn object_meta<K: ManagedResource>(owner: &K, name: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.namespace(),
        labels: Some(standard_labels(component, &owner.name_any())),
        owner_references: Some(vec![owner_reference(owner)]),
        ..Default::default()
    }
}

fn container_resources(resources: &ResourceRequirements) -> K8sResources {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    K8sResources {
        requests: Some(quantities(
            &resources.requests.cpu,
            &resources.requests.memory,
        )),
        limits: Some(quantities(&resources.limits.cpu, &resources.limits.memory)),
        ..Default::default()
    }
}

fn tcp_probe(port: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

fn deployment<K: ManagedResource>(
    owner: &K,
    name: &str,
    component: &str,
    replicas: i32,
    pod: PodSpec,
) -> Deployment {
    let labels = standard_labels(component, &owner.name_any());
    Deployment {
        metadata: object_meta(owner, name, component),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn service<K: ManagedResource>(
    owner: &K,
    name: &str,
    component: &str,
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: object_meta(owner, name, component),
        spec: Some(ServiceSpec {
            selector: Some(standard_labels(component, &owner.name_any())),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// In-cluster HTTP URL of a service
pub fn service_url(service: &str, namespace: &str) -> String {
    format!("http://{service}.{namespace}.svc")
}

// ============================================================================
// Trillian
// ============================================================================

pub fn trillian_logserver_name(trillian: &Trillian) -> String {
    format!("{}-logserver", trillian.name_any())
}

pub fn trillian_logsigner_name(trillian: &Trillian) -> String {
    format!("{}-logsigner", trillian.name_any())
}

/// gRPC address other components use to reach the log server
pub fn trillian_address(trillian: &Trillian) -> String {
    format!(
        "{}.{}.svc:{}",
        trillian_logserver_name(trillian),
        trillian.namespace().unwrap_or_default(),
        DEFAULT_TRILLIAN_PORT
    )
}

fn trillian_container(trillian: &Trillian, name: &str, image: &str, extra: &[&str]) -> Container {
    let mut args = vec![
        "--storage_system=mysql".to_string(),
        "--mysql_uri=$(MYSQL_URI)".to_string(),
        format!("--rpc_endpoint=0.0.0.0:{DEFAULT_TRILLIAN_PORT}"),
        format!("--http_endpoint=0.0.0.0:{TRILLIAN_HTTP_PORT}"),
        "--alsologtostderr".to_string(),
    ];
    args.extend(extra.iter().map(|a| a.to_string()));

    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        args: Some(args),
        env: Some(vec![EnvVar {
            name: "MYSQL_URI".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(trillian.spec.database_secret_ref.clone()),
                    key: "mysql-uri".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![
            container_port("grpc", DEFAULT_TRILLIAN_PORT),
            container_port("http", TRILLIAN_HTTP_PORT),
        ]),
        resources: Some(container_resources(&trillian.spec.resources)),
        readiness_probe: Some(tcp_probe(DEFAULT_TRILLIAN_PORT)),
        ..Default::default()
    }
}

pub fn trillian_logserver_deployment(trillian: &Trillian, images: &ImageConfig) -> Deployment {
    let pod = PodSpec {
        containers: vec![trillian_container(
            trillian,
            "log-server",
            &images.trillian_logserver,
            &[],
        )],
        ..Default::default()
    };
    deployment(
        trillian,
        &trillian_logserver_name(trillian),
        "trillian-logserver",
        trillian.spec.replicas,
        pod,
    )
}

/// The signer sequences leaves into the tree and must run as a single replica
pub fn trillian_logsigner_deployment(trillian: &Trillian, images: &ImageConfig) -> Deployment {
    let pod = PodSpec {
        containers: vec![trillian_container(
            trillian,
            "log-signer",
            &images.trillian_logsigner,
            &["--force_master"],
        )],
        ..Default::default()
    };
    deployment(
        trillian,
        &trillian_logsigner_name(trillian),
        "trillian-logsigner",
        1,
        pod,
    )
}

pub fn trillian_logserver_service(trillian: &Trillian) -> Service {
    service(
        trillian,
        &trillian_logserver_name(trillian),
        "trillian-logserver",
        vec![
            service_port("grpc", DEFAULT_TRILLIAN_PORT, DEFAULT_TRILLIAN_PORT),
            service_port("http", TRILLIAN_HTTP_PORT, TRILLIAN_HTTP_PORT),
        ],
    )
}

pub fn trillian_logsigner_service(trillian: &Trillian) -> Service {
    service(
        trillian,
        &trillian_logsigner_name(trillian),
        "trillian-logsigner",
        vec![service_port("http", TRILLIAN_HTTP_PORT, TRILLIAN_HTTP_PORT)],
    )
}

// ============================================================================
// Rekor
// ============================================================================

pub fn rekor_server_name(rekor: &Rekor) -> String {
    format!("{}-server", rekor.name_any())
}

fn split_address(address: &str) -> (&str, &str) {
    address.rsplit_once(':').unwrap_or((address, ""))
}

/// Requires the tree id to be resolved
pub fn rekor_deployment(rekor: &Rekor, images: &ImageConfig) -> Result<Deployment> {
    let tree_id = rekor
        .resolved_tree()
        .ok_or(Error::MissingObjectKey(".status.treeId"))?;
    let address = rekor.trillian_address();
    let (host, port) = split_address(&address);

    let mut args = vec![
        "serve".to_string(),
        format!("--trillian_log_server.address={host}"),
        format!("--trillian_log_server.port={port}"),
        format!("--trillian_log_server.tlog_id={tree_id}"),
        "--rekor_server.address=0.0.0.0".to_string(),
        format!("--port={REKOR_PORT}"),
        "--enable_retrieve_api=false".to_string(),
    ];
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    match &rekor.spec.signer_secret_ref {
        Some(secret) => {
            args.push(format!("--rekor_server.signer={REKOR_SIGNER_MOUNT}/private"));
            volumes.push(Volume {
                name: "signer".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    default_mode: Some(0o444),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "signer".to_string(),
                mount_path: REKOR_SIGNER_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
        None => args.push("--rekor_server.signer=memory".to_string()),
    }

    let container = Container {
        name: "rekor-server".to_string(),
        image: Some(images.rekor_server.clone()),
        args: Some(args),
        ports: Some(vec![container_port("http", REKOR_PORT)]),
        resources: Some(container_resources(&rekor.spec.resources)),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        readiness_probe: Some(tcp_probe(REKOR_PORT)),
        ..Default::default()
    };
    let pod = PodSpec {
        containers: vec![container],
        volumes: (!volumes.is_empty()).then_some(volumes),
        ..Default::default()
    };
    Ok(deployment(
        rekor,
        &rekor_server_name(rekor),
        "rekor-server",
        rekor.spec.replicas,
        pod,
    ))
}

pub fn rekor_service(rekor: &Rekor) -> Service {
    service(
        rekor,
        &rekor_server_name(rekor),
        "rekor-server",
        vec![service_port("http", 80, REKOR_PORT)],
    )
}

// ============================================================================
// CT log
// ============================================================================

pub fn ctlog_server_name(ctlog: &CTlog) -> String {
    format!("{}-server", ctlog.name_any())
}

/// Requires the tree id to be resolved. The tree id is handed to the
/// frontend through `TREE_ID` for its config template.
pub fn ctlog_deployment(ctlog: &CTlog, images: &ImageConfig) -> Result<Deployment> {
    let tree_id = ctlog
        .resolved_tree()
        .ok_or(Error::MissingObjectKey(".status.treeId"))?;

    let container = Container {
        name: "ctfe".to_string(),
        image: Some(images.ctlog_server.clone()),
        args: Some(vec![
            format!("--http_endpoint=0.0.0.0:{CTLOG_PORT}"),
            format!("--log_config={CTLOG_CONFIG_MOUNT}/config"),
            format!("--log_rpc_server={}", ctlog.trillian_address()),
            "--alsologtostderr".to_string(),
        ]),
        env: Some(vec![EnvVar {
            name: "TREE_ID".to_string(),
            value: Some(tree_id.to_string()),
            ..Default::default()
        }]),
        ports: Some(vec![container_port("http", CTLOG_PORT)]),
        resources: Some(container_resources(&ctlog.spec.resources)),
        volume_mounts: Some(vec![VolumeMount {
            name: "config".to_string(),
            mount_path: CTLOG_CONFIG_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        readiness_probe: Some(tcp_probe(CTLOG_PORT)),
        ..Default::default()
    };
    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: "config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(ctlog.spec.config_secret_ref.clone()),
                default_mode: Some(420),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Ok(deployment(ctlog, &ctlog_server_name(ctlog), "ctlog", 1, pod))
}

pub fn ctlog_service(ctlog: &CTlog) -> Service {
    service(
        ctlog,
        &ctlog_server_name(ctlog),
        "ctlog",
        vec![service_port("http", 80, CTLOG_PORT)],
    )
}

// ============================================================================
// Tree resolution
// ============================================================================

const TREE_COMPONENT: &str = "tree-resolver";

/// Name shared by the result holder and the RBAC objects of the tree workload
pub fn tree_holder_name<K: ManagedResource>(obj: &K) -> String {
    format!("{}-{}-tree", obj.name_any(), K::kind(&()).to_lowercase())
}

pub fn tree_service_account<K: TreeResolvable>(obj: &K) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(obj, &tree_holder_name(obj), TREE_COMPONENT),
        ..Default::default()
    }
}

/// Lets the workload write back into its own result holder and nothing else
pub fn tree_role_rules<K: TreeResolvable>(obj: &K) -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["configmaps".to_string()]),
        resource_names: Some(vec![tree_holder_name(obj)]),
        verbs: vec!["get".to_string(), "update".to_string(), "patch".to_string()],
        ..Default::default()
    }]
}

pub fn tree_role<K: TreeResolvable>(obj: &K) -> Role {
    Role {
        metadata: object_meta(obj, &tree_holder_name(obj), TREE_COMPONENT),
        rules: Some(tree_role_rules(obj)),
    }
}

pub fn tree_role_ref<K: TreeResolvable>(obj: &K) -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: tree_holder_name(obj),
    }
}

pub fn tree_role_subjects<K: TreeResolvable>(obj: &K) -> Vec<Subject> {
    vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: tree_holder_name(obj),
        namespace: obj.namespace(),
        ..Default::default()
    }]
}

pub fn tree_role_binding<K: TreeResolvable>(obj: &K) -> RoleBinding {
    RoleBinding {
        metadata: object_meta(obj, &tree_holder_name(obj), TREE_COMPONENT),
        role_ref: tree_role_ref(obj),
        subjects: Some(tree_role_subjects(obj)),
    }
}

/// Empty result holder; the workload fills in `data.tree_id`
pub fn tree_holder<K: TreeResolvable>(obj: &K) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(obj, &tree_holder_name(obj), TREE_COMPONENT),
        ..Default::default()
    }
}

/// Job name derived from the holder's uid, so a recreated holder gets a new Job
pub fn tree_job_name(holder: &ConfigMap) -> Result<String> {
    let uid = holder
        .metadata
        .uid
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let suffix: String = uid.chars().take(8).collect();
    Ok(format!("{}-{}", holder.name_any(), suffix))
}

/// One-shot workload that creates a tree and reports its id into the holder
pub fn tree_job<K: TreeResolvable>(obj: &K, holder: &ConfigMap, image: &str) -> Result<Job> {
    let holder_name = holder.name_any();
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let labels = standard_labels(TREE_COMPONENT, &obj.name_any());

    let container = Container {
        name: "createtree".to_string(),
        image: Some(image.to_string()),
        args: Some(vec![
            format!("--admin_server={}", obj.trillian_address()),
            format!("--display_name={}", obj.name_any()),
            format!("--configmap={holder_name}"),
            format!("--namespace={namespace}"),
        ]),
        env: Some(vec![EnvVar {
            name: "NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(tree_job_name(holder)?),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(obj)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(holder_name),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Non-controlling owner reference from a Job, recorded on the holder
pub fn job_owner_reference(job: &Job) -> OwnerReference {
    OwnerReference {
        api_version: Job::api_version(&()).to_string(),
        kind: Job::kind(&()).to_string(),
        name: job.name_any(),
        uid: job.metadata.uid.clone().unwrap_or_default(),
        controller: None,
        block_owner_deletion: None,
    }
}
