//! Shared types for Sigstore component specifications
//!
//! These types are used across the CRD definitions and controller logic.
//!
//! # Type Hierarchy
//!
//! - [`Condition`] - Kubernetes-style condition reported in every component status
//! - [`ResourceRequirements`] - CPU and memory requests/limits following Kubernetes conventions
//! - [`TrillianService`] - Address of the Trillian log server a component talks to
//! - [`ManagedResource`] - Capability trait implemented by every managed kind

use std::fmt::Debug;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Condition for status reporting (Kubernetes convention)
///
/// Exactly one condition of type `Ready` routes the reconcile pipeline.
/// Any other type tracks an independent sub-feature.
///
/// # Examples
///
/// ```rust,no_run
/// use sigstore_k8s::crd::Condition;
///
/// let condition = Condition::ready(true, "Ready", "Rekor is ready");
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "TreeResolved")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation the condition was set based upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }
}

/// Kubernetes-style resource requirements
///
/// Resource quantities use the usual formats: `"500m"`, `"2"`, `"512Mi"`, `"1Gi"`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Minimum resources requested
    pub requests: ResourceSpec,
    /// Maximum resources allowed
    pub limits: ResourceSpec,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            requests: ResourceSpec {
                cpu: "100m".to_string(),
                memory: "128Mi".to_string(),
            },
            limits: ResourceSpec {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
            },
        }
    }
}

/// Resource specification for CPU and memory
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceSpec {
    /// CPU cores (e.g., "500m", "2")
    pub cpu: String,
    /// Memory (e.g., "1Gi", "4Gi")
    pub memory: String,
}

/// Trillian log server a transparency log is backed by
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrillianService {
    /// Service address. Defaults to `trillian-logserver` in the same namespace,
    /// which is the log server Service of a `Trillian` resource named `trillian`;
    /// set it when the Trillian resource has another name or lives elsewhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// gRPC port of the log server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Default gRPC port of the Trillian log server
pub const DEFAULT_TRILLIAN_PORT: i32 = 8091;

impl TrillianService {
    /// Resolve the `host:port` address, falling back to the namespace-local log server
    pub fn resolve(&self, namespace: &str) -> String {
        let host = self
            .address
            .clone()
            .unwrap_or_else(|| format!("trillian-logserver.{namespace}.svc"));
        format!("{}:{}", host, self.port.unwrap_or(DEFAULT_TRILLIAN_PORT))
    }
}

/// Capability contract every managed kind implements so the generic
/// reconcile engine can read and write its small fixed status field set.
pub trait ManagedResource:
    kube::Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Sub-feature condition types that must all be True before Ready
    fn sub_features() -> &'static [&'static str];

    /// Current status conditions
    fn conditions(&self) -> &[Condition];

    /// Mutable status conditions, creating an empty status if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Error-recovery counter
    fn recovery_attempts(&self) -> i64;

    /// Store the error-recovery counter
    fn set_recovery_attempts(&mut self, attempts: i64);

    /// Validate the user-supplied spec
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Capability contract for kinds whose Trillian tree id is resolved by a
/// one-shot in-cluster job unless the user pins one.
pub trait TreeResolvable: ManagedResource {
    /// Tree id pinned by the user in the spec
    fn tree_override(&self) -> Option<i64>;

    /// Tree id recorded in status
    fn resolved_tree(&self) -> Option<i64>;

    /// Record (or clear) the tree id in status
    fn set_resolved_tree(&mut self, tree_id: Option<i64>);

    /// `host:port` of the Trillian log server the tree lives on
    fn trillian_address(&self) -> String;
}

/// Implements [`ManagedResource`] for a CRD whose status carries
/// `conditions` and `recovery_attempts`.
macro_rules! impl_managed_resource {
    ($kind:ty, $status:ty, [$($feature:expr),* $(,)?]) => {
        impl $crate::crd::ManagedResource for $kind {
            fn sub_features() -> &'static [&'static str] {
                &[$($feature),*]
            }

            fn conditions(&self) -> &[$crate::crd::Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or(&[])
            }

            fn conditions_mut(&mut self) -> &mut Vec<$crate::crd::Condition> {
                &mut self.status.get_or_insert_with(<$status>::default).conditions
            }

            fn recovery_attempts(&self) -> i64 {
                self.status
                    .as_ref()
                    .map(|s| s.recovery_attempts)
                    .unwrap_or(0)
            }

            fn set_recovery_attempts(&mut self, attempts: i64) {
                self.status
                    .get_or_insert_with(<$status>::default)
                    .recovery_attempts = attempts;
            }

            fn validate(&self) -> Result<(), String> {
                self.spec.validate()
            }
        }
    };
}

pub(crate) use impl_managed_resource;
