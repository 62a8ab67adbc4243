//! Trillian Custom Resource Definition
//!
//! A Trillian resource runs the verifiable log backend (log server and log
//! signer) that Rekor and CT log store their Merkle trees in.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{impl_managed_resource, Condition, ResourceRequirements};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sigstore.dev",
    version = "v1alpha1",
    kind = "Trillian",
    namespaced,
    status = "TrillianStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrillianSpec {
    /// Secret holding the `mysql-uri` key the log server and signer connect with
    pub database_secret_ref: String,

    /// Log server replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

fn default_replicas() -> i32 {
    1
}

impl TrillianSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.database_secret_ref.trim().is_empty() {
            return Err("spec.databaseSecretRef must not be empty".to_string());
        }
        if self.replicas < 0 {
            return Err(format!(
                "spec.replicas must be >= 0, got {}",
                self.replicas
            ));
        }
        Ok(())
    }
}

/// Observed state of a Trillian deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrillianStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Consecutive reconcile errors absorbed since the last clean Ready
    #[serde(default)]
    pub recovery_attempts: i64,

    /// In-cluster gRPC address of the log server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl_managed_resource!(Trillian, TrillianStatus, []);
