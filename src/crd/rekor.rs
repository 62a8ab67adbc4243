//! Rekor Custom Resource Definition
//!
//! A Rekor resource runs the transparency log server on top of a Trillian
//! tree. The tree id is either pinned in the spec or created on demand by a
//! one-shot job.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    impl_managed_resource, Condition, ResourceRequirements, TreeResolvable, TrillianService,
};
use crate::controller::conditions::CONDITION_TYPE_TREE_RESOLVED;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sigstore.dev",
    version = "v1alpha1",
    kind = "Rekor",
    namespaced,
    status = "RekorStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#,
    printcolumn = r#"{"name":"Tree","type":"integer","jsonPath":".status.treeId"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RekorSpec {
    /// Pin an existing Trillian tree instead of creating one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,

    #[serde(default)]
    pub trillian: TrillianService,

    /// Secret holding the `private` signer key; Rekor generates one when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_secret_ref: Option<String>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

fn default_replicas() -> i32 {
    1
}

impl RekorSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if let Some(tree_id) = self.tree_id {
            if tree_id <= 0 {
                return Err(format!("spec.treeId must be positive, got {tree_id}"));
            }
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

/// Observed state of a Rekor deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RekorStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub recovery_attempts: i64,

    /// Trillian tree the log is served from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,

    /// In-cluster URL of the Rekor API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl_managed_resource!(Rekor, RekorStatus, [CONDITION_TYPE_TREE_RESOLVED]);

impl TreeResolvable for Rekor {
    fn tree_override(&self) -> Option<i64> {
        self.spec.tree_id
    }

    fn resolved_tree(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.tree_id)
    }

    fn set_resolved_tree(&mut self, tree_id: Option<i64>) {
        self.status.get_or_insert_with(RekorStatus::default).tree_id = tree_id;
    }

    fn trillian_address(&self) -> String {
        let namespace = self.namespace().unwrap_or_else(|| "default".to_string());
        self.spec.trillian.resolve(&namespace)
    }
}
