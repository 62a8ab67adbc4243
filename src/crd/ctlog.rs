//! CTlog Custom Resource Definition
//!
//! A CTlog resource runs a certificate transparency log frontend backed by
//! its own Trillian tree. Keys and root certificates are supplied by the
//! user through a config secret.

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
    kind = "CTlog",
    namespaced,
    status = "CTlogStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#,
    printcolumn = r#"{"name":"Tree","type":"integer","jsonPath":".status.treeId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CTlogSpec {
    /// Pin an existing Trillian tree instead of creating one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,

    #[serde(default)]
    pub trillian: TrillianService,

    /// Secret holding the `config` key with the CT log server configuration
    pub config_secret_ref: String,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl CTlogSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.config_secret_ref.trim().is_empty() {
            return Err("spec.configSecretRef must not be empty".to_string());
        }
        if let Some(tree_id) = self.tree_id {
            if tree_id <= 0 {
                return Err(format!("spec.treeId must be positive, got {tree_id}"));
            }
        }
        Ok(())
    }
}

/// Observed state of a CT log deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CTlogStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub recovery_attempts: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl_managed_resource!(CTlog, CTlogStatus, [CONDITION_TYPE_TREE_RESOLVED]);

impl TreeResolvable for CTlog {
    fn tree_override(&self) -> Option<i64> {
        self.spec.tree_id
    }

    fn resolved_tree(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.tree_id)
    }

    fn set_resolved_tree(&mut self, tree_id: Option<i64>) {
        self.status.get_or_insert_with(CTlogStatus::default).tree_id = tree_id;
    }

    fn trillian_address(&self) -> String {
        let namespace = self.namespace().unwrap_or_else(|| "default".to_string());
        self.spec.trillian.resolve(&namespace)
    }
}
