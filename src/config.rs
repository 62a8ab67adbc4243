//! Operator configuration
//!
//! Built once at start-up from an optional TOML file plus CLI/environment
//! overrides, then shared read-only with every controller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Container images used by the resource builders
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    pub trillian_logserver: String,
    pub trillian_logsigner: String,
    pub rekor_server: String,
    pub ctlog_server: String,
    /// One-shot workload that creates a Trillian tree and reports its id
    pub create_tree: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            trillian_logserver: "gcr.io/trillian-opensource-ci/log_server:v1.6.1".to_string(),
            trillian_logsigner: "gcr.io/trillian-opensource-ci/log_signer:v1.6.1".to_string(),
            rekor_server: "ghcr.io/sigstore/rekor/rekor-server:v1.3.6".to_string(),
            ctlog_server: "ghcr.io/sigstore/scaffolding/ct_server:v0.7.11".to_string(),
            create_tree: "ghcr.io/sigstore/scaffolding/createtree:v0.7.11".to_string(),
        }
    }
}

/// Top-level operator configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace the operator runs in (leader election lease lives here)
    pub namespace: String,
    /// Restrict watches to one namespace; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Consecutive errors absorbed before Ready is pinned to Failure
    pub recovery_threshold: i64,
    /// Requeue delay while waiting on an external dependency
    pub short_requeue_secs: u64,
    /// Requeue delay after a retriable error
    pub error_requeue_secs: u64,
    /// Periodic resync of converged resources
    pub resync_secs: u64,
    /// Name of the coordination lease used for leader election
    pub lease_name: String,
    pub images: ImageConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            watch_namespace: None,
            recovery_threshold: 3,
            short_requeue_secs: 5,
            error_requeue_secs: 15,
            resync_secs: 300,
            lease_name: "sigstore-operator-leader".to_string(),
            images: ImageConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::ConfigError(format!("invalid config: {e}")))
    }

    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the controllers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.recovery_threshold < 1 {
            return Err(Error::ConfigError(format!(
                "recovery_threshold must be >= 1, got {}",
                self.recovery_threshold
            )));
        }
        if self.short_requeue_secs == 0 || self.error_requeue_secs == 0 || self.resync_secs == 0 {
            return Err(Error::ConfigError(
                "requeue intervals must be greater than zero".to_string(),
            ));
        }
        let images = [
            ("trillian_logserver", &self.images.trillian_logserver),
            ("trillian_logsigner", &self.images.trillian_logsigner),
            ("rekor_server", &self.images.rekor_server),
            ("ctlog_server", &self.images.ctlog_server),
            ("create_tree", &self.images.create_tree),
        ];
        if let Some((field, _)) = images.iter().find(|(_, image)| image.trim().is_empty()) {
            return Err(Error::ConfigError(format!("images.{field} must not be empty")));
        }
        Ok(())
    }

    pub fn short_requeue(&self) -> Duration {
        Duration::from_secs(self.short_requeue_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}
