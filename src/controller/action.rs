//! Action contract for the reconcile pipeline
//!
//! An action is one stateless stage of a pipeline. The driver asks every
//! action in order whether it applies to the current instance and lets the
//! first applicable one that produces a non-[`ActionResult::Continue`]
//! result decide the outcome of the pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::OperatorConfig;
use crate::controller::events::EventRecorder;
use crate::crd::ManagedResource;
use crate::error::Error;
use crate::store::ClusterStore;

/// Collaborators handed to every action for one pass
#[derive(Clone)]
pub struct ActionContext {
    pub store: Arc<dyn ClusterStore>,
    pub recorder: Arc<dyn EventRecorder>,
    pub config: Arc<OperatorConfig>,
}

impl ActionContext {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        recorder: Arc<dyn EventRecorder>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            store,
            recorder,
            config,
        }
    }

    /// Short busy-wait used while an external dependency converges
    pub fn short_requeue(&self) -> Duration {
        self.config.short_requeue()
    }
}

/// Outcome of a single action
#[derive(Debug)]
pub enum ActionResult {
    /// Nothing visible happened, move on to the next action
    Continue,
    /// Persist the status; the resulting update event triggers the next pass
    StatusUpdate,
    /// Check again after the delay
    Requeue(Duration),
    /// Propagate the error; the controller backs off
    Failed(Error),
    /// Persist the status, then propagate the error
    FailedWithStatusUpdate(Error),
}

impl ActionResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, ActionResult::Continue)
    }
}

impl From<Error> for ActionResult {
    fn from(err: Error) -> Self {
        ActionResult::Failed(err)
    }
}

/// A stage of the reconcile pipeline for kind `K`
#[async_trait]
pub trait ReconcileAction<K: ManagedResource>: Send + Sync {
    /// Stable name used in logs
    fn name(&self) -> &'static str;

    /// Whether this action applies. Never fails: lookup errors read as "not yet".
    async fn can_handle(&self, ctx: &ActionContext, obj: &K) -> bool;

    /// Run the action. May mutate the working instance and owned artifacts.
    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult;

    /// Whether this action reacts to an error raised by another action in the same pass
    fn can_handle_error(&self, _ctx: &ActionContext, _obj: &K, _err: &Error) -> bool {
        false
    }

    /// React to an error raised by another action in the same pass
    async fn handle_error(&self, _ctx: &ActionContext, _obj: &mut K, err: Error) -> ActionResult {
        ActionResult::Failed(err)
    }
}
