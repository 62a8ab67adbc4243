//! Reconcile pass driver
//!
//! One pass fetches the managed resource, runs the ordered action list
//! against a working copy until an action produces a non-Continue result,
//! and persists status when that result asks for it.

use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use crate::controller::action::{ActionContext, ActionResult, ReconcileAction};
use crate::crd::ManagedResource;
use crate::error::{Error, Result};
use crate::store;

/// Scheduling outcome of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The resource is gone; owned artifacts are left to garbage collection
    NotFound,
    /// Every action continued; nothing to do until the next event
    Idle,
    /// Status was written; its watch event drives the next pass
    StatusUpdated,
    /// Check again after the delay
    Requeue(Duration),
}

/// Statically ordered action list for kind `K`
pub struct Pipeline<K> {
    actions: Vec<Box<dyn ReconcileAction<K>>>,
}

impl<K: ManagedResource> Default for Pipeline<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ManagedResource> Pipeline<K> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Append an action; earlier actions take precedence
    pub fn with(mut self, action: impl ReconcileAction<K> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    /// Run the actions once against `obj`
    pub async fn run(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        for action in &self.actions {
            if !action.can_handle(ctx, obj).await {
                continue;
            }
            debug!("Running action {}", action.name());
            match action.handle(ctx, obj).await {
                ActionResult::Continue => continue,
                ActionResult::Failed(err) => {
                    warn!("Action {} failed: {}", action.name(), err);
                    return self.handle_error(ctx, obj, err).await;
                }
                other => return other,
            }
        }
        ActionResult::Continue
    }

    /// Offer an error to the first action that wants to react to it
    async fn handle_error(&self, ctx: &ActionContext, obj: &mut K, err: Error) -> ActionResult {
        for action in &self.actions {
            if action.can_handle_error(ctx, obj, &err) {
                debug!("Action {} handles the error", action.name());
                return action.handle_error(ctx, obj, err).await;
            }
        }
        ActionResult::Failed(err)
    }

    /// One full pass against the stored resource `namespace/name`
    #[instrument(skip(self, ctx), fields(kind = %K::kind(&())))]
    pub async fn reconcile(
        &self,
        ctx: &ActionContext,
        namespace: &str,
        name: &str,
    ) -> Result<PassOutcome> {
        let Some(stored) = store::get::<K>(ctx.store.as_ref(), namespace, name).await? else {
            debug!("{}/{} not found", namespace, name);
            return Ok(PassOutcome::NotFound);
        };

        let mut working = stored.clone();
        match self.run(ctx, &mut working).await {
            ActionResult::Continue => Ok(PassOutcome::Idle),
            ActionResult::StatusUpdate => {
                persist_status(ctx, &working).await?;
                Ok(PassOutcome::StatusUpdated)
            }
            ActionResult::Requeue(delay) => Ok(PassOutcome::Requeue(delay)),
            ActionResult::Failed(err) => Err(err),
            ActionResult::FailedWithStatusUpdate(err) => {
                if let Err(write_err) = persist_status(ctx, &working).await {
                    warn!(
                        "Failed to record error status on {}: {}",
                        working.name_any(),
                        write_err
                    );
                }
                Err(err)
            }
        }
    }
}

async fn persist_status<K: ManagedResource>(ctx: &ActionContext, obj: &K) -> Result<()> {
    store::replace_status(ctx.store.as_ref(), obj).await?;
    Ok(())
}
