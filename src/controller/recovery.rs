//! Bounded error recovery
//!
//! [`RecoveryAction`] never handles a pass on its own. It only reacts to
//! errors raised by other actions: transient errors demote Ready to Pending
//! so the pipeline re-converges, until the attempt counter reaches the
//! configured threshold and Ready is pinned to Failure.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{error, warn};

use crate::controller::action::{ActionContext, ActionResult, ReconcileAction};
use crate::controller::conditions::{
    find_condition, ready_reason, set_ready, ReadyReason, CONDITION_TYPE_READY,
};
use crate::controller::events::{record, EventType};
use crate::crd::ManagedResource;
use crate::error::Error;

pub struct RecoveryAction;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for RecoveryAction {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn can_handle(&self, _ctx: &ActionContext, _obj: &K) -> bool {
        false
    }

    async fn handle(&self, _ctx: &ActionContext, _obj: &mut K) -> ActionResult {
        ActionResult::Continue
    }

    fn can_handle_error(&self, _ctx: &ActionContext, obj: &K, _err: &Error) -> bool {
        find_condition(obj.conditions(), CONDITION_TYPE_READY).is_some()
            && !matches!(
                ready_reason(obj),
                Some(ReadyReason::Error | ReadyReason::Failure)
            )
    }

    async fn handle_error(&self, ctx: &ActionContext, obj: &mut K, err: Error) -> ActionResult {
        if err.is_terminal() {
            error!("Terminal error reconciling {}: {}", obj.name_any(), err);
            set_ready(obj, ReadyReason::Error, &err.to_string());
            record(ctx, obj, EventType::Warning, "Error", &err.to_string()).await;
            return ActionResult::FailedWithStatusUpdate(err);
        }

        let threshold = ctx.config.recovery_threshold;
        let attempts = (obj.recovery_attempts() + 1).min(threshold);
        obj.set_recovery_attempts(attempts);

        if attempts < threshold {
            warn!(
                "Error reconciling {} (attempt {}/{}): {}",
                obj.name_any(),
                attempts,
                threshold,
                err
            );
            set_ready(obj, ReadyReason::Pending, &err.to_string());
            return ActionResult::FailedWithStatusUpdate(err);
        }

        let msg = format!("Recovery exhausted after {attempts} attempts: {err}");
        error!("{} for {}", msg, obj.name_any());
        set_ready(obj, ReadyReason::Failure, &msg);
        record(ctx, obj, EventType::Warning, "RecoveryExhausted", &msg).await;
        ActionResult::FailedWithStatusUpdate(Error::terminal(msg))
    }
}
