//! Generic Ready-condition transitions
//!
//! Each action gates strictly on the current Ready reason and moves it one
//! step. Sub-feature conditions are never touched here except for seeding
//! placeholders; Ready follows them through [`ToInitialize`] and
//! [`Reconverge`].

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use crate::controller::action::{ActionContext, ActionResult, ReconcileAction};
use crate::controller::conditions::{
    all_true, find_condition, ready_reason, ready_reason_in, set_object_condition, set_ready,
    ReadyReason, CONDITION_STATUS_UNKNOWN, CONDITION_TYPE_READY,
};
use crate::controller::events::{record, EventType};
use crate::crd::ManagedResource;
use crate::error::Error;

fn ready_generation<K: ManagedResource>(obj: &K) -> i64 {
    find_condition(obj.conditions(), CONDITION_TYPE_READY)
        .and_then(|c| c.observed_generation)
        .unwrap_or(0)
}

fn generation<K: ManagedResource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or(0)
}

/// Reject an invalid spec before anything is created
///
/// Stays quiet once the rejection for the current generation is recorded,
/// so an invalid resource costs one status write per edit.
pub struct ValidateSpec;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for ValidateSpec {
    fn name(&self) -> &'static str {
        "validate-spec"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        if obj.validate().is_ok() {
            return false;
        }
        !(ready_reason(obj) == Some(ReadyReason::Error) && ready_generation(obj) == generation(obj))
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let Err(msg) = obj.validate() else {
            return ActionResult::Continue;
        };
        set_ready(obj, ReadyReason::Error, &msg);
        record(ctx, obj, EventType::Warning, "InvalidSpec", &msg).await;
        ActionResult::FailedWithStatusUpdate(Error::ValidationError(msg))
    }
}

/// Error or Failure → Pending once the user edits the spec
pub struct Reset;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for Reset {
    fn name(&self) -> &'static str {
        "reset"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason_in(obj, &[ReadyReason::Error, ReadyReason::Failure])
            && generation(obj) > ready_generation(obj)
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        info!("Spec of {} changed, retrying", obj.name_any());
        set_ready(obj, ReadyReason::Pending, "Spec changed, retrying");
        record(ctx, obj, EventType::Normal, "Retrying", "Spec changed, retrying").await;
        ActionResult::StatusUpdate
    }
}

/// No Ready condition (or Unknown) → Pending, seeding sub-feature placeholders
pub struct ToPending;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for ToPending {
    fn name(&self) -> &'static str {
        "to-pending"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        find_condition(obj.conditions(), CONDITION_TYPE_READY)
            .map_or(true, |c| c.status == CONDITION_STATUS_UNKNOWN)
    }

    async fn handle(&self, _ctx: &ActionContext, obj: &mut K) -> ActionResult {
        set_ready(obj, ReadyReason::Pending, "Waiting to be reconciled");
        for feature in K::sub_features() {
            if find_condition(obj.conditions(), feature).is_none() {
                set_object_condition(
                    obj,
                    feature,
                    CONDITION_STATUS_UNKNOWN,
                    ReadyReason::Pending.as_str(),
                    "",
                );
            }
        }
        ActionResult::StatusUpdate
    }
}

/// Pending → Creating
pub struct ToCreate;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for ToCreate {
    fn name(&self) -> &'static str {
        "to-create"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason(obj) == Some(ReadyReason::Pending)
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        set_ready(obj, ReadyReason::Creating, "Creating resources");
        record(ctx, obj, EventType::Normal, "Creating", "Creating resources").await;
        ActionResult::StatusUpdate
    }
}

/// Creating → Initialize once every sub-feature is True
pub struct ToInitialize;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for ToInitialize {
    fn name(&self) -> &'static str {
        "to-initialize"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason(obj) == Some(ReadyReason::Creating)
            && all_true(obj.conditions(), K::sub_features())
    }

    async fn handle(&self, _ctx: &ActionContext, obj: &mut K) -> ActionResult {
        set_ready(obj, ReadyReason::Initialize, "Waiting for deployments");
        ActionResult::StatusUpdate
    }
}

/// Initialize/Ready → Creating when a sub-feature was invalidated
pub struct Reconverge;

#[async_trait]
impl<K: ManagedResource> ReconcileAction<K> for Reconverge {
    fn name(&self) -> &'static str {
        "reconverge"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        ready_reason_in(obj, &[ReadyReason::Initialize, ReadyReason::Ready])
            && !all_true(obj.conditions(), K::sub_features())
    }

    async fn handle(&self, _ctx: &ActionContext, obj: &mut K) -> ActionResult {
        info!("{} lost a prerequisite, reconverging", obj.name_any());
        set_ready(obj, ReadyReason::Creating, "Reconverging");
        ActionResult::StatusUpdate
    }
}
