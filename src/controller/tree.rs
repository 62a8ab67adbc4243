//! Job-based Trillian tree resolution
//!
//! A tree id is either pinned in the spec or created by a one-shot Job that
//! writes it back into a result-holder ConfigMap. Every stage is its own
//! action and all progress lives in cluster objects, so resolution resumes
//! where it left off after an operator restart:
//!
//! 1. [`ResolveManual`]: copy the pinned id, skip the rest
//! 2. [`EnsureTreeRbac`]: ServiceAccount, Role and RoleBinding for the Job
//! 3. [`EnsureTreeHolder`]: empty ConfigMap; its existence guards the launch
//! 4. [`LaunchTreeJob`]: create the Job and record it as a holder owner
//! 5. [`PollTreeJob`]: wait for the Job to finish
//! 6. [`ExtractTreeId`]: read `data.tree_id` into status
//!
//! A failed Job or an unreadable result marks TreeResolved `JobFailed` and
//! stops the pipeline. Deleting the holder lets [`RetryTreeJob`] start over
//! with a fresh Job.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::action::{ActionContext, ActionResult, ReconcileAction};
use crate::controller::conditions::{
    find_condition, is_condition_true, ready_reason, set_object_condition, set_ready, ReadyReason,
    CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_TYPE_TREE_RESOLVED,
};
use crate::controller::ensure::{
    ensure, ensure_controller_reference, ensure_labels, ensure_owner_reference,
    ensure_role_binding, ensure_role_rules, Mutator,
};
use crate::controller::events::{record, EventType};
use crate::controller::resources::{
    job_owner_reference, owner_reference, tree_holder, tree_holder_name, tree_job,
    tree_job_name, tree_role, tree_role_binding, tree_role_ref, tree_role_rules,
    tree_role_subjects, tree_service_account, MANAGED_LABELS, TREE_ID_KEY,
};
use crate::crd::TreeResolvable;
use crate::error::{Error, Result};
use crate::store;

/// TreeResolved reason after a failed or unreadable tree Job
pub const TREE_JOB_FAILED: &str = "JobFailed";

/// Resolution stages only run while building and until the tree is known
fn resolving<K: TreeResolvable>(obj: &K) -> bool {
    ready_reason(obj) == Some(ReadyReason::Creating)
        && !is_condition_true(obj.conditions(), CONDITION_TYPE_TREE_RESOLVED)
}

fn mark_resolved<K: TreeResolvable>(obj: &mut K, tree_id: i64, message: &str) {
    obj.set_resolved_tree(Some(tree_id));
    set_object_condition(
        obj,
        CONDITION_TYPE_TREE_RESOLVED,
        CONDITION_STATUS_TRUE,
        "Resolved",
        message,
    );
}

/// Record why resolution stopped and hand back the terminal error
fn mark_job_failed<K: TreeResolvable>(obj: &mut K, err: Error) -> ActionResult {
    set_object_condition(
        obj,
        CONDITION_TYPE_TREE_RESOLVED,
        CONDITION_STATUS_FALSE,
        TREE_JOB_FAILED,
        &err.to_string(),
    );
    ActionResult::Failed(err)
}

/// Labels and controller reference; everything else on the object is left alone
fn ownership<K: TreeResolvable, T: kube::Resource>(obj: &K, desired: &T) -> Vec<Mutator<T>> {
    vec![
        ensure_labels(MANAGED_LABELS, desired.labels().clone()),
        ensure_controller_reference(owner_reference(obj)),
    ]
}

async fn get_holder<K: TreeResolvable>(ctx: &ActionContext, obj: &K) -> Result<Option<ConfigMap>> {
    let namespace = obj.namespace().unwrap_or_default();
    store::get(ctx.store.as_ref(), &namespace, &tree_holder_name(obj)).await
}

/// Name of the Job recorded as an owner of the holder, if any
fn holder_job(holder: &ConfigMap) -> Option<String> {
    holder
        .owner_references()
        .iter()
        .find(|r| r.kind == "Job")
        .map(|r| r.name.clone())
}

#[derive(Debug, PartialEq, Eq)]
enum JobState {
    Missing,
    Running,
    Complete,
    Failed,
}

fn job_state(job: Option<&Job>) -> JobState {
    let Some(job) = job else {
        return JobState::Missing;
    };
    let finished = |type_: &str| {
        job.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
    };
    if finished("Failed") {
        JobState::Failed
    } else if finished("Complete") {
        JobState::Complete
    } else {
        JobState::Running
    }
}

async fn launched_job_state<K: TreeResolvable>(ctx: &ActionContext, obj: &K) -> Result<Option<(String, JobState)>> {
    let Some(holder) = get_holder(ctx, obj).await? else {
        return Ok(None);
    };
    let Some(job_name) = holder_job(&holder) else {
        return Ok(None);
    };
    let namespace = obj.namespace().unwrap_or_default();
    let job: Option<Job> = store::get(ctx.store.as_ref(), &namespace, &job_name).await?;
    Ok(Some((job_name, job_state(job.as_ref()))))
}

/// Parse the id the workload wrote into the holder
pub fn parse_tree_id(holder: &ConfigMap) -> Result<i64> {
    let raw = holder
        .data
        .as_ref()
        .and_then(|d| d.get(TREE_ID_KEY))
        .ok_or_else(|| {
            Error::terminal(format!(
                "{} has no {} entry",
                holder.name_any(),
                TREE_ID_KEY
            ))
        })?;
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(Error::terminal(format!(
            "{} holds an invalid tree id {:?}",
            holder.name_any(),
            raw
        ))),
    }
}

/// Use the tree id pinned in the spec
pub struct ResolveManual;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for ResolveManual {
    fn name(&self) -> &'static str {
        "tree-manual"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        resolving(obj) && obj.tree_override().is_some()
    }

    async fn handle(&self, _ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let Some(tree_id) = obj.tree_override() else {
            return ActionResult::Continue;
        };
        info!("Using tree {} from spec for {}", tree_id, obj.name_any());
        mark_resolved(obj, tree_id, "Tree id set in spec");
        ActionResult::StatusUpdate
    }
}

/// Identity the tree Job uses to write its result
pub struct EnsureTreeRbac;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for EnsureTreeRbac {
    fn name(&self) -> &'static str {
        "tree-rbac"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        resolving(obj) && obj.tree_override().is_none()
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let store = ctx.store.as_ref();

        let account = tree_service_account(obj);
        let mutators = ownership(obj, &account);
        let sa_changed = match ensure::<ServiceAccount>(store, account, &mutators).await {
            Ok(changed) => changed,
            Err(e) => return ActionResult::Failed(e),
        };

        let role = tree_role(obj);
        let mut mutators = ownership(obj, &role);
        mutators.push(ensure_role_rules(tree_role_rules(obj)));
        let role_changed = match ensure::<Role>(store, role, &mutators).await {
            Ok(changed) => changed,
            Err(e) => return ActionResult::Failed(e),
        };

        let binding = tree_role_binding(obj);
        let mut mutators = ownership(obj, &binding);
        mutators.push(ensure_role_binding(
            tree_role_ref(obj),
            tree_role_subjects(obj),
        ));
        let binding_changed = match ensure::<RoleBinding>(store, binding, &mutators).await {
            Ok(changed) => changed,
            Err(e) => return ActionResult::Failed(e),
        };

        if sa_changed || role_changed || binding_changed {
            set_ready(obj, ReadyReason::Creating, "Tree job RBAC ensured");
            return ActionResult::StatusUpdate;
        }
        ActionResult::Continue
    }
}

/// Empty result holder; its payload belongs to the Job
pub struct EnsureTreeHolder;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for EnsureTreeHolder {
    fn name(&self) -> &'static str {
        "tree-holder"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        resolving(obj) && obj.tree_override().is_none()
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let holder = tree_holder(obj);
        let mutators = ownership(obj, &holder);
        match ensure::<ConfigMap>(ctx.store.as_ref(), holder, &mutators).await {
            Ok(true) => ActionResult::Requeue(ctx.short_requeue()),
            Ok(false) => ActionResult::Continue,
            Err(e) => ActionResult::Failed(e),
        }
    }
}

/// Start the tree Job once the holder exists and has none
pub struct LaunchTreeJob;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for LaunchTreeJob {
    fn name(&self) -> &'static str {
        "tree-launch"
    }

    async fn can_handle(&self, ctx: &ActionContext, obj: &K) -> bool {
        if !resolving(obj) || obj.tree_override().is_some() {
            return false;
        }
        matches!(get_holder(ctx, obj).await, Ok(Some(holder)) if holder_job(&holder).is_none())
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        match launch(ctx, obj).await {
            Ok(job_name) => {
                record(
                    ctx,
                    obj,
                    EventType::Normal,
                    "TreeJobLaunched",
                    &format!("Launched tree job {job_name}"),
                )
                .await;
                ActionResult::Requeue(ctx.short_requeue())
            }
            Err(e) => ActionResult::Failed(e),
        }
    }
}

async fn launch<K: TreeResolvable>(ctx: &ActionContext, obj: &K) -> Result<String> {
    let store = ctx.store.as_ref();
    let holder = get_holder(ctx, obj)
        .await?
        .ok_or(Error::MissingObjectKey("tree holder"))?;
    let namespace = obj.namespace().unwrap_or_default();
    let job_name = tree_job_name(&holder)?;

    // A Job left behind by a pass that died before recording it is adopted.
    let job = match store::get::<Job>(store, &namespace, &job_name).await? {
        Some(existing) => existing,
        None => {
            let desired = tree_job(obj, &holder, &ctx.config.images.create_tree)?;
            info!("Launching tree job {}/{}", namespace, job_name);
            store::create(store, &desired).await?
        }
    };

    let mutators = vec![ensure_owner_reference(job_owner_reference(&job))];
    ensure::<ConfigMap>(store, holder, &mutators).await?;
    Ok(job_name)
}

/// Wait for the launched Job to finish
pub struct PollTreeJob;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for PollTreeJob {
    fn name(&self) -> &'static str {
        "tree-poll"
    }

    async fn can_handle(&self, ctx: &ActionContext, obj: &K) -> bool {
        if !resolving(obj) || obj.tree_override().is_some() {
            return false;
        }
        matches!(launched_job_state(ctx, obj).await, Ok(Some(_)))
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        match launched_job_state(ctx, obj).await {
            Ok(Some((_, JobState::Complete))) => ActionResult::Continue,
            Ok(Some((name, JobState::Failed))) => {
                let err = Error::terminal(format!(
                    "tree job {name} failed; delete {} to retry",
                    tree_holder_name(obj)
                ));
                mark_job_failed(obj, err)
            }
            Ok(Some((name, state))) => {
                debug!("Tree job {} is {:?}", name, state);
                ActionResult::Requeue(ctx.short_requeue())
            }
            Ok(None) => ActionResult::Continue,
            Err(e) => ActionResult::Failed(e),
        }
    }
}

/// Copy the tree id out of the holder once the Job completed
pub struct ExtractTreeId;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for ExtractTreeId {
    fn name(&self) -> &'static str {
        "tree-extract"
    }

    async fn can_handle(&self, ctx: &ActionContext, obj: &K) -> bool {
        if !resolving(obj) || obj.tree_override().is_some() {
            return false;
        }
        matches!(
            launched_job_state(ctx, obj).await,
            Ok(Some((_, JobState::Complete)))
        )
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        let holder = match get_holder(ctx, obj).await {
            Ok(Some(holder)) => holder,
            Ok(None) => return ActionResult::Requeue(ctx.short_requeue()),
            Err(e) => return ActionResult::Failed(e),
        };
        match parse_tree_id(&holder) {
            Ok(tree_id) => {
                info!("Resolved tree {} for {}", tree_id, obj.name_any());
                mark_resolved(obj, tree_id, "Tree created by job");
                ActionResult::StatusUpdate
            }
            Err(Error::Terminal(msg)) => {
                let err = Error::terminal(format!(
                    "{msg}; delete {} to retry",
                    tree_holder_name(obj)
                ));
                mark_job_failed(obj, err)
            }
            Err(e) => ActionResult::Failed(e),
        }
    }
}

/// Start resolution over once the holder of a failed Job has been deleted
pub struct RetryTreeJob;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for RetryTreeJob {
    fn name(&self) -> &'static str {
        "tree-retry"
    }

    async fn can_handle(&self, ctx: &ActionContext, obj: &K) -> bool {
        let job_failed = find_condition(obj.conditions(), CONDITION_TYPE_TREE_RESOLVED)
            .is_some_and(|c| c.reason == TREE_JOB_FAILED);
        if !job_failed
            || ready_reason(obj) != Some(ReadyReason::Error)
            || obj.tree_override().is_some()
        {
            return false;
        }
        matches!(get_holder(ctx, obj).await, Ok(None))
    }

    async fn handle(&self, ctx: &ActionContext, obj: &mut K) -> ActionResult {
        info!("Tree holder of {} deleted, retrying resolution", obj.name_any());
        set_object_condition(
            obj,
            CONDITION_TYPE_TREE_RESOLVED,
            CONDITION_STATUS_FALSE,
            ReadyReason::Pending.as_str(),
            "Retrying tree job",
        );
        set_ready(obj, ReadyReason::Pending, "Tree holder deleted, retrying tree job");
        record(
            ctx,
            obj,
            EventType::Normal,
            "TreeJobRetry",
            "Tree holder deleted, retrying tree job",
        )
        .await;
        ActionResult::StatusUpdate
    }
}

/// Drop a resolved tree that no longer matches the id pinned in the spec
pub struct InvalidateTree;

#[async_trait]
impl<K: TreeResolvable> ReconcileAction<K> for InvalidateTree {
    fn name(&self) -> &'static str {
        "tree-invalidate"
    }

    async fn can_handle(&self, _ctx: &ActionContext, obj: &K) -> bool {
        is_condition_true(obj.conditions(), CONDITION_TYPE_TREE_RESOLVED)
            && obj
                .tree_override()
                .is_some_and(|pinned| Some(pinned) != obj.resolved_tree())
    }

    async fn handle(&self, _ctx: &ActionContext, obj: &mut K) -> ActionResult {
        info!("Tree id of {} changed in spec", obj.name_any());
        obj.set_resolved_tree(None);
        set_object_condition(
            obj,
            CONDITION_TYPE_TREE_RESOLVED,
            CONDITION_STATUS_FALSE,
            ReadyReason::Pending.as_str(),
            "Tree id changed in spec",
        );
        ActionResult::StatusUpdate
    }
}
