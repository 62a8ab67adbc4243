//! Tests for Job-based tree resolution
//!
//! These drive the Rekor pipeline through every resolver stage:
//! - RBAC, result holder, launch, poll, extract
//! - Resuming after an operator restart
//! - Failed and corrupt workloads
//! - Invalidation when the pinned tree changes

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ServiceAccount;
    use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
    use kube::ResourceExt;

    use crate::controller::conditions::{
        find_condition, is_condition_true, ReadyReason, CONDITION_TYPE_READY,
        CONDITION_TYPE_TREE_RESOLVED,
    };
    use crate::controller::pipeline::PassOutcome;
    use crate::controller::rekor::pipeline;
    use crate::controller::testing::{harness, rekor, Harness, NAMESPACE};
    use crate::controller::tree::TREE_JOB_FAILED;
    use crate::crd::{ManagedResource, Rekor, TreeResolvable};
    use crate::store;

    use PassOutcome::StatusUpdated;
    use ReadyReason::Creating;

    const HOLDER: &str = "rekor-rekor-tree";
    const SHORT: PassOutcome = PassOutcome::Requeue(Duration::from_secs(5));

    /// Create an unpinned Rekor and run it up to a launched, running Job
    async fn launch(h: &Harness) -> String {
        let pipeline = pipeline();
        h.create(&rekor("rekor", None)).await;
        h.pass(&pipeline, "rekor").await.unwrap();
        h.pass(&pipeline, "rekor").await.unwrap();

        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));

        let jobs = h.jobs().await;
        assert_eq!(jobs.len(), 1);
        jobs[0].name_any()
    }

    #[tokio::test]
    async fn test_rbac_then_holder_then_launch() {
        let h = harness();
        let job = launch(&h).await;

        let sa: Option<ServiceAccount> = store::get(h.store.as_ref(), NAMESPACE, HOLDER)
            .await
            .unwrap();
        let role: Option<Role> = store::get(h.store.as_ref(), NAMESPACE, HOLDER).await.unwrap();
        let binding: Option<RoleBinding> = store::get(h.store.as_ref(), NAMESPACE, HOLDER)
            .await
            .unwrap();
        assert!(sa.is_some() && role.is_some() && binding.is_some());

        let holder = h.config_map(HOLDER).await.unwrap();
        assert!(holder.data.is_none());
        let owners = holder.owner_references();
        assert_eq!(owners.len(), 2);
        assert!(owners.iter().any(|o| o.kind == "Rekor" && o.controller == Some(true)));
        assert!(owners.iter().any(|o| o.kind == "Job" && o.name == job));

        let r: Rekor = h.get("rekor").await;
        let ready = find_condition(r.conditions(), CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.message, "Tree job RBAC ensured");
        let events = h.events.events().await;
        assert!(events.iter().any(|e| e.reason == "TreeJobLaunched"));
    }

    #[tokio::test]
    async fn test_job_result_resolves_tree() {
        let h = harness();
        let pipeline = pipeline();
        let job = launch(&h).await;

        // Still running: keep polling, never launch a second Job.
        for _ in 0..3 {
            assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));
        }
        assert_eq!(h.jobs().await.len(), 1);

        h.write_holder(HOLDER, "654321").await;
        h.finish_job(&job, "Complete").await;
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));

        let r: Rekor = h.get("rekor").await;
        assert_eq!(r.resolved_tree(), Some(654321));
        assert!(is_condition_true(r.conditions(), CONDITION_TYPE_TREE_RESOLVED));

        // The server deployment comes next and carries the tree.
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        let deployment = h.deployment("rekor-server").await.unwrap();
        let args = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert!(args.contains(&"--trillian_log_server.tlog_id=654321".to_string()));

        // The holder payload survives later ensures of the holder.
        assert_eq!(
            h.config_map(HOLDER).await.unwrap().data.unwrap()["tree_id"],
            "654321"
        );
    }

    #[tokio::test]
    async fn test_resumes_after_restart() {
        let h = harness();
        let job = launch(&h).await;
        h.write_holder(HOLDER, "654321").await;
        h.finish_job(&job, "Complete").await;

        // A freshly built pipeline has no memory of the previous passes.
        let restarted = pipeline();
        assert_eq!(h.step(&restarted, "rekor").await, (StatusUpdated, Some(Creating)));
        let r: Rekor = h.get("rekor").await;
        assert_eq!(r.resolved_tree(), Some(654321));
        assert_eq!(h.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_terminal() {
        let h = harness();
        let pipeline = pipeline();
        let job = launch(&h).await;
        h.finish_job(&job, "Failed").await;

        let err = h.pass(&pipeline, "rekor").await.unwrap_err();
        assert!(err.is_terminal());
        let r: Rekor = h.get("rekor").await;
        assert_eq!(
            find_condition(r.conditions(), CONDITION_TYPE_READY).unwrap().reason,
            "Error"
        );
        assert_eq!(r.recovery_attempts(), 0);

        // Not retried: the next pass has nothing to do.
        assert_eq!(
            h.step(&pipeline, "rekor").await,
            (PassOutcome::Idle, Some(ReadyReason::Error))
        );
        assert_eq!(h.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_result_is_terminal() {
        let h = harness();
        let pipeline = pipeline();
        let job = launch(&h).await;
        h.write_holder(HOLDER, "not-a-number").await;
        h.finish_job(&job, "Complete").await;

        let err = h.pass(&pipeline, "rekor").await.unwrap_err();
        assert!(err.is_terminal());
        let r: Rekor = h.get("rekor").await;
        assert_eq!(r.resolved_tree(), None);
    }

    #[tokio::test]
    async fn test_deleting_holder_retries_with_new_job() {
        let h = harness();
        let pipeline = pipeline();
        let first = launch(&h).await;
        h.finish_job(&first, "Failed").await;
        assert!(h.pass(&pipeline, "rekor").await.is_err());

        store::delete::<k8s_openapi::api::core::v1::ConfigMap>(h.store.as_ref(), NAMESPACE, HOLDER)
            .await
            .unwrap();
        let mut r: Rekor = h.get("rekor").await;
        r.spec.replicas = 2;
        store::replace(h.store.as_ref(), &r).await.unwrap();

        // Reset, ToCreate, holder (RBAC unchanged), launch
        assert_eq!(h.step(&pipeline, "rekor").await.1, Some(ReadyReason::Pending));
        assert_eq!(h.step(&pipeline, "rekor").await.1, Some(Creating));
        assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));

        let jobs: Vec<String> = h.jobs().await.iter().map(|j| j.name_any()).collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.contains(&first));
    }

    #[tokio::test]
    async fn test_deleting_holder_alone_retries_failed_job() {
        let h = harness();
        let pipeline = pipeline();
        let first = launch(&h).await;
        h.finish_job(&first, "Failed").await;
        assert!(h.pass(&pipeline, "rekor").await.unwrap_err().is_terminal());

        let r: Rekor = h.get("rekor").await;
        let ready = find_condition(r.conditions(), CONDITION_TYPE_READY).unwrap();
        assert!(ready.message.contains(&format!("delete {HOLDER} to retry")));
        let tree = find_condition(r.conditions(), CONDITION_TYPE_TREE_RESOLVED).unwrap();
        assert_eq!(tree.reason, TREE_JOB_FAILED);

        store::delete::<k8s_openapi::api::core::v1::ConfigMap>(h.store.as_ref(), NAMESPACE, HOLDER)
            .await
            .unwrap();

        // No spec edit: the generation is unchanged.
        assert_eq!(
            h.step(&pipeline, "rekor").await,
            (StatusUpdated, Some(ReadyReason::Pending))
        );
        assert_eq!(h.get::<Rekor>("rekor").await.metadata.generation, Some(1));
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (SHORT, Some(Creating)));

        let jobs: Vec<String> = h.jobs().await.iter().map(|j| j.name_any()).collect();
        assert_eq!(jobs.len(), 2);
        let second = jobs.into_iter().find(|j| *j != first).unwrap();
        h.write_holder(HOLDER, "777").await;
        h.finish_job(&second, "Complete").await;
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        assert_eq!(h.get::<Rekor>("rekor").await.resolved_tree(), Some(777));

        let events = h.events.events().await;
        assert!(events.iter().any(|e| e.reason == "TreeJobRetry"));
    }

    #[tokio::test]
    async fn test_corrupt_result_retried_after_holder_deleted() {
        let h = harness();
        let pipeline = pipeline();
        let job = launch(&h).await;
        h.write_holder(HOLDER, "not-a-number").await;
        h.finish_job(&job, "Complete").await;
        let err = h.pass(&pipeline, "rekor").await.unwrap_err();
        assert!(err.to_string().contains(&format!("delete {HOLDER} to retry")));

        // While the holder is still there nothing happens.
        assert_eq!(
            h.step(&pipeline, "rekor").await,
            (PassOutcome::Idle, Some(ReadyReason::Error))
        );

        store::delete::<k8s_openapi::api::core::v1::ConfigMap>(h.store.as_ref(), NAMESPACE, HOLDER)
            .await
            .unwrap();
        assert_eq!(
            h.step(&pipeline, "rekor").await,
            (StatusUpdated, Some(ReadyReason::Pending))
        );
    }

    #[tokio::test]
    async fn test_changed_pin_invalidates_tree() {
        let h = harness();
        let pipeline = pipeline();
        h.create(&rekor("rekor", Some(1))).await;
        for _ in 0..6 {
            h.pass(&pipeline, "rekor").await.unwrap();
        }
        h.mark_available("rekor-server").await;
        assert_eq!(h.step(&pipeline, "rekor").await.1, Some(ReadyReason::Ready));

        let mut r: Rekor = h.get("rekor").await;
        r.spec.tree_id = Some(2);
        store::replace(h.store.as_ref(), &r).await.unwrap();

        // Only the sub-feature is reset; Ready follows through Reconverge.
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(ReadyReason::Ready)));
        let r: Rekor = h.get("rekor").await;
        assert!(!is_condition_true(r.conditions(), CONDITION_TYPE_TREE_RESOLVED));
        assert_eq!(r.resolved_tree(), None);

        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        assert_eq!(h.get::<Rekor>("rekor").await.resolved_tree(), Some(2));
        // deployment rolls to the new tree
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(Creating)));
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(ReadyReason::Initialize)));
        assert_eq!(h.step(&pipeline, "rekor").await, (StatusUpdated, Some(ReadyReason::Ready)));
    }
}
