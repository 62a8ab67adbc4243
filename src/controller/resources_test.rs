//! Unit tests for Kubernetes resource builders.
//!
//! Run with: `cargo test -p sigstore-k8s resources_test`

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;

    use crate::config::ImageConfig;
    use crate::controller::resources::*;
    use crate::controller::testing::{ctlog, rekor, trillian};
    use crate::crd::TreeResolvable;

    fn args(deployment: &k8s_openapi::api::apps::v1::Deployment) -> Vec<String> {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers[0].args.clone())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Ownership and labels
    // -----------------------------------------------------------------------

    #[test]
    fn test_artifacts_are_controlled_by_their_owner() {
        let trillian = trillian("trillian");
        let deployment = trillian_logserver_deployment(&trillian, &ImageConfig::default());

        let owners = deployment.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Trillian");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(deployment.namespace().as_deref(), Some("sigstore"));
    }

    #[test]
    fn test_standard_labels_cover_managed_keys() {
        let labels = standard_labels("rekor-server", "rekor");
        for key in MANAGED_LABELS {
            assert!(labels.contains_key(*key), "missing label {key}");
        }
        assert_eq!(labels[LABEL_INSTANCE], "rekor");
    }

    #[test]
    fn test_selector_matches_pod_labels() {
        let deployment = trillian_logsigner_deployment(&trillian("t"), &ImageConfig::default());
        let spec = deployment.spec.unwrap();
        assert_eq!(
            spec.selector.match_labels,
            spec.template.metadata.unwrap().labels
        );
        assert_eq!(spec.replicas, Some(1));
    }

    // -----------------------------------------------------------------------
    // Trillian
    // -----------------------------------------------------------------------

    #[test]
    fn test_default_trillian_name_matches_default_address() {
        let t = trillian("trillian");
        assert_eq!(trillian_address(&t), "trillian-logserver.sigstore.svc:8091");
        assert_eq!(
            trillian_address(&t),
            rekor("rekor", None).trillian_address()
        );
    }

    #[test]
    fn test_renamed_trillian_needs_explicit_address() {
        let t = trillian("prod");
        let mut r = rekor("rekor", None);
        assert_ne!(trillian_address(&t), r.trillian_address());

        r.spec.trillian.address = Some(format!("{}.sigstore.svc", trillian_logserver_name(&t)));
        assert_eq!(trillian_address(&t), r.trillian_address());
    }

    #[test]
    fn test_trillian_reads_database_secret() {
        let deployment = trillian_logserver_deployment(&trillian("t"), &ImageConfig::default());
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        let secret = env[0]
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(secret.name.as_deref(), Some("trillian-db"));
    }

    // -----------------------------------------------------------------------
    // Rekor / CT log
    // -----------------------------------------------------------------------

    #[test]
    fn test_rekor_deployment_needs_resolved_tree() {
        let mut r = rekor("rekor", None);
        assert!(rekor_deployment(&r, &ImageConfig::default()).is_err());

        r.set_resolved_tree(Some(654321));
        let deployment = rekor_deployment(&r, &ImageConfig::default()).unwrap();
        let args = args(&deployment);
        assert!(args.contains(&"--trillian_log_server.tlog_id=654321".to_string()));
        assert!(args.contains(&"--trillian_log_server.address=trillian-logserver.sigstore.svc".to_string()));
        assert!(args.contains(&"--trillian_log_server.port=8091".to_string()));
        assert!(args.contains(&"--rekor_server.signer=memory".to_string()));
    }

    #[test]
    fn test_rekor_mounts_signer_secret() {
        let mut r = rekor("rekor", None);
        r.spec.signer_secret_ref = Some("rekor-signer".to_string());
        r.set_resolved_tree(Some(1));

        let deployment = rekor_deployment(&r, &ImageConfig::default()).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("rekor-signer")
        );
        assert!(pod.containers[0].volume_mounts.is_some());
    }

    #[test]
    fn test_rekor_service_targets_server_port() {
        let svc = rekor_service(&rekor("rekor", None));
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(
            port.target_port,
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(3000))
        );
    }

    #[test]
    fn test_ctlog_deployment_mounts_config_secret() {
        let mut c = ctlog("ctlog", None);
        c.set_resolved_tree(Some(42));

        let deployment = ctlog_deployment(&c, &ImageConfig::default()).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let secret = pod.volumes.unwrap()[0].secret.clone().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("ctlog-config"));
        assert_eq!(secret.default_mode, Some(420));
        let env = pod.containers[0].env.clone().unwrap();
        assert_eq!(env[0].value.as_deref(), Some("42"));
    }

    // -----------------------------------------------------------------------
    // Tree resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_tree_objects_share_holder_name() {
        let r = rekor("prod", None);
        assert_eq!(tree_holder_name(&r), "prod-rekor-tree");
        assert_eq!(tree_holder_name(&ctlog("prod", None)), "prod-ctlog-tree");
        assert_eq!(tree_role(&r).name_any(), "prod-rekor-tree");
        assert_eq!(tree_service_account(&r).name_any(), "prod-rekor-tree");

        let binding = tree_role_binding(&r);
        assert_eq!(binding.role_ref.name, "prod-rekor-tree");
        assert_eq!(binding.subjects.unwrap()[0].name, "prod-rekor-tree");
    }

    #[test]
    fn test_tree_role_is_scoped_to_holder() {
        let rules = tree_role_rules(&rekor("prod", None));
        assert_eq!(
            rules[0].resource_names,
            Some(vec!["prod-rekor-tree".to_string()])
        );
        assert!(!rules[0].verbs.contains(&"create".to_string()));
    }

    #[test]
    fn test_tree_job_wire_contract() {
        let r = rekor("prod", None);
        let holder = ConfigMap {
            metadata: ObjectMeta {
                name: Some(tree_holder_name(&r)),
                namespace: Some("sigstore".to_string()),
                uid: Some("0f3c9a7e-1111-2222-3333-444455556666".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let job = tree_job(&r, &holder, "createtree:test").unwrap();
        assert_eq!(job.name_any(), "prod-rekor-tree-0f3c9a7e");

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("prod-rekor-tree"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("createtree:test"));
        assert_eq!(
            container.args.clone().unwrap(),
            vec![
                "--admin_server=trillian-logserver.sigstore.svc:8091".to_string(),
                "--display_name=prod".to_string(),
                "--configmap=prod-rekor-tree".to_string(),
                "--namespace=sigstore".to_string(),
            ]
        );
        let env = &container.env.clone().unwrap()[0];
        assert_eq!(env.name, "NAMESPACE");
        assert!(env.value_from.as_ref().unwrap().field_ref.is_some());
    }

    #[test]
    fn test_tree_job_needs_holder_uid() {
        let r = rekor("prod", None);
        assert!(tree_job(&r, &tree_holder(&r), "img").is_err());
    }
}
