//! CT log pipeline: tree resolution, then the frontend

use crate::controller::artifacts::{EnsureDeployment, EnsureService, Initialize};
use crate::controller::conditions::CONDITION_TYPE_TREE_RESOLVED;
use crate::controller::pipeline::Pipeline;
use crate::controller::recovery::RecoveryAction;
use crate::controller::resources::{ctlog_deployment, ctlog_server_name, ctlog_service, service_url};
use crate::controller::transitions::{
    Reconverge, Reset, ToCreate, ToInitialize, ToPending, ValidateSpec,
};
use crate::controller::tree::{
    EnsureTreeHolder, EnsureTreeRbac, ExtractTreeId, InvalidateTree, LaunchTreeJob, PollTreeJob,
    ResolveManual, RetryTreeJob,
};
use crate::crd::CTlog;
use kube::ResourceExt;

fn publish_url(ctlog: &mut CTlog) {
    let url = service_url(&ctlog_server_name(ctlog), &ctlog.namespace().unwrap_or_default());
    ctlog.status.get_or_insert_with(Default::default).url = Some(url);
}

pub fn pipeline() -> Pipeline<CTlog> {
    Pipeline::new()
        .with(ValidateSpec)
        .with(Reset)
        .with(RetryTreeJob)
        .with(ToPending)
        .with(ToCreate)
        .with(InvalidateTree)
        .with(Reconverge)
        .with(ResolveManual)
        .with(EnsureTreeRbac)
        .with(EnsureTreeHolder)
        .with(LaunchTreeJob)
        .with(PollTreeJob)
        .with(ExtractTreeId)
        .with(
            EnsureDeployment::<CTlog>::new("server-deployment", ctlog_deployment)
                .requires(&[CONDITION_TYPE_TREE_RESOLVED]),
        )
        .with(EnsureService::<CTlog>::new("server-service", ctlog_service))
        .with(ToInitialize)
        .with(Initialize::<CTlog>::new(|c| vec![ctlog_server_name(c)], publish_url))
        .with(RecoveryAction)
}
