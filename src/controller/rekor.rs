//! Rekor pipeline: tree resolution, then the server

use crate::controller::artifacts::{EnsureDeployment, EnsureService, Initialize};
use crate::controller::conditions::CONDITION_TYPE_TREE_RESOLVED;
use crate::controller::pipeline::Pipeline;
use crate::controller::recovery::RecoveryAction;
use crate::controller::resources::{rekor_deployment, rekor_server_name, rekor_service, service_url};
use crate::controller::transitions::{
    Reconverge, Reset, ToCreate, ToInitialize, ToPending, ValidateSpec,
};
use crate::controller::tree::{
    EnsureTreeHolder, EnsureTreeRbac, ExtractTreeId, InvalidateTree, LaunchTreeJob, PollTreeJob,
    ResolveManual, RetryTreeJob,
};
use crate::crd::Rekor;
use kube::ResourceExt;

fn publish_url(rekor: &mut Rekor) {
    let url = service_url(&rekor_server_name(rekor), &rekor.namespace().unwrap_or_default());
    rekor.status.get_or_insert_with(Default::default).url = Some(url);
}

pub fn pipeline() -> Pipeline<Rekor> {
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
            EnsureDeployment::<Rekor>::new("server-deployment", rekor_deployment)
                .requires(&[CONDITION_TYPE_TREE_RESOLVED]),
        )
        .with(EnsureService::<Rekor>::new("server-service", rekor_service))
        .with(ToInitialize)
        .with(Initialize::<Rekor>::new(|r| vec![rekor_server_name(r)], publish_url))
        .with(RecoveryAction)
}
