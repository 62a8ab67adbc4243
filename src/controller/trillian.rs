//! Trillian pipeline: log server and log signer

use crate::controller::artifacts::{EnsureDeployment, EnsureService, Initialize};
use crate::controller::pipeline::Pipeline;
use crate::controller::recovery::RecoveryAction;
use crate::controller::resources::{
    trillian_address, trillian_logserver_deployment, trillian_logserver_name,
    trillian_logserver_service, trillian_logsigner_deployment, trillian_logsigner_name,
    trillian_logsigner_service,
};
use crate::controller::transitions::{
    Reconverge, Reset, ToCreate, ToInitialize, ToPending, ValidateSpec,
};
use crate::crd::Trillian;

fn deployments(trillian: &Trillian) -> Vec<String> {
    vec![
        trillian_logserver_name(trillian),
        trillian_logsigner_name(trillian),
    ]
}

fn publish_address(trillian: &mut Trillian) {
    let address = trillian_address(trillian);
    trillian.status.get_or_insert_with(Default::default).url = Some(address);
}

pub fn pipeline() -> Pipeline<Trillian> {
    Pipeline::new()
        .with(ValidateSpec)
        .with(Reset)
        .with(ToPending)
        .with(ToCreate)
        .with(Reconverge)
        .with(EnsureDeployment::<Trillian>::new("logserver-deployment", |t, images| {
            Ok(trillian_logserver_deployment(t, images))
        }))
        .with(EnsureService::<Trillian>::new(
            "logserver-service",
            trillian_logserver_service,
        ))
        .with(EnsureDeployment::<Trillian>::new("logsigner-deployment", |t, images| {
            Ok(trillian_logsigner_deployment(t, images))
        }))
        .with(EnsureService::<Trillian>::new(
            "logsigner-service",
            trillian_logsigner_service,
        ))
        .with(ToInitialize)
        .with(Initialize::<Trillian>::new(deployments, publish_address))
        .with(RecoveryAction)
}
