//! Lease-based leader election
//!
//! Every replica runs the election loop; only the holder of the
//! coordination Lease has its `is_leader` flag set and runs passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Identity of this replica: the pod name when running in-cluster
pub fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

/// Contend for `lease_name` in `namespace` forever, mirroring the result into `is_leader`
pub async fn run_leader_election(
    client: Client,
    namespace: String,
    lease_name: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, &namespace);

    loop {
        match try_acquire_or_renew(&leases, &namespace, &lease_name, &identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", lease_name);
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", lease_name);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

/// Whether a lease last renewed per `spec` can be taken over at `now`
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(renew) = spec.and_then(|s| s.renew_time.as_ref()) else {
        return true;
    };
    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS);
    now > renew.0 + chrono::Duration::seconds(i64::from(duration))
}

fn new_lease(namespace: &str, lease_name: &str, identity: &str, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(lease_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            ..Default::default()
        }),
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    lease_name: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let existing = match leases.get_opt(lease_name).await? {
        Some(existing) => existing,
        None => {
            let lease = new_lease(namespace, lease_name, identity, now);
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", lease_name, identity);
            return Ok(true);
        }
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Renewed lease {}", lease_name);
        return Ok(true);
    }

    if !lease_expired(spec, now) {
        return Ok(false);
    }

    info!(
        "Lease held by {:?} has expired, taking over",
        current_holder
    );
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    leases
        .patch(lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
