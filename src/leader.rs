//! Leader election for dispatcher replicas using Kubernetes Leases
//!
//! Every dispatcher replica serves traffic and keeps its own routing table.
//! Only the replica holding the Lease writes channel status; the others run
//! the observe-only reconcile. Leadership is published through a shared
//! [`LeaderFlag`] that the dispatcher reconciler reads on every pass.
//!
//! # Atomicity
//!
//! Lease writes carry the resourceVersion that was read. If the lease changed
//! in between, the write fails with 409 Conflict and the attempt counts as
//! "not leader" until the next round.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, DISPATCHER_COMPONENT};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Shared "this replica is the leader" flag
///
/// Backed by a watch channel so the dispatcher can react to promotion.
#[derive(Clone, Debug)]
pub struct LeaderFlag(Arc<watch::Sender<bool>>);

impl LeaderFlag {
    /// Flag that starts as follower
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    /// Current leadership
    pub fn is_leader(&self) -> bool {
        *self.0.borrow()
    }

    /// Record leadership
    pub fn set(&self, leader: bool) {
        self.0.send_replace(leader);
    }

    /// Receiver notified on every leadership change
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for LeaderFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do with the lease as it currently stands
#[derive(Clone, Debug, PartialEq, Eq)]
enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it
    Renew,
    /// Someone else held it but let it expire
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Wait,
}

fn decide(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = existing else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    let expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (_, Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    };

    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Lease-based leader elector
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    flag: LeaderFlag,
}

impl LeaderElector {
    /// Create an elector for `identity` ("pod/container")
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            flag: LeaderFlag::new(),
        }
    }

    /// Flag updated by [`LeaderElector::run`]
    pub fn flag(&self) -> LeaderFlag {
        self.flag.clone()
    }

    /// Campaign for and hold the lease until `shutdown` fires
    ///
    /// Losing the lease flips the flag back to follower and resumes the
    /// campaign. On shutdown the lease is released so a standby can take
    /// over without waiting for expiry.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(identity = %self.identity, lease = %self.lease_name, "starting leader election");

        loop {
            let leader = match self.try_acquire_or_renew().await {
                Ok(held) => held,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease update failed");
                    false
                }
            };

            if leader != self.flag.is_leader() {
                if leader {
                    info!(identity = %self.identity, "leadership acquired");
                } else {
                    warn!(identity = %self.identity, "leadership lost");
                }
                self.flag.set(leader);
            }

            let wait = if leader { RENEW_INTERVAL } else { RETRY_INTERVAL };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.flag.is_leader() {
            self.flag.set(false);
            if let Err(e) = self.release().await {
                warn!(identity = %self.identity, error = %e, "failed to release lease");
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await?;

        let lease = match decide(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => {
                return match api.create(&PostParams::default(), &self.lease(now, 0, None)).await {
                    Ok(_) => {
                        info!(identity = %self.identity, "created lease");
                        Ok(true)
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                };
            }
            LeaseAction::Renew => {
                let mut renewed = existing.ok_or_else(|| Error::internal("lease vanished"))?;
                if let Some(spec) = renewed.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                renewed
            }
            LeaseAction::TakeOver { transitions } => {
                let resource_version = existing
                    .and_then(|l| l.metadata.resource_version)
                    .ok_or_else(|| Error::internal("lease missing resourceVersion"))?;
                self.lease(now, transitions + 1, Some(resource_version))
            }
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "lease held");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease(&self, now: DateTime<Utc>, transitions: i32, resource_version: Option<String>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn release(&self) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let patch = json!({ "spec": { "holderIdentity": null } });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(DISPATCHER_COMPONENT),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}
