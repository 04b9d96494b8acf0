//! Resources owned or inspected by the channel controller
//!
//! The only object the controller writes is the per-channel ExternalName
//! Service that aliases the shared dispatcher Service. Everything here is pure
//! so it can be exercised without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::FanoutChannel;
use crate::Error;

/// Suffix appended to the channel name to form its Service name
pub const CHANNEL_SERVICE_SUFFIX: &str = "-fanout-ch";

/// Label marking Services that front a fanout channel
pub const MESSAGING_ROLE_LABEL: &str = "messaging.fanout.dev/role";

/// Value of [`MESSAGING_ROLE_LABEL`]
pub const MESSAGING_ROLE: &str = "fanout-channel";

/// Name of the channel Service port
pub const PORT_NAME: &str = "http";

/// Channel Service port number
pub const PORT_NUMBER: i32 = 80;

/// Longest name a Service may carry (DNS-1035 label)
const MAX_NAME_LEN: usize = 63;

/// Hex characters of the digest used when a name must be shortened
const DIGEST_LEN: usize = 32;

/// Derive a child resource name from a parent name and suffix
///
/// Returns `parent + suffix` when it fits in 63 characters. Longer names are
/// truncated and disambiguated with a SHA-256 prefix of the full parent name,
/// so the result is stable across reconciles and never exceeds the limit.
pub fn child_name(parent: &str, suffix: &str) -> String {
    if parent.len() + suffix.len() <= MAX_NAME_LEN {
        return format!("{parent}{suffix}");
    }

    let digest = format!("{:x}", Sha256::digest(parent.as_bytes()));
    let digest = &digest[..DIGEST_LEN];
    let head = MAX_NAME_LEN.saturating_sub(suffix.len() + DIGEST_LEN);
    let truncated = parent.get(..head).unwrap_or_default().trim_end_matches('-');
    format!("{truncated}{digest}{suffix}")
}

/// Name of the Service owned by the given channel
pub fn channel_service_name(channel_name: &str) -> String {
    child_name(channel_name, CHANNEL_SERVICE_SUFFIX)
}

/// Cluster DNS name of a Service
pub fn service_hostname(name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{name}.{namespace}.svc.{cluster_domain}")
}

/// Build the ExternalName Service the channel should own
///
/// Fails if the channel has not been persisted yet (no uid to own through).
pub fn make_channel_service(
    channel: &FanoutChannel,
    dispatcher_hostname: &str,
) -> Result<Service, Error> {
    let owner = channel
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal("channel has no uid; cannot set owner reference"))?;

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(channel_service_name(&channel.name_any())),
            namespace: channel.namespace(),
            labels: Some(BTreeMap::from([(
                MESSAGING_ROLE_LABEL.to_string(),
                MESSAGING_ROLE.to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(expected_spec(dispatcher_hostname)),
        status: None,
    })
}

fn expected_spec(dispatcher_hostname: &str) -> ServiceSpec {
    ServiceSpec {
        type_: Some("ExternalName".to_string()),
        external_name: Some(dispatcher_hostname.to_string()),
        ports: Some(vec![ServicePort {
            name: Some(PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            port: PORT_NUMBER,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// True if `service` carries a controller owner reference to `channel`
pub fn is_controlled_by(service: &Service, channel: &FanoutChannel) -> bool {
    let Some(uid) = channel.meta().uid.as_deref() else {
        return false;
    };
    service
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Return the existing Service with managed fields reset, if any drifted
///
/// Only the type, external name and ports are managed. Fields the API server
/// fills in (cluster IPs, session affinity, ...) are left alone, so an
/// untouched Service never looks drifted.
pub fn drift_corrected(existing: &Service, expected: &Service) -> Option<Service> {
    let want = expected.spec.as_ref()?;
    let have = existing.spec.clone().unwrap_or_default();

    let ports_match = match (&have.ports, &want.ports) {
        (Some(have), Some(want)) => {
            have.len() == want.len()
                && have.iter().zip(want).all(|(h, w)| {
                    h.name == w.name
                        && h.port == w.port
                        && h.protocol.as_deref().unwrap_or("TCP")
                            == w.protocol.as_deref().unwrap_or("TCP")
                })
        }
        (None, None) => true,
        _ => false,
    };

    if have.type_ == want.type_ && have.external_name == want.external_name && ports_match {
        return None;
    }

    let mut updated = existing.clone();
    let spec = updated.spec.get_or_insert_with(Default::default);
    spec.type_ = want.type_.clone();
    spec.external_name = want.external_name.clone();
    spec.ports = want.ports.clone();
    // ExternalName services carry no cluster IP
    spec.cluster_ip = None;
    spec.cluster_ips = None;
    Some(updated)
}
