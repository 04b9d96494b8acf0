//! FanoutChannel Custom Resource Definition
//!
//! A FanoutChannel accepts messages over HTTP at its status address and
//! delivers every message to each subscriber listed in its spec.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ChannelAddress, DeliverySpec, SubscriberSpec, SubscriberStatus};
use crate::conditions::{ChannelConditionType, ConditionTracker};

/// Specification for a FanoutChannel
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "messaging.fanout.dev",
    version = "v1alpha1",
    kind = "FanoutChannel",
    plural = "fanoutchannels",
    shortname = "fch",
    status = "FanoutChannelStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FanoutChannelSpec {
    /// Destinations that receive every message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<SubscriberSpec>,

    /// Delivery options applied to subscribers that don't carry their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

impl FanoutChannelSpec {
    /// Validate the channel specification
    ///
    /// Every subscriber must name a subscriber URI, a reply URI, or both.
    /// Blank URIs count as missing. All offending subscribers are reported
    /// in one error.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let fields: Vec<String> = self
            .subscribers
            .iter()
            .enumerate()
            .filter(|(_, sub)| !sub.has_destination())
            .flat_map(|(i, _)| {
                [
                    format!("spec.subscribers[{i}].replyUri"),
                    format!("spec.subscribers[{i}].subscriberUri"),
                ]
            })
            .collect();

        if fields.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::MissingField { fields })
        }
    }
}

impl FanoutChannel {
    /// Validate the channel (delegates to the spec)
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.spec.validate()
    }

    /// True if the channel's Ready roll-up is True
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(FanoutChannelStatus::is_ready)
    }

    /// Hostname of the channel's address, if one has been assigned
    pub fn address_host(&self) -> Option<String> {
        let url = self.status.as_ref()?.address.as_ref()?.url.as_deref()?;
        let parsed = reqwest::Url::parse(url).ok()?;
        parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .map(str::to_string)
    }
}

/// Status for a FanoutChannel
///
/// Conditions, address and observedGeneration are owned by the controller;
/// subscribers are owned by the dispatcher.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FanoutChannelStatus {
    /// Generation of the spec last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the channel state
    #[serde(default, skip_serializing_if = "ConditionTracker::is_empty")]
    pub conditions: ConditionTracker,

    /// Where the channel accepts messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ChannelAddress>,

    /// Per-subscriber readiness as observed by the dispatcher
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<SubscriberStatus>,
}

impl FanoutChannelStatus {
    /// True if the Ready roll-up is True
    pub fn is_ready(&self) -> bool {
        self.conditions.is_true(ChannelConditionType::Ready)
    }

    /// Record the channel address and flip Addressable accordingly
    ///
    /// An empty hostname clears the address and marks Addressable False.
    pub fn set_address(&mut self, hostname: &str) {
        if hostname.is_empty() {
            self.address = None;
            self.conditions.mark_false(
                ChannelConditionType::Addressable,
                "EmptyHostname",
                "hostname is the empty string",
            );
        } else {
            self.address = Some(ChannelAddress {
                url: Some(format!("http://{hostname}")),
            });
            self.conditions.mark_true(ChannelConditionType::Addressable);
        }
    }
}
