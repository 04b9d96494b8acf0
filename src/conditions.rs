//! Condition tracking for FanoutChannel status
//!
//! A channel carries five dependent conditions plus a derived `Ready`. Marks are
//! idempotent: re-marking a condition with the same status, reason and message
//! changes nothing, and `lastTransitionTime` only moves when the status does.
//! `Ready` is recomputed after every mark and cannot be set directly.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Condition, ConditionStatus};

/// Named conditions on a FanoutChannel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelConditionType {
    /// Roll-up of every other condition
    Ready,
    /// The shared dispatcher Deployment is available
    DispatcherReady,
    /// The shared dispatcher Service exists
    ServiceReady,
    /// The dispatcher Service has at least one backing endpoint
    EndpointsReady,
    /// The channel has a non-empty address
    Addressable,
    /// The channel-owned ExternalName Service is in place
    ChannelServiceReady,
}

impl ChannelConditionType {
    /// Conditions that feed the Ready roll-up, in evaluation order
    pub const DEPENDENTS: [Self; 5] = [
        Self::DispatcherReady,
        Self::ServiceReady,
        Self::EndpointsReady,
        Self::Addressable,
        Self::ChannelServiceReady,
    ];

    /// Wire name of the condition type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::DispatcherReady => "DispatcherReady",
            Self::ServiceReady => "ServiceReady",
            Self::EndpointsReady => "EndpointsReady",
            Self::Addressable => "Addressable",
            Self::ChannelServiceReady => "ChannelServiceReady",
        }
    }
}

impl std::fmt::Display for ChannelConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of rolling dependent conditions up into Ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollUp {
    /// Ready status
    pub status: ConditionStatus,
    /// Reason copied from the dependent that decided the roll-up
    pub reason: String,
    /// Message copied from the dependent that decided the roll-up
    pub message: String,
}

/// Compute Ready from a set of conditions
///
/// True iff every dependent is True. Otherwise False with the first False
/// dependent's reason, or Unknown with the first non-True dependent's reason.
/// A missing dependent counts as Unknown.
pub fn roll_up(conditions: &[Condition]) -> RollUp {
    let lookup = |t: ChannelConditionType| conditions.iter().find(|c| c.type_ == t.as_str());

    let from = |status, cond: Option<&Condition>| RollUp {
        status,
        reason: cond.map(|c| c.reason.clone()).unwrap_or_default(),
        message: cond.map(|c| c.message.clone()).unwrap_or_default(),
    };

    if let Some(failed) = ChannelConditionType::DEPENDENTS
        .iter()
        .filter_map(|t| lookup(*t))
        .find(|c| c.status == ConditionStatus::False)
    {
        return from(ConditionStatus::False, Some(failed));
    }

    for t in ChannelConditionType::DEPENDENTS {
        match lookup(t) {
            Some(c) if c.status == ConditionStatus::True => continue,
            other => return from(ConditionStatus::Unknown, other),
        }
    }

    from(ConditionStatus::True, None)
}

/// Ordered set of channel conditions, serialized as a plain list
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct ConditionTracker(Vec<Condition>);

impl ConditionTracker {
    /// Set every missing condition to Unknown and recompute Ready
    pub fn initialize(&mut self) {
        for t in ChannelConditionType::DEPENDENTS {
            if self.get(t).is_none() {
                self.0
                    .push(Condition::new(t.as_str(), ConditionStatus::Unknown, "", ""));
            }
        }
        self.recompute_ready();
    }

    /// True if no condition has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All recorded conditions
    pub fn as_slice(&self) -> &[Condition] {
        &self.0
    }

    /// Look up a condition by type
    pub fn get(&self, type_: ChannelConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_.as_str())
    }

    /// Status of a condition; Unknown if it was never recorded
    pub fn status(&self, type_: ChannelConditionType) -> ConditionStatus {
        self.get(type_).map(|c| c.status).unwrap_or_default()
    }

    /// True if the condition is recorded as True
    pub fn is_true(&self, type_: ChannelConditionType) -> bool {
        self.status(type_) == ConditionStatus::True
    }

    /// Mark a dependent condition True
    pub fn mark_true(&mut self, type_: ChannelConditionType) {
        self.mark(type_, ConditionStatus::True, "", "");
    }

    /// Mark a dependent condition False with a reason
    pub fn mark_false(
        &mut self,
        type_: ChannelConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.mark(type_, ConditionStatus::False, reason, message);
    }

    /// Mark a dependent condition Unknown with a reason
    pub fn mark_unknown(
        &mut self,
        type_: ChannelConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.mark(type_, ConditionStatus::Unknown, reason, message);
    }

    fn mark(
        &mut self,
        type_: ChannelConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        // Ready is derived
        if type_ == ChannelConditionType::Ready {
            return;
        }
        self.set(type_, status, reason.into(), message.into());
        self.recompute_ready();
    }

    fn recompute_ready(&mut self) {
        let RollUp {
            status,
            reason,
            message,
        } = roll_up(&self.0);
        self.set(ChannelConditionType::Ready, status, reason, message);
    }

    fn set(
        &mut self,
        type_: ChannelConditionType,
        status: ConditionStatus,
        reason: String,
        message: String,
    ) {
        match self.0.iter_mut().find(|c| c.type_ == type_.as_str()) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return;
                }
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
            }
            None => self
                .0
                .push(Condition::new(type_.as_str(), status, reason, message)),
        }
    }
}
