//! Kubernetes Event recording for the channel controllers.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What was being done (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    /// (e.g. "fanout-channel-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// The shared dispatcher Deployment is missing or unreadable
    pub const DISPATCHER_DEPLOYMENT_FAILED: &str = "DispatcherDeploymentFailed";
    /// The shared dispatcher Service is missing or unreadable
    pub const DISPATCHER_SERVICE_FAILED: &str = "DispatcherServiceFailed";
    /// The dispatcher Endpoints are missing, empty or unreadable
    pub const DISPATCHER_ENDPOINTS_FAILED: &str = "DispatcherEndpointsFailed";
    /// The channel-owned Service could not be reconciled
    pub const CHANNEL_SERVICE_FAILED: &str = "ChannelServiceFailed";
    /// Status write or other internal failure
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// Channel reached Ready
    pub const CHANNEL_RECONCILED: &str = "ChannelReconciled";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// The dispatcher could not turn the channel into a routing entry
    pub const TRANSLATION_FAILED: &str = "TranslationFailed";
    /// The dispatcher could not write subscriber status
    pub const STATUS_PATCH_FAILED: &str = "StatusPatchFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Validating the channel spec
    pub const VALIDATE: &str = "Validate";
}
