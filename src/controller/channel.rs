//! FanoutChannel controller implementation
//!
//! Each pass checks the shared dispatcher (Deployment, Service, Endpoints),
//! makes sure the channel owns an ExternalName Service pointing at it, and
//! assigns the channel address. Conditions record how far the pass got; the
//! first failing step ends the pass and the partial status is still written.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::resources::{
    drift_corrected, is_controlled_by, make_channel_service, service_hostname,
};
use crate::conditions::ChannelConditionType;
use crate::crd::{ConditionStatus, FanoutChannel, FanoutChannelStatus};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::retry::{FailureCounters, RetryConfig};
use crate::{
    Error, CONTROLLER_NAME, DEFAULT_CLUSTER_DOMAIN, DEFAULT_SYSTEM_NAMESPACE, DISPATCHER_NAME,
};

/// Requeue interval for channels that reconciled cleanly
const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Resource store operations used by the channel controller
///
/// `get_*` return `Ok(None)` when the object does not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Get a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Get the Endpoints of a Service
    async fn get_endpoints(&self, namespace: &str, name: &str)
        -> Result<Option<Endpoints>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// Replace an existing Service (keeps its identity and resourceVersion)
    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// Write the controller-owned status fields of a channel
    ///
    /// Only conditions, address and observedGeneration are sent; subscriber
    /// status belongs to the dispatcher and is left alone.
    async fn patch_channel_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FanoutChannelStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ChannelStoreImpl {
    client: Client,
}

impl ChannelStoreImpl {
    /// Create a new store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelStore for ChannelStoreImpl {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&service.name_any(), &PostParams::default(), service)
            .await?)
    }

    async fn patch_channel_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FanoutChannelStatus,
    ) -> Result<(), Error> {
        let api: Api<FanoutChannel> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "status": {
                "observedGeneration": status.observed_generation,
                "conditions": status.conditions,
                "address": status.address,
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Controller context shared across reconciliations
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .system_namespace("fanout-system")
///     .cluster_domain("cluster.local")
///     .build();
/// ```
pub struct Context {
    /// Resource store (trait object for testability)
    pub store: Arc<dyn ChannelStore>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Namespace holding the shared dispatcher
    pub system_namespace: String,
    /// Cluster DNS domain
    pub cluster_domain: String,
    /// Backoff for failing channels
    pub retry: RetryConfig,
    /// Consecutive failures per channel ("namespace/name")
    pub failures: FailureCounters,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn ChannelStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            events,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            retry: RetryConfig::reconcile(),
            failures: FailureCounters::default(),
        }
    }

    async fn publish(
        &self,
        channel: &FanoutChannel,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&channel.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ChannelStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    system_namespace: String,
    cluster_domain: String,
    retry: RetryConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            events: None,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            retry: RetryConfig::reconcile(),
        }
    }

    /// Set the namespace holding the shared dispatcher
    pub fn system_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.system_namespace = namespace.into();
        self
    }

    /// Set the cluster DNS domain
    pub fn cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.cluster_domain = domain.into();
        self
    }

    /// Override the failure backoff
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the resource store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn ChannelStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(ChannelStoreImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            system_namespace: self.system_namespace,
            cluster_domain: self.cluster_domain,
            retry: self.retry,
            failures: FailureCounters::default(),
        }
    }
}

/// A failed step: the event reason to publish and the underlying error
struct StepFailure {
    reason: &'static str,
    error: Error,
}

impl StepFailure {
    fn new(reason: &'static str, error: Error) -> Self {
        Self { reason, error }
    }
}

pub(crate) fn channel_key(channel: &FanoutChannel) -> String {
    format!(
        "{}/{}",
        channel.namespace().unwrap_or_default(),
        channel.name_any()
    )
}

/// Reconcile a FanoutChannel
///
/// Returns `await_change` for invalid specs (nothing will improve until the
/// spec does) and a periodic requeue after a clean pass. Failed passes return
/// the error so [`error_policy`] can back off.
#[instrument(skip(channel, ctx), fields(channel = %channel_key(&channel)))]
pub async fn reconcile(channel: Arc<FanoutChannel>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = channel.name_any();
    let namespace = channel
        .namespace()
        .ok_or_else(|| Error::validation("metadata.namespace", "FanoutChannel must be namespaced"))?;
    let key = channel_key(&channel);
    info!("reconciling channel");

    if let Err(e) = channel.validate() {
        warn!(error = %e, "channel validation failed");
        ctx.publish(
            &channel,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::VALIDATE,
            e.to_string(),
        )
        .await;
        ctx.failures.clear(&key);
        return Ok(Action::await_change());
    }

    let current = channel.status.clone().unwrap_or_default();
    let mut status = current.clone();
    status.conditions.initialize();
    status.observed_generation = channel.metadata.generation;

    let outcome = reconcile_dependents(&channel, &namespace, &ctx, &mut status).await;

    if controller_fields_changed(&current, &status) {
        if let Err(e) = ctx
            .store
            .patch_channel_status(&namespace, &name, &status)
            .await
        {
            error!(error = %e, "failed to update channel status");
            ctx.publish(
                &channel,
                EventType::Warning,
                reasons::INTERNAL_ERROR,
                actions::RECONCILE,
                format!("Failed to update channel status: {e}"),
            )
            .await;
            return Err(e);
        }
        debug!(ready = %status.conditions.status(ChannelConditionType::Ready), "updated channel status");
    }

    if let Err(StepFailure { reason, error }) = outcome {
        warn!(error = %error, reason, "channel reconcile failed");
        ctx.publish(
            &channel,
            EventType::Warning,
            reason,
            actions::RECONCILE,
            error.to_string(),
        )
        .await;
        return Err(error);
    }

    if !current.is_ready() && status.is_ready() {
        info!("channel is ready");
        ctx.publish(
            &channel,
            EventType::Normal,
            reasons::CHANNEL_RECONCILED,
            actions::RECONCILE,
            "FanoutChannel reconciled".to_string(),
        )
        .await;
    }

    ctx.failures.clear(&key);
    Ok(Action::requeue(DRIFT_CHECK_INTERVAL))
}

/// Error policy for the channel controller
///
/// Retryable errors back off exponentially per channel. An ownership conflict
/// needs a human, so it is only rechecked at the slowest interval. Other
/// permanent errors wait for the channel to change.
pub fn error_policy(channel: Arc<FanoutChannel>, error: &Error, ctx: Arc<Context>) -> Action {
    let attempt = ctx.failures.record(&channel_key(&channel));
    error!(
        ?error,
        channel = %channel_key(&channel),
        attempt,
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.retry.delay_for_attempt(attempt))
    } else if matches!(error, Error::OwnershipConflict { .. }) {
        Action::requeue(ctx.retry.max_delay)
    } else {
        Action::await_change()
    }
}

fn controller_fields_changed(before: &FanoutChannelStatus, after: &FanoutChannelStatus) -> bool {
    before.conditions != after.conditions
        || before.address != after.address
        || before.observed_generation != after.observed_generation
}

async fn reconcile_dependents(
    channel: &FanoutChannel,
    namespace: &str,
    ctx: &Context,
    status: &mut FanoutChannelStatus,
) -> Result<(), StepFailure> {
    let system_ns = ctx.system_namespace.as_str();
    let dispatcher = format!("{system_ns}/{DISPATCHER_NAME}");

    // Dispatcher Deployment: mirror its Available condition
    match ctx.store.get_deployment(system_ns, DISPATCHER_NAME).await {
        Ok(Some(deployment)) => propagate_dispatcher_status(status, &deployment),
        Ok(None) => {
            status.conditions.mark_false(
                ChannelConditionType::DispatcherReady,
                "DispatcherDeploymentDoesNotExist",
                "Dispatcher Deployment does not exist",
            );
            return Err(StepFailure::new(
                reasons::DISPATCHER_DEPLOYMENT_FAILED,
                Error::not_found("Deployment", dispatcher.as_str()),
            ));
        }
        Err(e) => {
            status.conditions.mark_unknown(
                ChannelConditionType::DispatcherReady,
                "DispatcherDeploymentGetFailed",
                format!("Failed to get dispatcher Deployment: {e}"),
            );
            return Err(StepFailure::new(reasons::DISPATCHER_DEPLOYMENT_FAILED, e));
        }
    }

    let conditions = &mut status.conditions;

    // Dispatcher Service: existence only
    match ctx.store.get_service(system_ns, DISPATCHER_NAME).await {
        Ok(Some(_)) => conditions.mark_true(ChannelConditionType::ServiceReady),
        Ok(None) => {
            conditions.mark_false(
                ChannelConditionType::ServiceReady,
                "DispatcherServiceDoesNotExist",
                "Dispatcher Service does not exist",
            );
            return Err(StepFailure::new(
                reasons::DISPATCHER_SERVICE_FAILED,
                Error::not_found("Service", dispatcher.as_str()),
            ));
        }
        Err(e) => {
            conditions.mark_unknown(
                ChannelConditionType::ServiceReady,
                "DispatcherServiceGetFailed",
                format!("Failed to get dispatcher Service: {e}"),
            );
            return Err(StepFailure::new(reasons::DISPATCHER_SERVICE_FAILED, e));
        }
    }

    // Dispatcher Endpoints: at least one ready address
    match ctx.store.get_endpoints(system_ns, DISPATCHER_NAME).await {
        Ok(Some(endpoints)) if has_ready_addresses(&endpoints) => {
            conditions.mark_true(ChannelConditionType::EndpointsReady)
        }
        Ok(Some(_)) => {
            conditions.mark_false(
                ChannelConditionType::EndpointsReady,
                "DispatcherEndpointsNotReady",
                "There are no endpoints ready for Dispatcher service",
            );
            return Err(StepFailure::new(
                reasons::DISPATCHER_ENDPOINTS_FAILED,
                Error::not_ready("Endpoints", dispatcher.as_str(), "no ready addresses"),
            ));
        }
        Ok(None) => {
            conditions.mark_false(
                ChannelConditionType::EndpointsReady,
                "DispatcherEndpointsDoesNotExist",
                "Dispatcher Endpoints does not exist",
            );
            return Err(StepFailure::new(
                reasons::DISPATCHER_ENDPOINTS_FAILED,
                Error::not_found("Endpoints", dispatcher.as_str()),
            ));
        }
        Err(e) => {
            conditions.mark_unknown(
                ChannelConditionType::EndpointsReady,
                "DispatcherEndpointsGetFailed",
                format!("Failed to get dispatcher Endpoints: {e}"),
            );
            return Err(StepFailure::new(reasons::DISPATCHER_ENDPOINTS_FAILED, e));
        }
    }

    // Channel Service and address
    let service = reconcile_channel_service(channel, namespace, ctx, status).await?;
    status
        .conditions
        .mark_true(ChannelConditionType::ChannelServiceReady);
    status.set_address(&service_hostname(
        &service.name_any(),
        namespace,
        &ctx.cluster_domain,
    ));
    Ok(())
}

/// Copy the Deployment's Available condition onto DispatcherReady
///
/// A Deployment that reports no Available condition leaves DispatcherReady as is.
fn propagate_dispatcher_status(status: &mut FanoutChannelStatus, deployment: &Deployment) {
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Available"));

    let Some(cond) = available else {
        return;
    };
    let reason = cond.reason.as_deref().unwrap_or_default();
    let message = cond.message.as_deref().unwrap_or_default();

    match ConditionStatus::from_k8s(&cond.status) {
        ConditionStatus::True => status
            .conditions
            .mark_true(ChannelConditionType::DispatcherReady),
        ConditionStatus::False => status.conditions.mark_false(
            ChannelConditionType::DispatcherReady,
            "DispatcherDeploymentFalse",
            format!("The status of Dispatcher Deployment is False: {reason} : {message}"),
        ),
        ConditionStatus::Unknown => status.conditions.mark_unknown(
            ChannelConditionType::DispatcherReady,
            "DispatcherDeploymentUnknown",
            format!("The status of Dispatcher Deployment is Unknown: {reason} : {message}"),
        ),
    }
}

fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|subset| !subset.addresses.as_deref().unwrap_or_default().is_empty())
}

/// Ensure the channel owns an ExternalName Service aliasing the dispatcher
///
/// Ownership is checked before any write: a Service with the expected name
/// but a different controller is reported and never modified.
async fn reconcile_channel_service(
    channel: &FanoutChannel,
    namespace: &str,
    ctx: &Context,
    status: &mut FanoutChannelStatus,
) -> Result<Service, StepFailure> {
    let conditions = &mut status.conditions;
    let failed = |e: &Error| format!("Channel Service failed: {e}");

    let dispatcher_host =
        service_hostname(DISPATCHER_NAME, &ctx.system_namespace, &ctx.cluster_domain);
    let expected = match make_channel_service(channel, &dispatcher_host) {
        Ok(svc) => svc,
        Err(e) => {
            conditions.mark_false(
                ChannelConditionType::ChannelServiceReady,
                "ChannelServiceFailed",
                failed(&e),
            );
            return Err(StepFailure::new(reasons::CHANNEL_SERVICE_FAILED, e));
        }
    };
    let service_name = expected.name_any();

    let existing = match ctx.store.get_service(namespace, &service_name).await {
        Ok(existing) => existing,
        Err(e) => {
            conditions.mark_unknown(
                ChannelConditionType::ChannelServiceReady,
                "ChannelServiceGetFailed",
                format!("Unable to get the channel service: {e}"),
            );
            return Err(StepFailure::new(reasons::CHANNEL_SERVICE_FAILED, e));
        }
    };

    let Some(existing) = existing else {
        info!(service = %service_name, "creating channel service");
        return match ctx.store.create_service(namespace, &expected).await {
            Ok(created) => Ok(created),
            Err(e) => {
                conditions.mark_false(
                    ChannelConditionType::ChannelServiceReady,
                    "ChannelServiceFailed",
                    failed(&e),
                );
                Err(StepFailure::new(reasons::CHANNEL_SERVICE_FAILED, e))
            }
        };
    };

    if !is_controlled_by(&existing, channel) {
        let e = Error::OwnershipConflict {
            owner: channel_key(channel),
            kind: "Service",
            name: service_name,
        };
        conditions.mark_false(
            ChannelConditionType::ChannelServiceReady,
            "ChannelServiceFailed",
            failed(&e),
        );
        return Err(StepFailure::new(reasons::CHANNEL_SERVICE_FAILED, e));
    }

    let Some(updated) = drift_corrected(&existing, &expected) else {
        return Ok(existing);
    };

    info!(service = %service_name, "updating drifted channel service");
    match ctx.store.update_service(namespace, &updated).await {
        Ok(svc) => Ok(svc),
        Err(e) => {
            conditions.mark_false(
                ChannelConditionType::ChannelServiceReady,
                "ChannelServiceFailed",
                failed(&e),
            );
            Err(StepFailure::new(reasons::CHANNEL_SERVICE_FAILED, e))
        }
    }
}
