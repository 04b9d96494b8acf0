//! Controller runner - wires the channel controller to the cluster
//!
//! Besides the FanoutChannel watch, the runner watches the shared dispatcher
//! Deployment, Service and Endpoints. Any change to them invalidates every
//! channel at once through `reconcile_all_on`. A separate FanoutChannel watch
//! drops the failure counters of deleted channels.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::channel::{channel_key, error_policy, reconcile, Context};
use super::resources::{MESSAGING_ROLE, MESSAGING_ROLE_LABEL};
use crate::crd::FanoutChannel;
use crate::retry::FailureCounters;
use crate::DISPATCHER_NAME;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Resync signals buffered while a global reconcile is pending
const RESYNC_BUFFER: usize = 1;

/// Run the channel controller until a shutdown signal arrives
pub async fn run_channel_controller(client: Client, ctx: Arc<Context>) {
    let channels: Api<FanoutChannel> = Api::all(client.clone());
    let channel_services: Api<Service> = Api::all(client.clone());
    let resync = dispatcher_resync_trigger(client, &ctx.system_namespace);
    spawn_deletion_watch(channels.clone(), Arc::clone(&ctx));

    info!(namespace = %ctx.system_namespace, "starting FanoutChannel controller");

    Controller::new(
        channels,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        channel_services,
        WatcherConfig::default()
            .labels(&format!("{MESSAGING_ROLE_LABEL}={MESSAGING_ROLE}"))
            .timeout(WATCH_TIMEOUT_SECS),
    )
    .reconcile_all_on(resync)
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("FanoutChannel"))
    .await;
}

/// Stream that yields once per change to the shared dispatcher resources
///
/// Signals coalesce: while one resync is queued, further changes are dropped.
pub fn dispatcher_resync_trigger(client: Client, namespace: &str) -> ReceiverStream<()> {
    let (tx, rx) = mpsc::channel(RESYNC_BUFFER);
    let selector = format!("metadata.name={DISPATCHER_NAME}");

    spawn_resync_watch::<Deployment>(
        Api::namespaced(client.clone(), namespace),
        &selector,
        tx.clone(),
    );
    spawn_resync_watch::<Service>(
        Api::namespaced(client.clone(), namespace),
        &selector,
        tx.clone(),
    );
    spawn_resync_watch::<Endpoints>(Api::namespaced(client, namespace), &selector, tx);

    ReceiverStream::new(rx)
}

fn spawn_resync_watch<K>(api: Api<K>, selector: &str, tx: mpsc::Sender<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    let config = WatcherConfig::default()
        .fields(selector)
        .timeout(WATCH_TIMEOUT_SECS);
    let kind = K::kind(&K::DynamicType::default()).to_string();

    tokio::spawn(async move {
        let mut changes = watcher::watcher(api, config)
            .default_backoff()
            .touched_objects()
            .boxed();

        loop {
            match changes.try_next().await {
                Ok(Some(_)) => match tx.try_send(()) {
                    Ok(()) => debug!(kind = %kind, "dispatcher changed, resyncing all channels"),
                    Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Closed(())) => break,
                },
                Ok(None) => break,
                Err(e) => warn!(kind = %kind, error = %e, "dispatcher watch error"),
            }
        }
    });
}

/// Drop failure counters of channels that no longer exist
///
/// `seen` collects channels between `Init` and `InitDone`, so channels
/// deleted while the watch was down are caught by the relist.
pub fn forget_deleted_channels(
    failures: &FailureCounters,
    event: Event<FanoutChannel>,
    seen: &mut HashSet<String>,
) {
    match event {
        Event::Delete(channel) => failures.clear(&channel_key(&channel)),
        Event::Init => seen.clear(),
        Event::InitApply(channel) => {
            seen.insert(channel_key(&channel));
        }
        Event::InitDone => {
            failures.retain(seen);
            seen.clear();
        }
        Event::Apply(_) => {}
    }
}

fn spawn_deletion_watch(api: Api<FanoutChannel>, ctx: Arc<Context>) {
    tokio::spawn(async move {
        let mut events = watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff()
            .boxed();
        let mut seen = HashSet::new();

        loop {
            match events.try_next().await {
                Ok(Some(event)) => forget_deleted_channels(&ctx.failures, event, &mut seen),
                Ok(None) => break,
                Err(e) => warn!(error = %e, "channel watch error"),
            }
        }
    });
}

/// Log the outcome of each reconcile emitted by a controller stream
pub fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::FanoutChannelSpec;
    use kube::api::ObjectMeta;

    fn channel(name: &str) -> FanoutChannel {
        FanoutChannel {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: FanoutChannelSpec::default(),
            status: None,
        }
    }

    /// Story: a channel deleted while failing leaves no counter behind
    #[test]
    fn story_deleted_channel_failures_are_forgotten() {
        let failures = FailureCounters::default();
        let mut seen = HashSet::new();
        failures.record("default/orders");
        failures.record("default/billing");

        forget_deleted_channels(&failures, Event::Delete(channel("orders")), &mut seen);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.record("default/orders"), 1);
    }

    /// Story: a relist drops counters of channels deleted while the watch was down
    #[test]
    fn story_relist_prunes_vanished_channels() {
        let failures = FailureCounters::default();
        let mut seen = HashSet::new();
        failures.record("default/orders");
        failures.record("default/billing");

        forget_deleted_channels(&failures, Event::Init, &mut seen);
        forget_deleted_channels(&failures, Event::InitApply(channel("billing")), &mut seen);
        forget_deleted_channels(&failures, Event::InitDone, &mut seen);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures.record("default/billing"), 2);
        assert!(seen.is_empty());
    }
}
