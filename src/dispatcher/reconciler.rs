//! Dispatcher reconciler
//!
//! Keeps the routing table in sync with ready channels. The leader replica
//! also reports per-subscriber readiness back into channel status; other
//! replicas run the same steps without the status write.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::fanout::{FanoutHandler, MessageSender};
use super::table::RoutingTable;
use super::translate::{translate, ChannelConfig};
use crate::controller::{log_reconcile_result, WATCH_TIMEOUT_SECS};
use crate::crd::{ConditionStatus, FanoutChannel, SubscriberStatus};
use crate::events::{actions, reasons, EventPublisher};
use crate::leader::LeaderFlag;
use crate::retry::{FailureCounters, RetryConfig};
use crate::{Error, DISPATCHER_COMPONENT};

/// Whether a pass may write channel status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileKind {
    /// Update the routing table and patch subscriber status
    Reconcile,
    /// Update the routing table only
    Observe,
}

/// What a pass did to the routing table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Installed {
    /// Channel is not Ready; nothing touched
    Skipped,
    /// New handler inserted for the hostname
    Created,
    /// Existing handler got a new subscription list
    Updated,
    /// Existing handler already matched
    Unchanged,
}

/// Status writes used by the dispatcher
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DispatcherStore: Send + Sync {
    /// Apply a JSON patch to a channel's status subresource
    async fn patch_channel_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct DispatcherStoreImpl {
    client: Client,
}

impl DispatcherStoreImpl {
    /// Create a new store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DispatcherStore for DispatcherStoreImpl {
    async fn patch_channel_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let api: Api<FanoutChannel> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(DISPATCHER_COMPONENT),
            &Patch::<()>::Json(patch.clone()),
        )
        .await?;
        Ok(())
    }
}

/// Dispatcher context shared across reconciliations
pub struct DispatcherContext {
    /// Live routing table, shared with the ingress
    pub table: Arc<RoutingTable>,
    /// Status writes
    pub store: Arc<dyn DispatcherStore>,
    /// Sender handed to every new fanout handler
    pub sender: Arc<dyn MessageSender>,
    /// Warning events for failed passes (leader only)
    pub events: Arc<dyn EventPublisher>,
    /// Leadership of this replica
    pub leader: LeaderFlag,
    /// Backoff for failing channels
    pub retry: RetryConfig,
    /// Consecutive failures per channel ("namespace/name")
    pub failures: FailureCounters,
}

impl DispatcherContext {
    /// Create a context
    pub fn new(
        table: Arc<RoutingTable>,
        store: Arc<dyn DispatcherStore>,
        sender: Arc<dyn MessageSender>,
        events: Arc<dyn EventPublisher>,
        leader: LeaderFlag,
    ) -> Self {
        Self {
            table,
            store,
            sender,
            events,
            leader,
            retry: RetryConfig::reconcile(),
            failures: FailureCounters::default(),
        }
    }

    fn kind(&self) -> ReconcileKind {
        if self.leader.is_leader() {
            ReconcileKind::Reconcile
        } else {
            ReconcileKind::Observe
        }
    }

    async fn publish_warning(&self, channel: &FanoutChannel, reason: &str, error: &Error) {
        self.events
            .publish(
                &channel.object_ref(&()),
                EventType::Warning,
                reason,
                actions::RECONCILE,
                Some(error.to_string()),
            )
            .await;
    }
}

fn owner_key(channel: &FanoutChannel) -> String {
    format!(
        "{}/{}",
        channel.namespace().unwrap_or_default(),
        channel.name_any()
    )
}

/// Controller entry point: reconcile as leader, observe otherwise
#[instrument(skip(channel, ctx), fields(channel = %owner_key(&channel)))]
pub async fn reconcile(
    channel: Arc<FanoutChannel>,
    ctx: Arc<DispatcherContext>,
) -> Result<Action, Error> {
    reconcile_kind(&channel, &ctx, ctx.kind()).await?;
    ctx.failures.clear(&owner_key(&channel));
    Ok(Action::await_change())
}

/// Run one pass of the given kind
///
/// Failures of a `Reconcile` pass are also published as Warning events on
/// the channel; `Observe` passes write nothing to the cluster.
pub async fn reconcile_kind(
    channel: &FanoutChannel,
    ctx: &DispatcherContext,
    kind: ReconcileKind,
) -> Result<Installed, Error> {
    if !channel.is_ready() {
        debug!("channel not ready, leaving routing untouched");
        return Ok(Installed::Skipped);
    }

    let config = match translate(channel) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "channel translation failed");
            if kind == ReconcileKind::Reconcile {
                ctx.publish_warning(channel, reasons::TRANSLATION_FAILED, &e).await;
            }
            return Err(e);
        }
    };
    let installed = install(&ctx.table, config, &ctx.sender);
    debug!(?installed, ?kind, "routing table synced");

    if kind == ReconcileKind::Reconcile {
        if let Err(e) = patch_subscriber_status(channel, ctx.store.as_ref()).await {
            warn!(error = %e, "failed to update subscriber status");
            ctx.publish_warning(channel, reasons::STATUS_PATCH_FAILED, &e).await;
            return Err(e);
        }
    }
    Ok(installed)
}

/// Install a translated channel into the routing table
///
/// An existing handler keeps its identity; its subscription list is swapped
/// only when the effective subscriptions differ. Hostnames the same channel
/// used before are dropped.
pub fn install(
    table: &RoutingTable,
    config: ChannelConfig,
    sender: &Arc<dyn MessageSender>,
) -> Installed {
    let owner = config.owner_key();

    let installed = match table.get(&config.host) {
        Some(handler) if handler.owner() == owner => {
            if *handler.subscriptions() == config.subscriptions {
                Installed::Unchanged
            } else {
                info!(host = %config.host, subscriptions = config.subscriptions.len(), "updating subscriptions");
                handler.set_subscriptions(config.subscriptions);
                Installed::Updated
            }
        }
        existing => {
            if let Some(previous) = existing {
                warn!(host = %config.host, previous = %previous.owner(), "hostname moved to another channel");
            }
            info!(host = %config.host, subscriptions = config.subscriptions.len(), "installing channel");
            let handler = FanoutHandler::new(owner.clone(), config.subscriptions, Arc::clone(sender));
            table.insert(config.host.clone(), Arc::new(handler));
            Installed::Created
        }
    };

    for stale in table.hosts_for(&owner) {
        if stale != config.host {
            info!(host = %stale, "removing stale hostname");
            table.remove(&stale);
        }
    }
    installed
}

/// Subscriber status the dispatcher reports for the current spec
pub fn expected_subscriber_status(channel: &FanoutChannel) -> Vec<SubscriberStatus> {
    channel
        .spec
        .subscribers
        .iter()
        .map(|s| SubscriberStatus {
            uid: s.uid.clone(),
            observed_generation: s.generation,
            ready: ConditionStatus::True,
            message: None,
        })
        .collect()
}

/// JSON patch taking the stored channel to the expected subscriber status
pub fn subscriber_status_patch(channel: &FanoutChannel) -> Result<json_patch::Patch, Error> {
    let before = serde_json::to_value(channel).map_err(|e| Error::serialization(e.to_string()))?;

    let mut desired = channel.clone();
    desired.status.get_or_insert_with(Default::default).subscribers =
        expected_subscriber_status(channel);
    let after = serde_json::to_value(&desired).map_err(|e| Error::serialization(e.to_string()))?;

    Ok(json_patch::diff(&before, &after))
}

async fn patch_subscriber_status(
    channel: &FanoutChannel,
    store: &dyn DispatcherStore,
) -> Result<(), Error> {
    let patch = subscriber_status_patch(channel)?;
    if patch.0.is_empty() {
        return Ok(());
    }

    let namespace = channel.namespace().unwrap_or_default();
    store
        .patch_channel_status(&namespace, &channel.name_any(), &patch)
        .await?;
    info!(subscribers = channel.spec.subscribers.len(), "subscriber status updated");
    Ok(())
}

/// Error policy with per-channel exponential backoff
pub fn error_policy(channel: Arc<FanoutChannel>, error: &Error, ctx: Arc<DispatcherContext>) -> Action {
    let key = owner_key(&channel);
    let attempt = ctx.failures.record(&key);
    error!(?error, channel = %key, attempt, "dispatcher reconciliation failed");

    if error.is_retryable() {
        Action::requeue(ctx.retry.delay_for_attempt(attempt))
    } else {
        Action::await_change()
    }
}

/// Apply a channel watch event to the routing table
///
/// Deleted channels lose their hostnames and failure counters. After a
/// relist, channels that vanished while the watch was down are dropped as
/// well. `seen` collects owners between `Init` and `InitDone`.
pub fn apply_channel_event(
    ctx: &DispatcherContext,
    event: Event<FanoutChannel>,
    seen: &mut HashSet<String>,
) {
    match event {
        Event::Delete(channel) => {
            let owner = owner_key(&channel);
            for host in ctx.table.remove_channel(&owner) {
                info!(channel = %owner, host = %host, "channel deleted, route removed");
            }
            ctx.failures.clear(&owner);
        }
        Event::Init => seen.clear(),
        Event::InitApply(channel) => {
            seen.insert(owner_key(&channel));
        }
        Event::InitDone => {
            for host in ctx.table.retain_owners(seen) {
                info!(host = %host, "channel gone after relist, route removed");
            }
            ctx.failures.retain(seen);
            seen.clear();
        }
        Event::Apply(_) => {}
    }
}

/// Run the dispatcher reconciler until a shutdown signal arrives
pub async fn run_dispatcher_reconciler(client: Client, ctx: Arc<DispatcherContext>) {
    let channels: Api<FanoutChannel> = Api::all(client);
    let promotions = leader_promotions(&ctx.leader);
    spawn_deletion_watch(channels.clone(), Arc::clone(&ctx));

    info!("starting dispatcher reconciler");

    Controller::new(channels, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .reconcile_all_on(promotions)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Dispatcher"))
        .await;
}

/// Stream that yields every time this replica becomes leader
///
/// A fresh leader re-runs every channel so status skipped while following
/// gets written.
fn leader_promotions(leader: &LeaderFlag) -> ReceiverStream<()> {
    let (tx, rx) = mpsc::channel(1);
    let mut changes = leader.subscribe();

    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            if !*changes.borrow_and_update() {
                continue;
            }
            match tx.try_send(()) {
                Ok(()) => debug!("promoted to leader, resyncing all channels"),
                Err(TrySendError::Full(())) => {}
                Err(TrySendError::Closed(())) => break,
            }
        }
    });

    ReceiverStream::new(rx)
}

fn spawn_deletion_watch(api: Api<FanoutChannel>, ctx: Arc<DispatcherContext>) {
    tokio::spawn(async move {
        let mut events = watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff()
            .boxed();
        let mut seen = HashSet::new();

        loop {
            match events.try_next().await {
                Ok(Some(event)) => apply_channel_event(&ctx, event, &mut seen),
                Ok(None) => break,
                Err(e) => warn!(error = %e, "channel watch error"),
            }
        }
    });
}
