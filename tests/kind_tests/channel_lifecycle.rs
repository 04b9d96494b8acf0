//! Integration tests for controller and dispatcher passes
//!
//! These tests drive single reconcile passes against a real API server. No
//! dispatcher Deployment is installed in the test cluster, which lets the
//! stories observe how missing infrastructure is reported.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams, PostParams};
use serde_json::json;

use fanout_channel::conditions::ChannelConditionType;
use fanout_channel::controller::{reconcile, Context};
use fanout_channel::crd::{ConditionStatus, FanoutChannel, FanoutChannelStatus};
use fanout_channel::dispatcher::reconciler::{reconcile_kind, Installed};
use fanout_channel::dispatcher::{
    DispatcherContext, DispatcherStoreImpl, HttpMessageSender, ReconcileKind, RoutingTable,
};
use fanout_channel::events::NoopEventPublisher;
use fanout_channel::leader::LeaderFlag;
use fanout_channel::Error;

use super::helpers::{cleanup_channel, ensure_test_cluster, sample_channel, TEST_NAMESPACE};

/// Story: the controller reports a missing dispatcher on the channel
///
/// Expected behavior:
/// - The pass fails with a not-found error
/// - DispatcherReady=False is persisted on the channel, Ready is False
/// - No channel Service is created
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_missing_dispatcher_is_reported() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<FanoutChannel> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "it-no-dispatcher";
    cleanup_channel(&client, name).await;

    let created = api
        .create(
            &PostParams::default(),
            &sample_channel(name, &["http://a.fanout-it.svc/"]),
        )
        .await
        .expect("failed to create channel");

    let ctx = Arc::new(
        Context::builder(client.clone())
            .system_namespace("fanout-it-missing")
            .events(Arc::new(NoopEventPublisher))
            .build(),
    );
    let result = reconcile(Arc::new(created), ctx).await;
    assert!(matches!(result, Err(Error::NotFound { .. })));

    let stored = api.get(name).await.expect("failed to read channel");
    let status = stored.status.expect("status should be written");
    assert_eq!(
        status.conditions.status(ChannelConditionType::DispatcherReady),
        ConditionStatus::False
    );
    assert_eq!(
        status.conditions.status(ChannelConditionType::Ready),
        ConditionStatus::False
    );
    assert!(status.address.is_none());

    cleanup_channel(&client, name).await;
}

/// Story: the leading dispatcher reports subscribers once and then stays quiet
///
/// Expected behavior:
/// - A Ready channel is installed into the routing table
/// - status.subscribers lists each subscriber as ready at its generation
/// - A second pass finds nothing to change
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_dispatcher_reports_subscribers() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<FanoutChannel> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "it-dispatch";
    cleanup_channel(&client, name).await;

    api.create(
        &PostParams::default(),
        &sample_channel(name, &["http://a.fanout-it.svc/", "http://b.fanout-it.svc/"]),
    )
    .await
    .expect("failed to create channel");

    // Stand in for the controller: mark every dependent True and assign an address
    let mut status = FanoutChannelStatus::default();
    status.conditions.initialize();
    for dependent in ChannelConditionType::DEPENDENTS {
        status.conditions.mark_true(dependent);
    }
    status.set_address("it-dispatch-fanout-ch.fanout-it.svc.cluster.local");
    let ready = api
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await
        .expect("failed to mark channel ready");
    assert!(ready.is_ready());

    let leader = LeaderFlag::new();
    leader.set(true);
    let ctx = DispatcherContext::new(
        Arc::new(RoutingTable::new()),
        Arc::new(DispatcherStoreImpl::new(client.clone())),
        Arc::new(HttpMessageSender::new(Duration::from_secs(5)).expect("http client")),
        Arc::new(NoopEventPublisher),
        leader,
    );

    let installed = reconcile_kind(&ready, &ctx, ReconcileKind::Reconcile)
        .await
        .expect("dispatcher pass failed");
    assert_eq!(installed, Installed::Created);

    let stored = api.get(name).await.expect("failed to read channel");
    let subscribers = stored
        .status
        .as_ref()
        .map(|s| s.subscribers.clone())
        .unwrap_or_default();
    assert_eq!(subscribers.len(), 2);
    assert!(subscribers
        .iter()
        .all(|s| s.ready == ConditionStatus::True && s.observed_generation == Some(1)));

    let again = reconcile_kind(&stored, &ctx, ReconcileKind::Reconcile)
        .await
        .expect("second dispatcher pass failed");
    assert_eq!(again, Installed::Unchanged);

    cleanup_channel(&client, name).await;
}
