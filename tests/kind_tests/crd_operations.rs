//! Integration tests for CRD operations
//!
//! These tests tell the story of how channel owners interact with
//! FanoutChannel resources through the Kubernetes API.

use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;

use fanout_channel::crd::{ConditionStatus, FanoutChannel};

use super::helpers::{cleanup_channel, ensure_test_cluster, sample_channel, TEST_NAMESPACE};

/// Story: a channel owner creates a channel with two subscribers
///
/// Expected behavior:
/// - The FanoutChannel is persisted with both subscribers in order
/// - No status exists until a control-plane process writes one
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_owner_creates_channel() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<FanoutChannel> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "it-create";
    cleanup_channel(&client, name).await;

    let channel = sample_channel(
        name,
        &["http://a.fanout-it.svc/", "http://b.fanout-it.svc/"],
    );
    let created = api
        .create(&PostParams::default(), &channel)
        .await
        .expect("failed to create channel");

    assert_eq!(created.spec.subscribers.len(), 2);
    assert_eq!(
        created.spec.subscribers[1].subscriber_uri.as_deref(),
        Some("http://b.fanout-it.svc/")
    );
    assert!(created.status.is_none());
    assert!(created.validate().is_ok());

    cleanup_channel(&client, name).await;
}

/// Story: status is a subresource and survives round trips through the API
///
/// Expected behavior:
/// - A merge patch against /status sets subscriber readiness
/// - The spec is untouched by the status write
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_subresource_round_trip() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<FanoutChannel> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "it-status";
    cleanup_channel(&client, name).await;

    api.create(
        &PostParams::default(),
        &sample_channel(name, &["http://a.fanout-it.svc/"]),
    )
    .await
    .expect("failed to create channel");

    let patch = json!({
        "status": {
            "subscribers": [{ "uid": "it-status-sub-0", "observedGeneration": 1, "ready": "True" }]
        }
    });
    let patched = api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to patch status");

    let status = patched.status.expect("status should be set");
    assert_eq!(status.subscribers.len(), 1);
    assert_eq!(status.subscribers[0].ready, ConditionStatus::True);
    assert_eq!(patched.spec.subscribers.len(), 1);

    cleanup_channel(&client, name).await;
}

/// Story: created channels show up when listing the namespace
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_channels_are_listable() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<FanoutChannel> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let names = ["it-list-a", "it-list-b"];

    for name in names {
        cleanup_channel(&client, name).await;
        api.create(
            &PostParams::default(),
            &sample_channel(name, &["http://a.fanout-it.svc/"]),
        )
        .await
        .expect("failed to create channel");
    }

    let listed = api
        .list(&ListParams::default())
        .await
        .expect("failed to list channels");
    for name in names {
        assert!(listed
            .items
            .iter()
            .any(|c| c.metadata.name.as_deref() == Some(name)));
        cleanup_channel(&client, name).await;
    }
}
